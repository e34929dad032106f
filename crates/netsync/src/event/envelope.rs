use crate::net::{AUTHORITY_UNSET, AuthorityId};

use super::types::{Event, EventType};
use super::value::ValueChanged;

/// Routing metadata attached to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// `AUTHORITY_UNSET` means "this machine".
    pub source: AuthorityId,
    pub target: Option<AuthorityId>,
    pub reliable: bool,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            source: AUTHORITY_UNSET,
            target: None,
            reliable: true,
        }
    }
}

impl Route {
    pub fn from_source(source: AuthorityId) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    pub fn to(mut self, target: AuthorityId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn unreliable(mut self) -> Self {
        self.reliable = false;
        self
    }
}

/// What a handler sees: the event plus where it came from.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub event: &'a dyn Event,
    pub source: AuthorityId,
    pub target: Option<AuthorityId>,
    pub reliable: bool,
    pub is_from_me: bool,
    /// Rust type named at the publish call.
    pub published_as: &'static str,
}

impl<'a> Envelope<'a> {
    pub fn event_type(&self) -> &'static EventType {
        self.event.event_type()
    }

    pub fn event_as<T: Event>(&self) -> Option<&'a T> {
        self.event.as_any().downcast_ref::<T>()
    }

    pub fn value_changed(&self) -> Option<&'a ValueChanged> {
        self.event.value_changed()
    }

    pub fn is_source_remote(&self) -> bool {
        !self.is_from_me
    }
}
