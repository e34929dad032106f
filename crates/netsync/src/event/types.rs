use std::any::Any;
use std::fmt;

use super::value::ValueChanged;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Interface,
    Class,
    Abstract,
}

/// Stable cache key for an event type. Descriptor names are unique per
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventTypeId(pub &'static str);

impl fmt::Display for EventTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Static description of an event type's place in the hierarchy. Classes
/// name at most one base; any type may list interfaces, and interfaces
/// list the interfaces they extend.
#[derive(Debug)]
pub struct EventType {
    pub name: &'static str,
    pub kind: EventKind,
    pub base: Option<&'static EventType>,
    pub interfaces: &'static [&'static EventType],
}

impl EventType {
    pub fn id(&self) -> EventTypeId {
        EventTypeId(self.name)
    }

    /// `self`, its base chain, then every interface reachable from any of
    /// those, each listed once.
    pub fn ancestry(&'static self) -> Vec<&'static EventType> {
        let mut out: Vec<&'static EventType> = Vec::new();

        let mut class = Some(self);
        while let Some(ty) = class {
            push_unique(&mut out, ty);
            class = ty.base;
        }

        let mut cursor = 0;
        while cursor < out.len() {
            let ty = out[cursor];
            for iface in ty.interfaces {
                push_unique(&mut out, iface);
            }
            cursor += 1;
        }
        out
    }

    pub fn is_a(&'static self, other: &EventType) -> bool {
        self.ancestry().iter().any(|ty| ty.id() == other.id())
    }

    pub fn is_value_changed_family(&'static self) -> bool {
        self.is_a(&VALUE_CHANGED)
    }

    pub fn is_concrete(&self) -> bool {
        self.kind == EventKind::Class
    }
}

fn push_unique(out: &mut Vec<&'static EventType>, ty: &'static EventType) {
    if !out.iter().any(|seen| seen.id() == ty.id()) {
        out.push(ty);
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub static NET_EVENT: EventType = EventType {
    name: "NetEvent",
    kind: EventKind::Interface,
    base: None,
    interfaces: &[],
};

/// Not retained for late joiners.
pub static TRANSIENT_EVENT: EventType = EventType {
    name: "TransientEvent",
    kind: EventKind::Interface,
    base: None,
    interfaces: &[&NET_EVENT],
};

/// Retained and replayed to late joiners.
pub static PERSISTENT_EVENT: EventType = EventType {
    name: "PersistentEvent",
    kind: EventKind::Interface,
    base: None,
    interfaces: &[&NET_EVENT],
};

/// Never leaves the publishing machine.
pub static LOCAL_ONLY_PUBLISH: EventType = EventType {
    name: "LocalOnlyPublish",
    kind: EventKind::Interface,
    base: None,
    interfaces: &[&NET_EVENT],
};

/// Returned to its pool once dispatch finishes.
pub static SELF_RETURNING_EVENT: EventType = EventType {
    name: "SelfReturningEvent",
    kind: EventKind::Interface,
    base: None,
    interfaces: &[&NET_EVENT],
};

/// Root of the high-frequency value-changed family.
pub static VALUE_CHANGED: EventType = EventType {
    name: "ValueChanged",
    kind: EventKind::Abstract,
    base: None,
    interfaces: &[&TRANSIENT_EVENT, &SELF_RETURNING_EVENT],
};

/// Anything the bus can dispatch. Implemented automatically for
/// [`TypedEvent`] types.
pub trait Event: Any + Send + fmt::Debug {
    fn event_type(&self) -> &'static EventType;

    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn value_changed(&self) -> Option<&ValueChanged> {
        None
    }

    /// Called after every handler has run.
    fn recycle(self: Box<Self>) {}
}

/// An event whose Rust type maps to exactly one descriptor.
pub trait TypedEvent: Any + Send + fmt::Debug {
    fn static_type() -> &'static EventType;
}

impl<T: TypedEvent> Event for T {
    fn event_type(&self) -> &'static EventType {
        T::static_type()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
