use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::ids::NetId;
use crate::pool::ObjectPool;

use super::types::{Event, EventKind, EventType, VALUE_CHANGED};

pub static VALUE_CHANGED_EVENT: EventType = EventType {
    name: "ValueChangedEvent",
    kind: EventKind::Class,
    base: Some(&VALUE_CHANGED),
    interfaces: &[],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Vector3,
    Quaternion,
    Text,
    Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Vector3([f32; 3]),
    Quaternion([f32; 4]),
    Text(String),
    Bytes(Vec<u8>),
}

impl SyncValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            SyncValue::Bool(_) => ValueKind::Bool,
            SyncValue::Int(_) => ValueKind::Int,
            SyncValue::Float(_) => ValueKind::Float,
            SyncValue::Vector3(_) => ValueKind::Vector3,
            SyncValue::Quaternion(_) => ValueKind::Quaternion,
            SyncValue::Text(_) => ValueKind::Text,
            SyncValue::Bytes(_) => ValueKind::Bytes,
        }
    }
}

impl Default for SyncValue {
    fn default() -> Self {
        SyncValue::Bool(false)
    }
}

/// A synchronized field of a participant changed value.
pub struct ValueChanged {
    pub participant_id: NetId,
    pub field: u16,
    pub previous: SyncValue,
    pub current: SyncValue,
    pub occurred_at: Duration,
    home: Option<Arc<ValueChangedPool>>,
}

impl ValueChanged {
    /// An unpooled event.
    pub fn new(participant_id: NetId, field: u16, previous: SyncValue, current: SyncValue) -> Self {
        Self {
            participant_id,
            field,
            previous,
            current,
            occurred_at: Duration::ZERO,
            home: None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.current.kind()
    }

    pub fn at(mut self, occurred_at: Duration) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

impl fmt::Debug for ValueChanged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueChanged")
            .field("participant_id", &self.participant_id)
            .field("field", &self.field)
            .field("previous", &self.previous)
            .field("current", &self.current)
            .field("occurred_at", &self.occurred_at)
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

impl Event for ValueChanged {
    fn event_type(&self) -> &'static EventType {
        &VALUE_CHANGED_EVENT
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_changed(&self) -> Option<&ValueChanged> {
        Some(self)
    }

    fn recycle(mut self: Box<Self>) {
        if let Some(home) = self.home.take() {
            self.previous = SyncValue::default();
            self.current = SyncValue::default();
            home.give_back(self);
        }
    }
}

/// Recycles boxed [`ValueChanged`] events so the high-frequency path does
/// not allocate per change.
#[derive(Debug)]
pub struct ValueChangedPool {
    events: ObjectPool<Box<ValueChanged>>,
}

impl ValueChangedPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            events: ObjectPool::with_capacity(capacity, 0, || {
                Box::new(ValueChanged::new(0, 0, SyncValue::default(), SyncValue::default()))
            }),
        })
    }

    pub fn acquire(
        self: &Arc<Self>,
        participant_id: NetId,
        field: u16,
        previous: SyncValue,
        current: SyncValue,
        occurred_at: Duration,
    ) -> Box<ValueChanged> {
        let mut event = self.events.acquire_or_create();
        event.participant_id = participant_id;
        event.field = field;
        event.previous = previous;
        event.current = current;
        event.occurred_at = occurred_at;
        event.home = Some(Arc::clone(self));
        event
    }

    fn give_back(&self, event: Box<ValueChanged>) {
        if self.events.release(event).is_err() {
            log::trace!("Value-changed pool full, dropping event");
        }
    }

    pub fn available(&self) -> usize {
        self.events.available()
    }
}
