use crate::net::{
    AuthorityId, ClientTypeFlags, ConnectionHandle, ConnectionState, ControlMessage,
    CorrelationId,
};

use super::types::{
    EventKind, EventType, LOCAL_ONLY_PUBLISH, PERSISTENT_EVENT, TRANSIENT_EVENT, TypedEvent,
};

pub static CLIENT_STATE_CHANGED: EventType = EventType {
    name: "ClientStateChanged",
    kind: EventKind::Class,
    base: None,
    interfaces: &[&LOCAL_ONLY_PUBLISH, &TRANSIENT_EVENT],
};

pub static REMOTE_CLIENT_STATE_CHANGED: EventType = EventType {
    name: "RemoteClientStateChanged",
    kind: EventKind::Class,
    base: None,
    interfaces: &[&LOCAL_ONLY_PUBLISH, &TRANSIENT_EVENT],
};

pub static CLIENT_TYPE_FLAGS_CHANGED: EventType = EventType {
    name: "ClientTypeFlagsChanged",
    kind: EventKind::Class,
    base: None,
    interfaces: &[&PERSISTENT_EVENT],
};

pub static CONTROL_RECEIVED: EventType = EventType {
    name: "ControlReceived",
    kind: EventKind::Class,
    base: None,
    interfaces: &[&LOCAL_ONLY_PUBLISH, &TRANSIENT_EVENT],
};

/// This machine's link to its server changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStateChanged {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

impl TypedEvent for ClientStateChanged {
    fn static_type() -> &'static EventType {
        &CLIENT_STATE_CHANGED
    }
}

/// Authority side: a remote client connected, left or timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteClientStateChanged {
    pub authority_id: AuthorityId,
    pub correlation_id: CorrelationId,
    pub state: ConnectionState,
}

impl TypedEvent for RemoteClientStateChanged {
    fn static_type() -> &'static EventType {
        &REMOTE_CLIENT_STATE_CHANGED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTypeFlagsChanged {
    pub authority_id: AuthorityId,
    pub flags: ClientTypeFlags,
}

impl TypedEvent for ClientTypeFlagsChanged {
    fn static_type() -> &'static EventType {
        &CLIENT_TYPE_FLAGS_CHANGED
    }
}

/// A control message decoded off the wire, handed to the simulation thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReceived {
    pub from: ConnectionHandle,
    pub message: ControlMessage,
}

impl TypedEvent for ControlReceived {
    fn static_type() -> &'static EventType {
        &CONTROL_RECEIVED
    }
}
