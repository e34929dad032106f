mod builtin;
mod bus;
mod deferred;
mod envelope;
mod types;
mod value;

pub use builtin::{
    CLIENT_STATE_CHANGED, CLIENT_TYPE_FLAGS_CHANGED, CONTROL_RECEIVED, ClientStateChanged,
    ClientTypeFlagsChanged, ControlReceived, REMOTE_CLIENT_STATE_CHANGED,
    RemoteClientStateChanged,
};
pub use bus::{
    DEFAULT_PRIORITY, DispatchError, DrainReport, EventBus, HandlerResult, MAX_DISPATCH_DEPTH,
    SubscribeError, SubscriptionId,
};
pub use deferred::DeferredPublisher;
pub use envelope::{Envelope, Route};
pub use types::{
    Event, EventKind, EventType, EventTypeId, LOCAL_ONLY_PUBLISH, NET_EVENT, PERSISTENT_EVENT,
    SELF_RETURNING_EVENT, TRANSIENT_EVENT, TypedEvent, VALUE_CHANGED,
};
pub use value::{SyncValue, VALUE_CHANGED_EVENT, ValueChanged, ValueChangedPool, ValueKind};
