pub mod config;
pub mod context;
pub mod event;
pub mod ids;
pub mod net;
pub mod pool;

pub use config::{ConfigError, ConfigSource, SharedConfig, SyncConfig};
pub use context::{SyncContext, TickReport};
pub use event::{
    ClientStateChanged, ClientTypeFlagsChanged, ControlReceived, DeferredPublisher,
    DispatchError, Envelope, Event, EventBus, EventType, HandlerResult, RemoteClientStateChanged,
    Route, SubscribeError, SubscriptionId, TypedEvent, ValueChanged,
};
pub use ids::{Allocation, BatchLedger, ClientIdAllocator, IdBatch, NetId, ServerIdAuthority};
pub use net::{
    AuthorityId, ChannelId, ChannelTable, ClientLink, ClientTypeFlags, Connection,
    ConnectionHandle, ConnectionState, ControlMessage, ControlTriage, NetworkEndpoint, Packet,
    PacketHeader, PacketType, PeerTable, QosType, SendError, TransportSession,
};
pub use pool::{BufferPool, PoolScaler, ScaleChange};
