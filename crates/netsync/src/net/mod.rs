mod channel;
mod client;
mod compression;
mod connection;
mod control;
mod endpoint;
mod frame;
mod peers;
mod protocol;
mod rtt;
mod session;
mod stats;
mod tracking;

pub use channel::{
    AUTO_SYNC_RELIABLE, AUTO_SYNC_UNRELIABLE, CUSTOM_SERIALIZATION_RELIABLE,
    CUSTOM_SERIALIZATION_UNRELIABLE, Channel, ChannelError, ChannelId, ChannelRegistry,
    ChannelTable, EVENT_SINGLES_RELIABLE, EVENT_SINGLES_UNRELIABLE, QosType,
    TIME_SYNC_UNRELIABLE,
};
pub use client::{
    AttemptStep, CONNECT_RETRY_INTERVAL, CONNECT_TOKEN_EXPIRY, ClientLink, ConnectAttempt,
    ConnectError, ConnectToken, KEEPALIVE_INTERVAL, StateWatch,
};
#[cfg(feature = "zstd")]
pub use compression::ZstdCompressor;
pub use compression::{CompressionError, Compressor};
pub use connection::{
    AUTHORITY_SERVER, AUTHORITY_UNSET, AuthorityId, ClientTypeFlags, Connection,
    ConnectionHandle, ConnectionState, CorrelationId, FrameReceiver, LinkResources,
    ReceiveError, SendError, Triage,
};
pub use control::{CONTROL_CHANNEL, ControlError, ControlMessage, ControlTriage};
pub use endpoint::{NetworkEndpoint, UdpSession};
pub use frame::{
    FRAME_HEADER_LEN, FrameError, FrameHeader, MAX_FRAME_PAYLOAD, PERFORMANCE_WARN_PAYLOAD,
    SAFE_RELIABLE_PAYLOAD,
};
pub use peers::{PeerError, PeerTable, RemotePeer};
pub use protocol::{
    DEFAULT_PORT, DEFAULT_TICK_RATE, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet,
    PacketError, PacketHeader, PacketType, sequence_greater_than,
};
pub use rtt::{RTT_HISTORY_LEN, RttHistory};
pub use session::{MemoryDatagram, MemoryInbox, MemorySession, TransportError, TransportSession};
pub use stats::{NetworkStats, rand_nonzero_u64, rand_u64};
pub use tracking::{AckTracker, LinkState, ReceiveTracker};
