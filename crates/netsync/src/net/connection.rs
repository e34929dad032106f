use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use crate::pool::BufferPool;

use super::channel::{ChannelId, ChannelRegistry, QosType};
use super::compression::{CompressionError, Compressor};
use super::frame::{
    FRAME_HEADER_LEN, FrameError, FrameHeader, MAX_FRAME_PAYLOAD, PERFORMANCE_WARN_PAYLOAD,
    SAFE_RELIABLE_PAYLOAD,
};
use super::rtt::RttHistory;
use super::session::{TransportError, TransportSession};

pub type CorrelationId = u64;
pub type AuthorityId = u16;

pub const AUTHORITY_UNSET: AuthorityId = 0;
pub const AUTHORITY_SERVER: AuthorityId = AuthorityId::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    TimedOut,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClientTypeFlags: u32 {
        const PLAYER_STANDARD = 1 << 0;
        const SERVER_HOST = 1 << 1;
    }
}

/// Identifies the peer a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub correlation_id: CorrelationId,
    pub authority_id: AuthorityId,
}

/// Receives every decoded frame. May be called from a transport I/O thread.
pub trait Triage: Send + Sync {
    fn triage(&self, from: ConnectionHandle, payload: &[u8], channel: ChannelId);
}

impl<F> Triage for F
where
    F: Fn(ConnectionHandle, &[u8], ChannelId) + Send + Sync,
{
    fn triage(&self, from: ConnectionHandle, payload: &[u8], channel: ChannelId) {
        self(from, payload, channel)
    }
}

/// Collaborators shared by every connection of one session context.
#[derive(Clone)]
pub struct LinkResources {
    pub channels: Arc<dyn ChannelRegistry>,
    pub compressor: Option<Arc<dyn Compressor>>,
    pub pool: Arc<BufferPool>,
}

impl fmt::Debug for LinkResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkResources")
            .field("compressor", &self.compressor)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("channel {0} is not registered")]
    UnknownChannel(ChannelId),
    #[error("payload of {size} bytes exceeds the {max} byte frame limit")]
    TooLarge { size: usize, max: usize },
    #[error("buffer pool saturated, unreliable frame dropped")]
    PoolSaturated,
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("frame payload exceeds the {max} byte limit")]
    TooLarge { max: usize },
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// The inbound half of a [`Connection`]. Cloneable and thread-safe so a
/// transport's I/O thread can decode frames while the connection itself
/// stays on the simulation thread.
#[derive(Clone)]
pub struct FrameReceiver {
    handle: ConnectionHandle,
    resources: LinkResources,
    triage: Arc<dyn Triage>,
    open: Arc<AtomicBool>,
}

impl FrameReceiver {
    /// Decodes one wire frame and forwards it to triage. Frames arriving
    /// after disconnect are ignored; payloads that are, or inflate to, more
    /// than [`MAX_FRAME_PAYLOAD`] bytes are rejected.
    pub fn on_receive(&self, raw: &[u8]) -> Result<(), ReceiveError> {
        if !self.open.load(Ordering::Acquire) {
            log::trace!("Ignoring frame for closed connection {:?}", self.handle);
            return Ok(());
        }

        let (header, body) = FrameHeader::parse(raw)?;

        if body.len() > MAX_FRAME_PAYLOAD {
            log::warn!(
                "Dropping {} byte frame from {:?} on channel {}: over the frame limit",
                body.len(),
                self.handle,
                header.channel
            );
            return Err(ReceiveError::TooLarge {
                max: MAX_FRAME_PAYLOAD,
            });
        }

        match &self.resources.compressor {
            Some(codec) => {
                let mut plain = self.resources.pool.borrow();
                match codec.decompress(body, MAX_FRAME_PAYLOAD, &mut plain) {
                    Ok(()) => {}
                    Err(CompressionError::TooLarge { limit }) => {
                        log::warn!(
                            "Dropping frame from {:?} on channel {}: inflates past {} bytes",
                            self.handle,
                            header.channel,
                            limit
                        );
                        return Err(ReceiveError::TooLarge { max: limit });
                    }
                    Err(e) => return Err(e.into()),
                }
                self.triage.triage(self.handle, &plain, header.channel);
            }
            None => self.triage.triage(self.handle, body, header.channel),
        }
        Ok(())
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }
}

/// One peer's channelized view of a transport session.
pub struct Connection {
    session: Box<dyn TransportSession>,
    resources: LinkResources,
    receiver: FrameReceiver,
    rtt: RttHistory,
}

impl Connection {
    pub fn new(
        handle: ConnectionHandle,
        session: Box<dyn TransportSession>,
        resources: LinkResources,
        triage: Arc<dyn Triage>,
    ) -> Self {
        let receiver = FrameReceiver {
            handle,
            resources: resources.clone(),
            triage,
            open: Arc::new(AtomicBool::new(true)),
        };
        Self {
            session,
            resources,
            receiver,
            rtt: RttHistory::new(),
        }
    }

    /// Frames `payload` for `channel` and hands it to the session with that
    /// channel's QoS. Returns the frame size put on the wire.
    pub fn send_over_channel(&mut self, payload: &[u8], channel: ChannelId) -> Result<usize, SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }

        let qos = self
            .resources
            .channels
            .qos(channel)
            .ok_or(SendError::UnknownChannel(channel))?;

        check_payload_size(payload.len(), qos)?;

        let pool = &self.resources.pool;
        let mut frame = if qos.is_reliable() {
            pool.borrow()
        } else {
            match pool.try_borrow() {
                Some(buf) => buf,
                None => {
                    log::debug!("Dropping unreliable frame on channel {}: pool saturated", channel);
                    return Err(SendError::PoolSaturated);
                }
            }
        };

        match &self.resources.compressor {
            Some(codec) => {
                let mut packed = pool.borrow();
                codec.compress(payload, &mut packed)?;
                if packed.len() > MAX_FRAME_PAYLOAD {
                    log::error!(
                        "Refusing frame on channel {}: {} byte payload compressed to {} bytes, limit is {}",
                        channel,
                        payload.len(),
                        packed.len(),
                        MAX_FRAME_PAYLOAD
                    );
                    return Err(SendError::TooLarge {
                        size: packed.len(),
                        max: MAX_FRAME_PAYLOAD,
                    });
                }
                write_frame(&mut frame, channel, &packed);
            }
            None => write_frame(&mut frame, channel, payload),
        }

        if let Err(e) = self.session.send(&frame, qos) {
            log::error!(
                "Transmit failed on channel {} to {:?}: {}",
                channel,
                self.receiver.handle,
                e
            );
            return Err(e.into());
        }

        log::trace!("Sent {} byte frame on channel {}", frame.len(), channel);
        Ok(frame.len())
    }

    pub fn on_receive(&self, raw: &[u8]) -> Result<(), ReceiveError> {
        self.receiver.on_receive(raw)
    }

    pub fn receiver(&self) -> FrameReceiver {
        self.receiver.clone()
    }

    pub fn record_rtt(&mut self, rtt_ms: f32) {
        self.rtt.record(rtt_ms);
    }

    pub fn rtt_latest(&self) -> Option<f32> {
        self.rtt.latest()
    }

    pub fn rtt_average(&self) -> Option<f32> {
        self.rtt.average()
    }

    pub fn disconnect(&mut self) {
        if self.receiver.open.swap(false, Ordering::AcqRel) {
            log::info!("Connection {:?} closed", self.receiver.handle);
        }
        self.session.close();
    }

    pub fn is_open(&self) -> bool {
        self.receiver.open.load(Ordering::Acquire) && self.session.is_open()
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.receiver.handle
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.receiver.handle)
            .field("open", &self.is_open())
            .field("rtt", &self.rtt)
            .finish_non_exhaustive()
    }
}

fn check_payload_size(size: usize, qos: QosType) -> Result<(), SendError> {
    if size > MAX_FRAME_PAYLOAD {
        log::error!(
            "Refusing {} byte payload, limit is {} bytes",
            size,
            MAX_FRAME_PAYLOAD
        );
        return Err(SendError::TooLarge {
            size,
            max: MAX_FRAME_PAYLOAD,
        });
    }
    if qos.is_reliable() && size > SAFE_RELIABLE_PAYLOAD {
        log::warn!(
            "{} byte payload on a reliable channel exceeds the safe size of {} bytes",
            size,
            SAFE_RELIABLE_PAYLOAD
        );
    } else if size > PERFORMANCE_WARN_PAYLOAD {
        log::info!("Large {} byte payload may hurt performance", size);
    }
    Ok(())
}

fn write_frame(out: &mut Vec<u8>, channel: ChannelId, body: &[u8]) {
    out.reserve(FRAME_HEADER_LEN + body.len());
    FrameHeader {
        channel,
        length: body.len() as u32,
    }
    .write(out);
    out.extend_from_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::channel::{AUTO_SYNC_RELIABLE, AUTO_SYNC_UNRELIABLE, ChannelTable};
    use crate::net::session::{MemoryInbox, MemorySession};
    use parking_lot::Mutex;

    type Seen = Arc<Mutex<Vec<(ChannelId, Vec<u8>)>>>;

    fn resources(compressor: Option<Arc<dyn Compressor>>, limit: usize) -> LinkResources {
        LinkResources {
            channels: Arc::new(ChannelTable::default()),
            compressor,
            pool: Arc::new(BufferPool::new(8, limit)),
        }
    }

    fn handle() -> ConnectionHandle {
        ConnectionHandle {
            correlation_id: 42,
            authority_id: 1,
        }
    }

    fn pair(res: &LinkResources) -> (Connection, MemoryInbox, Connection, Seen) {
        let ((a, _a_inbox), (b, b_inbox)) = MemorySession::pair();
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);

        let sender = Connection::new(handle(), Box::new(a), res.clone(), Arc::new(|_: ConnectionHandle, _: &[u8], _: ChannelId| {}));
        let receiver = Connection::new(
            handle(),
            Box::new(b),
            res.clone(),
            Arc::new(move |_: ConnectionHandle, payload: &[u8], channel: ChannelId| {
                sink.lock().push((channel, payload.to_vec()))
            }),
        );
        (sender, b_inbox, receiver, seen)
    }

    #[test]
    fn frame_passes_through_without_compressor() {
        let res = resources(None, 16);
        let (mut tx, inbox, rx, seen) = pair(&res);

        let sent = tx.send_over_channel(b"hello", AUTO_SYNC_RELIABLE).unwrap();
        assert_eq!(sent, FRAME_HEADER_LEN + 5);

        let datagram = inbox.try_recv().unwrap();
        assert_eq!(datagram.qos, QosType::ReliableOrdered);
        assert_eq!(&datagram.frame[..5], &[AUTO_SYNC_RELIABLE, 5, 0, 0, 0]);

        rx.on_receive(&datagram.frame).unwrap();
        assert_eq!(*seen.lock(), vec![(AUTO_SYNC_RELIABLE, b"hello".to_vec())]);
        assert_eq!(res.pool.borrowed(), 0);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn compressed_frame_restores_payload() {
        use crate::net::compression::ZstdCompressor;

        let res = resources(Some(Arc::new(ZstdCompressor::default())), 16);
        let (mut tx, inbox, rx, seen) = pair(&res);
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 7) as u8).collect();

        let sent = tx.send_over_channel(&payload, AUTO_SYNC_UNRELIABLE).unwrap();
        assert!(sent < payload.len());

        rx.on_receive(&inbox.try_recv().unwrap().frame).unwrap();
        assert_eq!(*seen.lock(), vec![(AUTO_SYNC_UNRELIABLE, payload)]);
        assert_eq!(res.pool.borrowed(), 0);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn inflating_frame_is_rejected() {
        use crate::net::compression::ZstdCompressor;

        let res = resources(Some(Arc::new(ZstdCompressor::default())), 16);
        let (_, _, rx, seen) = pair(&res);

        let mut packed = Vec::new();
        ZstdCompressor::default()
            .compress(&vec![0u8; 50_000_000], &mut packed)
            .unwrap();
        assert!(packed.len() < MAX_FRAME_PAYLOAD);
        let mut frame = Vec::new();
        write_frame(&mut frame, AUTO_SYNC_RELIABLE, &packed);

        assert!(matches!(
            rx.on_receive(&frame),
            Err(ReceiveError::TooLarge { max: MAX_FRAME_PAYLOAD })
        ));
        assert!(seen.lock().is_empty());
        assert_eq!(res.pool.borrowed(), 0);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn payload_at_limit_still_decodes() {
        use crate::net::compression::ZstdCompressor;

        let res = resources(Some(Arc::new(ZstdCompressor::default())), 16);
        let (mut tx, inbox, rx, seen) = pair(&res);
        let payload = vec![7u8; MAX_FRAME_PAYLOAD];

        tx.send_over_channel(&payload, AUTO_SYNC_RELIABLE).unwrap();
        rx.on_receive(&inbox.try_recv().unwrap().frame).unwrap();
        assert_eq!(seen.lock()[0].1.len(), MAX_FRAME_PAYLOAD);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn compressed_body_over_limit_is_refused() {
        use crate::net::compression::ZstdCompressor;

        let res = resources(Some(Arc::new(ZstdCompressor::default())), 16);
        let (mut tx, inbox, _, _) = pair(&res);

        // xorshift noise does not compress, so zstd framing pushes it over
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let payload: Vec<u8> = (0..MAX_FRAME_PAYLOAD)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 56) as u8
            })
            .collect();

        assert!(matches!(
            tx.send_over_channel(&payload, AUTO_SYNC_RELIABLE),
            Err(SendError::TooLarge { max: MAX_FRAME_PAYLOAD, .. })
        ));
        assert!(inbox.is_empty());
        assert_eq!(res.pool.borrowed(), 0);
    }

    #[test]
    fn oversize_incoming_frame_is_rejected() {
        let res = resources(None, 16);
        let (_, _, rx, seen) = pair(&res);
        let mut frame = Vec::new();
        write_frame(&mut frame, AUTO_SYNC_RELIABLE, &vec![1u8; MAX_FRAME_PAYLOAD + 1]);

        assert!(matches!(
            rx.on_receive(&frame),
            Err(ReceiveError::TooLarge { .. })
        ));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let res = resources(None, 16);
        let (mut tx, inbox, _, _) = pair(&res);
        assert!(matches!(
            tx.send_over_channel(b"x", 99),
            Err(SendError::UnknownChannel(99))
        ));
        assert!(inbox.is_empty());
    }

    #[test]
    fn oversize_payload_is_refused() {
        let res = resources(None, 16);
        let (mut tx, _, _, _) = pair(&res);
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert!(matches!(
            tx.send_over_channel(&payload, AUTO_SYNC_RELIABLE),
            Err(SendError::TooLarge { .. })
        ));
        assert_eq!(res.pool.borrowed(), 0);
    }

    #[test]
    fn saturated_pool_drops_unreliable_only() {
        let res = resources(None, 1);
        let (mut tx, inbox, _, _) = pair(&res);
        let _held = res.pool.borrow();

        assert!(matches!(
            tx.send_over_channel(b"drop me", AUTO_SYNC_UNRELIABLE),
            Err(SendError::PoolSaturated)
        ));
        tx.send_over_channel(b"keep me", AUTO_SYNC_RELIABLE).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(res.pool.borrowed(), 1);
    }

    #[test]
    fn buffers_return_when_transport_fails() {
        let res = resources(None, 16);
        let (mut tx, _, mut rx, _) = pair(&res);
        rx.disconnect();

        assert!(tx.send_over_channel(b"late", AUTO_SYNC_RELIABLE).is_err());
        assert_eq!(res.pool.borrowed(), 0);
    }

    #[test]
    fn closed_connection_ignores_frames() {
        let res = resources(None, 16);
        let (mut tx, inbox, mut rx, seen) = pair(&res);
        tx.send_over_channel(b"hi", AUTO_SYNC_RELIABLE).unwrap();

        rx.disconnect();
        assert!(!rx.is_open());
        rx.on_receive(&inbox.try_recv().unwrap().frame).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn receiver_works_from_another_thread() {
        let res = resources(None, 16);
        let (mut tx, inbox, rx, seen) = pair(&res);
        tx.send_over_channel(b"threaded", AUTO_SYNC_RELIABLE).unwrap();

        let receiver = rx.receiver();
        let frame = inbox.try_recv().unwrap().frame;
        std::thread::spawn(move || receiver.on_receive(&frame).unwrap())
            .join()
            .unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn malformed_frame_is_an_error() {
        let res = resources(None, 16);
        let (_, _, rx, seen) = pair(&res);
        assert!(matches!(
            rx.on_receive(&[1, 9, 0, 0, 0, 1]),
            Err(ReceiveError::Frame(FrameError::LengthMismatch { .. }))
        ));
        assert!(rx.on_receive(&[1, 2]).is_err());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn rtt_feeds_history() {
        let res = resources(None, 16);
        let (mut tx, _, _, _) = pair(&res);
        assert_eq!(tx.rtt_average(), None);
        tx.record_rtt(50.0);
        tx.record_rtt(100.0);
        assert_eq!(tx.rtt_latest(), Some(100.0));
        assert!((tx.rtt_average().unwrap() - 60.0).abs() < 1e-3);
    }
}
