use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::channel::QosType;
use super::protocol::PacketError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("session is closed")]
    Closed,
    #[error("reliable send queue exhausted")]
    QueueExhausted,
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// The reliable transport beneath a [`Connection`](super::Connection).
/// Delivery guarantees per [`QosType`] are the implementation's business.
pub trait TransportSession: Send {
    fn send(&mut self, frame: &[u8], qos: QosType) -> Result<(), TransportError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDatagram {
    pub frame: Vec<u8>,
    pub qos: QosType,
}

/// In-process session half. Both halves of a pair share one open flag, so
/// closing either side disconnects both.
#[derive(Debug)]
pub struct MemorySession {
    outbound: flume::Sender<MemoryDatagram>,
    open: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct MemoryInbox {
    inbound: flume::Receiver<MemoryDatagram>,
}

impl MemorySession {
    pub fn pair() -> ((MemorySession, MemoryInbox), (MemorySession, MemoryInbox)) {
        let (a_tx, b_rx) = flume::unbounded();
        let (b_tx, a_rx) = flume::unbounded();
        let open = Arc::new(AtomicBool::new(true));

        (
            (
                MemorySession {
                    outbound: a_tx,
                    open: Arc::clone(&open),
                },
                MemoryInbox { inbound: a_rx },
            ),
            (
                MemorySession {
                    outbound: b_tx,
                    open,
                },
                MemoryInbox { inbound: b_rx },
            ),
        )
    }
}

impl TransportSession for MemorySession {
    fn send(&mut self, frame: &[u8], qos: QosType) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(MemoryDatagram {
                frame: frame.to_vec(),
                qos,
            })
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl MemoryInbox {
    pub fn try_recv(&self) -> Option<MemoryDatagram> {
        self.inbound.try_recv().ok()
    }

    pub fn drain(&self) -> impl Iterator<Item = MemoryDatagram> + '_ {
        self.inbound.try_iter()
    }

    pub fn len(&self) -> usize {
        self.inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty()
    }
}
