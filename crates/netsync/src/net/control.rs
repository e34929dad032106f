use std::sync::Arc;

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::event::{ControlReceived, DeferredPublisher, Route};
use crate::ids::NetId;

use super::channel::{ChannelId, EVENT_SINGLES_RELIABLE};
use super::connection::{Connection, ConnectionHandle, SendError, Triage};
use super::protocol::PacketError;

pub const CONTROL_CHANNEL: ChannelId = EVENT_SINGLES_RELIABLE;

/// Session bookkeeping exchanged between a client and its authority.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ControlMessage {
    /// Client is running low on ids.
    BatchRequest,
    BatchGrant { batch_start: NetId },
    TypeFlags { flags: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control encode failed: {0}")]
    Encode(PacketError),
    #[error(transparent)]
    Send(#[from] SendError),
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.to_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }

    pub fn send_on(&self, connection: &mut Connection) -> Result<usize, ControlError> {
        let bytes = self.encode().map_err(ControlError::Encode)?;
        Ok(connection.send_over_channel(&bytes, CONTROL_CHANNEL)?)
    }
}

/// Triage that lifts control messages onto the event bus as
/// [`ControlReceived`] and hands every other frame to `fallback`.
#[derive(Clone)]
pub struct ControlTriage {
    publisher: DeferredPublisher,
    fallback: Option<Arc<dyn Triage>>,
}

impl ControlTriage {
    pub fn new(publisher: DeferredPublisher) -> Self {
        Self {
            publisher,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Triage>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl Triage for ControlTriage {
    fn triage(&self, from: ConnectionHandle, payload: &[u8], channel: ChannelId) {
        if channel == CONTROL_CHANNEL {
            if let Ok(message) = ControlMessage::decode(payload) {
                log::debug!("Control {:?} from {:?}", message, from);
                self.publisher.publish_with(
                    ControlReceived { from, message },
                    Route::from_source(from.authority_id),
                );
                return;
            }
        }

        match &self.fallback {
            Some(next) => next.triage(from, payload, channel),
            None => log::trace!(
                "Unhandled {} byte frame on channel {} from {:?}",
                payload.len(),
                channel,
                from
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use parking_lot::Mutex;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn handle() -> ConnectionHandle {
        ConnectionHandle {
            correlation_id: 1,
            authority_id: 4,
        }
    }

    #[test]
    fn control_frames_become_deferred_events() {
        let bus = EventBus::new();
        let triage = ControlTriage::new(bus.deferred_publisher());
        let seen: Rc<RefCell<Vec<(ControlMessage, u16)>>> = Rc::default();
        let sink = Rc::clone(&seen);
        bus.subscribe::<ControlReceived>(move |env| {
            if let Some(ev) = env.event_as::<ControlReceived>() {
                sink.borrow_mut().push((ev.message.clone(), env.source));
            }
            Ok(())
        })
        .unwrap();

        let grant = ControlMessage::BatchGrant { batch_start: 1000 };
        triage.triage(handle(), &grant.encode().unwrap(), CONTROL_CHANNEL);
        assert!(seen.borrow().is_empty());

        bus.drain_deferred();
        assert_eq!(*seen.borrow(), vec![(grant, 4)]);
    }

    #[test]
    fn other_frames_reach_fallback() {
        let bus = EventBus::new();
        let forwarded: Arc<Mutex<Vec<ChannelId>>> = Arc::default();
        let sink = Arc::clone(&forwarded);
        let triage = ControlTriage::new(bus.deferred_publisher()).with_fallback(Arc::new(
            move |_: ConnectionHandle, _: &[u8], channel: ChannelId| sink.lock().push(channel),
        ));

        triage.triage(handle(), b"state delta", 1);
        triage.triage(handle(), &[0xFF; 3], CONTROL_CHANNEL);
        assert_eq!(*forwarded.lock(), vec![1, CONTROL_CHANNEL]);
        assert_eq!(bus.deferred_len(), 0);
    }
}
