use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use netsync::config::{ConfigSource, SyncConfig};
use netsync::event::{ClientStateChanged, ControlReceived, Route, SyncValue, ValueKind};
use netsync::ids::{ClientIdAllocator, NetId};
use netsync::net::{
    ClientLink, ClientTypeFlags, ConnectError, ConnectionState, ControlMessage, ControlTriage,
};
use netsync::SyncContext;

const SPAWN_FIELD: u16 = 0;

/// A headless participant: connects, announces itself, and mints ids from
/// the batches its authority grants.
pub struct ClientSession {
    context: SyncContext,
    link: ClientLink,
    ids: Rc<RefCell<ClientIdAllocator>>,
    spawned: Rc<Cell<u64>>,
    announced: bool,
    started: Instant,
}

impl ClientSession {
    pub fn new(config: SyncConfig) -> io::Result<Self> {
        let source: Arc<dyn ConfigSource> = Arc::new(config.clone());
        let context = SyncContext::new(source);
        let ids = Rc::new(RefCell::new(ClientIdAllocator::new(&config)));

        let bus = context.bus();
        let grants = Rc::clone(&ids);
        bus.subscribe::<ControlReceived>(move |envelope| {
            if let Some(ControlReceived {
                message: ControlMessage::BatchGrant { batch_start },
                ..
            }) = envelope.event_as::<ControlReceived>()
            {
                grants.borrow_mut().add_batch(*batch_start);
            }
            Ok(())
        })
        .map_err(io::Error::other)?;

        let resets = Rc::clone(&ids);
        bus.subscribe::<ClientStateChanged>(move |envelope| {
            if let Some(change) = envelope.event_as::<ClientStateChanged>() {
                if matches!(
                    change.current,
                    ConnectionState::Disconnected | ConnectionState::TimedOut
                ) {
                    resets.borrow_mut().reset_all();
                }
            }
            Ok(())
        })
        .map_err(io::Error::other)?;

        let spawned = Rc::new(Cell::new(0));
        let counter = Rc::clone(&spawned);
        bus.subscribe_value_changed(ValueKind::Int, move |envelope| {
            if envelope.value_changed().is_some() {
                counter.set(counter.get() + 1);
            }
            Ok(())
        });

        let triage = Arc::new(ControlTriage::new(context.publisher()));
        let link = ClientLink::new(
            "0.0.0.0:0",
            context.link_resources(),
            triage,
            context.publisher(),
        )?;

        Ok(Self {
            context,
            link,
            ids,
            spawned,
            announced: false,
            started: Instant::now(),
        })
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ConnectError> {
        let timeout = self.context.config().connect_timeout_secs;
        self.link.connect(host, port, timeout)
    }

    pub fn update(&mut self, now: Instant) -> io::Result<()> {
        self.link.update(now)?;
        self.context.bus().set_local_authority(self.link.authority_id());
        self.context.tick(1, now);

        match self.link.state() {
            ConnectionState::Connected if !self.announced => {
                if let Some(conn) = self.link.connection_mut() {
                    let flags = ControlMessage::TypeFlags {
                        flags: ClientTypeFlags::PLAYER_STANDARD.bits(),
                    };
                    match flags.send_on(conn) {
                        Ok(_) => self.announced = true,
                        Err(e) => log::warn!("Failed to announce client type: {}", e),
                    }
                }
            }
            ConnectionState::Connected => {}
            _ => self.announced = false,
        }
        Ok(())
    }

    /// Draws an id for a new local object, asking for a refill when the
    /// allocator crosses its low watermark.
    pub fn spawn(&mut self, now: Instant) -> Option<NetId> {
        let allocation = self.ids.borrow_mut().try_allocate_next_id()?;

        if allocation.should_request_more {
            match self.link.connection_mut() {
                Some(conn) => {
                    if let Err(e) = ControlMessage::BatchRequest.send_on(conn) {
                        log::warn!("Batch request failed: {}", e);
                    }
                }
                None => log::warn!("Out of ids soon but not connected"),
            }
        }

        let elapsed = now.saturating_duration_since(self.started);
        let event = self.context.value_pool().acquire(
            allocation.id,
            SPAWN_FIELD,
            SyncValue::Int(0),
            SyncValue::Int(allocation.id as i64),
            elapsed,
        );
        let route = Route::from_source(self.link.authority_id());
        if let Err(e) = self.context.bus().publish_boxed(event, route) {
            log::error!("Spawn event for {} failed: {}", allocation.id, e);
        }
        Some(allocation.id)
    }

    pub fn disconnect(&mut self) {
        self.link.disconnect();
        self.context.tick(0, Instant::now());
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn has_ids(&self) -> bool {
        self.ids.borrow().has_available_ids()
    }

    pub fn remaining_ids(&self) -> u64 {
        self.ids.borrow().remaining_ids()
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.get()
    }

    pub fn rtt_ms(&self) -> Option<f32> {
        self.link.connection().and_then(|c| c.rtt_average())
    }
}
