use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ConfigSource, SyncConfig};
use crate::event::{DeferredPublisher, DrainReport, EventBus, ValueChangedPool};
use crate::net::{
    ChannelTable, Compressor, Connection, ConnectionHandle, LinkResources, TransportSession,
    Triage,
};
use crate::pool::{BufferPool, PoolScaler, ScaleChange, ScalerStats};

const VALUE_POOL_CAPACITY: usize = 1024;
const MAX_RETAINED_BUFFERS: usize = 4096;

/// What one [`SyncContext::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub events: DrainReport,
    pub scale: Option<ScaleChange>,
}

/// Everything one simulated peer owns: its event bus, the shared buffer
/// pool and its scaler, the channel table and the compressor. Built
/// explicitly so several peers can live in one process.
pub struct SyncContext {
    bus: EventBus,
    config: Arc<dyn ConfigSource>,
    pool: Arc<BufferPool>,
    scaler: PoolScaler,
    channels: Arc<ChannelTable>,
    compressor: Option<Arc<dyn Compressor>>,
    values: Arc<ValueChangedPool>,
    started: Instant,
}

impl SyncContext {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self::started_at(config, Instant::now())
    }

    pub fn started_at(config: Arc<dyn ConfigSource>, started: Instant) -> Self {
        let current = config.current();
        let scaler = PoolScaler::from_config(&current, Duration::ZERO);
        let pool = Arc::new(BufferPool::new(
            scaler.baseline().min(MAX_RETAINED_BUFFERS),
            scaler.current_limit(),
        ));

        Self {
            bus: EventBus::new(),
            compressor: compressor_for(&current),
            config,
            pool,
            scaler,
            channels: Arc::new(ChannelTable::default()),
            values: ValueChangedPool::new(VALUE_POOL_CAPACITY),
            started,
        }
    }

    pub fn with_channels(mut self, channels: ChannelTable) -> Self {
        self.channels = Arc::new(channels);
        self
    }

    pub fn with_compressor(mut self, compressor: Option<Arc<dyn Compressor>>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Once per simulation tick: dispatch deferred events, then let the
    /// scaler resize the pool.
    pub fn tick(&mut self, peer_count: usize, now: Instant) -> TickReport {
        let events = self.bus.drain_deferred();

        let borrowed = self.pool.take_peak();
        let elapsed = now.saturating_duration_since(self.started);
        let scale = self.scaler.update(borrowed, peer_count, elapsed);
        if scale.is_some() {
            self.pool.set_limit(self.scaler.current_limit());
        }

        TickReport { events, scale }
    }

    /// Re-reads configuration and applies pool bounds and compression.
    pub fn refresh_config(&mut self) {
        let current = self.config.current();
        self.scaler.refresh(self.config.as_ref());
        self.pool.set_limit(self.scaler.current_limit());

        if current.compression != self.compressor.is_some() {
            log::info!("Compression {}", if current.compression { "enabled" } else { "disabled" });
            self.compressor = compressor_for(&current);
        }
    }

    pub fn link_resources(&self) -> LinkResources {
        LinkResources {
            channels: self.channels.clone(),
            compressor: self.compressor.clone(),
            pool: Arc::clone(&self.pool),
        }
    }

    /// Wraps `session` in a connection sharing this context's pool,
    /// channels and compressor.
    pub fn open_connection(
        &self,
        handle: ConnectionHandle,
        session: Box<dyn TransportSession>,
        triage: Arc<dyn Triage>,
    ) -> Connection {
        Connection::new(handle, session, self.link_resources(), triage)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn publisher(&self) -> DeferredPublisher {
        self.bus.deferred_publisher()
    }

    pub fn config(&self) -> SyncConfig {
        self.config.current()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn scaler(&self) -> &PoolScaler {
        &self.scaler
    }

    pub fn scaler_stats(&self) -> ScalerStats {
        self.scaler.stats()
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn value_pool(&self) -> &Arc<ValueChangedPool> {
        &self.values
    }
}

#[cfg(feature = "zstd")]
fn compressor_for(config: &SyncConfig) -> Option<Arc<dyn Compressor>> {
    config
        .compression
        .then(|| Arc::new(crate::net::ZstdCompressor::default()) as Arc<dyn Compressor>)
}

#[cfg(not(feature = "zstd"))]
fn compressor_for(config: &SyncConfig) -> Option<Arc<dyn Compressor>> {
    if config.compression {
        log::warn!("Compression requested but built without the zstd feature");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedConfig;
    use crate::event::ClientStateChanged;
    use crate::net::{AUTO_SYNC_RELIABLE, ConnectionState, MemorySession};

    fn shared(adaptive: bool) -> SharedConfig {
        SharedConfig::new(SyncConfig {
            adaptive_pool_scaling: adaptive,
            pool_baseline: 100,
            pool_ceiling: 1000,
            compression: false,
            ..SyncConfig::default()
        })
    }

    #[test]
    fn tick_drains_deferred_events() {
        let start = Instant::now();
        let mut ctx = SyncContext::started_at(Arc::new(shared(true)), start);
        let hits = std::rc::Rc::new(std::cell::Cell::new(0));
        let counter = std::rc::Rc::clone(&hits);
        ctx.bus()
            .subscribe::<ClientStateChanged>(move |_| {
                counter.set(counter.get() + 1);
                Ok(())
            })
            .unwrap();

        ctx.publisher().publish(ClientStateChanged {
            previous: ConnectionState::Disconnected,
            current: ConnectionState::Connecting,
        });
        let report = ctx.tick(0, start);
        assert_eq!(report.events.dispatched, 1);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn tick_applies_scale_to_pool() {
        let start = Instant::now();
        let mut ctx = SyncContext::started_at(Arc::new(shared(true)), start);
        assert_eq!(ctx.pool().limit(), 100);

        let pool = Arc::clone(ctx.pool());
        let held: Vec<_> = (0..90).map(|_| pool.borrow()).collect();
        let report = ctx.tick(1, start + Duration::from_secs(1));
        drop(held);

        assert_eq!(report.scale, Some(ScaleChange::Up { from: 100, to: 200 }));
        assert_eq!(ctx.pool().limit(), 200);
    }

    #[test]
    fn refresh_picks_up_runtime_changes() {
        let start = Instant::now();
        let config = shared(true);
        let mut ctx = SyncContext::started_at(Arc::new(config.clone()), start);

        config.update(|c| c.adaptive_pool_scaling = false);
        ctx.refresh_config();
        assert_eq!(ctx.pool().limit(), 1000);
        assert_eq!(ctx.scaler_stats().current_limit, 1000);
    }

    #[test]
    fn contexts_are_independent() {
        let a = SyncContext::new(Arc::new(shared(true)));
        let b = SyncContext::new(Arc::new(shared(false)));
        assert_eq!(a.pool().limit(), 100);
        assert_eq!(b.pool().limit(), 1000);
        assert!(!Arc::ptr_eq(a.pool(), b.pool()));
    }

    #[test]
    fn opened_connection_uses_context_pool() {
        let ctx = SyncContext::new(Arc::new(shared(true)));
        let ((a, _), (_b, inbox)) = MemorySession::pair();
        let handle = ConnectionHandle {
            correlation_id: 1,
            authority_id: 1,
        };
        let mut conn = ctx.open_connection(
            handle,
            Box::new(a),
            Arc::new(|_: ConnectionHandle, _: &[u8], _: u8| {}),
        );

        conn.send_over_channel(b"abc", AUTO_SYNC_RELIABLE).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(ctx.pool().borrowed(), 0);
        assert_eq!(ctx.pool().take_peak(), 1);
    }
}
