use std::fmt;
use std::time::Duration;

use crate::config::{ConfigSource, SyncConfig};

pub const UPDATE_INTERVAL: Duration = Duration::from_secs(1);
pub const SCALE_UP_THRESHOLD: f32 = 0.75;
pub const SCALE_DOWN_THRESHOLD: f32 = 0.25;
pub const SCALE_DOWN_DELAY: Duration = Duration::from_secs(5);
pub const SCALE_UP_FACTOR: f32 = 1.5;
pub const MIN_SCALE_UP_INCREMENT: usize = 100;
pub const ESTIMATED_BYTES_PER_BUFFER: usize = 1024;
pub const MEMORY_WARNING_BYTES: usize = 500 * 1024 * 1024;
pub const WARNING_THROTTLE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    Adaptive,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleChange {
    Up { from: usize, to: usize },
    Down { from: usize, to: usize },
    Pinned { from: usize, to: usize },
}

impl ScaleChange {
    pub fn new_limit(&self) -> usize {
        match *self {
            ScaleChange::Up { to, .. } | ScaleChange::Down { to, .. } | ScaleChange::Pinned { to, .. } => to,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalerStats {
    pub mode: ScalingMode,
    pub current_limit: usize,
    pub baseline: usize,
    pub ceiling: usize,
    pub scale_up_count: u32,
    pub scale_down_count: u32,
}

impl fmt::Display for ScalerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            ScalingMode::Adaptive => "adaptive",
            ScalingMode::Fixed => "fixed",
        };
        write!(
            f,
            "pool mode={} current={} baseline={} ceiling={} scale_ups={} scale_downs={}",
            mode,
            self.current_limit,
            self.baseline,
            self.ceiling,
            self.scale_up_count,
            self.scale_down_count
        )
    }
}

/// Sizes the shared buffer pool from observed borrow pressure, evaluated at
/// most once per [`UPDATE_INTERVAL`]. `baseline <= current_limit <= ceiling`
/// holds after every call.
#[derive(Debug, Clone)]
pub struct PoolScaler {
    mode: ScalingMode,
    current_limit: usize,
    baseline: usize,
    ceiling: usize,
    peak_since_last_tick: usize,
    last_update: Duration,
    last_scale_up: Duration,
    last_scale_down: Duration,
    scale_up_count: u32,
    scale_down_count: u32,
    last_ceiling_warning: Option<Duration>,
    last_memory_warning: Option<Duration>,
}

impl PoolScaler {
    pub fn new(adaptive: bool, baseline: usize, ceiling: usize, now: Duration) -> Self {
        let (baseline, ceiling) = validate_bounds(baseline, ceiling);
        let mode = if adaptive {
            ScalingMode::Adaptive
        } else {
            ScalingMode::Fixed
        };
        let current_limit = match mode {
            ScalingMode::Adaptive => baseline,
            ScalingMode::Fixed => ceiling,
        };

        log::info!(
            "Pool scaler initialised: mode={:?} limit={} ceiling={}",
            mode,
            current_limit,
            ceiling
        );

        Self {
            mode,
            current_limit,
            baseline,
            ceiling,
            peak_since_last_tick: 0,
            last_update: now,
            last_scale_up: now,
            last_scale_down: now,
            scale_up_count: 0,
            scale_down_count: 0,
            last_ceiling_warning: None,
            last_memory_warning: None,
        }
    }

    pub fn from_config(config: &SyncConfig, now: Duration) -> Self {
        Self::new(
            config.adaptive_pool_scaling,
            config.pool_baseline,
            config.pool_ceiling,
            now,
        )
    }

    /// Applies new bounds. The current limit is kept (clamped into the new
    /// bounds) unless adaptive scaling is off, which pins it to the ceiling.
    pub fn configure(&mut self, adaptive: bool, baseline: usize, ceiling: usize) {
        let (baseline, ceiling) = validate_bounds(baseline, ceiling);
        self.baseline = baseline;
        self.ceiling = ceiling;

        if adaptive {
            self.mode = ScalingMode::Adaptive;
            self.current_limit = self.current_limit.clamp(baseline, ceiling);
        } else {
            if self.mode == ScalingMode::Adaptive {
                log::info!("Adaptive pool scaling disabled, fixed limit {}", ceiling);
            }
            self.mode = ScalingMode::Fixed;
            self.current_limit = ceiling;
        }
    }

    pub fn refresh(&mut self, source: &dyn ConfigSource) {
        let config = source.current();
        self.configure(
            config.adaptive_pool_scaling,
            config.pool_baseline,
            config.pool_ceiling,
        );
    }

    pub fn update(&mut self, borrowed: usize, peers: usize, now: Duration) -> Option<ScaleChange> {
        if now.saturating_sub(self.last_update) < UPDATE_INTERVAL {
            self.peak_since_last_tick = self.peak_since_last_tick.max(borrowed);
            return None;
        }

        let observed = borrowed.max(self.peak_since_last_tick);
        let utilization = observed as f32 / self.current_limit as f32;
        self.peak_since_last_tick = 0;
        self.last_update = now;

        if self.mode == ScalingMode::Fixed {
            if self.current_limit != self.ceiling {
                let from = self.current_limit;
                self.current_limit = self.ceiling;
                log::info!("Adaptive pool scaling off, using fixed limit {}", self.ceiling);
                return Some(ScaleChange::Pinned {
                    from,
                    to: self.ceiling,
                });
            }
            return None;
        }

        let mut change = None;

        if utilization > SCALE_UP_THRESHOLD {
            let proposed = (self.current_limit as f32 * SCALE_UP_FACTOR).ceil() as usize;
            let increment = proposed
                .saturating_sub(self.current_limit)
                .max(MIN_SCALE_UP_INCREMENT);
            let target = (self.current_limit + increment).min(self.ceiling);

            if target > self.current_limit {
                let from = self.current_limit;
                self.current_limit = target;
                self.scale_up_count += 1;
                self.last_scale_up = now;
                change = Some(ScaleChange::Up { from, to: target });

                log::info!(
                    "Pool scaled up {} -> {} (utilization {:.0}%, peers {}, scale-ups {})",
                    from,
                    target,
                    utilization * 100.0,
                    peers,
                    self.scale_up_count
                );
            }

            if self.current_limit >= self.ceiling {
                self.warn_ceiling(utilization, observed, peers, now);
            }
        } else if utilization < SCALE_DOWN_THRESHOLD
            && now.saturating_sub(self.last_scale_up) > SCALE_DOWN_DELAY
            && self.current_limit > self.baseline
        {
            let from = self.current_limit;
            self.current_limit = self.baseline;
            self.scale_down_count += 1;
            self.last_scale_down = now;
            change = Some(ScaleChange::Down {
                from,
                to: self.baseline,
            });

            log::info!(
                "Pool scaled down {} -> {} (utilization {:.0}%, low for over {:?})",
                from,
                self.baseline,
                utilization * 100.0,
                SCALE_DOWN_DELAY
            );
        }

        self.check_memory(observed, now);
        change
    }

    fn warn_ceiling(&mut self, utilization: f32, borrowed: usize, peers: usize, now: Duration) {
        if !throttle(&mut self.last_ceiling_warning, now) {
            return;
        }
        log::warn!(
            "Pool limit reached its ceiling of {} buffers: {}/{} borrowed ({:.0}%), {} peers. \
             Unreliable traffic will be dropped until pressure falls; raise pool_ceiling if this persists",
            self.ceiling,
            borrowed,
            self.current_limit,
            utilization * 100.0,
            peers
        );
    }

    fn check_memory(&mut self, borrowed: usize, now: Duration) {
        let estimated = borrowed.saturating_mul(ESTIMATED_BYTES_PER_BUFFER);
        if estimated <= MEMORY_WARNING_BYTES {
            return;
        }
        if !throttle(&mut self.last_memory_warning, now) {
            return;
        }
        log::warn!(
            "Pool memory estimate ~{:.1} MB ({} buffers borrowed) exceeds {} MB",
            estimated as f64 / (1024.0 * 1024.0),
            borrowed,
            MEMORY_WARNING_BYTES / (1024 * 1024)
        );
    }

    pub fn current_limit(&self) -> usize {
        self.current_limit
    }

    pub fn baseline(&self) -> usize {
        self.baseline
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn mode(&self) -> ScalingMode {
        self.mode
    }

    pub fn last_scale_down(&self) -> Duration {
        self.last_scale_down
    }

    pub fn stats(&self) -> ScalerStats {
        ScalerStats {
            mode: self.mode,
            current_limit: self.current_limit,
            baseline: self.baseline,
            ceiling: self.ceiling,
            scale_up_count: self.scale_up_count,
            scale_down_count: self.scale_down_count,
        }
    }
}

fn validate_bounds(baseline: usize, ceiling: usize) -> (usize, usize) {
    let ceiling = if ceiling == 0 {
        log::warn!("Pool ceiling of 0 is invalid, using 1");
        1
    } else {
        ceiling
    };

    if baseline > ceiling {
        log::warn!(
            "Pool baseline {} exceeds ceiling {}, clamping baseline to {}",
            baseline,
            ceiling,
            ceiling
        );
        (ceiling, ceiling)
    } else if baseline == 0 {
        log::warn!("Pool baseline of 0 is invalid, using 1");
        (1, ceiling)
    } else {
        (baseline, ceiling)
    }
}

fn throttle(last: &mut Option<Duration>, now: Duration) -> bool {
    match *last {
        Some(at) if now.saturating_sub(at) < WARNING_THROTTLE => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}
