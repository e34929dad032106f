use std::fmt;

use super::batch::{IdBatch, NetId};
use crate::config::{ConfigSource, SyncConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchIntegrityError {
    #[error("batches {first} and {second} overlap")]
    Overlap { first: IdBatch, second: IdBatch },
    #[error("batch {0} has inconsistent bookkeeping")]
    Inconsistent(IdBatch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub id: NetId,
    /// Set once per low-watermark crossing; the caller should ask the
    /// authority for another batch.
    pub should_request_more: bool,
}

/// Client-side consumer of authority-granted id batches. Ids are drawn from
/// the oldest batch first.
#[derive(Debug, Clone)]
pub struct ClientIdAllocator {
    batch_size: u32,
    batches: Vec<IdBatch>,
    total_allocated: u64,
    total_used: u64,
    refill_requested: bool,
}

impl ClientIdAllocator {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size(),
            batches: Vec::new(),
            total_allocated: 0,
            total_used: 0,
            refill_requested: false,
        }
    }

    pub fn refresh(&mut self, source: &dyn ConfigSource) {
        self.batch_size = source.current().batch_size();
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    fn request_threshold(&self) -> u64 {
        (self.batch_size / 2) as u64
    }

    pub fn add_batch(&mut self, batch_start: NetId) -> bool {
        if self.batches.iter().any(|b| b.start() == batch_start) {
            log::warn!("Ignoring duplicate id batch starting at {}", batch_start);
            return false;
        }

        let batch = IdBatch::new(batch_start, self.batch_size);
        self.batches.push(batch);
        self.total_allocated += self.batch_size as u64;
        self.refill_requested = false;

        log::debug!(
            "Received id batch {} ({} batches active, {} ids remaining)",
            batch,
            self.batches.len(),
            self.remaining_ids()
        );
        true
    }

    pub fn try_allocate_next_id(&mut self) -> Option<Allocation> {
        self.batches.retain(|b| !b.is_exhausted());

        let Some(id) = self.batches.first_mut().and_then(IdBatch::take_next) else {
            log::error!(
                "No id batch capacity left ({} allocated, {} used)",
                self.total_allocated,
                self.total_used
            );
            return None;
        };
        self.total_used += 1;

        let remaining = self.remaining_ids();
        let should_request_more = remaining < self.request_threshold() && !self.refill_requested;
        if should_request_more {
            self.refill_requested = true;
            log::debug!(
                "Id batch low watermark crossed ({} remaining), requesting another",
                remaining
            );
        }

        Some(Allocation {
            id,
            should_request_more,
        })
    }

    pub fn is_id_in_active_batch(&self, id: NetId) -> bool {
        self.batches.iter().any(|b| b.contains(id))
    }

    pub fn remaining_ids(&self) -> u64 {
        self.total_allocated.saturating_sub(self.total_used)
    }

    pub fn has_available_ids(&self) -> bool {
        self.batches.iter().any(|b| !b.is_exhausted())
    }

    pub fn refill_requested(&self) -> bool {
        self.refill_requested
    }

    pub fn active_batches(&self) -> &[IdBatch] {
        &self.batches
    }

    /// Full clear for disconnect/reconnect only; batches survive scene changes.
    pub fn reset_all(&mut self) {
        self.batches.clear();
        self.total_allocated = 0;
        self.total_used = 0;
        self.refill_requested = false;
    }

    pub fn validate_integrity(&self) -> Result<(), BatchIntegrityError> {
        for (i, first) in self.batches.iter().enumerate() {
            if !first.is_consistent() {
                return Err(BatchIntegrityError::Inconsistent(*first));
            }
            for second in &self.batches[i + 1..] {
                if first.overlaps(second) {
                    return Err(BatchIntegrityError::Overlap {
                        first: *first,
                        second: *second,
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ClientIdAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id batches={} allocated={} used={} remaining={} requested={}",
            self.batches.len(),
            self.total_allocated,
            self.total_used,
            self.remaining_ids(),
            self.refill_requested
        )?;
        for batch in &self.batches {
            write!(f, " {}", batch)?;
        }
        Ok(())
    }
}
