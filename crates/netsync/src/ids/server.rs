use std::collections::BTreeMap;

use super::batch::{IdBatch, NetId};
use crate::config::{ConfigSource, SyncConfig};

/// Authority-side record of every batch handed to a client and not yet
/// released. Entries never overlap.
#[derive(Debug, Clone)]
pub struct BatchLedger {
    batch_size: u32,
    batches: BTreeMap<NetId, IdBatch>,
}

impl BatchLedger {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size(),
            batches: BTreeMap::new(),
        }
    }

    /// Re-reads the batch size. Existing entries keep the size they were
    /// granted with.
    pub fn refresh(&mut self, source: &dyn ConfigSource) {
        self.batch_size = source.current().batch_size();
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Reserves the next free range after `last_assigned`. A candidate that
    /// intersects an outstanding batch is pushed forward one batch size at a
    /// time. Returns `None` only when the id space is exhausted.
    pub fn allocate_batch(&mut self, last_assigned: NetId) -> Option<NetId> {
        let size = self.batch_size as u64;
        let mut start = last_assigned as u64 + 1;

        loop {
            if start + size > u32::MAX as u64 + 1 {
                log::error!(
                    "Id space exhausted allocating a batch of {} after {}",
                    size,
                    last_assigned
                );
                return None;
            }

            let candidate = IdBatch::new(start as NetId, self.batch_size);
            match self.overlapping(&candidate) {
                Some(existing) => {
                    log::warn!(
                        "Batch candidate {} collides with outstanding batch {}, advancing",
                        candidate,
                        existing
                    );
                    start += size;
                }
                None => {
                    self.batches.insert(candidate.start(), candidate);
                    log::debug!(
                        "Allocated id batch {} ({} outstanding)",
                        candidate,
                        self.batches.len()
                    );
                    return Some(candidate.start());
                }
            }
        }
    }

    fn overlapping(&self, candidate: &IdBatch) -> Option<IdBatch> {
        let upper = NetId::try_from(candidate.end() - 1).unwrap_or(NetId::MAX);
        self.batches
            .range(..=upper)
            .next_back()
            .map(|(_, b)| *b)
            .filter(|b| b.overlaps(candidate))
    }

    pub fn batch_containing(&self, id: NetId) -> Option<&IdBatch> {
        self.batches
            .range(..=id)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.contains(id))
    }

    pub fn is_id_in_any_batch(&self, id: NetId) -> bool {
        self.batch_containing(id).is_some()
    }

    pub fn release_batch(&mut self, batch_start: NetId) -> bool {
        let released = self.batches.remove(&batch_start).is_some();
        if released {
            log::debug!("Released id batch starting at {}", batch_start);
        } else {
            log::warn!("No outstanding id batch starts at {}", batch_start);
        }
        released
    }

    pub fn reset_all(&mut self) {
        log::info!("Clearing {} outstanding id batches", self.batches.len());
        self.batches.clear();
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdBatch> {
        self.batches.values()
    }
}

/// The authority's own id minting. Ids inside client batches are skipped,
/// and client batches are granted from the authority's current position.
#[derive(Debug, Clone)]
pub struct ServerIdAuthority {
    ledger: BatchLedger,
    last_assigned: NetId,
}

impl ServerIdAuthority {
    pub fn new(ledger: BatchLedger) -> Self {
        Self {
            ledger,
            last_assigned: 0,
        }
    }

    pub fn mint_id(&mut self) -> Option<NetId> {
        let mut next = self.last_assigned.checked_add(1)?;
        while let Some(batch) = self.ledger.batch_containing(next) {
            let after = batch.end();
            next = NetId::try_from(after).ok()?;
        }
        self.last_assigned = next;
        Some(next)
    }

    pub fn grant_batch(&mut self) -> Option<NetId> {
        self.ledger.allocate_batch(self.last_assigned)
    }

    pub fn release_batch(&mut self, batch_start: NetId) -> bool {
        self.ledger.release_batch(batch_start)
    }

    pub fn last_assigned(&self) -> NetId {
        self.last_assigned
    }

    pub fn ledger(&self) -> &BatchLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut BatchLedger {
        &mut self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> BatchLedger {
        BatchLedger::new(&SyncConfig::default())
    }

    #[test]
    fn allocates_after_last_assigned() {
        let mut ledger = ledger();
        assert_eq!(ledger.allocate_batch(999), Some(1000));
    }

    #[test]
    fn sequential_batches() {
        let mut ledger = ledger();
        let first = ledger.allocate_batch(999).unwrap();
        let second = ledger.allocate_batch(first + 199).unwrap();
        assert_eq!(second, first + 200);
    }

    #[test]
    fn collision_advances_by_batch_size() {
        let mut ledger = ledger();
        assert_eq!(ledger.allocate_batch(999), Some(1000));
        assert_eq!(ledger.allocate_batch(999), Some(1200));
        assert_eq!(ledger.allocate_batch(999), Some(1400));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn partial_overlap_is_a_collision() {
        let mut ledger = ledger();
        ledger.allocate_batch(999);
        assert_eq!(ledger.allocate_batch(1049), Some(1250));
    }

    #[test]
    fn membership() {
        let mut ledger = ledger();
        let start = ledger.allocate_batch(999).unwrap();
        assert!(ledger.is_id_in_any_batch(start));
        assert!(ledger.is_id_in_any_batch(start + 100));
        assert!(ledger.is_id_in_any_batch(start + 199));
        assert!(!ledger.is_id_in_any_batch(start - 1));
        assert!(!ledger.is_id_in_any_batch(start + 200));
    }

    #[test]
    fn release_and_reuse() {
        let mut ledger = ledger();
        let start = ledger.allocate_batch(999).unwrap();
        assert!(ledger.release_batch(start));
        assert!(!ledger.release_batch(start));
        assert!(!ledger.is_id_in_any_batch(start));
        assert_eq!(ledger.allocate_batch(999), Some(start));
    }

    #[test]
    fn reset_clears_everything() {
        let mut ledger = ledger();
        ledger.allocate_batch(0);
        ledger.allocate_batch(0);
        ledger.reset_all();
        assert!(ledger.is_empty());
    }

    #[test]
    fn batch_size_change_keeps_ranges_disjoint() {
        let mut ledger = ledger();
        ledger.allocate_batch(999);
        ledger.refresh(&SyncConfig {
            id_batch_size: 500,
            ..SyncConfig::default()
        });
        let start = ledger.allocate_batch(899).unwrap();
        assert_eq!(start, 1400);

        let batches: Vec<_> = ledger.iter().copied().collect();
        assert!(!batches[0].overlaps(&batches[1]));
    }

    #[test]
    fn exhausted_id_space() {
        let mut ledger = ledger();
        assert_eq!(ledger.allocate_batch(u32::MAX - 10), None);
    }

    #[test]
    fn authority_skips_client_ranges() {
        let mut authority = ServerIdAuthority::new(ledger());
        assert_eq!(authority.mint_id(), Some(1));
        assert_eq!(authority.grant_batch(), Some(2));
        assert_eq!(authority.mint_id(), Some(202));
        assert_eq!(authority.grant_batch(), Some(203));

        assert!(authority.release_batch(2));
        assert_eq!(authority.mint_id(), Some(403));
    }
}
