use std::fmt;

pub type NetId = u32;

/// Contiguous identifier range `[start, start + size)` consumed front to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdBatch {
    start: NetId,
    size: u32,
    next_available: u64,
    remaining: u32,
}

impl IdBatch {
    pub fn new(start: NetId, size: u32) -> Self {
        Self {
            start,
            size,
            next_available: start as u64,
            remaining: size,
        }
    }

    pub fn start(&self) -> NetId {
        self.start
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Exclusive end of the range.
    pub fn end(&self) -> u64 {
        self.start as u64 + self.size as u64
    }

    pub fn next_available(&self) -> u64 {
        self.next_available
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    pub fn contains(&self, id: NetId) -> bool {
        let id = id as u64;
        id >= self.start as u64 && id < self.end()
    }

    pub fn overlaps(&self, other: &IdBatch) -> bool {
        (self.start as u64) < other.end() && (other.start as u64) < self.end()
    }

    pub fn take_next(&mut self) -> Option<NetId> {
        if self.remaining == 0 {
            return None;
        }
        let id = NetId::try_from(self.next_available).ok()?;
        self.next_available += 1;
        self.remaining -= 1;
        Some(id)
    }

    pub fn is_consistent(&self) -> bool {
        self.next_available >= self.start as u64
            && self.next_available <= self.end()
            && self.remaining as u64 == self.end() - self.next_available
    }

    #[cfg(test)]
    pub(crate) fn corrupt_remaining(&mut self, remaining: u32) {
        self.remaining = remaining;
    }
}

impl fmt::Display for IdBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..{}) next={} remaining={}",
            self.start,
            self.end(),
            self.next_available,
            self.remaining
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_take() {
        let mut batch = IdBatch::new(1000, 3);
        assert_eq!(batch.take_next(), Some(1000));
        assert_eq!(batch.take_next(), Some(1001));
        assert_eq!(batch.take_next(), Some(1002));
        assert_eq!(batch.take_next(), None);
        assert!(batch.is_exhausted());
        assert!(batch.is_consistent());
    }

    #[test]
    fn range_checks() {
        let a = IdBatch::new(1000, 200);
        assert!(a.contains(1000));
        assert!(a.contains(1199));
        assert!(!a.contains(999));
        assert!(!a.contains(1200));

        assert!(a.overlaps(&IdBatch::new(1199, 10)));
        assert!(!a.overlaps(&IdBatch::new(1200, 10)));
        assert!(a.overlaps(&IdBatch::new(900, 101)));
        assert!(!a.overlaps(&IdBatch::new(900, 100)));
    }

    #[test]
    fn range_at_top_of_id_space() {
        let mut batch = IdBatch::new(u32::MAX - 1, 2);
        assert_eq!(batch.take_next(), Some(u32::MAX - 1));
        assert_eq!(batch.take_next(), Some(u32::MAX));
        assert_eq!(batch.take_next(), None);
        assert!(batch.is_consistent());
    }
}
