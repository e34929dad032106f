pub const RTT_HISTORY_LEN: usize = 5;

/// Latest round-trip sample plus a moving average over the last
/// [`RTT_HISTORY_LEN`] samples. The first sample seeds every slot.
#[derive(Debug, Clone, Default)]
pub struct RttHistory {
    samples: [f32; RTT_HISTORY_LEN],
    next: usize,
    sum: f32,
    latest: Option<f32>,
}

impl RttHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, rtt_ms: f32) {
        match self.latest {
            None => {
                self.samples = [rtt_ms; RTT_HISTORY_LEN];
                self.sum = rtt_ms * RTT_HISTORY_LEN as f32;
                self.next = 0;
            }
            Some(_) => {
                self.sum += rtt_ms - self.samples[self.next];
                self.samples[self.next] = rtt_ms;
                self.next = (self.next + 1) % RTT_HISTORY_LEN;
            }
        }
        self.latest = Some(rtt_ms);
    }

    pub fn latest(&self) -> Option<f32> {
        self.latest
    }

    pub fn average(&self) -> Option<f32> {
        self.latest.map(|_| self.sum / RTT_HISTORY_LEN as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn empty_history() {
        let rtt = RttHistory::new();
        assert_eq!(rtt.latest(), None);
        assert_eq!(rtt.average(), None);
    }

    #[test]
    fn first_sample_seeds_all_slots() {
        let mut rtt = RttHistory::new();
        rtt.record(80.0);
        assert_eq!(rtt.latest(), Some(80.0));
        assert!(close(rtt.average().unwrap(), 80.0));

        rtt.record(30.0);
        assert!(close(rtt.average().unwrap(), (80.0 * 4.0 + 30.0) / 5.0));
    }

    #[test]
    fn window_slides() {
        let mut rtt = RttHistory::new();
        for sample in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0] {
            rtt.record(sample);
        }
        // 10 seeded everywhere, then 20..60 overwrite all five slots.
        assert!(close(rtt.average().unwrap(), 40.0));
        assert_eq!(rtt.latest(), Some(60.0));
    }
}
