use std::collections::VecDeque;
use std::time::Instant;

use super::protocol::{PacketHeader, sequence_greater_than};

#[derive(Debug, Clone)]
struct InFlight {
    sequence: u32,
    sent_at: Instant,
    acked: bool,
}

/// Remembers when each outgoing sequence left so acks turn into RTT samples.
#[derive(Debug)]
pub struct AckTracker {
    in_flight: VecDeque<InFlight>,
    max_in_flight: usize,
}

impl AckTracker {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            in_flight: VecDeque::with_capacity(max_in_flight),
            max_in_flight,
        }
    }

    pub fn track(&mut self, sequence: u32, sent_at: Instant) {
        while self.in_flight.len() >= self.max_in_flight {
            self.in_flight.pop_front();
        }
        self.in_flight.push_back(InFlight {
            sequence,
            sent_at,
            acked: false,
        });
    }

    /// Marks everything covered by `ack`/`ack_bitfield` and returns one RTT
    /// sample in milliseconds per newly acked packet.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32, now: Instant) -> Vec<f32> {
        let mut samples = Vec::new();

        for pending in self.in_flight.iter_mut().filter(|p| !p.acked) {
            let is_acked = if pending.sequence == ack {
                true
            } else if sequence_greater_than(ack, pending.sequence) {
                let diff = ack.wrapping_sub(pending.sequence);
                diff <= 32 && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };

            if is_acked {
                pending.acked = true;
                samples.push(now.duration_since(pending.sent_at).as_secs_f32() * 1000.0);
            }
        }

        while self.in_flight.front().is_some_and(|p| p.acked) {
            self.in_flight.pop_front();
        }

        samples
    }

    pub fn unacked_count(&self) -> usize {
        self.in_flight.iter().filter(|p| !p.acked).count()
    }
}

#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: u32,
    received_bitfield: u32,
    recent: VecDeque<u32>,
    max_recent: usize,
    any_received: bool,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: 0,
            received_bitfield: 0,
            recent: VecDeque::with_capacity(128),
            max_recent: 128,
            any_received: false,
        }
    }

    /// Returns false for a sequence seen recently.
    pub fn record(&mut self, sequence: u32) -> bool {
        if self.recent.contains(&sequence) {
            return false;
        }
        if self.recent.len() >= self.max_recent {
            self.recent.pop_front();
        }
        self.recent.push_back(sequence);

        if !self.any_received {
            self.any_received = true;
            self.last_received = sequence;
            self.received_bitfield = 0;
        } else if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            self.received_bitfield = if diff <= 32 {
                self.received_bitfield.checked_shl(diff).unwrap_or(0) | (1 << (diff - 1))
            } else {
                0
            };
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bitfield |= 1 << (diff - 1);
            }
        }

        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }
}

/// Per-peer sequencing shared by the send path and the receive loop.
#[derive(Debug)]
pub struct LinkState {
    send_sequence: u32,
    acks: AckTracker,
    received: ReceiveTracker,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            send_sequence: 0,
            acks: AckTracker::new(256),
            received: ReceiveTracker::new(),
        }
    }

    pub fn next_header(&mut self, now: Instant) -> PacketHeader {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.acks.track(sequence, now);

        let (ack, ack_bitfield) = self.received.ack_data();
        PacketHeader::new(sequence, ack, ack_bitfield)
    }

    /// `None` when the packet is a duplicate; otherwise the RTT samples its
    /// acks produced.
    pub fn on_header(&mut self, header: &PacketHeader, now: Instant) -> Option<Vec<f32>> {
        if !self.received.record(header.sequence) {
            return None;
        }
        Some(self.acks.process_ack(header.ack, header.ack_bitfield, now))
    }

    pub fn unacked_count(&self) -> usize {
        self.acks.unacked_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn receive_bitfield_in_order() {
        let mut tracker = ReceiveTracker::new();
        tracker.record(1);
        tracker.record(2);
        tracker.record(3);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn receive_bitfield_out_of_order() {
        let mut tracker = ReceiveTracker::new();
        tracker.record(3);
        tracker.record(1);
        tracker.record(2);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn duplicates_detected() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record(0));
        assert!(!tracker.record(0));
        assert!(tracker.record(1));
    }

    #[test]
    fn acks_yield_rtt_samples() {
        let start = Instant::now();
        let mut tracker = AckTracker::new(32);
        tracker.track(1, start);
        tracker.track(2, start);

        let samples = tracker.process_ack(2, 0b1, start + Duration::from_millis(40));
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| (*s - 40.0).abs() < 0.5));
        assert_eq!(tracker.unacked_count(), 0);

        assert!(tracker.process_ack(2, 0b1, start).is_empty());
    }

    #[test]
    fn link_round_trip_produces_sample() {
        let start = Instant::now();
        let mut client = LinkState::new();
        let mut server = LinkState::new();

        let outbound = client.next_header(start);
        assert_eq!(server.on_header(&outbound, start), Some(Vec::new()));

        let reply = server.next_header(start);
        let samples = client
            .on_header(&reply, start + Duration::from_millis(25))
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert!(client.on_header(&reply, start).is_none());
    }
}
