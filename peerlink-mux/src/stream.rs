use std::collections::HashMap;

use bytes::BytesMut;

use crate::chunk::PayloadKind;
use crate::reliability::Reliability;

/// True when `a` precedes `b` in wrapping 16-bit sequence space.
pub(crate) fn seq16_lt(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 1 << 15
}

/// Per-stream send/receive state.
///
/// Buffered-byte accounting follows the channel contract: the counter grows
/// on enqueue, shrinks on acknowledgment or abandonment, and the
/// low-watermark notification fires exactly once per crossing from above
/// the threshold to at-or-below it.
pub(crate) struct Stream {
    pub(crate) reliability: Reliability,

    // send side
    pub(crate) next_ssn_out: u16,
    buffered: usize,
    low_threshold: usize,
    above_threshold: bool,
    pub(crate) reset_sent: bool,

    // receive side
    next_ssn_in: u16,
    ordered_pending: HashMap<u16, (PayloadKind, BytesMut)>,
}

impl Stream {
    pub(crate) fn new(reliability: Reliability) -> Self {
        Self {
            reliability,
            next_ssn_out: 0,
            buffered: 0,
            low_threshold: 0,
            above_threshold: false,
            reset_sent: false,
            next_ssn_in: 0,
            ordered_pending: HashMap::new(),
        }
    }

    pub(crate) fn buffered_amount(&self) -> usize {
        self.buffered
    }

    pub(crate) fn low_threshold(&self) -> usize {
        self.low_threshold
    }

    pub(crate) fn set_low_threshold(&mut self, threshold: usize) {
        self.low_threshold = threshold;
        self.above_threshold = self.buffered > threshold;
    }

    pub(crate) fn on_enqueued(&mut self, len: usize) {
        self.buffered += len;
        if self.buffered > self.low_threshold {
            self.above_threshold = true;
        }
    }

    /// Returns true when this dequeue crossed the low watermark.
    #[must_use]
    pub(crate) fn on_dequeued(&mut self, len: usize) -> bool {
        self.buffered = self.buffered.saturating_sub(len);
        if self.above_threshold && self.buffered <= self.low_threshold {
            self.above_threshold = false;
            return true;
        }
        false
    }

    pub(crate) fn pending_ordered(&self) -> usize {
        self.ordered_pending.len()
    }

    /// Feed one complete ordered message; returns every message now
    /// deliverable in stream-sequence order.
    pub(crate) fn deliver_ordered(
        &mut self,
        ssn: u16,
        kind: PayloadKind,
        payload: BytesMut,
    ) -> Vec<(PayloadKind, BytesMut)> {
        let mut out = Vec::new();
        if ssn == self.next_ssn_in {
            out.push((kind, payload));
            self.next_ssn_in = self.next_ssn_in.wrapping_add(1);
            while let Some(next) = self.ordered_pending.remove(&self.next_ssn_in) {
                out.push(next);
                self.next_ssn_in = self.next_ssn_in.wrapping_add(1);
            }
        } else if seq16_lt(self.next_ssn_in, ssn) {
            self.ordered_pending.insert(ssn, (kind, payload));
        }
        // A stale sequence is a duplicate of something already delivered
        out
    }

    /// Skip ordered delivery past an abandoned message, releasing anything
    /// buffered behind it.
    pub(crate) fn skip_past(&mut self, abandoned_ssn: u16) -> Vec<(PayloadKind, BytesMut)> {
        let mut out = Vec::new();
        if seq16_lt(self.next_ssn_in, abandoned_ssn.wrapping_add(1))
            || self.next_ssn_in == abandoned_ssn
        {
            // Drop partials for skipped sequences, keep anything ahead
            let first_valid = abandoned_ssn.wrapping_add(1);
            self.ordered_pending
                .retain(|&ssn, _| !seq16_lt(ssn, first_valid));
            self.next_ssn_in = first_valid;
            while let Some(next) = self.ordered_pending.remove(&self.next_ssn_in) {
                out.push(next);
                self.next_ssn_in = self.next_ssn_in.wrapping_add(1);
            }
        }
        out
    }

    pub(crate) fn reset_receive_state(&mut self) {
        self.ordered_pending.clear();
        self.next_ssn_in = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(byte: u8) -> (PayloadKind, BytesMut) {
        (PayloadKind::Binary, BytesMut::from(&[byte][..]))
    }

    #[test]
    fn test_ordered_delivery_buffers_early_arrivals() {
        let mut s = Stream::new(Reliability::reliable_ordered());
        let (kind, payload) = msg(2);
        assert!(s.deliver_ordered(2, kind, payload).is_empty());
        let (kind, payload) = msg(1);
        assert!(s.deliver_ordered(1, kind, payload).is_empty());
        let (kind, payload) = msg(0);
        let ready = s.deliver_ordered(0, kind, payload);
        assert_eq!(ready.len(), 3);
        assert_eq!(ready[0].1[0], 0);
        assert_eq!(ready[1].1[0], 1);
        assert_eq!(ready[2].1[0], 2);
    }

    #[test]
    fn test_duplicate_ordered_message_dropped() {
        let mut s = Stream::new(Reliability::reliable_ordered());
        let (kind, payload) = msg(0);
        assert_eq!(s.deliver_ordered(0, kind, payload).len(), 1);
        let (kind, payload) = msg(0);
        assert!(s.deliver_ordered(0, kind, payload).is_empty());
    }

    #[test]
    fn test_skip_past_releases_buffered() {
        let mut s = Stream::new(Reliability::reliable_ordered());
        let (kind, payload) = msg(1);
        assert!(s.deliver_ordered(1, kind, payload).is_empty());
        // message 0 was abandoned by the sender
        let ready = s.skip_past(0);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1[0], 1);
    }

    #[test]
    fn test_low_watermark_fires_once_per_crossing() {
        let mut s = Stream::new(Reliability::reliable_ordered());
        s.set_low_threshold(10);
        s.on_enqueued(20);
        assert!(!s.on_dequeued(5)); // 15, still above
        assert!(s.on_dequeued(5)); // 10, crossed
        assert!(!s.on_dequeued(5)); // 5, already below
        s.on_enqueued(20); // 25, above again
        assert!(s.on_dequeued(20)); // 5, crossed again
    }

    #[test]
    fn test_watermark_not_fired_while_above() {
        let mut s = Stream::new(Reliability::reliable_ordered());
        s.set_low_threshold(4);
        s.on_enqueued(100);
        assert!(!s.on_dequeued(10));
        assert!(!s.on_dequeued(10));
        assert_eq!(s.buffered_amount(), 80);
    }

    #[test]
    fn test_seq16_wrapping() {
        assert!(seq16_lt(65535, 0));
        assert!(seq16_lt(0, 1));
        assert!(!seq16_lt(1, 0));
        assert!(!seq16_lt(5, 5));
    }
}
