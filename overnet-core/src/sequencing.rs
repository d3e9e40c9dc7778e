//! Per-stream sequencing: what has been sent and not yet acknowledged, and
//! what has been received and may be handed to the application.

use std::collections::{BTreeMap, BTreeSet};

use crate::protocol::ReliabilityAndOrdering;
use crate::slice::Slice;

/// Send side of one stream. Sequence numbers start at zero; after `n`
/// messages `next_seq()` is `n`, which is also the `final_seq` announced on
/// close.
#[derive(Debug)]
pub struct SendWindow {
    reliable: bool,
    next_seq: u64,
    unacked: BTreeMap<u64, Slice>,
    retries: u32,
    /// The peer reported holding unread data since the last retransmission
    /// round.
    heard: bool,
}

impl SendWindow {
    pub fn new(reliability: ReliabilityAndOrdering) -> Self {
        Self {
            reliable: reliability.is_reliable(),
            next_seq: 0,
            unacked: BTreeMap::new(),
            retries: 0,
            heard: false,
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Unreliable streams never wait for window space.
    pub fn has_capacity(&self, window: usize) -> bool {
        !self.reliable || self.unacked.len() < window
    }

    /// Assign the next sequence number to `payload`, keeping a copy for
    /// retransmission when the stream is reliable.
    pub fn record_sent(&mut self, payload: Slice) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.reliable {
            self.unacked.insert(seq, payload);
        }
        seq
    }

    /// Returns true if `seq` was outstanding.
    pub fn ack(&mut self, seq: u64) -> bool {
        let progressed = self.unacked.remove(&seq).is_some();
        if progressed {
            self.retries = 0;
        }
        progressed
    }

    /// The peer has `seq` queued for its reader. Returns true if `seq` was
    /// outstanding.
    pub fn hold(&mut self, seq: u64) -> bool {
        let outstanding = self.unacked.contains_key(&seq);
        self.heard |= outstanding;
        outstanding
    }

    /// Whether a hold arrived since the last call.
    pub fn take_heard(&mut self) -> bool {
        std::mem::take(&mut self.heard)
    }

    pub fn is_drained(&self) -> bool {
        self.unacked.is_empty()
    }

    pub fn outstanding(&self) -> impl Iterator<Item = (u64, &Slice)> {
        self.unacked.iter().map(|(seq, payload)| (*seq, payload))
    }

    /// Count one retransmission round and return the number of rounds since
    /// the last acknowledged progress.
    pub fn bump_retries(&mut self) -> u32 {
        self.retries += 1;
        self.retries
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Keep backing off at the longest delay without giving up.
    pub fn clamp_retries(&mut self, max: u32) {
        self.retries = self.retries.min(max);
    }

    /// Forget everything outstanding (the stream is closed).
    pub fn abandon(&mut self) {
        self.unacked.clear();
    }
}

/// Outcome of feeding one data frame into a [`ReceiveWindow`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Received {
    /// Messages now deliverable with their sequence numbers, in delivery
    /// order.
    pub deliver: Vec<(u64, Slice)>,
    /// The frame was a duplicate or arrived too late to be used.
    pub discarded: bool,
    /// The frame did not fit the window and was not kept.
    pub refused: bool,
}

/// Receive side of one stream.
#[derive(Debug)]
pub struct ReceiveWindow {
    mode: ReliabilityAndOrdering,
    /// Ordered modes: next sequence number to deliver. Reliable unordered:
    /// every sequence number below this has been delivered.
    floor: u64,
    reorder: BTreeMap<u64, Slice>,
    seen: BTreeSet<u64>,
    window: usize,
}

impl ReceiveWindow {
    /// `window` bounds how many messages may wait for the reader, counting
    /// both delivered ones and those held for reordering.
    pub fn new(mode: ReliabilityAndOrdering, window: usize) -> Self {
        Self {
            mode,
            floor: 0,
            reorder: BTreeMap::new(),
            seen: BTreeSet::new(),
            window: window.max(1),
        }
    }

    /// Feed one data frame. `queued` is the number of delivered messages the
    /// reader has not taken yet.
    pub fn on_data(&mut self, seq: u64, payload: Slice, queued: usize) -> Received {
        use ReliabilityAndOrdering::*;
        let mut out = Received::default();
        let room = self.window.saturating_sub(queued) as u64;
        match self.mode {
            ReliableOrdered => {
                if seq < self.floor || self.reorder.contains_key(&seq) {
                    out.discarded = true;
                    return out;
                }
                if seq - self.floor >= room {
                    out.refused = true;
                    return out;
                }
                self.reorder.insert(seq, payload);
                while let Some(next) = self.reorder.remove(&self.floor) {
                    out.deliver.push((self.floor, next));
                    self.floor += 1;
                }
            }
            ReliableUnordered => {
                if seq < self.floor || self.seen.contains(&seq) {
                    out.discarded = true;
                    return out;
                }
                if seq - self.floor >= room {
                    out.refused = true;
                    return out;
                }
                self.seen.insert(seq);
                out.deliver.push((seq, payload));
                while self.seen.remove(&self.floor) {
                    self.floor += 1;
                }
            }
            UnreliableOrdered => {
                if seq < self.floor {
                    out.discarded = true;
                    return out;
                }
                if room == 0 {
                    out.refused = true;
                    return out;
                }
                self.floor = seq + 1;
                out.deliver.push((seq, payload));
            }
            UnreliableUnordered if room == 0 => out.refused = true,
            UnreliableUnordered => out.deliver.push((seq, payload)),
        }
        out
    }

    pub fn resize(&mut self, window: usize) {
        self.window = window.max(1);
    }

    /// Whether `seq` is waiting in the reorder buffer.
    pub fn holds(&self, seq: u64) -> bool {
        self.reorder.contains_key(&seq)
    }

    /// Whether everything a peer sent before announcing `final_seq` has been
    /// seen. Unreliable streams never wait.
    pub fn is_complete(&self, final_seq: u64) -> bool {
        !self.mode.is_reliable() || self.floor >= final_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReliabilityAndOrdering::*;

    fn s(v: u8) -> Slice {
        Slice::from(vec![v])
    }

    fn bytes(r: &Received) -> Vec<u8> {
        r.deliver.iter().map(|(_, m)| m[0]).collect()
    }

    #[test]
    fn send_window_tracks_reliable_only() {
        let mut w = SendWindow::new(ReliableOrdered);
        assert_eq!(w.record_sent(s(0)), 0);
        assert_eq!(w.record_sent(s(1)), 1);
        assert!(!w.has_capacity(2));
        assert!(w.has_capacity(3));
        assert_eq!(w.bump_retries(), 1);
        assert!(w.ack(0));
        assert!(!w.ack(0));
        assert_eq!(w.retries(), 0);
        assert_eq!(w.outstanding().map(|(seq, _)| seq).collect::<Vec<_>>(), vec![1]);
        w.ack(1);
        assert!(w.is_drained());
        assert_eq!(w.next_seq(), 2);

        let mut u = SendWindow::new(UnreliableOrdered);
        for i in 0..10 {
            u.record_sent(s(i));
        }
        assert!(u.is_drained());
        assert!(u.has_capacity(1));
    }

    #[test]
    fn holds_keep_retries_from_running_out() {
        let mut w = SendWindow::new(ReliableOrdered);
        w.record_sent(s(0));
        assert!(!w.hold(7));
        assert!(!w.take_heard());
        assert!(w.hold(0));
        for _ in 0..5 {
            w.bump_retries();
        }
        assert!(w.take_heard());
        assert!(!w.take_heard());
        w.clamp_retries(3);
        assert_eq!(w.retries(), 3);
        assert!(w.ack(0));
        assert_eq!(w.retries(), 0);
    }

    #[test]
    fn reliable_window_refuses_beyond_room() {
        let mut w = ReceiveWindow::new(ReliableOrdered, 3);
        assert!(w.on_data(3, s(3), 0).refused);
        assert!(!w.on_data(2, s(2), 0).refused);
        assert!(w.holds(2));
        let r = w.on_data(0, s(0), 0);
        assert_eq!(r.deliver.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(), vec![0]);
        // Reader still has 0 queued: only 1 and 2 fit.
        assert!(w.on_data(3, s(3), 1).refused);
        assert_eq!(bytes(&w.on_data(1, s(1), 1)), vec![1, 2]);
        assert!(!w.holds(2));
        // Three queued: nothing new fits, duplicates are still recognised.
        let full = w.on_data(3, s(3), 3);
        assert!(full.refused && full.deliver.is_empty());
        assert!(w.on_data(1, s(1), 3).discarded);
        assert_eq!(bytes(&w.on_data(3, s(3), 0)), vec![3]);

        let mut u = ReceiveWindow::new(ReliableUnordered, 2);
        assert_eq!(bytes(&u.on_data(1, s(1), 0)), vec![1]);
        assert!(u.on_data(2, s(2), 1).refused);
        assert_eq!(bytes(&u.on_data(0, s(0), 1)), vec![0]);
        assert!(u.on_data(0, s(0), 2).discarded);
    }

    #[test]
    fn unreliable_window_drops_when_full() {
        let mut w = ReceiveWindow::new(UnreliableOrdered, 2);
        assert_eq!(bytes(&w.on_data(0, s(0), 1)), vec![0]);
        assert!(w.on_data(1, s(1), 2).refused);
        assert_eq!(bytes(&w.on_data(2, s(2), 0)), vec![2]);

        let mut u = ReceiveWindow::new(UnreliableUnordered, 1);
        assert!(u.on_data(4, s(4), 1).refused);
        assert_eq!(bytes(&u.on_data(4, s(4), 0)), vec![4]);
    }

    #[test]
    fn reliable_ordered_reorders_and_dedupes() {
        let mut w = ReceiveWindow::new(ReliableOrdered, 16);
        assert!(bytes(&w.on_data(1, s(1), 0)).is_empty());
        assert!(bytes(&w.on_data(2, s(2), 0)).is_empty());
        assert!(w.on_data(1, s(1), 0).discarded);
        assert_eq!(bytes(&w.on_data(0, s(0), 0)), vec![0, 1, 2]);
        assert!(w.on_data(0, s(0), 0).discarded);
        assert!(w.is_complete(3));
        assert!(!w.is_complete(4));
    }

    #[test]
    fn reliable_unordered_delivers_once() {
        let mut w = ReceiveWindow::new(ReliableUnordered, 16);
        assert_eq!(bytes(&w.on_data(2, s(2), 0)), vec![2]);
        assert!(w.on_data(2, s(2), 0).discarded);
        assert!(!w.is_complete(3));
        assert_eq!(bytes(&w.on_data(0, s(0), 0)), vec![0]);
        assert_eq!(bytes(&w.on_data(1, s(1), 0)), vec![1]);
        assert!(w.on_data(1, s(1), 0).discarded);
        assert!(w.is_complete(3));
    }

    #[test]
    fn unreliable_ordered_drops_stale() {
        let mut w = ReceiveWindow::new(UnreliableOrdered, 16);
        assert_eq!(bytes(&w.on_data(0, s(0), 0)), vec![0]);
        assert_eq!(bytes(&w.on_data(3, s(3), 0)), vec![3]);
        assert!(w.on_data(2, s(2), 0).discarded);
        assert!(w.is_complete(100));
    }

    #[test]
    fn unreliable_unordered_passes_everything() {
        let mut w = ReceiveWindow::new(UnreliableUnordered, 16);
        assert_eq!(bytes(&w.on_data(5, s(5), 0)), vec![5]);
        assert_eq!(bytes(&w.on_data(1, s(1), 0)), vec![1]);
    }
}
