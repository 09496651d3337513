//! Per-direction flow state.

use crate::conntrack::reassembly::Msp;
use bitmask_enum::bitmask;
use std::collections::{BTreeMap, VecDeque};

/// Bits tracked once-per-direction rather than per-packet.
#[bitmask(u8)]
pub enum StaticFlags {
    BaseSeqSet,
    SawSyn,
    SawSynAck,
}

/// Persistent per-direction flags.
#[bitmask(u8)]
pub enum FlowFlags {
    ReassembleUntilFin,
}

/// One entry of `FlowState::unacked_segments`.
#[derive(Debug, Clone, Copy)]
pub struct UnackedSegment {
    pub frame: u64,
    pub seq: u32,
    pub nextseq: u32,
    pub ts: f64,
}

/// Per-direction TCP analysis state.
#[derive(Debug, Clone)]
pub struct FlowState {
    pub base_seq: u32,
    pub static_flags: StaticFlags,

    pub nextseq: u32,
    pub nextseqframe: u64,
    pub nextseqtime: f64,

    pub lastack: u32,
    pub lastacktime: f64,
    pub lastnondupack: u32,
    pub dupacknum: u32,
    /// Frame carrying the pure ACK that started the current dup-ack run.
    pub dupack_frame: u64,

    pub maxseqtobeacked: u32,

    pub window: u16,
    /// -1 unknown, -2 known-not-scaled, 0..=14 shift.
    pub win_scale: i8,

    pub valid_bif: bool,

    pub push_bytes_sent: u32,
    pub push_set_last: bool,

    unacked_segments: VecDeque<UnackedSegment>,
    unacked_cap: usize,

    pub scps_capable: bool,
    pub maxsizeacked: u32,

    pub multisegment_pdus: BTreeMap<u32, Msp>,

    pub fin: u64,
    pub flags: FlowFlags,
    pub maxnextseq: u32,

    pub mptcp_subflow: Option<crate::mptcp::SubflowId>,

    /// Last segment's seglen/flags, used by the KA/ZWP-ACK lookback against
    /// the reverse flow's previous segment.
    pub last_seglen: u32,
    pub last_was_keepalive: bool,
    pub last_was_zwp: bool,
}

impl FlowState {
    pub fn new(unacked_cap: usize) -> Self {
        FlowState {
            base_seq: 0,
            static_flags: StaticFlags::none(),
            nextseq: 0,
            nextseqframe: 0,
            nextseqtime: 0.0,
            lastack: 0,
            lastacktime: 0.0,
            lastnondupack: 0,
            dupacknum: 0,
            dupack_frame: 0,
            maxseqtobeacked: 0,
            window: 0,
            win_scale: -1,
            valid_bif: true,
            push_bytes_sent: 0,
            push_set_last: false,
            unacked_segments: VecDeque::new(),
            unacked_cap,
            scps_capable: false,
            maxsizeacked: 0,
            multisegment_pdus: BTreeMap::new(),
            fin: 0,
            flags: FlowFlags::none(),
            maxnextseq: 0,
            mptcp_subflow: None,
            last_seglen: 0,
            last_was_keepalive: false,
            last_was_zwp: false,
        }
    }

    /// Sets `base_seq` on first sight of this direction. No-op once `BaseSeqSet` is latched.
    pub fn maybe_set_base_seq(&mut self, seq: u32, is_syn: bool) {
        if self.static_flags.contains(StaticFlags::BaseSeqSet) {
            return;
        }
        self.base_seq = if is_syn { seq } else { seq.wrapping_sub(1) };
        self.static_flags |= StaticFlags::BaseSeqSet;
    }

    /// Effective scaled window, falling back to `default_scale` when no
    /// Window Scale option has been observed yet.
    pub fn scaled_window(&self, default_scale: i8) -> u32 {
        let shift = match self.win_scale {
            s if s >= 0 => s,
            _ if default_scale >= 0 => default_scale,
            _ => 0,
        };
        (self.window as u32) << shift.min(14)
    }

    pub fn unacked_segments(&self) -> &VecDeque<UnackedSegment> {
        &self.unacked_segments
    }

    /// Appends a newly-sent, not-yet-acked segment, enforcing the cap.
    pub fn push_unacked(&mut self, seg: UnackedSegment) {
        if self.unacked_segments.len() >= self.unacked_cap {
            self.unacked_segments.pop_front();
            self.valid_bif = false;
            log::warn!("unacked_segments cap reached, dropping oldest entry");
        }
        self.unacked_segments.push_back(seg);
    }

    /// Removes everything acked by `ack`.
    ///
    /// Returns `(exact_match, bytes_in_flight)` where `exact_match` is the
    /// fully-acked segment closest to `ack`, if any.
    pub fn ack_unacked(&mut self, ack: u32, now: f64) -> (Option<UnackedSegment>, Option<u32>) {
        let mut exact = None;
        while let Some(front) = self.unacked_segments.front_mut() {
            if crate::utils::seq_geq(ack, front.nextseq) {
                let seg = self.unacked_segments.pop_front().unwrap();
                if seg.nextseq == ack {
                    exact = Some(seg);
                }
            } else if crate::utils::seq_gt(ack, front.seq) {
                // Partial ack: shrink the segment from the front.
                front.seq = ack;
                break;
            } else {
                break;
            }
        }
        let _ = now;
        let bif = self.bytes_in_flight();
        (exact, bif)
    }

    /// `max(nextseq) - min(seq)` over the current unacked list.
    pub fn bytes_in_flight(&self) -> Option<u32> {
        if self.unacked_segments.is_empty() {
            return None;
        }
        let min_seq = self
            .unacked_segments
            .iter()
            .map(|u| u.seq)
            .min()
            .expect("non-empty");
        let max_nextseq = self
            .unacked_segments
            .iter()
            .map(|u| u.nextseq)
            .max()
            .expect("non-empty");
        let bif = crate::utils::seq_diff(max_nextseq, min_seq);
        if bif > 0 && (bif as u64) < 2_000_000_000 {
            Some(bif)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn base_seq_latched_once() {
        let mut f = FlowState::new(10_000);
        f.maybe_set_base_seq(1000, true);
        assert_eq!(f.base_seq, 1000);
        f.maybe_set_base_seq(9999, false);
        assert_eq!(f.base_seq, 1000);
    }

    #[test]
    fn non_syn_base_seq_is_seq_minus_one() {
        let mut f = FlowState::new(10_000);
        f.maybe_set_base_seq(5001, false);
        assert_eq!(f.base_seq, 5000);
    }

    #[test]
    fn unacked_cap_drops_oldest_and_invalidates_bif() {
        let mut f = FlowState::new(2);
        for i in 0..3u32 {
            f.push_unacked(UnackedSegment {
                frame: i as u64,
                seq: i * 10,
                nextseq: i * 10 + 5,
                ts: 0.0,
            });
        }
        assert_eq!(f.unacked_segments().len(), 2);
        assert!(!f.valid_bif);
    }

    #[test]
    fn ack_unacked_removes_fully_acked_segments() {
        let mut f = FlowState::new(10_000);
        f.push_unacked(UnackedSegment { frame: 1, seq: 0, nextseq: 100, ts: 0.0 });
        f.push_unacked(UnackedSegment { frame: 2, seq: 100, nextseq: 200, ts: 0.0 });
        let (exact, bif) = f.ack_unacked(100, 1.0);
        assert!(exact.is_some());
        assert_eq!(f.unacked_segments().len(), 1);
        assert_eq!(bif, Some(100));
    }

    #[test]
    fn scaled_window_falls_back_to_default() {
        let mut f = FlowState::new(10_000);
        f.window = 100;
        assert_eq!(f.scaled_window(-1), 100);
        assert_eq!(f.scaled_window(3), 800);
        f.win_scale = 2;
        assert_eq!(f.scaled_window(5), 400);
    }
}
