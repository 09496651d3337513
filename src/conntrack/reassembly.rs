//! Multisegment PDU reassembly.
//!
//! Grounded on `retina_core::conntrack::conn::tcp_conn::reassembly::{TcpFlow,
//! OutOfOrderBuffer}`, which buffers out-of-order `L4Pdu`s in a `VecDeque`
//! and flushes them once the gap closes. This module keeps that shape but
//! reassembles into subdissector-sized PDUs (`Msp`) instead of just
//! re-ordering segments, since this reassembler must honor an "I need N
//! more bytes" protocol that a transport layer sitting below subscription
//! filters never had to.

use crate::conntrack::flow::{FlowFlags, FlowState};
use crate::utils::{seq_diff, seq_geq, seq_gt, seq_lt};
use bitmask_enum::bitmask;

#[bitmask(u8)]
pub enum MspFlags {
    ReassembleEntireSegment,
    MissingFirstSegment,
    GotAllSegments,
}

/// A multisegment PDU under construction.
#[derive(Debug, Clone)]
pub struct Msp {
    pub seq: u32,
    pub nxtpdu: u32,
    pub first_frame: u64,
    pub first_frame_with_seq: u64,
    pub last_frame: u64,
    pub last_frame_time: f64,
    pub flags: MspFlags,
    fragments: Vec<(u32, Vec<u8>)>,
}

impl Msp {
    fn new(seq: u32, nxtpdu: u32, frame: u64, now: f64) -> Self {
        Msp {
            seq,
            nxtpdu,
            first_frame: frame,
            first_frame_with_seq: frame,
            last_frame: frame,
            last_frame_time: now,
            flags: MspFlags::none(),
            fragments: Vec::new(),
        }
    }

    fn total_len(&self) -> u32 {
        seq_diff(self.nxtpdu, self.seq)
    }

    /// Adds a fragment at its absolute `seq`, clipped to `[self.seq,
    /// self.nxtpdu)`. Returns `true` once every byte in the range is
    /// present.
    fn add_fragment(&mut self, seq: u32, data: &[u8]) -> bool {
        let offset = seq_diff(seq, self.seq);
        self.fragments.push((offset, data.to_vec()));
        self.covered_len() >= self.total_len()
    }

    fn covered_len(&self) -> u32 {
        // Cheap coverage check: sum of non-overlapping byte positions seen.
        // Bounded by the MSP's own size, which is small relative to a
        // capture (application PDUs, not whole streams).
        let total = self.total_len() as usize;
        if total == 0 {
            return 0;
        }
        let mut seen = vec![false; total];
        for (offset, data) in &self.fragments {
            let start = *offset as usize;
            for (i, _) in data.iter().enumerate() {
                if let Some(slot) = seen.get_mut(start + i) {
                    *slot = true;
                }
            }
        }
        seen.iter().filter(|b| **b).count() as u32
    }

    fn assemble(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.total_len() as usize];
        for (offset, data) in &self.fragments {
            let start = *offset as usize;
            let end = (start + data.len()).min(buf.len());
            if start < end {
                buf[start..end].copy_from_slice(&data[..end - start]);
            }
        }
        buf
    }

    fn reset_total_length(&mut self, new_total: u32) {
        self.nxtpdu = self.seq.wrapping_add(new_total);
    }
}

/// What the subdissector asked for after consuming a reassembled buffer:
/// "one more segment" or "reassemble through the FIN".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesegmentRequest {
    /// The subdissector consumed everything; no more PDU is pending.
    Complete,
    /// Needs `n` more bytes beyond what has been seen so far.
    NeedMoreBytes(u32),
    /// Wants the entirety of at least one more segment.
    OneMoreSegment,
    /// Reassemble everything up through the direction's FIN.
    UntilFin,
}

/// A completed reassembled PDU, ready for subdissector delivery.
#[derive(Debug, Clone)]
pub struct ReassembledPdu {
    pub seq: u32,
    pub bytes: Vec<u8>,
    pub first_frame: u64,
    pub last_frame: u64,
}

/// Runs the reassembly state machine for one direction's incoming segment.
/// `desegment` carries the subdissector's "I need N more bytes" answer, if
/// one is already known for this segment; returns every
/// PDU that became complete as a result.
#[allow(clippy::too_many_arguments)]
pub fn insert_segment(
    flow: &mut FlowState,
    out_of_order: bool,
    frame: u64,
    seq: u32,
    payload: &[u8],
    is_fin: bool,
    now: f64,
    desegment: Option<DesegmentRequest>,
) -> Vec<ReassembledPdu> {
    let mut out = Vec::new();
    if payload.is_empty() && !is_fin {
        return out;
    }
    let seglen = payload.len() as u32;
    let end_seq = seq.wrapping_add(seglen);

    let (target_total_len, want_entire_segment) = match desegment {
        None | Some(DesegmentRequest::Complete) => (None, false),
        Some(DesegmentRequest::NeedMoreBytes(extra)) if extra > 0 => {
            (Some(seglen.wrapping_add(extra)), false)
        }
        Some(DesegmentRequest::NeedMoreBytes(_)) => (None, false),
        Some(DesegmentRequest::OneMoreSegment) => (None, true),
        Some(DesegmentRequest::UntilFin) => {
            flow.flags |= FlowFlags::ReassembleUntilFin;
            (None, false)
        }
    };

    // Primary lookup: the MSP with greatest seq <= current_seq.
    let msp_seq = flow
        .multisegment_pdus
        .range(..=seq)
        .next_back()
        .map(|(k, _)| *k);

    let key = match msp_seq {
        Some(k) if seq_geq(seq, k) && seq_geq(flow.multisegment_pdus[&k].nxtpdu, seq) => Some(k),
        _ => None,
    };

    let key = match key {
        Some(k) => k,
        None => {
            // No existing MSP covers this segment: open one, sized to the
            // subdissector's request if it already made one.
            let nxtpdu = match target_total_len {
                Some(total) => seq.wrapping_add(total.max(seglen)),
                None => end_seq,
            };
            let mut msp = Msp::new(seq, nxtpdu, frame, now);
            if out_of_order && seq_gt(seq, flow.maxnextseq) && flow.maxnextseq != 0 {
                msp.flags |= MspFlags::MissingFirstSegment;
            }
            flow.multisegment_pdus.insert(seq, msp);
            seq
        }
    };

    {
        let msp = flow.multisegment_pdus.get_mut(&key).expect("just inserted");
        if msp.flags.contains(MspFlags::MissingFirstSegment) && msp.seq == seq {
            msp.first_frame_with_seq = frame;
            msp.flags &= !MspFlags::MissingFirstSegment;
        }
        msp.last_frame = frame;
        msp.last_frame_time = now;

        if want_entire_segment {
            msp.flags |= MspFlags::ReassembleEntireSegment;
            msp.reset_total_length(seq_diff(end_seq.wrapping_add(1), msp.seq));
        } else if let Some(total) = target_total_len {
            if out_of_order {
                let grown = seq_diff(end_seq.max(msp.nxtpdu), msp.seq).max(total);
                msp.reset_total_length(grown);
            }
        }

        let complete = if msp.flags.contains(MspFlags::ReassembleEntireSegment) {
            msp.add_fragment(seq, payload);
            true
        } else {
            let take = seq_diff(msp.nxtpdu.min(end_seq), seq).min(seglen);
            msp.add_fragment(seq, &payload[..take as usize])
        };

        if complete {
            msp.flags |= MspFlags::GotAllSegments;
        }
    }

    if flow
        .multisegment_pdus
        .get(&key)
        .map(|m| m.flags.contains(MspFlags::GotAllSegments))
        .unwrap_or(false)
    {
        if let Some(msp) = flow.multisegment_pdus.remove(&key) {
            out.push(ReassembledPdu {
                seq: msp.seq,
                bytes: msp.assemble(),
                first_frame: msp.first_frame,
                last_frame: msp.last_frame,
            });
        }
    }

    if out_of_order && seq_lt(flow.maxnextseq, end_seq) {
        flow.maxnextseq = end_seq;
    }

    out
}

/// Finalizes the MSP covering a direction's FIN. Called once the FIN segment for this direction
/// has been observed; emits the last reassembled buffer if a sentinel MSP
/// is open.
pub fn finalize_on_fin(flow: &mut FlowState, fin_seq: u32, frame: u64) -> Option<ReassembledPdu> {
    let key = flow
        .multisegment_pdus
        .range(..=fin_seq)
        .next_back()
        .map(|(k, _)| *k)?;
    let mut msp = flow.multisegment_pdus.remove(&key)?;
    msp.nxtpdu = fin_seq;
    msp.last_frame = frame;
    msp.flags |= MspFlags::GotAllSegments;
    Some(ReassembledPdu {
        seq: msp.seq,
        bytes: msp.assemble(),
        first_frame: msp.first_frame,
        last_frame: msp.last_frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn flow() -> FlowState {
        FlowState::new(10_000)
    }

    #[test]
    fn reassembles_three_in_order_segments() {
        let mut f = flow();
        // Subdissector wants a 250-byte PDU: 100 bytes seen,
        // 150 more requested.
        let first = insert_segment(
            &mut f,
            false,
            1,
            1,
            &[b'a'; 100],
            false,
            0.0,
            Some(DesegmentRequest::NeedMoreBytes(150)),
        );
        assert!(first.is_empty());
        let second = insert_segment(&mut f, false, 2, 101, &[b'b'; 100], false, 0.0, None);
        assert!(second.is_empty());
        let third = insert_segment(&mut f, false, 3, 201, &[b'c'; 100], false, 0.0, None);
        assert_eq!(third.len(), 1);
        let pdu = &third[0];
        assert_eq!(pdu.seq, 1);
        assert_eq!(pdu.bytes.len(), 250);
        assert_eq!(pdu.first_frame, 1);
        assert_eq!(pdu.last_frame, 3);
    }

    #[test]
    fn out_of_order_segment_waits_for_gap_fill() {
        let mut f = flow();
        f.maxnextseq = 1;
        let later = insert_segment(&mut f, true, 2, 101, &[b'b'; 50], false, 0.0, None);
        assert!(later.is_empty());
        assert!(f.multisegment_pdus.contains_key(&101));
    }

    #[test]
    fn finalize_on_fin_closes_the_pdu() {
        let mut f = flow();
        insert_segment(
            &mut f,
            false,
            1,
            1,
            &[b'a'; 50],
            false,
            0.0,
            Some(DesegmentRequest::OneMoreSegment),
        );
        let pdu = finalize_on_fin(&mut f, 51, 2);
        assert!(pdu.is_some());
        assert!(f.multisegment_pdus.is_empty());
    }
}
