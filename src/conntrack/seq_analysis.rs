//! Sequence-number anomaly analyzer.
//!
//! `retina_core` tracks only enough TCP state to reassemble a byte stream,
//! not Wireshark-style anomaly classification, so this module's rules are
//! new; they're written in `retina_core`'s per-direction `FlowState` style
//! (plain structs mutated in place, `log::trace!` at decision points).

use crate::conntrack::flow::{FlowState, UnackedSegment};
use crate::config::EngineConfig;
use crate::packet::header::Flags;
use crate::utils::{seq_geq, seq_gt, seq_lt};
use bitmask_enum::bitmask;

#[bitmask(u16)]
pub enum AnalysisFlags {
    Retransmission,
    FastRetransmission,
    SpuriousRetransmission,
    OutOfOrder,
    LostPacket,
    AckLostPacket,
    KeepAlive,
    KeepAliveAck,
    WindowUpdate,
    WindowFull,
    ZeroWindow,
    ZeroWindowProbe,
    ZeroWindowProbeAck,
    DuplicateAck,
    ReusedPorts,
}

/// Per-segment analysis outcome. Fields use `Option` throughout: absence
/// means "never computed", since any field may be missing depending on
/// which analyzers are enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisRecord {
    pub flags: AnalysisFlagsOpt,
    pub frame_acked: Option<u64>,
    pub ack_rtt: Option<f64>,
    pub rto: Option<f64>,
    pub rto_frame: Option<u64>,
    pub bytes_in_flight: Option<u32>,
    pub push_bytes_sent: Option<u32>,
    pub dupack_num: Option<u32>,
    pub dupack_frame: Option<u64>,
}

/// Wraps `AnalysisFlags` so `AnalysisRecord` can derive `Default` (the
/// bitmask macro's generated type has no `Default` impl of its own).
#[derive(Debug, Clone, Copy)]
pub struct AnalysisFlagsOpt(pub AnalysisFlags);

impl Default for AnalysisFlagsOpt {
    fn default() -> Self {
        AnalysisFlagsOpt(AnalysisFlags::none())
    }
}

impl std::ops::Deref for AnalysisFlagsOpt {
    type Target = AnalysisFlags;
    fn deref(&self) -> &AnalysisFlags {
        &self.0
    }
}

#[allow(clippy::too_many_arguments)]
pub fn analyze(
    fwd: &mut FlowState,
    rev: &mut FlowState,
    cfg: &EngineConfig,
    frame: u64,
    seq: u32,
    ack: u32,
    has_ack: bool,
    seglen: u32,
    flags: Flags,
    window: u16,
    now: f64,
    ts_first_rtt: Option<f64>,
) -> AnalysisRecord {
    let mut rec = AnalysisRecord::default();
    let mut out = AnalysisFlags::none();

    let is_syn = flags.contains(Flags::Syn);
    let is_fin = flags.contains(Flags::Fin);
    let is_rst = flags.contains(Flags::Rst);
    let end_seq = seq.wrapping_add(seglen);

    // Rule 1: ZERO_WINDOW_PROBE.
    if seglen == 1 && seq == fwd.nextseq && rev.window == 0 {
        out |= AnalysisFlags::ZeroWindowProbe;
    }
    // Rule 2: ZERO_WINDOW.
    if window == 0 && !is_syn && !is_fin && !is_rst {
        out |= AnalysisFlags::ZeroWindow;
    }
    // Rule 3: LOST_PACKET.
    if fwd.nextseq > 0 && seq_gt(seq, fwd.nextseq) && !is_rst {
        out |= AnalysisFlags::LostPacket;
        fwd.valid_bif = false;
    }
    // Rule 4: KEEP_ALIVE.
    if (seglen == 0 || seglen == 1)
        && seq == fwd.nextseq.wrapping_sub(1)
        && !is_syn
        && !is_fin
        && !is_rst
    {
        out |= AnalysisFlags::KeepAlive;
    }
    // Rule 5: WINDOW_UPDATE.
    if seglen == 0
        && window != fwd.window
        && seq == fwd.nextseq
        && has_ack
        && ack == fwd.lastack
        && !is_syn
        && !is_fin
        && !is_rst
    {
        out |= AnalysisFlags::WindowUpdate;
    }
    // Rule 6: WINDOW_FULL.
    if seglen > 0
        && end_seq == rev.lastack.wrapping_add(rev.scaled_window(cfg.default_window_scaling))
        && !is_syn
        && !is_fin
        && !is_rst
    {
        out |= AnalysisFlags::WindowFull;
    }
    // Rule 7: KEEP_ALIVE_ACK / ZERO_WINDOW_PROBE_ACK / DUPLICATE_ACK.
    if seglen == 0 && window == fwd.window && seq == fwd.nextseq && has_ack && ack == fwd.lastack {
        if rev.last_was_keepalive {
            out |= AnalysisFlags::KeepAliveAck;
        } else if rev.last_was_zwp && window == 0 && rev.window == 0 {
            out |= AnalysisFlags::ZeroWindowProbeAck;
        } else {
            if ack != fwd.lastnondupack {
                fwd.dupacknum = 0;
            }
            fwd.dupacknum += 1;
            if fwd.dupacknum == 1 {
                fwd.dupack_frame = frame;
            }
            rec.dupack_num = Some(fwd.dupacknum);
            rec.dupack_frame = Some(fwd.dupack_frame);
            out |= AnalysisFlags::DuplicateAck;
        }
    } else if has_ack {
        fwd.lastnondupack = ack;
    }
    // Rule 8: ACK_LOST_PACKET.
    if has_ack && rev.maxseqtobeacked > 0 && seq_gt(ack, rev.maxseqtobeacked) {
        out |= AnalysisFlags::AckLostPacket;
        rev.maxseqtobeacked = ack;
    }
    // Rule 9: retransmission family.
    if (seglen > 0 || is_syn || is_fin)
        && seq_lt(seq, fwd.nextseq)
        && !out.contains(AnalysisFlags::KeepAlive)
    {
        let since_last_dupack = now - rev.lastacktime;
        if rev.dupacknum >= 2 && since_last_dupack < cfg.fast_retransmission_window_ms / 1000.0 {
            out |= AnalysisFlags::FastRetransmission;
        } else {
            let threshold_s = ts_first_rtt
                .unwrap_or(cfg.ooo_threshold_ms / 1000.0)
                .max(cfg.ooo_threshold_ms / 1000.0);
            let since_expected = now - fwd.nextseqtime;
            if since_expected < threshold_s && fwd.nextseq != end_seq {
                out |= AnalysisFlags::OutOfOrder;
            } else if seglen > 0 && rev.lastack > 0 && seq_geq(rev.lastack, end_seq) {
                out |= AnalysisFlags::SpuriousRetransmission;
            } else {
                out |= AnalysisFlags::Retransmission;
                rec.rto = Some(now - fwd.nextseqtime);
                rec.rto_frame = Some(fwd.nextseqframe);
            }
        }
    }

    // Post-classification state updates.
    if seglen > 0 || is_syn || is_fin {
        let nextseq = if is_syn || is_fin {
            end_seq.wrapping_add(1)
        } else {
            end_seq
        };
        fwd.push_unacked(UnackedSegment {
            frame,
            seq,
            nextseq,
            ts: now,
        });
        if seq_gt(nextseq, fwd.nextseq) && !out.contains(AnalysisFlags::ZeroWindowProbe) {
            fwd.nextseq = nextseq;
            fwd.nextseqframe = frame;
            fwd.nextseqtime = now;
        }
    }
    fwd.window = window;
    if has_ack {
        fwd.lastack = ack;
        fwd.lastacktime = now;
    }

    let (exact, bif) = rev.ack_unacked(ack, now);
    if let Some(seg) = exact {
        rec.frame_acked = Some(seg.frame);
        rec.ack_rtt = Some(now - seg.ts);
    }
    if cfg.track_bytes_in_flight && rev.valid_bif {
        rec.bytes_in_flight = bif;
    }

    if flags.contains(Flags::Psh) {
        if fwd.push_set_last {
            fwd.push_bytes_sent = seglen;
        } else {
            fwd.push_bytes_sent += seglen;
        }
        fwd.push_set_last = true;
        rec.push_bytes_sent = Some(fwd.push_bytes_sent);
    } else {
        fwd.push_set_last = false;
    }

    fwd.last_seglen = seglen;
    fwd.last_was_keepalive = out.contains(AnalysisFlags::KeepAlive);
    fwd.last_was_zwp = out.contains(AnalysisFlags::ZeroWindowProbe);

    rec.flags = AnalysisFlagsOpt(out);
    log::trace!("seq analysis frame={frame} seq={seq} flags={out:?}");
    rec
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn flows() -> (FlowState, FlowState) {
        (FlowState::new(10_000), FlowState::new(10_000))
    }

    #[test]
    fn retransmission_detected_after_timeout() {
        let (mut fwd, mut rev) = flows();
        fwd.nextseq = 1101;
        fwd.nextseqtime = 1.0;
        let rec = analyze(
            &mut fwd,
            &mut rev,
            &EngineConfig::default(),
            2,
            1001,
            5001,
            true,
            100,
            Flags::Ack,
            1000,
            1.3,
            None,
        );
        assert!(rec.flags.contains(AnalysisFlags::Retransmission));
        assert_eq!(rec.rto, Some(0.3));
    }

    #[test]
    fn duplicate_ack_counter_increments() {
        let (mut fwd, mut rev) = flows();
        fwd.nextseq = 1001;
        fwd.window = 1000;
        fwd.lastack = 5001;
        rev.window = 1000;
        for n in 1..=3u32 {
            let rec = analyze(
                &mut fwd,
                &mut rev,
                &EngineConfig::default(),
                n as u64,
                1001,
                5001,
                true,
                0,
                Flags::Ack,
                1000,
                n as f64,
                None,
            );
            assert!(rec.flags.contains(AnalysisFlags::DuplicateAck));
            assert_eq!(rec.dupack_num, Some(n));
        }
    }

    #[test]
    fn zero_window_flagged_when_window_is_zero() {
        let (mut fwd, mut rev) = flows();
        let rec = analyze(
            &mut fwd,
            &mut rev,
            &EngineConfig::default(),
            1,
            1,
            0,
            false,
            10,
            Flags::none(),
            0,
            0.0,
            None,
        );
        assert!(rec.flags.contains(AnalysisFlags::ZeroWindow));
    }
}
