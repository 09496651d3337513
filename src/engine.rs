//! Engine facade: stitches the segment parser, option
//! table, conversation table, sequence analyzer, reassembler, MPTCP
//! analyzer, and timing into the two entry points the embedding
//! application calls: [`Engine::process_segment`] and
//! [`Engine::iter_reassembled`].

use crate::config::EngineConfig;
use crate::conntrack::reassembly::{DesegmentRequest, ReassembledPdu};
use crate::conntrack::{conversation::Direction, seq_analysis, timing, ConversationTable};
use crate::error::{ExpertInfo, TcpParseError};
use crate::mptcp::{MptcpAnalysisId, MptcpAnalyzer, Reinjection};
use crate::packet::header::{self, Flags, TcpHeader};
use crate::packet::mptcp_opt::MptcpOption;
use crate::packet::options::{self, SackRange, TcpOption};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

/// One raw TCP segment as delivered by the capture source. IP addresses arrive pre-parsed; the engine never touches
/// link-layer or IP headers.
pub struct Segment<'a> {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub frame: u64,
    pub timestamp: f64,
    pub visited: bool,
    pub fragmented: bool,
    pub in_error: bool,
    /// The TCP header, options, and payload as one contiguous byte slice.
    pub bytes: &'a [u8],
}

/// Parsed header plus everything derivable from it without mutating flow
/// state.
#[derive(Debug, Clone)]
pub struct HeaderRecord {
    pub header: TcpHeader,
    pub options: Vec<TcpOption>,
    pub sack_ranges: Vec<SackRange>,
    pub mptcp: Option<MptcpOption>,
    pub header_len: usize,
    pub payload_len: usize,
    pub stream_id: usize,
    pub relative_seq: Option<u32>,
    pub relative_ack: Option<u32>,
    pub effective_window: u32,
    pub flags_letters: String,
    pub flags_names: String,
    pub expert: Vec<ExpertInfo>,
}

/// MPTCP-specific per-segment outcome.
#[derive(Debug, Clone)]
pub struct MptcpOutcome {
    pub analysis_id: MptcpAnalysisId,
    pub stream_id: usize,
    pub dsn: Option<u64>,
    pub relative_dsn: Option<u64>,
    pub reinjections: Vec<Reinjection>,
    /// Notes raised by this segment's MPTCP handling (missing/unsupported
    /// crypto algorithm, echoed-key mismatch, infinite/missing mapping).
    /// Also folded into the header's own `expert` list.
    pub expert: Vec<ExpertInfo>,
}

/// The complete per-segment result handed back to the display surface.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub header: HeaderRecord,
    pub analysis: Option<seq_analysis::AnalysisRecord>,
    pub timing: Option<timing::Timing>,
    pub mptcp: Option<MptcpOutcome>,
}

#[derive(Debug, Clone)]
struct Cached {
    analysis: Option<seq_analysis::AnalysisRecord>,
    timing: Option<timing::Timing>,
    mptcp: Option<MptcpOutcome>,
}

/// The TCP dissection and stream-analysis engine. Owns
/// every conversation and MPTCP connection for the life of the capture,
/// freeing them all at once when the engine is dropped.
pub struct Engine {
    cfg: EngineConfig,
    conversations: ConversationTable,
    mptcp: MptcpAnalyzer,
    /// Cache for the two-pass idempotence invariant:
    /// keyed on `(frame, seq, ack)`, same as `Conversation::acked_table`,
    /// but holds the full per-segment outcome rather than only the
    /// analysis flags, since a visited pass must reproduce the whole
    /// `Outcome` without re-touching any mutable state.
    replay: HashMap<(u64, u32, u32), Cached>,
    reassembled_queue: VecDeque<ReassembledPdu>,
    stats: crate::stats::EngineStats,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self {
        Engine {
            conversations: ConversationTable::new(cfg.unacked_segments_cap),
            mptcp: MptcpAnalyzer::new(),
            replay: HashMap::new(),
            reassembled_queue: VecDeque::new(),
            stats: crate::stats::EngineStats::default(),
            cfg,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn stats(&self) -> &crate::stats::EngineStats {
        &self.stats
    }

    /// Processes one segment end to end.
    pub fn process_segment(&mut self, seg: &Segment) -> Result<Outcome, TcpParseError> {
        self.stats.segments_seen += 1;
        let (raw_header, options_len) = match header::parse(seg.bytes) {
            Ok(v) => v,
            Err(e) => {
                match e {
                    TcpParseError::ShortSegment(_) => self.stats.short_segments += 1,
                    TcpParseError::BogusHeaderLength { .. } => self.stats.bogus_header_lengths += 1,
                }
                return Err(e);
            }
        };
        let header_len = raw_header.header_len_bytes();
        let option_bytes = &seg.bytes[20..20 + options_len];
        let (options, mut expert) = options::parse(option_bytes, &self.cfg);
        let payload = &seg.bytes[header_len..];

        if raw_header.flags.contains(Flags::Syn) && raw_header.ack_no != 0 {
            expert.push(ExpertInfo::SynWithNonzeroAck);
        }
        if !raw_header.flags.contains(Flags::Ack) && raw_header.ack_no != 0 {
            expert.push(ExpertInfo::AckClearNonzeroAckField);
        }

        if self.cfg.check_checksum && !seg.fragmented && !seg.in_error {
            let computed = crate::utils::tcp_checksum(seg.src_addr, seg.dst_addr, seg.bytes, 16);
            if computed == 0 && raw_header.checksum == 0xFFFF {
                expert.push(ExpertInfo::ChecksumFfffFixup);
            } else if computed != raw_header.checksum {
                self.stats.bad_checksums += 1;
                expert.push(ExpertInfo::BadChecksum {
                    computed,
                    received: raw_header.checksum,
                });
            }
        }

        let mptcp_option = options.iter().find_map(|o| match o {
            TcpOption::Mptcp(m) => Some(m.clone()),
            _ => None,
        });

        let src = SocketAddr::new(seg.src_addr, raw_header.src_port);
        let dst = SocketAddr::new(seg.dst_addr, raw_header.dst_port);
        let is_pure_syn = raw_header.flags.contains(Flags::Syn) && !raw_header.flags.contains(Flags::Ack);

        let (slot, dir, reused) = self.conversations.find_or_create(
            src,
            dst,
            is_pure_syn,
            raw_header.seq_no,
            seg.timestamp,
        );
        let stream_id = self.conversations.get(slot).stream_id;

        let key = (seg.frame, raw_header.seq_no, raw_header.ack_no);
        if seg.visited {
            if let Some(cached) = self.replay.get(&key).cloned() {
                let header_record = self.build_header_record(
                    &raw_header,
                    options.clone(),
                    mptcp_option.clone(),
                    header_len,
                    payload.len(),
                    stream_id,
                    expert,
                    slot,
                    dir,
                );
                return Ok(Outcome {
                    header: header_record,
                    analysis: cached.analysis,
                    timing: cached.timing,
                    mptcp: cached.mptcp,
                });
            }
        }

        {
            let conv = self.conversations.get_mut(slot);
            let (fwd, _rev) = conv.flows_mut(dir);
            fwd.maybe_set_base_seq(raw_header.seq_no, raw_header.flags.contains(Flags::Syn));
        }

        let timing_rec = if self.cfg.calculate_ts {
            let conv = self.conversations.get_mut(slot);
            Some(timing::compute(conv, seg.timestamp, raw_header.flags))
        } else {
            None
        };

        let analysis_rec = if self.cfg.analyze_seq {
            let seglen = payload.len() as u32;
            let has_ack = raw_header.flags.contains(Flags::Ack);
            let conv = self.conversations.get_mut(slot);
            let ts_first_rtt = conv.ts_first_rtt;
            let (fwd, rev) = conv.flows_mut(dir);
            let mut rec = seq_analysis::analyze(
                fwd,
                rev,
                &self.cfg,
                seg.frame,
                raw_header.seq_no,
                raw_header.ack_no,
                has_ack,
                seglen,
                raw_header.flags,
                raw_header.window,
                seg.timestamp,
                ts_first_rtt,
            );
            if reused {
                rec.flags = seq_analysis::AnalysisFlagsOpt(
                    *rec.flags | seq_analysis::AnalysisFlags::ReusedPorts,
                );
            }
            conv.acked_table.insert(key, rec);
            Some(rec)
        } else {
            None
        };

        if self.cfg.allow_desegment && !payload.is_empty() {
            let conv = self.conversations.get_mut(slot);
            let (fwd, _rev) = conv.flows_mut(dir);
            // No subdissector registry is wired up yet, so every segment
            // reassembles on its own rather than waiting on a declared byte count.
            let desegment: Option<DesegmentRequest> = None;
            let completed = crate::conntrack::reassembly::insert_segment(
                fwd,
                self.cfg.reassemble_out_of_order,
                seg.frame,
                raw_header.seq_no,
                payload,
                raw_header.flags.contains(Flags::Fin),
                seg.timestamp,
                desegment,
            );
            self.reassembled_queue.extend(completed);
            if raw_header.flags.contains(Flags::Fin) {
                if let Some(pdu) = crate::conntrack::reassembly::finalize_on_fin(
                    fwd,
                    raw_header.seq_no,
                    seg.frame,
                ) {
                    self.reassembled_queue.push_back(pdu);
                }
                fwd.fin = seg.frame;
            }
        }

        let mptcp_outcome = if self.cfg.analyze_mptcp {
            mptcp_option.as_ref().map(|opt| {
                self.run_mptcp(
                    opt,
                    slot,
                    dir,
                    stream_id,
                    seg.frame,
                    raw_header.seq_no,
                    payload.len() as u32,
                )
            })
        } else {
            None
        };
        if let Some(outcome) = &mptcp_outcome {
            expert.extend(outcome.expert.iter().copied());
        }

        self.replay.insert(
            key,
            Cached {
                analysis: analysis_rec,
                timing: timing_rec,
                mptcp: mptcp_outcome.clone(),
            },
        );

        let header_record = self.build_header_record(
            &raw_header,
            options,
            mptcp_option,
            header_len,
            payload.len(),
            stream_id,
            expert,
            slot,
            dir,
        );

        Ok(Outcome {
            header: header_record,
            analysis: analysis_rec,
            timing: timing_rec,
            mptcp: mptcp_outcome,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_header_record(
        &self,
        raw_header: &TcpHeader,
        options: Vec<TcpOption>,
        mptcp: Option<MptcpOption>,
        header_len: usize,
        payload_len: usize,
        stream_id: usize,
        expert: Vec<ExpertInfo>,
        slot: usize,
        dir: Direction,
    ) -> HeaderRecord {
        let sack_ranges = options
            .iter()
            .find_map(|o| match o {
                TcpOption::Sack(ranges) => Some(ranges.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let (relative_seq, relative_ack, effective_window) = if self.cfg.analyze_seq {
            let conv = self.conversations.get(slot);
            let (fwd, _rev) = conv.flows(dir);
            let rel_seq = self
                .cfg
                .relative_seq
                .then(|| crate::utils::seq_diff(raw_header.seq_no, fwd.base_seq));
            let rel_ack = if raw_header.flags.contains(Flags::Ack) && self.cfg.relative_seq {
                let (_fwd, rev) = conv.flows(dir);
                Some(crate::utils::seq_diff(raw_header.ack_no, rev.base_seq))
            } else {
                None
            };
            let window = if raw_header.flags.contains(Flags::Syn) {
                raw_header.window as u32
            } else {
                fwd.scaled_window(self.cfg.default_window_scaling)
            };
            (rel_seq, rel_ack, window)
        } else {
            (None, None, raw_header.window as u32)
        };

        HeaderRecord {
            header: *raw_header,
            flags_letters: header::flags_letters(raw_header.reserved, raw_header.flags),
            flags_names: header::flags_names(raw_header.reserved, raw_header.flags),
            options,
            sack_ranges,
            mptcp,
            header_len,
            payload_len,
            stream_id,
            relative_seq,
            relative_ack,
            effective_window,
            expert,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_mptcp(
        &mut self,
        opt: &MptcpOption,
        slot: usize,
        dir: Direction,
        stream_id: usize,
        frame: u64,
        raw_seq: u32,
        seglen: u32,
    ) -> MptcpOutcome {
        let conv = self.conversations.get_mut(slot);
        let analysis_id = match conv.mptcp_analysis {
            Some(id) => id,
            None => {
                let id = self.mptcp.find_or_create_by_token(frame as u32 ^ stream_id as u32);
                conv.mptcp_analysis = Some(id);
                id
            }
        };
        let conv = self.conversations.get_mut(slot);
        let subflow_id = match conv.flows(dir).0.mptcp_subflow {
            Some(id) => id,
            None => {
                let id = self.mptcp.new_subflow(analysis_id, dir == Direction::Forward);
                conv.flows_mut(dir).0.mptcp_subflow = Some(id);
                id
            }
        };

        let mut dsn = None;
        let mut relative = None;
        let mut reinjections = Vec::new();
        let mut expert = Vec::new();

        match opt {
            MptcpOption::Capable(cap) => {
                match cap.algorithm() {
                    crate::packet::mptcp_opt::CryptoAlgorithm::Missing => {
                        expert.push(ExpertInfo::MptcpMissingAlgorithm);
                    }
                    crate::packet::mptcp_opt::CryptoAlgorithm::Unsupported(_) => {
                        expert.push(ExpertInfo::MptcpUnsupportedAlgorithm);
                    }
                    crate::packet::mptcp_opt::CryptoAlgorithm::HmacSha1 => {}
                }
                match cap.form {
                    crate::packet::mptcp_opt::MpCapableForm::SynOrSynAck { sender_key } => {
                        let slot_idx = usize::from(dir == Direction::Reverse);
                        self.mptcp.bind_key(
                            analysis_id,
                            slot_idx,
                            sender_key,
                            IpAddr::from([0, 0, 0, 0]),
                            0,
                        );
                    }
                    crate::packet::mptcp_opt::MpCapableForm::Ack {
                        sender_key,
                        receiver_key,
                    } => {
                        let meta = &self.mptcp.analysis(analysis_id).meta;
                        let sender_matches = meta[0].key.map_or(true, |k| k == sender_key);
                        let receiver_matches = meta[1].key.map_or(true, |k| k == receiver_key);
                        if !sender_matches || !receiver_matches {
                            expert.push(ExpertInfo::MptcpEchoedKeyMismatch);
                        }
                    }
                }
            }
            MptcpOption::Join(crate::packet::mptcp_opt::MpJoin::Syn { token, .. }) => {
                let found = self.mptcp.find_or_create_by_token(*token);
                self.conversations.get_mut(slot).mptcp_analysis = Some(found);
            }
            MptcpOption::Dss(dss) => {
                if let Some(mapping) = dss.mapping {
                    if mapping.data_level_len == 0 {
                        expert.push(ExpertInfo::MptcpInfiniteMapping);
                    } else {
                        let meta = &self.mptcp.analysis(analysis_id).meta[0];
                        let base = meta.base_dsn.unwrap_or(0);
                        let extended = crate::mptcp::extend_dsn(mapping.raw_dsn as u32, base);
                        self.mptcp.subflow_mut(subflow_id).insert_mapping(crate::mptcp::DssMapping {
                            rawdsn: mapping.raw_dsn,
                            ssn_low: mapping.ssn,
                            ssn_high: mapping.ssn.wrapping_add(mapping.data_level_len as u32 - 1),
                            extended_dsn: extended,
                            frame,
                        });
                    }
                }
            }
            _ => {}
        }

        match self.mptcp.subflow(subflow_id).lookup(raw_seq, seglen.max(1)) {
            Some(m) => {
                dsn = Some(m.extended_dsn);
                let meta = &self.mptcp.analysis(analysis_id).meta[0];
                if self.cfg.mptcp_relative_seq {
                    relative = crate::mptcp::relative_dsn(
                        m.extended_dsn,
                        meta.base_dsn.unwrap_or(0),
                        meta.has_base_dsn_msb,
                    );
                }
                if self.cfg.mptcp_intersubflows_retransmission {
                    reinjections = self.mptcp.check_reinjection(
                        analysis_id,
                        subflow_id,
                        m.extended_dsn,
                        m.extended_dsn,
                        frame,
                    );
                }
            }
            None => {
                if self.cfg.mptcp_analyze_mappings && seglen > 0 {
                    expert.push(ExpertInfo::MptcpMappingMissing);
                }
            }
        }

        MptcpOutcome {
            analysis_id,
            stream_id: self.mptcp.analysis(analysis_id).stream_id,
            dsn,
            relative_dsn: relative,
            reinjections,
            expert,
        }
    }

    /// Drains completed reassembled PDUs. Lazy, finite, not restartable within a pass.
    pub fn iter_reassembled(&mut self) -> impl Iterator<Item = ReassembledPdu> + '_ {
        std::iter::from_fn(move || self.reassembled_queue.pop_front())
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use pretty_assertions::assert_eq;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn syn_segment(seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut b = vec![0u8; 20];
        b[0..2].copy_from_slice(&1234u16.to_be_bytes());
        b[2..4].copy_from_slice(&80u16.to_be_bytes());
        b[4..8].copy_from_slice(&seq.to_be_bytes());
        b[12] = 5 << 4;
        b[13] = 0b0000_0010; // SYN
        b[14..16].copy_from_slice(&65535u16.to_be_bytes());
        b.extend_from_slice(payload);
        b
    }

    #[test]
    fn process_segment_assigns_stream_zero_and_runs_seq_analysis() {
        init_logging();
        let mut engine = Engine::new(EngineConfig::default());
        let bytes = syn_segment(1000, b"hello");
        let seg = Segment {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            frame: 1,
            timestamp: 0.0,
            visited: false,
            fragmented: false,
            in_error: false,
            bytes: &bytes,
        };

        let outcome = engine.process_segment(&seg).expect("well-formed segment");
        assert_eq!(outcome.header.header.src_port, 1234);
        assert_eq!(outcome.header.stream_id, 0);
        assert_eq!(outcome.header.payload_len, 5);
        assert!(outcome.analysis.is_some());
        assert_eq!(engine.conversation_count(), 1);
        assert_eq!(engine.stats().segments_seen, 1);
    }

    #[test]
    fn short_segment_is_rejected_and_counted() {
        let mut engine = Engine::new(EngineConfig::default());
        let bytes = vec![0u8; 10];
        let seg = Segment {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            frame: 1,
            timestamp: 0.0,
            visited: false,
            fragmented: false,
            in_error: false,
            bytes: &bytes,
        };

        let err = engine.process_segment(&seg).unwrap_err();
        assert!(matches!(err, TcpParseError::ShortSegment(10)));
        assert_eq!(engine.stats().short_segments, 1);
    }

    #[test]
    fn mp_capable_with_no_algorithm_raises_expert_note() {
        let mut b = vec![0u8; 20];
        b[0..2].copy_from_slice(&1234u16.to_be_bytes());
        b[2..4].copy_from_slice(&80u16.to_be_bytes());
        b[4..8].copy_from_slice(&1000u32.to_be_bytes());
        b[12] = 8 << 4; // data offset 8: 20-byte header + 12-byte MPTCP option
        b[13] = 0b0000_0010; // SYN
        b[14..16].copy_from_slice(&65535u16.to_be_bytes());
        b.push(30); // MP_CAPABLE option kind
        b.push(12); // option length
        b.push(0x00); // subtype 0 (MP_CAPABLE), version 0
        b.push(0x00); // crypto flags: no algorithm bit set
        b.extend_from_slice(&1u64.to_be_bytes()); // sender key

        let mut cfg = EngineConfig::default();
        cfg.analyze_mptcp = true;
        let mut engine = Engine::new(cfg);
        let seg = Segment {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            frame: 1,
            timestamp: 0.0,
            visited: false,
            fragmented: false,
            in_error: false,
            bytes: &b,
        };

        let outcome = engine.process_segment(&seg).expect("well-formed segment");
        let mptcp = outcome.mptcp.expect("mptcp option present");
        assert!(mptcp.expert.contains(&crate::error::ExpertInfo::MptcpMissingAlgorithm));
        assert!(outcome
            .header
            .expert
            .contains(&crate::error::ExpertInfo::MptcpMissingAlgorithm));
    }

    #[test]
    fn revisited_segment_replays_cached_outcome_without_remutating_state() {
        let mut engine = Engine::new(EngineConfig::default());
        let bytes = syn_segment(1000, b"hello");
        let seg = Segment {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            frame: 7,
            timestamp: 0.0,
            visited: false,
            fragmented: false,
            in_error: false,
            bytes: &bytes,
        };
        let first = engine.process_segment(&seg).unwrap();

        let replay_seg = Segment { visited: true, ..seg };
        let second = engine.process_segment(&replay_seg).unwrap();

        assert_eq!(
            first.analysis.unwrap().dupack_num,
            second.analysis.unwrap().dupack_num
        );
        assert_eq!(engine.conversation_count(), 1);
    }
}
