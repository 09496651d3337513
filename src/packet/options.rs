//! TCP option parser table.
//!
//! Dispatches on option `kind`, following `retina_core`'s general habit of a
//! single parser producing a tagged-sum representation rather than a table
//! of function pointers.

use crate::config::EngineConfig;
use crate::error::ExpertInfo;
use crate::packet::mptcp_opt::{self, MptcpOption};
use bitmask_enum::bitmask;

/// One SACK edge pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackRange {
    pub left_edge: u32,
    pub right_edge: u32,
}

/// SCPS capability bits (kind 20), decoded structurally rather than left as
/// an opaque byte.
#[bitmask(u8)]
pub enum ScpsCapabilities {
    Bets,
    Snack1,
    Snack2,
    Comp,
    Nlts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScpsSnack {
    pub hole1: u16,
    pub hole2: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserTimeout {
    pub granularity_minutes: bool,
    pub timeout: u16,
}

#[derive(Debug, Clone)]
pub enum TfoOption {
    /// Len == 2: client requests a cookie.
    Request,
    /// Len > 2: carries the cookie bytes.
    Cookie(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct RiverbedTransparency {
    pub src_addr: [u8; 4],
    pub dst_addr: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
}

/// A single decoded TCP option.
#[derive(Debug, Clone)]
pub enum TcpOption {
    Nop,
    Mss(u16),
    WindowScale(u8),
    SackPermitted,
    Sack(Vec<SackRange>),
    Echo(u32),
    EchoReply(u32),
    Timestamps { tsval: u32, tsecr: u32 },
    Cc(u32),
    CcNew(u32),
    CcEcho(u32),
    Md5Signature([u8; 16]),
    ScpsCapabilities {
        caps: ScpsCapabilities,
        extended: Vec<u8>,
    },
    ScpsSnack(ScpsSnack),
    ScpsRecordBoundary,
    ScpsCorruptionExperienced,
    QuickStart { rate: u8, ttl_diff: u8 },
    UserTimeout(UserTimeout),
    Mptcp(MptcpOption),
    Tfo(TfoOption),
    RiverbedProbe { subtype: u8, payload: Vec<u8> },
    RiverbedTransparency(RiverbedTransparency),
    Experimental { kind: u8, magic: Option<u16>, payload: Vec<u8> },
    Unknown { kind: u8, payload: Vec<u8> },
}

/// Parses the TCP options area (everything past the fixed 20-byte header,
/// `header_len - 20` bytes). Returns the decoded options plus any non-fatal
/// notes: unknown kinds never abort parsing, but a length
/// byte pointing past the end of the area drops the remaining options.
pub fn parse(mut bytes: &[u8], cfg: &EngineConfig) -> (Vec<TcpOption>, Vec<ExpertInfo>) {
    let mut options = Vec::new();
    let mut notes = Vec::new();
    let mut nop_run = 0u32;

    while !bytes.is_empty() {
        let kind = bytes[0];
        match kind {
            0 => {
                // EOL: terminates the option list.
                break;
            }
            1 => {
                options.push(TcpOption::Nop);
                bytes = &bytes[1..];
                nop_run += 1;
                if nop_run == 4 {
                    notes.push(ExpertInfo::FourNopsInARow);
                }
                continue;
            }
            _ => {}
        }
        nop_run = 0;

        if bytes.len() < 2 {
            notes.push(ExpertInfo::OptionLengthInvalid { kind });
            break;
        }
        let len = bytes[1] as usize;
        if len < 2 || len > bytes.len() {
            notes.push(ExpertInfo::OptionLengthInvalid { kind });
            break;
        }
        let payload = &bytes[2..len];
        let rest = &bytes[len..];

        match decode_one(kind, len, payload, cfg, &mut notes) {
            Some(opt) => options.push(opt),
            None => {
                options.push(TcpOption::Unknown {
                    kind,
                    payload: payload.to_vec(),
                });
            }
        }
        bytes = rest;
    }

    (options, notes)
}

fn decode_one(
    kind: u8,
    len: usize,
    payload: &[u8],
    cfg: &EngineConfig,
    notes: &mut Vec<ExpertInfo>,
) -> Option<TcpOption> {
    match kind {
        2 => {
            if len != 4 {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            Some(TcpOption::Mss(u16::from_be_bytes([payload[0], payload[1]])))
        }
        3 => {
            if len != 3 {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            let requested = payload[0];
            if requested > 14 {
                notes.push(ExpertInfo::WindowScaleClamped { requested });
                Some(TcpOption::WindowScale(14))
            } else {
                Some(TcpOption::WindowScale(requested))
            }
        }
        4 => {
            if len != 2 {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            Some(TcpOption::SackPermitted)
        }
        5 => parse_sack(kind, payload, notes),
        6 => read_u32(payload).map(TcpOption::Echo),
        7 => read_u32(payload).map(TcpOption::EchoReply),
        8 => {
            if len != 10 {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            Some(TcpOption::Timestamps {
                tsval: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                tsecr: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            })
        }
        11 => read_u32(payload).map(TcpOption::Cc),
        12 => read_u32(payload).map(TcpOption::CcNew),
        13 => read_u32(payload).map(TcpOption::CcEcho),
        19 => {
            if len != 18 {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            let mut digest = [0u8; 16];
            digest.copy_from_slice(payload);
            Some(TcpOption::Md5Signature(digest))
        }
        20 => {
            if payload.is_empty() {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            let caps = ScpsCapabilities::from(payload[0]);
            Some(TcpOption::ScpsCapabilities {
                caps,
                extended: payload[1..].to_vec(),
            })
        }
        21 => {
            if len != 6 {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            Some(TcpOption::ScpsSnack(ScpsSnack {
                hole1: u16::from_be_bytes([payload[0], payload[1]]),
                hole2: u16::from_be_bytes([payload[2], payload[3]]),
            }))
        }
        22 => Some(TcpOption::ScpsRecordBoundary),
        23 => Some(TcpOption::ScpsCorruptionExperienced),
        27 => {
            if len != 8 {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            Some(TcpOption::QuickStart {
                rate: payload[0] & 0x0f,
                ttl_diff: payload[1],
            })
        }
        28 => {
            if len != 4 {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            Some(TcpOption::UserTimeout(UserTimeout {
                granularity_minutes: raw & 0x8000 != 0,
                timeout: raw & 0x7fff,
            }))
        }
        30 => Some(TcpOption::Mptcp(mptcp_opt::parse(payload))),
        34 => {
            if len == 2 {
                Some(TcpOption::Tfo(TfoOption::Request))
            } else {
                Some(TcpOption::Tfo(TfoOption::Cookie(payload.to_vec())))
            }
        }
        76 => {
            if payload.is_empty() {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            Some(TcpOption::RiverbedProbe {
                subtype: payload[0],
                payload: payload[1..].to_vec(),
            })
        }
        78 => {
            if payload.len() < 12 {
                notes.push(ExpertInfo::OptionLengthInvalid { kind });
                return None;
            }
            let mut src_addr = [0u8; 4];
            let mut dst_addr = [0u8; 4];
            src_addr.copy_from_slice(&payload[0..4]);
            dst_addr.copy_from_slice(&payload[4..8]);
            Some(TcpOption::RiverbedTransparency(RiverbedTransparency {
                src_addr,
                dst_addr,
                src_port: u16::from_be_bytes([payload[8], payload[9]]),
                dst_port: u16::from_be_bytes([payload[10], payload[11]]),
            }))
        }
        253 | 254 => {
            if cfg.exp_options_with_magic && payload.len() >= 2 {
                let magic = u16::from_be_bytes([payload[0], payload[1]]);
                let rest = &payload[2..];
                if magic == TFO_MAGIC {
                    if rest.is_empty() {
                        Some(TcpOption::Tfo(TfoOption::Request))
                    } else {
                        Some(TcpOption::Tfo(TfoOption::Cookie(rest.to_vec())))
                    }
                } else {
                    Some(TcpOption::Experimental {
                        kind,
                        magic: Some(magic),
                        payload: rest.to_vec(),
                    })
                }
            } else {
                Some(TcpOption::Experimental {
                    kind,
                    magic: None,
                    payload: payload.to_vec(),
                })
            }
        }
        _ => None,
    }
}

fn read_u32(payload: &[u8]) -> Option<u32> {
    if payload.len() != 4 {
        return None;
    }
    Some(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

/// The TFO magic number (kind 253/254 experimental).
pub const TFO_MAGIC: u16 = 0xF989;

fn parse_sack(kind: u8, payload: &[u8], notes: &mut Vec<ExpertInfo>) -> Option<TcpOption> {
    if payload.len() % 8 != 0 {
        notes.push(ExpertInfo::SubOptionMalformed { kind });
        // Parse whatever complete edge pairs fit, per section 7: "emit
        // expert, stop parsing that option" -- prior (complete) edges are
        // preserved.
    }
    let mut ranges = Vec::new();
    for chunk in payload.chunks_exact(8).take(4) {
        ranges.push(SackRange {
            left_edge: u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            right_edge: u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
        });
    }
    Some(TcpOption::Sack(ranges))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn parses_mss_and_window_scale() {
        let bytes = [2, 4, 0x05, 0xB4, 3, 3, 7, 1, 1];
        let (opts, notes) = parse(&bytes, &cfg());
        assert!(notes.is_empty());
        assert!(matches!(opts[0], TcpOption::Mss(1460)));
        assert!(matches!(opts[1], TcpOption::WindowScale(7)));
        assert!(matches!(opts[2], TcpOption::Nop));
        assert!(matches!(opts[3], TcpOption::Nop));
    }

    #[test]
    fn clamps_window_scale_above_14() {
        let bytes = [3, 3, 15];
        let (opts, notes) = parse(&bytes, &cfg());
        assert!(matches!(opts[0], TcpOption::WindowScale(14)));
        assert_eq!(notes, vec![ExpertInfo::WindowScaleClamped { requested: 15 }]);
    }

    #[test]
    fn flags_four_nops_in_a_row() {
        let bytes = [1, 1, 1, 1];
        let (_, notes) = parse(&bytes, &cfg());
        assert_eq!(notes, vec![ExpertInfo::FourNopsInARow]);
    }

    #[test]
    fn option_length_past_end_drops_remainder() {
        let bytes = [2, 200, 0, 0];
        let (opts, notes) = parse(&bytes, &cfg());
        assert!(opts.is_empty());
        assert_eq!(notes, vec![ExpertInfo::OptionLengthInvalid { kind: 2 }]);
    }

    #[test]
    fn parses_sack_with_two_ranges() {
        let mut bytes = vec![5, 18];
        bytes.extend_from_slice(&100u32.to_be_bytes());
        bytes.extend_from_slice(&200u32.to_be_bytes());
        bytes.extend_from_slice(&300u32.to_be_bytes());
        bytes.extend_from_slice(&400u32.to_be_bytes());
        let (opts, notes) = parse(&bytes, &cfg());
        assert!(notes.is_empty());
        match &opts[0] {
            TcpOption::Sack(ranges) => {
                assert_eq!(ranges.len(), 2);
                assert_eq!(ranges[0].left_edge, 100);
                assert_eq!(ranges[1].right_edge, 400);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn experimental_with_tfo_magic_dispatches_to_tfo() {
        let mut bytes = vec![253, 4];
        bytes.extend_from_slice(&TFO_MAGIC.to_be_bytes());
        let (opts, _) = parse(&bytes, &cfg());
        match &opts[0] {
            TcpOption::Tfo(TfoOption::Request) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn experimental_with_other_magic_stays_experimental() {
        let mut bytes = vec![253, 6];
        bytes.extend_from_slice(&0x1234u16.to_be_bytes());
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        let (opts, _) = parse(&bytes, &cfg());
        match &opts[0] {
            TcpOption::Experimental { magic, payload, .. } => {
                assert_eq!(*magic, Some(0x1234));
                assert_eq!(payload, &vec![0xAA, 0xBB]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
