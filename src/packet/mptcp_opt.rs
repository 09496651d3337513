//! Pure decoding of the MPTCP option (kind 30).
//!
//! This module only turns option bytes into a typed sub-record; linking
//! subflows into a connection, deriving tokens/DSNs, and tracking DSS
//! mappings over time is stateful and lives in [`crate::mptcp`].

/// One decoded MPTCP sub-option (dispatch on the high nibble of the first
/// payload byte).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MptcpOption {
    Capable(MpCapable),
    Join(MpJoin),
    Dss(Dss),
    AddAddr(AddAddr),
    RemoveAddr(RemoveAddr),
    Priority(MpPrio),
    Fail(MpFail),
    FastClose(MpFastClose),
    /// Recognized subtype but malformed length, or an unassigned subtype.
    Unknown { subtype: u8, payload: Vec<u8> },
}

/// HMAC-SHA1 is the only algorithm this crate (and RFC 6824) supports.
pub const CRYPTO_HMAC_SHA1: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpCapableForm {
    /// 12-byte form on SYN/SYN-ACK: sender's key only.
    SynOrSynAck { sender_key: u64 },
    /// 20-byte form on ACK: both keys, for mismatch detection.
    Ack { sender_key: u64, receiver_key: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpCapable {
    pub version: u8,
    /// Crypto algorithm octet; `CRYPTO_HMAC_SHA1` if none or unrecognized,
    /// callers should validate via [`MpCapable::algorithm`].
    pub crypto_flags: u8,
    pub form: MpCapableForm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoAlgorithm {
    HmacSha1,
    Missing,
    Unsupported(u8),
}

impl MpCapable {
    pub fn algorithm(&self) -> CryptoAlgorithm {
        let bits = self.crypto_flags & 0x0f;
        if bits == 0 {
            CryptoAlgorithm::Missing
        } else if bits & CRYPTO_HMAC_SHA1 != 0 {
            CryptoAlgorithm::HmacSha1
        } else {
            CryptoAlgorithm::Unsupported(bits)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpJoin {
    Syn {
        address_id: u8,
        token: u32,
        nonce: u32,
    },
    SynAck {
        address_id: u8,
        sender_hmac: u64,
        nonce: u32,
    },
    Ack {
        hmac: [u8; 20],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct DssFlags {
    pub data_ack_present: bool,
    pub data_ack_8bytes: bool,
    pub mapping_present: bool,
    pub dsn_8bytes: bool,
    pub data_fin: bool,
}

impl DssFlags {
    pub fn from_byte(b: u8) -> Self {
        DssFlags {
            data_ack_present: b & 0x01 != 0,
            data_ack_8bytes: b & 0x02 != 0,
            mapping_present: b & 0x04 != 0,
            dsn_8bytes: b & 0x08 != 0,
            data_fin: b & 0x10 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dss {
    pub flags: DssFlags,
    pub data_ack: Option<u64>,
    pub mapping: Option<DssMappingWire>,
}

/// The wire-level mapping fields carried by one DSS option (not yet
/// inserted into an interval tree -- see [`crate::mptcp::DssMapping`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DssMappingWire {
    pub raw_dsn: u64,
    pub ssn: u32,
    /// `data_level_len == 0` denotes an "infinite mapping".
    pub data_level_len: u16,
    pub checksum: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddAddr {
    pub address_id: u8,
    pub address: std::net::IpAddr,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveAddr {
    pub address_ids: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpPrio {
    pub backup: bool,
    pub address_id: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpFail {
    pub data_sequence_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpFastClose {
    pub receiver_key: u64,
}

/// Decodes the MPTCP option payload (everything after kind+length).
/// `payload.len()` corresponds to `len - 2`.
pub fn parse(payload: &[u8]) -> MptcpOption {
    if payload.is_empty() {
        return MptcpOption::Unknown {
            subtype: 0xff,
            payload: payload.to_vec(),
        };
    }
    let subtype = (payload[0] & 0xf0) >> 4;
    match subtype {
        0 => parse_capable(payload),
        1 => parse_join(payload),
        2 => parse_dss(payload),
        3 => parse_add_addr(payload),
        4 => parse_remove_addr(payload),
        5 => parse_prio(payload),
        6 => parse_fail(payload),
        7 => parse_fastclose(payload),
        _ => MptcpOption::Unknown {
            subtype,
            payload: payload.to_vec(),
        },
    }
}

fn u64_be(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    u64::from_be_bytes(buf)
}

fn u32_be(b: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&b[..4]);
    u32::from_be_bytes(buf)
}

fn parse_capable(payload: &[u8]) -> MptcpOption {
    // payload[0]: subtype(4) | version(4); payload[1]: crypto flags.
    if payload.len() < 2 {
        return unknown(0, payload);
    }
    let version = payload[0] & 0x0f;
    let crypto_flags = payload[1];
    let rest = &payload[2..];
    let form = if rest.len() >= 16 {
        MpCapableForm::Ack {
            sender_key: u64_be(&rest[0..8]),
            receiver_key: u64_be(&rest[8..16]),
        }
    } else if rest.len() >= 8 {
        MpCapableForm::SynOrSynAck {
            sender_key: u64_be(&rest[0..8]),
        }
    } else {
        return unknown(0, payload);
    };
    MptcpOption::Capable(MpCapable {
        version,
        crypto_flags,
        form,
    })
}

fn parse_join(payload: &[u8]) -> MptcpOption {
    // Total option length (incl. kind+len) distinguishes SYN(12)/SYNACK(16)/ACK(24);
    // payload.len() is that minus 2.
    let rest = &payload[1..];
    match payload.len() {
        10 => {
            // 12-byte option: address_id(1) token(4) nonce(4)
            if rest.len() < 9 {
                return unknown(1, payload);
            }
            MptcpOption::Join(MpJoin::Syn {
                address_id: rest[0],
                token: u32_be(&rest[1..5]),
                nonce: u32_be(&rest[5..9]),
            })
        }
        14 => {
            // 16-byte option: address_id(1) truncated hmac(8) nonce(4)
            if rest.len() < 13 {
                return unknown(1, payload);
            }
            let mut hmac = [0u8; 8];
            hmac.copy_from_slice(&rest[1..9]);
            MptcpOption::Join(MpJoin::SynAck {
                address_id: rest[0],
                sender_hmac: u64::from_be_bytes(hmac),
                nonce: u32_be(&rest[9..13]),
            })
        }
        22 => {
            // 24-byte option: reserved(1) hmac(20)
            if rest.len() < 21 {
                return unknown(1, payload);
            }
            let mut hmac = [0u8; 20];
            hmac.copy_from_slice(&rest[1..21]);
            MptcpOption::Join(MpJoin::Ack { hmac })
        }
        _ => unknown(1, payload),
    }
}

fn parse_dss(payload: &[u8]) -> MptcpOption {
    if payload.len() < 2 {
        return unknown(2, payload);
    }
    let flags = DssFlags::from_byte(payload[1]);
    let mut offset = 2usize;

    let data_ack = if flags.data_ack_present {
        let width = if flags.data_ack_8bytes { 8 } else { 4 };
        if payload.len() < offset + width {
            return unknown(2, payload);
        }
        let v = if width == 8 {
            u64_be(&payload[offset..offset + 8])
        } else {
            u32_be(&payload[offset..offset + 4]) as u64
        };
        offset += width;
        Some(v)
    } else {
        None
    };

    let mapping = if flags.mapping_present {
        let dsn_width = if flags.dsn_8bytes { 8 } else { 4 };
        // dsn + ssn(4) + data_level_len(2), optional checksum(2)
        if payload.len() < offset + dsn_width + 6 {
            return unknown(2, payload);
        }
        let raw_dsn = if dsn_width == 8 {
            u64_be(&payload[offset..offset + 8])
        } else {
            u32_be(&payload[offset..offset + 4]) as u64
        };
        offset += dsn_width;
        let ssn = u32_be(&payload[offset..offset + 4]);
        offset += 4;
        let data_level_len = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        offset += 2;
        let checksum = if payload.len() >= offset + 2 {
            Some(u16::from_be_bytes([payload[offset], payload[offset + 1]]))
        } else {
            None
        };
        Some(DssMappingWire {
            raw_dsn,
            ssn,
            data_level_len,
            checksum,
        })
    } else {
        None
    };

    MptcpOption::Dss(Dss {
        flags,
        data_ack,
        mapping,
    })
}

fn parse_add_addr(payload: &[u8]) -> MptcpOption {
    // payload[0]: subtype|ipver ; payload[1]: address id
    if payload.len() < 2 {
        return unknown(3, payload);
    }
    let ip_ver = payload[0] & 0x0f;
    let address_id = payload[1];
    let rest = &payload[2..];
    let (address, rest) = if ip_ver == 4 {
        if rest.len() < 4 {
            return unknown(3, payload);
        }
        (
            std::net::IpAddr::V4(std::net::Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3])),
            &rest[4..],
        )
    } else {
        if rest.len() < 16 {
            return unknown(3, payload);
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&rest[..16]);
        (
            std::net::IpAddr::V6(std::net::Ipv6Addr::from(octets)),
            &rest[16..],
        )
    };
    let port = if rest.len() >= 2 {
        Some(u16::from_be_bytes([rest[0], rest[1]]))
    } else {
        None
    };
    MptcpOption::AddAddr(AddAddr {
        address_id,
        address,
        port,
    })
}

fn parse_remove_addr(payload: &[u8]) -> MptcpOption {
    if payload.is_empty() {
        return unknown(4, payload);
    }
    MptcpOption::RemoveAddr(RemoveAddr {
        address_ids: payload[1..].to_vec(),
    })
}

fn parse_prio(payload: &[u8]) -> MptcpOption {
    if payload.is_empty() {
        return unknown(5, payload);
    }
    let backup = payload[0] & 0x01 != 0;
    let address_id = payload.get(1).copied();
    MptcpOption::Priority(MpPrio {
        backup,
        address_id,
    })
}

fn parse_fail(payload: &[u8]) -> MptcpOption {
    // payload[0] subtype|reserved, payload[1] reserved, then 8-byte DSN.
    if payload.len() < 10 {
        return unknown(6, payload);
    }
    MptcpOption::Fail(MpFail {
        data_sequence_number: u64_be(&payload[2..10]),
    })
}

fn parse_fastclose(payload: &[u8]) -> MptcpOption {
    if payload.len() < 10 {
        return unknown(7, payload);
    }
    MptcpOption::FastClose(MpFastClose {
        receiver_key: u64_be(&payload[2..10]),
    })
}

fn unknown(subtype: u8, payload: &[u8]) -> MptcpOption {
    MptcpOption::Unknown {
        subtype,
        payload: payload.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_mp_capable_syn() {
        let mut payload = vec![0x00, CRYPTO_HMAC_SHA1];
        payload.extend_from_slice(&1u64.to_be_bytes());
        match parse(&payload) {
            MptcpOption::Capable(cap) => {
                assert_eq!(cap.algorithm(), CryptoAlgorithm::HmacSha1);
                assert_eq!(cap.form, MpCapableForm::SynOrSynAck { sender_key: 1 });
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_mp_capable_ack_both_keys() {
        let mut payload = vec![0x00, CRYPTO_HMAC_SHA1];
        payload.extend_from_slice(&1u64.to_be_bytes());
        payload.extend_from_slice(&2u64.to_be_bytes());
        match parse(&payload) {
            MptcpOption::Capable(cap) => assert_eq!(
                cap.form,
                MpCapableForm::Ack {
                    sender_key: 1,
                    receiver_key: 2
                }
            ),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_algorithm_detected() {
        let mut payload = vec![0x00, 0x00];
        payload.extend_from_slice(&1u64.to_be_bytes());
        match parse(&payload) {
            MptcpOption::Capable(cap) => assert_eq!(cap.algorithm(), CryptoAlgorithm::Missing),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_dss_with_32bit_mapping() {
        let mut payload = vec![0x20, 0x04]; // subtype=2, mapping present
        payload.extend_from_slice(&5u32.to_be_bytes()); // dsn
        payload.extend_from_slice(&100u32.to_be_bytes()); // ssn
        payload.extend_from_slice(&50u16.to_be_bytes()); // data_level_len
        match parse(&payload) {
            MptcpOption::Dss(dss) => {
                assert!(dss.flags.mapping_present);
                let m = dss.mapping.unwrap();
                assert_eq!(m.raw_dsn, 5);
                assert_eq!(m.ssn, 100);
                assert_eq!(m.data_level_len, 50);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_mp_join_syn() {
        let mut payload = vec![0x10, 7]; // subtype=1, address_id=7
        payload.extend_from_slice(&0xAAAAAAAAu32.to_be_bytes());
        payload.extend_from_slice(&0xBBBBBBBBu32.to_be_bytes());
        match parse(&payload) {
            MptcpOption::Join(MpJoin::Syn {
                address_id,
                token,
                nonce,
            }) => {
                assert_eq!(address_id, 7);
                assert_eq!(token, 0xAAAAAAAA);
                assert_eq!(nonce, 0xBBBBBBBB);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
