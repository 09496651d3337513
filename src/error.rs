//! Structural dissection errors and non-fatal per-packet notes.
//!
//! Mirrors the `thiserror`-derived `PacketParseError` idiom used by
//! `retina_core::protocols::packet`: a closed set of named outcomes the
//! caller can match on, rather than an opaque `anyhow` chain. None of these
//! unwind connection state; they are all local to the one packet that
//! triggered them.

use thiserror::Error;

/// Fatal parse outcomes for a single segment.
///
/// "Fatal" here only means dissection of the segment stops early; the
/// engine never panics and the conversation/flow state is left untouched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpParseError {
    /// Reported length is under the fixed 20-byte TCP header.
    #[error("short segment: {0} bytes available, 20 required")]
    ShortSegment(usize),

    /// `data_offset * 4` is less than 20 or greater than the reported length.
    #[error("bogus header length: data_offset={data_offset} implies {implied} bytes, {available} available")]
    BogusHeaderLength {
        data_offset: u8,
        implied: usize,
        available: usize,
    },
}

/// Non-fatal notes attached to a packet's analysis: structural, not
/// exceptional, so they never abort dissection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpertInfo {
    /// Computed checksum didn't match, and wasn't the RFC 1624 0xFFFF/0x0000
    /// special case either. Reassembly is disabled for the segment.
    BadChecksum { computed: u16, received: u16 },
    /// Received 0xFFFF with computed 0x0000 (RFC 1624). Reassembly still
    /// allowed.
    ChecksumFfffFixup,
    /// An option's length byte pointed past the end of the options area, or
    /// was otherwise too short for its kind. Remaining options are dropped.
    OptionLengthInvalid { kind: u8 },
    /// Malformed SACK or SCPS-extended sub-option; that option's parse
    /// stopped early but prior options are preserved.
    SubOptionMalformed { kind: u8 },
    /// Four consecutive NOPs seen within one 32-bit word (middlebox
    /// stripping heuristic).
    FourNopsInARow,
    /// Window Scale shift greater than 14 was clamped to 14 (RFC 1323).
    WindowScaleClamped { requested: u8 },
    /// A SYN segment carried a non-zero ACK field.
    SynWithNonzeroAck,
    /// The ACK flag was clear but the ack field was non-zero.
    AckClearNonzeroAckField,
    /// MP_CAPABLE did not advertise the HMAC-SHA1 checksum algorithm.
    MptcpMissingAlgorithm,
    /// MP_CAPABLE advertised an algorithm other than HMAC-SHA1.
    MptcpUnsupportedAlgorithm,
    /// MP_CAPABLE ACK's echoed keys didn't match the SYN/SYN-ACK keys.
    MptcpEchoedKeyMismatch,
    /// A DSS mapping advertised `length == 0` (infinite mapping).
    MptcpInfiniteMapping,
    /// No DSS mapping covers this segment's sequence range.
    MptcpMappingMissing,
}
