//! Fixed 20-byte TCP header.

use crate::error::TcpParseError;
use bitmask_enum::bitmask;
use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::IResult;

/// Fixed TCP header fields, all flags/offset already unpacked into host
/// representation (the engine operates on owned bytes, not a zero-copy
/// `repr(C, packed)` overlay like `retina_core::protocols::packet::tcp`,
/// since segments arrive as plain `&[u8]` rather than DPDK `Mbuf`s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_no: u32,
    pub ack_no: u32,
    /// Header length in 32-bit words, straight off the wire (4 bits).
    pub data_offset: u8,
    /// The three reserved bits between the data offset and NS.
    pub reserved: u8,
    pub flags: Flags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
}

/// The nine header flag bits.
/// The three reserved bits are tracked separately on [`TcpHeader::reserved`]
/// since they aren't individually named.
#[bitmask(u16)]
pub enum Flags {
    Fin,
    Syn,
    Rst,
    Psh,
    Ack,
    Urg,
    Ece,
    Cwr,
    Ns,
}

impl TcpHeader {
    /// Header length in bytes.
    #[inline]
    pub fn header_len_bytes(&self) -> usize {
        self.data_offset as usize * 4
    }
}

/// Reads just the source/destination ports, for the `BogusHeaderLength`
/// case where dissection stops early but ICMP-error style callers still
/// want the ports.
pub fn peek_ports(bytes: &[u8]) -> Option<(u16, u16)> {
    if bytes.len() < 4 {
        return None;
    }
    Some((
        u16::from_be_bytes([bytes[0], bytes[1]]),
        u16::from_be_bytes([bytes[2], bytes[3]]),
    ))
}

/// Parses the fixed 20-byte TCP header and validates the data offset
/// against `reported_length` (the length of `bytes`, i.e. header + options
/// + payload as delivered by the capture source).
///
/// Returns the parsed header and the number of option bytes that follow it.
pub fn parse(bytes: &[u8]) -> Result<(TcpHeader, usize), TcpParseError> {
    if bytes.len() < 20 {
        return Err(TcpParseError::ShortSegment(bytes.len()));
    }
    let (_, header) = parse_fixed(bytes).expect("length checked above");

    let header_len = header.header_len_bytes();
    if header.data_offset < 5 || header_len > bytes.len() {
        return Err(TcpParseError::BogusHeaderLength {
            data_offset: header.data_offset,
            implied: header_len,
            available: bytes.len(),
        });
    }
    let options_len = header_len - 20;
    Ok((header, options_len))
}

fn parse_fixed(i: &[u8]) -> IResult<&[u8], TcpHeader> {
    let (i, src_port) = be_u16(i)?;
    let (i, dst_port) = be_u16(i)?;
    let (i, seq_no) = be_u32(i)?;
    let (i, ack_no) = be_u32(i)?;
    let (i, data_offset_to_ns) = be_u8(i)?;
    let (i, flag_byte) = be_u8(i)?;
    let (i, window) = be_u16(i)?;
    let (i, checksum) = be_u16(i)?;
    let (i, urgent_pointer) = be_u16(i)?;
    let (i, _) = take(0usize)(i)?;

    let data_offset = (data_offset_to_ns & 0xf0) >> 4;
    let reserved = (data_offset_to_ns & 0x0e) >> 1;
    let ns = data_offset_to_ns & 0x01;

    let mut flags = Flags::none();
    if flag_byte & 0b0000_0001 != 0 {
        flags |= Flags::Fin;
    }
    if flag_byte & 0b0000_0010 != 0 {
        flags |= Flags::Syn;
    }
    if flag_byte & 0b0000_0100 != 0 {
        flags |= Flags::Rst;
    }
    if flag_byte & 0b0000_1000 != 0 {
        flags |= Flags::Psh;
    }
    if flag_byte & 0b0001_0000 != 0 {
        flags |= Flags::Ack;
    }
    if flag_byte & 0b0010_0000 != 0 {
        flags |= Flags::Urg;
    }
    if flag_byte & 0b0100_0000 != 0 {
        flags |= Flags::Ece;
    }
    if flag_byte & 0b1000_0000 != 0 {
        flags |= Flags::Cwr;
    }
    if ns != 0 {
        flags |= Flags::Ns;
    }

    Ok((
        i,
        TcpHeader {
            src_port,
            dst_port,
            seq_no,
            ack_no,
            data_offset,
            reserved,
            flags,
            window,
            checksum,
            urgent_pointer,
        },
    ))
}

/// Renders the 12-glyph flag-letters string: three reserved bits, then NS CWR ECE URG ACK PSH RST SYN FIN,
/// middle-dot for unset.
pub fn flags_letters(reserved: u8, flags: Flags) -> String {
    let mut s = String::with_capacity(12);
    for bit in 0..3 {
        s.push(if reserved & (1 << (2 - bit)) != 0 {
            'R'
        } else {
            '\u{00B7}'
        });
    }
    let glyphs: [(Flags, char); 9] = [
        (Flags::Ns, 'N'),
        (Flags::Cwr, 'C'),
        (Flags::Ece, 'E'),
        (Flags::Urg, 'U'),
        (Flags::Ack, 'A'),
        (Flags::Psh, 'P'),
        (Flags::Rst, 'R'),
        (Flags::Syn, 'S'),
        (Flags::Fin, 'F'),
    ];
    for (flag, ch) in glyphs {
        s.push(if flags.contains(flag) { ch } else { '\u{00B7}' });
    }
    s
}

/// Renders the comma-joined flag name list: `SYN, ACK`,
/// plus `Reserved` when any of the three reserved bits is set.
pub fn flags_names(reserved: u8, flags: Flags) -> String {
    let mut names = Vec::new();
    let named: [(Flags, &str); 9] = [
        (Flags::Ns, "NS"),
        (Flags::Cwr, "CWR"),
        (Flags::Ece, "ECE"),
        (Flags::Urg, "URG"),
        (Flags::Ack, "ACK"),
        (Flags::Psh, "PSH"),
        (Flags::Rst, "RST"),
        (Flags::Syn, "SYN"),
        (Flags::Fin, "FIN"),
    ];
    for (flag, name) in named {
        if flags.contains(flag) {
            names.push(name);
        }
    }
    if reserved != 0 {
        names.push("Reserved");
    }
    names.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn syn_segment() -> Vec<u8> {
        let mut b = vec![0u8; 20];
        b[0..2].copy_from_slice(&1234u16.to_be_bytes());
        b[2..4].copy_from_slice(&80u16.to_be_bytes());
        b[4..8].copy_from_slice(&1000u32.to_be_bytes());
        b[12] = 5 << 4; // data offset 5, no options
        b[13] = 0b0000_0010; // SYN
        b
    }

    #[test]
    fn parses_minimal_syn() {
        let bytes = syn_segment();
        let (header, options_len) = parse(&bytes).unwrap();
        assert_eq!(header.src_port, 1234);
        assert_eq!(header.dst_port, 80);
        assert_eq!(header.seq_no, 1000);
        assert_eq!(header.data_offset, 5);
        assert!(header.flags.contains(Flags::Syn));
        assert!(!header.flags.contains(Flags::Ack));
        assert_eq!(options_len, 0);
    }

    #[test]
    fn rejects_short_segment() {
        let bytes = vec![0u8; 10];
        assert_eq!(parse(&bytes), Err(TcpParseError::ShortSegment(10)));
    }

    #[test]
    fn rejects_bogus_header_length_too_small() {
        let mut bytes = syn_segment();
        bytes[12] = 4 << 4; // data offset 4 < minimum 5
        assert!(matches!(
            parse(&bytes),
            Err(TcpParseError::BogusHeaderLength { data_offset: 4, .. })
        ));
    }

    #[test]
    fn rejects_bogus_header_length_past_end() {
        let mut bytes = syn_segment();
        bytes[12] = 15 << 4; // implies 60-byte header, but only 20 present
        assert!(matches!(
            parse(&bytes),
            Err(TcpParseError::BogusHeaderLength { .. })
        ));
    }

    #[test]
    fn renders_flag_letters_and_names() {
        let flags = Flags::Syn | Flags::Ack;
        let letters = flags_letters(0, flags);
        assert_eq!(letters.chars().count(), 12);
        // reserved(3 dots) + Ns Cwr Ece Urg(dots) + Ack='A' + Psh Rst(dots) + Syn='S' + Fin(dot)
        let expected: String = "\u{00B7}\u{00B7}\u{00B7}\u{00B7}\u{00B7}\u{00B7}\u{00B7}A\u{00B7}\u{00B7}S\u{00B7}".into();
        assert_eq!(letters, expected);
        assert_eq!(flags_names(0, flags), "ACK, SYN");
        assert_eq!(flags_names(0b100, flags), "ACK, SYN, Reserved");
    }
}
