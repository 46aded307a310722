//! TCP header codec and the internet checksum (RFC 793 S3.1, RFC 1071).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Data |           |U|A|P|R|S|F|                               |
//! | Offset| Reserved  |R|C|S|S|Y|I|            Window             |
//! |       |           |G|K|H|T|N|N|                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |         Urgent Pointer        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Options are never emitted. On decode they are only measured and handed out
//! as a raw slice; see [`crate::options`] for interpreting them.

use bitflags::bitflags;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Length of the fixed header, without options.
pub const HEADER_LEN: usize = 20;

/// IP protocol number of TCP, used in the pseudo header.
pub const PROTOCOL_TCP: u8 = 6;

bitflags! {
    pub struct Flags: u8 {
        const FIN = 0b0000_0001;
        const SYN = 0b0000_0010;
        const RST = 0b0000_0100;
        const PSH = 0b0000_1000;
        const ACK = 0b0001_0000;
        const URG = 0b0010_0000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    /// Header length in 32-bit words.
    pub data_offset: u8,
    pub flags: Flags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
}

impl TcpHeader {
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            ack_number: 0,
            data_offset: (HEADER_LEN / 4) as u8,
            flags: Flags::empty(),
            window,
            checksum: 0,
            urgent_pointer: 0,
        }
    }

    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }

    pub fn syn(&self) -> bool {
        self.flags.contains(Flags::SYN)
    }

    pub fn ack(&self) -> bool {
        self.flags.contains(Flags::ACK)
    }

    pub fn fin(&self) -> bool {
        self.flags.contains(Flags::FIN)
    }

    pub fn rst(&self) -> bool {
        self.flags.contains(Flags::RST)
    }

    /// Sequence space consumed by a segment with this header: the payload plus
    /// one for each of SYN and FIN.
    pub fn sequence_len(&self, payload_len: usize) -> u32 {
        let mut len = payload_len as u32;
        if self.syn() {
            len += 1;
        }
        if self.fin() {
            len += 1;
        }
        len
    }

    fn write_fixed(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf.extend_from_slice(&self.seq_number.to_be_bytes());
        buf.extend_from_slice(&self.ack_number.to_be_bytes());
        buf.push(((HEADER_LEN / 4) as u8) << 4);
        buf.push(self.flags.bits());
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.urgent_pointer.to_be_bytes());
    }
}

/// A decoded segment borrowing the datagram it came from.
#[derive(Debug, Clone)]
pub struct SegmentSlice<'a> {
    header: TcpHeader,
    options: &'a [u8],
    payload: &'a [u8],
}

impl<'a> SegmentSlice<'a> {
    pub fn from_slice(bytes: &'a [u8]) -> Result<Self> {
        let header = decode(bytes)?;
        let header_len = header.header_len();
        Ok(Self {
            header,
            options: &bytes[HEADER_LEN..header_len],
            payload: &bytes[header_len..],
        })
    }

    pub fn header(&self) -> &TcpHeader {
        &self.header
    }

    /// Raw option bytes between the fixed header and the payload.
    pub fn options(&self) -> &'a [u8] {
        self.options
    }

    #[cfg(feature = "options")]
    pub fn options_iter(&self) -> crate::options::Options<'a> {
        crate::options::Options::new(self.options)
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

pub fn decode(bytes: &[u8]) -> Result<TcpHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }
    let data_offset = bytes[12] >> 4;
    if (data_offset as usize) * 4 < HEADER_LEN {
        return Err(Error::InvalidDataOffset(data_offset));
    }
    if (data_offset as usize) * 4 > bytes.len() {
        return Err(Error::Truncated {
            needed: data_offset as usize * 4,
            available: bytes.len(),
        });
    }

    Ok(TcpHeader {
        src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
        dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
        seq_number: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        ack_number: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        data_offset,
        flags: Flags::from_bits_truncate(bytes[13] & 0x3f),
        window: u16::from_be_bytes([bytes[14], bytes[15]]),
        checksum: u16::from_be_bytes([bytes[16], bytes[17]]),
        urgent_pointer: u16::from_be_bytes([bytes[18], bytes[19]]),
    })
}

/// Serializes a 20 byte header followed by `payload`, filling in the checksum
/// for a segment travelling from `src` to `dst`.
pub fn encode(header: &TcpHeader, payload: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    let header = TcpHeader {
        checksum: 0,
        ..header.clone()
    };
    header.write_fixed(&mut buf);
    buf.extend_from_slice(payload);

    let checksum = checksum(src, dst, &buf);
    buf[16..18].copy_from_slice(&checksum.to_be_bytes());
    buf
}

/// Checks the checksum of a complete segment as received.
pub fn verify_checksum(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<()> {
    // summing over a correct checksum field yields all ones
    if fold(sum_with_pseudo_header(src, dst, segment)) == 0xffff {
        Ok(())
    } else {
        Err(Error::Checksum)
    }
}

/// Internet checksum of `segment` (checksum field zeroed) behind an IPv4 pseudo header.
pub fn checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    !fold(sum_with_pseudo_header(src, dst, segment))
}

fn sum_with_pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u64 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = PROTOCOL_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    sum_words(sum_words(0, &pseudo), segment)
}

fn sum_words(mut sum: u64, bytes: &[u8]) -> u64 {
    let mut words = bytes.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    // odd length: pad with a zero byte that is never transmitted
    if let [last] = words.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}
