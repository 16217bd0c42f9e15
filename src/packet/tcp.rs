//! TCP header, flags and options

use std::fmt;
use std::net::IpAddr;
use std::ops::{BitOr, BitOrAssign};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use super::checksum::transport_checksum;
use super::IPPROTO_TCP;
use crate::error::PacketError;

/// Fixed TCP header length (data offset = 5)
pub const TCP_MIN_HEADER_LEN: usize = 20;

/// Largest header the 4-bit data offset can describe
pub const TCP_MAX_HEADER_LEN: usize = 60;

/// TCP flag bitset (the 9 bits after the data offset, NS included)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(u16);

impl TcpFlags {
    pub const FIN: Self = Self(0x001);
    pub const SYN: Self = Self(0x002);
    pub const RST: Self = Self(0x004);
    pub const PSH: Self = Self(0x008);
    pub const ACK: Self = Self(0x010);
    pub const URG: Self = Self(0x020);
    pub const ECE: Self = Self(0x040);
    pub const CWR: Self = Self(0x080);
    pub const NS: Self = Self(0x100);

    const NAMES: [(Self, &'static str); 9] = [
        (Self::FIN, "FIN"),
        (Self::SYN, "SYN"),
        (Self::RST, "RST"),
        (Self::PSH, "PSH"),
        (Self::ACK, "ACK"),
        (Self::URG, "URG"),
        (Self::ECE, "ECE"),
        (Self::CWR, "CWR"),
        (Self::NS, "NS"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from raw bits; bits above NS are discarded
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & 0x1FF)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_syn(self) -> bool {
        self.contains(Self::SYN)
    }

    pub fn is_ack(self) -> bool {
        self.contains(Self::ACK)
    }

    pub fn is_fin(self) -> bool {
        self.contains(Self::FIN)
    }

    pub fn is_rst(self) -> bool {
        self.contains(Self::RST)
    }

    pub fn is_psh(self) -> bool {
        self.contains(Self::PSH)
    }
}

impl BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TcpFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpFlags({self})")
    }
}

/// Option kinds (IANA "TCP Option Kind Numbers")
pub mod option_kind {
    pub const END_OF_LIST: u8 = 0;
    pub const NO_OP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WINDOW_SCALE: u8 = 3;
    pub const SACK_PERMITTED: u8 = 4;
    pub const SACK: u8 = 5;
    pub const ECHO: u8 = 6;
    pub const ECHO_REPLY: u8 = 7;
    pub const TIMESTAMPS: u8 = 8;
}

/// One TCP option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    EndOfList,
    NoOp,
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    /// SACK blocks as (left edge, right edge)
    Sack(Vec<(u32, u32)>),
    /// RFC 1072 echo (obsolete, kept for round-trip)
    Echo(u32),
    /// RFC 1072 echo reply
    EchoReply(u32),
    Timestamps { value: u32, echo_reply: u32 },
    /// Any kind this codec does not interpret
    Unknown { kind: u8, data: Bytes },
}

impl TcpOption {
    pub fn kind(&self) -> u8 {
        use option_kind::*;
        match self {
            Self::EndOfList => END_OF_LIST,
            Self::NoOp => NO_OP,
            Self::MaxSegmentSize(_) => MSS,
            Self::WindowScale(_) => WINDOW_SCALE,
            Self::SackPermitted => SACK_PERMITTED,
            Self::Sack(_) => SACK,
            Self::Echo(_) => ECHO,
            Self::EchoReply(_) => ECHO_REPLY,
            Self::Timestamps { .. } => TIMESTAMPS,
            Self::Unknown { kind, .. } => *kind,
        }
    }

    /// Encoded size in bytes, kind and length included
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::EndOfList | Self::NoOp => 1,
            Self::SackPermitted => 2,
            Self::WindowScale(_) => 3,
            Self::MaxSegmentSize(_) => 4,
            Self::Echo(_) | Self::EchoReply(_) => 6,
            Self::Timestamps { .. } => 10,
            Self::Sack(blocks) => 2 + blocks.len() * 8,
            Self::Unknown { data, .. } => 2 + data.len(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_to(&self, out: &mut BytesMut) {
        let kind = self.kind();
        match self {
            Self::EndOfList | Self::NoOp => out.put_u8(kind),
            _ => {
                out.put_u8(kind);
                out.put_u8(self.encoded_len() as u8);
            }
        }
        match self {
            Self::EndOfList | Self::NoOp | Self::SackPermitted => {}
            Self::MaxSegmentSize(mss) => out.put_u16(*mss),
            Self::WindowScale(shift) => out.put_u8(*shift),
            Self::Sack(blocks) => {
                for (left, right) in blocks {
                    out.put_u32(*left);
                    out.put_u32(*right);
                }
            }
            Self::Echo(v) | Self::EchoReply(v) => out.put_u32(*v),
            Self::Timestamps { value, echo_reply } => {
                out.put_u32(*value);
                out.put_u32(*echo_reply);
            }
            Self::Unknown { data, .. } => out.put_slice(data),
        }
    }

    /// Decode a TLV body. `None` means the body does not fit the kind
    /// and the option is skipped.
    fn decode(kind: u8, mut body: &[u8]) -> Option<Self> {
        use option_kind::*;
        let option = match (kind, body.len()) {
            (MSS, 2) => Self::MaxSegmentSize(body.get_u16()),
            (WINDOW_SCALE, 1) => Self::WindowScale(body.get_u8()),
            (SACK_PERMITTED, 0) => Self::SackPermitted,
            (SACK, n) if n > 0 && n % 8 == 0 => {
                let mut blocks = Vec::with_capacity(n / 8);
                while body.has_remaining() {
                    blocks.push((body.get_u32(), body.get_u32()));
                }
                Self::Sack(blocks)
            }
            (ECHO, 4) => Self::Echo(body.get_u32()),
            (ECHO_REPLY, 4) => Self::EchoReply(body.get_u32()),
            (TIMESTAMPS, 8) => Self::Timestamps {
                value: body.get_u32(),
                echo_reply: body.get_u32(),
            },
            (MSS | WINDOW_SCALE | SACK_PERMITTED | SACK | ECHO | ECHO_REPLY | TIMESTAMPS, _) => {
                return None
            }
            (kind, _) => Self::Unknown {
                kind,
                data: Bytes::copy_from_slice(body),
            },
        };
        Some(option)
    }
}

/// Parse the option area of a TCP header.
///
/// A well-framed option whose body does not match its kind is skipped.
/// A length byte below 2 or past the end of the area stops parsing; the
/// options already decoded are returned. End-of-list is not recorded.
pub fn parse_options(mut area: &[u8]) -> Vec<TcpOption> {
    let mut options = Vec::new();
    while let Some((&kind, rest)) = area.split_first() {
        match kind {
            // Everything from EOL on is padding, regenerated from the data offset
            option_kind::END_OF_LIST => break,
            option_kind::NO_OP => {
                options.push(TcpOption::NoOp);
                area = rest;
            }
            _ => {
                let Some(&len) = rest.first() else {
                    trace!("TCP option {} truncated before length byte", kind);
                    break;
                };
                let len = usize::from(len);
                if len < 2 || len > area.len() {
                    trace!("TCP option {} has invalid length {}", kind, len);
                    break;
                }
                match TcpOption::decode(kind, &area[2..len]) {
                    Some(option) => options.push(option),
                    None => trace!("Skipping malformed TCP option {} (len {})", kind, len),
                }
                area = &area[len..];
            }
        }
    }
    options
}

/// TCP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgment: u32,
    /// Header length in 32-bit words
    data_offset: u8,
    /// Reserved bits between data offset and NS (kept for round-trip)
    pub reserved: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    options: Vec<TcpOption>,
}

impl TcpHeader {
    /// Build a header with no options
    pub fn new(
        source_port: u16,
        destination_port: u16,
        sequence: u32,
        acknowledgment: u32,
        flags: TcpFlags,
        window: u16,
    ) -> Self {
        Self {
            source_port,
            destination_port,
            sequence,
            acknowledgment,
            data_offset: 5,
            reserved: 0,
            flags,
            window,
            checksum: 0,
            urgent_pointer: 0,
            options: Vec::new(),
        }
    }

    /// Parse a TCP header, advancing past it (options included)
    ///
    /// # Errors
    ///
    /// Returns `PacketError::MalformedHeader` when fewer than 20 bytes
    /// remain, the data offset is below 5, or it exceeds the buffer.
    pub fn parse(buf: &mut impl Buf) -> Result<Self, PacketError> {
        if buf.remaining() < TCP_MIN_HEADER_LEN {
            return Err(PacketError::truncated(
                "TCP header",
                TCP_MIN_HEADER_LEN,
                buf.remaining(),
            ));
        }

        let source_port = buf.get_u16();
        let destination_port = buf.get_u16();
        let sequence = buf.get_u32();
        let acknowledgment = buf.get_u32();
        let offset_flags = buf.get_u16();
        let window = buf.get_u16();
        let checksum = buf.get_u16();
        let urgent_pointer = buf.get_u16();

        #[allow(clippy::cast_possible_truncation)]
        let data_offset = (offset_flags >> 12) as u8;
        let header_len = usize::from(data_offset) * 4;
        if header_len < TCP_MIN_HEADER_LEN {
            return Err(PacketError::malformed(format!(
                "TCP data offset {data_offset} below minimum"
            )));
        }
        let options_len = header_len - TCP_MIN_HEADER_LEN;
        if options_len > buf.remaining() {
            return Err(PacketError::truncated(
                "TCP header with options",
                header_len,
                TCP_MIN_HEADER_LEN + buf.remaining(),
            ));
        }
        let area = buf.copy_to_bytes(options_len);

        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            source_port,
            destination_port,
            sequence,
            acknowledgment,
            data_offset,
            reserved: ((offset_flags >> 9) & 0x07) as u8,
            flags: TcpFlags::from_bits(offset_flags),
            window,
            checksum,
            urgent_pointer,
            options: parse_options(&area),
        })
    }

    pub fn data_offset(&self) -> u8 {
        self.data_offset
    }

    /// Header length in bytes
    pub fn header_len(&self) -> usize {
        usize::from(self.data_offset) * 4
    }

    pub fn options(&self) -> &[TcpOption] {
        &self.options
    }

    /// Replace the options, recomputing the data offset so the
    /// serialized length stays a whole number of words.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::MalformedHeader` if the options do not fit
    /// in the 40-byte option area.
    pub fn set_options(&mut self, options: Vec<TcpOption>) -> Result<(), PacketError> {
        let raw: usize = options.iter().map(TcpOption::encoded_len).sum();
        let padded = raw.div_ceil(4) * 4;
        if TCP_MIN_HEADER_LEN + padded > TCP_MAX_HEADER_LEN {
            return Err(PacketError::malformed(format!(
                "TCP options need {raw} bytes, at most 40 fit"
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            self.data_offset = ((TCP_MIN_HEADER_LEN + padded) / 4) as u8;
        }
        self.options = options;
        Ok(())
    }

    /// Peer's advertised MSS, if present
    pub fn mss(&self) -> Option<u16> {
        self.options.iter().find_map(|o| match o {
            TcpOption::MaxSegmentSize(mss) => Some(*mss),
            _ => None,
        })
    }

    /// Peer's window-scale shift, if present
    pub fn window_scale(&self) -> Option<u8> {
        self.options.iter().find_map(|o| match o {
            TcpOption::WindowScale(shift) => Some(*shift),
            _ => None,
        })
    }

    /// Timestamps option as (TSval, TSecr), if present
    pub fn timestamps(&self) -> Option<(u32, u32)> {
        self.options.iter().find_map(|o| match o {
            TcpOption::Timestamps { value, echo_reply } => Some((*value, *echo_reply)),
            _ => None,
        })
    }

    pub fn sack_permitted(&self) -> bool {
        self.options.contains(&TcpOption::SackPermitted)
    }

    /// Append the header with the stored checksum, padding the options
    /// with zeros up to the data offset
    pub fn write_to(&self, out: &mut BytesMut) {
        let start = out.len();
        out.put_u16(self.source_port);
        out.put_u16(self.destination_port);
        out.put_u32(self.sequence);
        out.put_u32(self.acknowledgment);
        out.put_u16(
            (u16::from(self.data_offset) << 12)
                | (u16::from(self.reserved & 0x07) << 9)
                | self.flags.bits(),
        );
        out.put_u16(self.window);
        out.put_u16(self.checksum);
        out.put_u16(self.urgent_pointer);
        for option in &self.options {
            option.write_to(out);
        }
        let written = out.len() - start;
        if written < self.header_len() {
            out.put_bytes(0, self.header_len() - written);
        }
    }

    /// Serialize the header exactly as stored
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.header_len());
        self.write_to(&mut out);
        out.freeze()
    }

    /// Serialize header plus payload, recomputing the checksum over the
    /// pseudo-header. The stored checksum is updated.
    pub fn encode(&mut self, src: IpAddr, dst: IpAddr, payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.header_len() + payload.len());
        self.checksum = 0;
        self.write_to(&mut out);
        self.checksum = transport_checksum(src, dst, IPPROTO_TCP, &out, payload);
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out.put_slice(payload);
        out
    }
}
