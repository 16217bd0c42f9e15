//! IPv4 and IPv6 headers

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::checksum::internet_checksum;
use crate::error::PacketError;

/// Minimum IPv4 header length (IHL = 5)
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Fixed IPv6 header length
pub const IPV6_HEADER_LEN: usize = 40;

/// Default TTL / hop limit for synthesized packets
pub const DEFAULT_TTL: u8 = 64;

/// IPv4 "don't fragment" flag (in the 3-bit flags field)
pub const IPV4_FLAG_DF: u8 = 0b010;

/// IPv4 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in 32-bit words
    pub ihl: u8,
    pub dscp: u8,
    pub ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    /// 3-bit flags field (reserved, DF, MF)
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// Raw options, `(ihl - 5) * 4` bytes. Carried through, not decoded.
    pub options: Bytes,
}

impl Ipv4Header {
    /// Build a fresh header with no options
    pub fn new(source: Ipv4Addr, destination: Ipv4Addr, protocol: u8, payload_len: usize) -> Self {
        let mut header = Self {
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 0,
            identification: 0,
            flags: IPV4_FLAG_DF,
            fragment_offset: 0,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            source,
            destination,
            options: Bytes::new(),
        };
        header.set_payload_len(payload_len);
        header
    }

    /// Parse an IPv4 header, advancing past it (including options)
    ///
    /// # Errors
    ///
    /// Returns `PacketError::MalformedHeader` on short input, a version
    /// other than 4, or an IHL that is too small or exceeds the buffer.
    pub fn parse(buf: &mut impl Buf) -> Result<Self, PacketError> {
        if buf.remaining() < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::truncated(
                "IPv4 header",
                IPV4_MIN_HEADER_LEN,
                buf.remaining(),
            ));
        }

        let version_ihl = buf.get_u8();
        let version = version_ihl >> 4;
        if version != 4 {
            return Err(PacketError::malformed(format!(
                "expected IP version 4, found {version}"
            )));
        }
        let ihl = version_ihl & 0x0F;
        let header_len = usize::from(ihl) * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::malformed(format!("IPv4 IHL {ihl} below minimum")));
        }
        // One byte already consumed
        if header_len - 1 > buf.remaining() {
            return Err(PacketError::truncated(
                "IPv4 header with options",
                header_len,
                buf.remaining() + 1,
            ));
        }

        let tos = buf.get_u8();
        let total_length = buf.get_u16();
        if usize::from(total_length) < header_len {
            return Err(PacketError::malformed(format!(
                "IPv4 total length {total_length} shorter than header length {header_len}"
            )));
        }
        let identification = buf.get_u16();
        let flags_fragment = buf.get_u16();
        let ttl = buf.get_u8();
        let protocol = buf.get_u8();
        let checksum = buf.get_u16();
        let source = Ipv4Addr::from(buf.get_u32());
        let destination = Ipv4Addr::from(buf.get_u32());
        let options = buf.copy_to_bytes(header_len - IPV4_MIN_HEADER_LEN);

        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            ihl,
            dscp: tos >> 2,
            ecn: tos & 0x03,
            total_length,
            identification,
            flags: (flags_fragment >> 13) as u8,
            fragment_offset: flags_fragment & 0x1FFF,
            ttl,
            protocol,
            checksum,
            source,
            destination,
            options,
        })
    }

    /// Header length in bytes
    pub fn header_len(&self) -> usize {
        usize::from(self.ihl) * 4
    }

    /// Bytes following the header according to the total length field
    pub fn payload_len(&self) -> usize {
        usize::from(self.total_length).saturating_sub(self.header_len())
    }

    /// Keep the total length consistent with a new payload size
    pub fn set_payload_len(&mut self, payload_len: usize) {
        let total = (self.header_len() + payload_len).min(usize::from(u16::MAX));
        #[allow(clippy::cast_possible_truncation)]
        {
            self.total_length = total as u16;
        }
    }

    /// Append the header to `out`, recomputing the header checksum.
    ///
    /// The stored `checksum` field is updated to the value written.
    pub fn write_to(&mut self, out: &mut BytesMut) {
        let start = out.len();
        out.put_u8(0x40 | (self.ihl & 0x0F));
        out.put_u8((self.dscp << 2) | (self.ecn & 0x03));
        out.put_u16(self.total_length);
        out.put_u16(self.identification);
        out.put_u16((u16::from(self.flags & 0x07) << 13) | (self.fragment_offset & 0x1FFF));
        out.put_u8(self.ttl);
        out.put_u8(self.protocol);
        out.put_u16(0);
        out.put_slice(&self.source.octets());
        out.put_slice(&self.destination.octets());
        out.put_slice(&self.options);

        // Options are padded with zero up to the declared IHL
        let written = out.len() - start;
        if written < self.header_len() {
            out.put_bytes(0, self.header_len() - written);
        }

        self.checksum = internet_checksum(&out[start..]);
        out[start + 10..start + 12].copy_from_slice(&self.checksum.to_be_bytes());
    }

    /// Serialize the header on its own
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.header_len());
        self.clone().write_to(&mut out);
        out.freeze()
    }

    /// Check the header checksum field against the header contents
    pub fn verify_checksum(&self) -> bool {
        let mut copy = self.clone();
        let mut out = BytesMut::with_capacity(self.header_len());
        copy.write_to(&mut out);
        copy.checksum == self.checksum
    }
}

/// IPv6 fixed header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    /// 20-bit flow label
    pub flow_label: u32,
    pub payload_length: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
}

impl Ipv6Header {
    /// Build a fresh header
    pub fn new(
        source: Ipv6Addr,
        destination: Ipv6Addr,
        next_header: u8,
        payload_len: usize,
    ) -> Self {
        let mut header = Self {
            traffic_class: 0,
            flow_label: 0,
            payload_length: 0,
            next_header,
            hop_limit: DEFAULT_TTL,
            source,
            destination,
        };
        header.set_payload_len(payload_len);
        header
    }

    /// Parse an IPv6 fixed header, advancing past it
    ///
    /// # Errors
    ///
    /// Returns `PacketError::MalformedHeader` on short input or a version
    /// other than 6.
    pub fn parse(buf: &mut impl Buf) -> Result<Self, PacketError> {
        if buf.remaining() < IPV6_HEADER_LEN {
            return Err(PacketError::truncated(
                "IPv6 header",
                IPV6_HEADER_LEN,
                buf.remaining(),
            ));
        }

        let word = buf.get_u32();
        let version = word >> 28;
        if version != 6 {
            return Err(PacketError::malformed(format!(
                "expected IP version 6, found {version}"
            )));
        }
        let payload_length = buf.get_u16();
        let next_header = buf.get_u8();
        let hop_limit = buf.get_u8();
        let source = Ipv6Addr::from(buf.get_u128());
        let destination = Ipv6Addr::from(buf.get_u128());

        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            traffic_class: ((word >> 20) & 0xFF) as u8,
            flow_label: word & 0x000F_FFFF,
            payload_length,
            next_header,
            hop_limit,
            source,
            destination,
        })
    }

    /// Keep the payload length consistent with a new payload size
    pub fn set_payload_len(&mut self, payload_len: usize) {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.payload_length = payload_len.min(usize::from(u16::MAX)) as u16;
        }
    }

    /// Append the header to `out`
    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u32(
            (6 << 28) | (u32::from(self.traffic_class) << 20) | (self.flow_label & 0x000F_FFFF),
        );
        out.put_u16(self.payload_length);
        out.put_u8(self.next_header);
        out.put_u8(self.hop_limit);
        out.put_slice(&self.source.octets());
        out.put_slice(&self.destination.octets());
    }

    /// Serialize the header on its own
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(IPV6_HEADER_LEN);
        self.write_to(&mut out);
        out.freeze()
    }
}

/// IP header of either family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl IpHeader {
    /// Parse an IP header, choosing the variant from the version nibble
    ///
    /// # Errors
    ///
    /// Returns `PacketError::MalformedHeader` for an empty buffer, an
    /// unknown version, or a header that does not fit the buffer.
    pub fn parse(buf: &mut impl Buf) -> Result<Self, PacketError> {
        let Some(&first) = buf.chunk().first() else {
            return Err(PacketError::malformed("empty buffer"));
        };
        match first >> 4 {
            4 => Ipv4Header::parse(buf).map(Self::V4),
            6 => Ipv6Header::parse(buf).map(Self::V6),
            version => Err(PacketError::malformed(format!(
                "unknown IP version {version}"
            ))),
        }
    }

    /// Build a fresh header for `source -> destination`
    ///
    /// # Errors
    ///
    /// Returns `PacketError::AddressFamilyMismatch` if the families differ.
    pub fn new(
        source: IpAddr,
        destination: IpAddr,
        protocol: u8,
        payload_len: usize,
    ) -> Result<Self, PacketError> {
        match (source, destination) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let mut header = Ipv4Header::new(src, dst, protocol, payload_len);
                header.identification = rand::random();
                Ok(Self::V4(header))
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                Ok(Self::V6(Ipv6Header::new(src, dst, protocol, payload_len)))
            }
            (src, dst) => Err(PacketError::AddressFamilyMismatch { src, dst }),
        }
    }

    /// Transport protocol number (IPv4 protocol / IPv6 next header)
    pub fn protocol(&self) -> u8 {
        match self {
            Self::V4(h) => h.protocol,
            Self::V6(h) => h.next_header,
        }
    }

    pub fn source(&self) -> IpAddr {
        match self {
            Self::V4(h) => IpAddr::V4(h.source),
            Self::V6(h) => IpAddr::V6(h.source),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self {
            Self::V4(h) => IpAddr::V4(h.destination),
            Self::V6(h) => IpAddr::V6(h.destination),
        }
    }

    /// Header length in bytes (always a multiple of 4)
    pub fn header_len(&self) -> usize {
        match self {
            Self::V4(h) => h.header_len(),
            Self::V6(_) => IPV6_HEADER_LEN,
        }
    }

    /// Payload length declared by the header
    pub fn payload_len(&self) -> usize {
        match self {
            Self::V4(h) => h.payload_len(),
            Self::V6(h) => usize::from(h.payload_length),
        }
    }

    pub fn set_payload_len(&mut self, payload_len: usize) {
        match self {
            Self::V4(h) => h.set_payload_len(payload_len),
            Self::V6(h) => h.set_payload_len(payload_len),
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Self::V6(_))
    }

    /// Deep copy with source and destination swapped.
    ///
    /// Used as the template for packets sent back towards the tunnel.
    /// IPv4 options are dropped and a fresh identification is drawn.
    #[must_use]
    pub fn reply(&self) -> Self {
        match self {
            Self::V4(h) => {
                let mut reply = h.clone();
                std::mem::swap(&mut reply.source, &mut reply.destination);
                reply.ihl = 5;
                reply.options = Bytes::new();
                reply.ttl = DEFAULT_TTL;
                reply.flags = IPV4_FLAG_DF;
                reply.fragment_offset = 0;
                reply.identification = rand::random();
                Self::V4(reply)
            }
            Self::V6(h) => {
                let mut reply = h.clone();
                std::mem::swap(&mut reply.source, &mut reply.destination);
                reply.hop_limit = DEFAULT_TTL;
                Self::V6(reply)
            }
        }
    }

    /// Append the header to `out` (IPv4 checksum recomputed)
    pub fn write_to(&mut self, out: &mut BytesMut) {
        match self {
            Self::V4(h) => h.write_to(out),
            Self::V6(h) => h.write_to(out),
        }
    }

    /// Serialize the header on its own
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::V4(h) => h.to_bytes(),
            Self::V6(h) => h.to_bytes(),
        }
    }
}
