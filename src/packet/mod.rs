//! Packet codec for tunnel traffic
//!
//! Stateless parse/serialize routines for the IPv4, IPv6, TCP and UDP
//! headers carried over the tunnel, plus builders for the packets the
//! engine writes back.
//!
//! Parsing works on any [`bytes::Buf`] and advances it past the header.
//! Serialization comes in two forms:
//!
//! - `to_bytes` / `write_to` write every field as stored, so
//!   `to_bytes(parse(bytes)) == bytes` for well-formed input (the IPv4
//!   header checksum is recomputed, which leaves a correct one unchanged).
//! - `encode` recomputes the transport checksum over the pseudo-header and
//!   is what the reply builders use.
//!
//! Every header type is `Clone`; a clone is a deep, independent copy. The
//! `reply` helpers clone before swapping so an inbound packet is never
//! mutated in place.

pub mod checksum;
pub mod ip;
pub mod tcp;
pub mod udp;

use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PacketError;

pub use checksum::{internet_checksum, pseudo_header, transport_checksum, Checksum};
pub use ip::{IpHeader, Ipv4Header, Ipv6Header};
pub use tcp::{TcpFlags, TcpHeader, TcpOption};
pub use udp::UdpHeader;

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;

/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// Human-readable protocol name for logs
pub fn protocol_name(protocol: u8) -> &'static str {
    match protocol {
        IPPROTO_TCP => "TCP",
        IPPROTO_UDP => "UDP",
        1 => "ICMP",
        58 => "ICMPv6",
        _ => "unknown",
    }
}

/// Transport header of either supported protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

impl TransportHeader {
    /// Parse the transport header for `protocol`
    ///
    /// # Errors
    ///
    /// `UnsupportedProtocol` for anything but TCP/UDP, `MalformedHeader`
    /// when the header does not fit.
    pub fn parse(buf: &mut impl Buf, protocol: u8) -> Result<Self, PacketError> {
        match protocol {
            IPPROTO_TCP => TcpHeader::parse(buf).map(Self::Tcp),
            IPPROTO_UDP => UdpHeader::parse(buf).map(Self::Udp),
            value => Err(PacketError::UnsupportedProtocol {
                layer: "transport",
                value,
            }),
        }
    }

    pub fn protocol(&self) -> u8 {
        match self {
            Self::Tcp(_) => IPPROTO_TCP,
            Self::Udp(_) => IPPROTO_UDP,
        }
    }

    pub fn source_port(&self) -> u16 {
        match self {
            Self::Tcp(h) => h.source_port,
            Self::Udp(h) => h.source_port,
        }
    }

    pub fn destination_port(&self) -> u16 {
        match self {
            Self::Tcp(h) => h.destination_port,
            Self::Udp(h) => h.destination_port,
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            Self::Tcp(h) => h.header_len(),
            Self::Udp(_) => udp::UDP_HEADER_LEN,
        }
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        match self {
            Self::Tcp(h) => h.write_to(out),
            Self::Udp(h) => h.write_to(out),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Tcp(h) => h.to_bytes(),
            Self::Udp(h) => h.to_bytes(),
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpHeader> {
        match self {
            Self::Tcp(h) => Some(h),
            Self::Udp(_) => None,
        }
    }

    /// Deep copy with ports swapped
    #[must_use]
    pub fn reply(&self) -> Self {
        let mut reply = self.clone();
        match &mut reply {
            Self::Tcp(h) => std::mem::swap(&mut h.source_port, &mut h.destination_port),
            Self::Udp(h) => std::mem::swap(&mut h.source_port, &mut h.destination_port),
        }
        reply
    }
}

/// A fully parsed tunnel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ip: IpHeader,
    pub transport: TransportHeader,
    pub payload: Bytes,
}

impl Packet {
    /// Parse a raw IP packet.
    ///
    /// Trailing bytes beyond the IP (and UDP) length fields are trimmed.
    ///
    /// # Errors
    ///
    /// `MalformedHeader` when a header or the declared lengths do not fit
    /// the buffer, `UnsupportedProtocol` for non TCP/UDP payloads.
    pub fn parse(data: Bytes) -> Result<Self, PacketError> {
        let mut buf = data;
        let ip = IpHeader::parse(&mut buf)?;

        let declared = ip.payload_len();
        if declared > buf.remaining() {
            return Err(PacketError::malformed(format!(
                "IP payload length {} exceeds the {} bytes captured",
                declared,
                buf.remaining()
            )));
        }
        buf.truncate(declared);

        let transport = TransportHeader::parse(&mut buf, ip.protocol())?;
        if let TransportHeader::Udp(udp) = &transport {
            let payload_len = udp.payload_len();
            if payload_len > buf.remaining() {
                return Err(PacketError::malformed(format!(
                    "UDP length {} exceeds the IP payload",
                    udp.length
                )));
            }
            buf.truncate(payload_len);
        }

        Ok(Self {
            ip,
            transport,
            payload: buf,
        })
    }

    pub fn protocol(&self) -> u8 {
        self.transport.protocol()
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.ip.source(), self.transport.source_port())
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.ip.destination(), self.transport.destination_port())
    }

    /// Serialize every header as stored, followed by the payload
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(
            self.ip.header_len() + self.transport.header_len() + self.payload.len(),
        );
        self.ip.clone().write_to(&mut out);
        self.transport.write_to(&mut out);
        out.put_slice(&self.payload);
        out.freeze()
    }
}

/// Frame a serialized transport segment in a fresh IP header.
///
/// IPv4 framing carries DF, TTL 64 and a random identification; IPv6
/// framing carries hop limit 64.
///
/// # Errors
///
/// `AddressFamilyMismatch` if `source` and `destination` differ in family.
pub fn encapsulate(
    source: IpAddr,
    destination: IpAddr,
    protocol: u8,
    segment: &[u8],
) -> Result<Bytes, PacketError> {
    let mut ip = IpHeader::new(source, destination, protocol, segment.len())?;
    let mut out = BytesMut::with_capacity(ip.header_len() + segment.len());
    ip.write_to(&mut out);
    out.put_slice(segment);
    Ok(out.freeze())
}

/// Build a TCP packet from a reply template.
///
/// The template's addresses are used as-is (call [`IpHeader::reply`]
/// first); lengths and both checksums are recomputed.
pub fn build_tcp_packet(template: &IpHeader, tcp: &mut TcpHeader, payload: &[u8]) -> Bytes {
    let segment = tcp.encode(template.source(), template.destination(), payload);
    frame(template, &segment)
}

/// Build a UDP packet from a reply template.
pub fn build_udp_packet(
    template: &IpHeader,
    source_port: u16,
    destination_port: u16,
    payload: &[u8],
) -> Bytes {
    let mut udp = UdpHeader::new(source_port, destination_port, payload.len());
    let datagram = udp.encode(template.source(), template.destination(), payload);
    frame(template, &datagram)
}

fn frame(template: &IpHeader, segment: &[u8]) -> Bytes {
    let mut ip = template.clone();
    ip.set_payload_len(segment.len());
    let mut out = BytesMut::with_capacity(ip.header_len() + segment.len());
    ip.write_to(&mut out);
    out.put_slice(segment);
    out.freeze()
}


#[cfg(test)]
mod tests {
    use super::test_packets::{tcp_v4, udp};
    use super::*;

    #[test]
    fn test_packet_round_trip_tcp() {
        let bytes = tcp_v4(
            "10.0.0.2:40000",
            "93.184.216.34:80",
            100,
            0,
            TcpFlags::SYN,
            vec![TcpOption::MaxSegmentSize(1460), TcpOption::WindowScale(8)],
            b"",
        );
        let packet = Packet::parse(bytes.clone()).unwrap();
        assert_eq!(packet.to_bytes(), bytes);
        assert_eq!(packet.source(), "10.0.0.2:40000".parse().unwrap());
        assert_eq!(packet.destination(), "93.184.216.34:80".parse().unwrap());
        let tcp = packet.transport.as_tcp().unwrap();
        assert_eq!(tcp.sequence, 100);
        assert_eq!(tcp.mss(), Some(1460));
    }

    #[test]
    fn test_packet_round_trip_udp_v6() {
        let bytes = udp("[fd00::2]:5353", "[2001:db8::1]:53", b"hello");
        let packet = Packet::parse(bytes.clone()).unwrap();
        assert_eq!(packet.payload.as_ref(), b"hello");
        assert_eq!(packet.to_bytes(), bytes);
        assert!(packet.ip.is_ipv6());
    }

    #[test]
    fn test_parse_trims_link_padding() {
        let mut raw = udp("10.0.0.2:5000", "10.0.0.1:53", b"abc").to_vec();
        raw.extend_from_slice(&[0, 0, 0, 0]);
        let packet = Packet::parse(Bytes::from(raw)).unwrap();
        assert_eq!(packet.payload.as_ref(), b"abc");
    }

    #[test]
    fn test_parse_total_length_exceeds_buffer() {
        let raw = udp("10.0.0.2:5000", "10.0.0.1:53", b"abcdef");
        let truncated = raw.slice(..raw.len() - 2);
        assert!(matches!(
            Packet::parse(truncated),
            Err(PacketError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_parse_unsupported_transport() {
        let icmp = encapsulate(
            "10.0.0.2".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            1,
            &[8, 0, 0, 0, 0, 0, 0, 0],
        )
        .unwrap();
        assert!(matches!(
            Packet::parse(icmp),
            Err(PacketError::UnsupportedProtocol { value: 1, .. })
        ));
    }

    #[test]
    fn test_encapsulate_family_mismatch() {
        let err = encapsulate(
            "10.0.0.2".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
            IPPROTO_UDP,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, PacketError::AddressFamilyMismatch { .. }));
    }

    #[test]
    fn test_encapsulate_sets_lengths() {
        let segment = [0u8; 28];
        let v4 = encapsulate(
            "10.0.0.2".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            IPPROTO_UDP,
            &segment,
        )
        .unwrap();
        assert_eq!(v4.len(), 48);
        assert_eq!(u16::from_be_bytes([v4[2], v4[3]]), 48);

        let v6 = encapsulate(
            "::1".parse().unwrap(),
            "::2".parse().unwrap(),
            IPPROTO_UDP,
            &segment,
        )
        .unwrap();
        assert_eq!(v6.len(), 68);
        assert_eq!(u16::from_be_bytes([v6[4], v6[5]]), 28);
    }

    #[test]
    fn test_transport_reply_swaps_ports() {
        let packet = Packet::parse(udp("10.0.0.2:5000", "10.0.0.1:53", b"q")).unwrap();
        let reply = packet.transport.reply();
        assert_eq!(reply.source_port(), 53);
        assert_eq!(reply.destination_port(), 5000);
        assert_eq!(packet.transport.source_port(), 5000);
    }

    #[test]
    fn test_build_tcp_packet_checksums() {
        let bytes = tcp_v4(
            "10.0.0.2:40000",
            "1.1.1.1:443",
            7,
            9,
            TcpFlags::PSH | TcpFlags::ACK,
            Vec::new(),
            b"payload",
        );
        let packet = Packet::parse(bytes.clone()).unwrap();
        if let IpHeader::V4(h) = &packet.ip {
            assert!(h.verify_checksum());
        }
        let tcp_segment = &bytes[20..];
        assert_eq!(
            pseudo_header(
                packet.ip.source(),
                packet.ip.destination(),
                IPPROTO_TCP,
                tcp_segment.len()
            )
            .add_bytes(tcp_segment)
            .finish(),
            0
        );
    }
}
