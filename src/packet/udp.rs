//! UDP header

use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::checksum::transport_checksum;
use super::IPPROTO_UDP;
use crate::error::PacketError;

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// UDP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    /// Header plus payload length
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn new(source_port: u16, destination_port: u16, payload_len: usize) -> Self {
        let mut header = Self {
            source_port,
            destination_port,
            length: 0,
            checksum: 0,
        };
        header.set_payload_len(payload_len);
        header
    }

    /// Parse a UDP header, advancing past it
    ///
    /// # Errors
    ///
    /// Returns `PacketError::MalformedHeader` when fewer than 8 bytes remain
    /// or the length field is smaller than the header.
    pub fn parse(buf: &mut impl Buf) -> Result<Self, PacketError> {
        if buf.remaining() < UDP_HEADER_LEN {
            return Err(PacketError::truncated(
                "UDP header",
                UDP_HEADER_LEN,
                buf.remaining(),
            ));
        }
        let header = Self {
            source_port: buf.get_u16(),
            destination_port: buf.get_u16(),
            length: buf.get_u16(),
            checksum: buf.get_u16(),
        };
        if usize::from(header.length) < UDP_HEADER_LEN {
            return Err(PacketError::malformed(format!(
                "UDP length {} shorter than header",
                header.length
            )));
        }
        Ok(header)
    }

    pub fn payload_len(&self) -> usize {
        usize::from(self.length).saturating_sub(UDP_HEADER_LEN)
    }

    pub fn set_payload_len(&mut self, payload_len: usize) {
        let total = (UDP_HEADER_LEN + payload_len).min(usize::from(u16::MAX));
        #[allow(clippy::cast_possible_truncation)]
        {
            self.length = total as u16;
        }
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u16(self.source_port);
        out.put_u16(self.destination_port);
        out.put_u16(self.length);
        out.put_u16(self.checksum);
    }

    /// Serialize the header exactly as stored
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(UDP_HEADER_LEN);
        self.write_to(&mut out);
        out.freeze()
    }

    /// Serialize header plus payload with a fresh length and checksum.
    ///
    /// A computed checksum of zero is transmitted as 0xFFFF (RFC 768).
    pub fn encode(&mut self, src: IpAddr, dst: IpAddr, payload: &[u8]) -> BytesMut {
        self.set_payload_len(payload.len());
        self.checksum = 0;
        let mut out = BytesMut::with_capacity(UDP_HEADER_LEN + payload.len());
        self.write_to(&mut out);
        let checksum = transport_checksum(src, dst, IPPROTO_UDP, &out, payload);
        self.checksum = if checksum == 0 { 0xFFFF } else { checksum };
        out[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        out.put_slice(payload);
        out
    }
}
