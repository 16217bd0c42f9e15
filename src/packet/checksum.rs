//! Internet checksum (RFC 1071)
//!
//! One's-complement sum of 16-bit big-endian words with end-around carry,
//! complemented at the end. An odd trailing byte is padded with zero.

use std::net::IpAddr;

/// Incremental internet checksum accumulator.
///
/// Odd-length chunks are handled across calls: a dangling byte from one
/// `add_bytes` is paired with the first byte of the next.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum {
    sum: u32,
    pending: Option<u8>,
}

impl Checksum {
    /// Create an empty accumulator
    pub const fn new() -> Self {
        Self {
            sum: 0,
            pending: None,
        }
    }

    /// Add a big-endian 16-bit word
    pub fn add_u16(&mut self, word: u16) -> &mut Self {
        self.add_bytes(&word.to_be_bytes())
    }

    /// Add a 32-bit value as two words
    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.add_bytes(&value.to_be_bytes())
    }

    /// Add an arbitrary byte slice
    pub fn add_bytes(&mut self, mut data: &[u8]) -> &mut Self {
        if let Some(high) = self.pending.take() {
            match data.split_first() {
                Some((&low, rest)) => {
                    self.sum += u32::from(u16::from_be_bytes([high, low]));
                    data = rest;
                }
                None => {
                    self.pending = Some(high);
                    return self;
                }
            }
        }

        let mut chunks = data.chunks_exact(2);
        for pair in &mut chunks {
            self.sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
            // Fold early so very large inputs never overflow the accumulator
            if self.sum > 0xFFFF_0000 {
                self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
            }
        }
        if let [last] = chunks.remainder() {
            self.pending = Some(*last);
        }
        self
    }

    /// Add an IP address (4 or 16 bytes)
    pub fn add_addr(&mut self, addr: IpAddr) -> &mut Self {
        match addr {
            IpAddr::V4(v4) => self.add_bytes(&v4.octets()),
            IpAddr::V6(v6) => self.add_bytes(&v6.octets()),
        }
    }

    /// Fold carries and return the complemented checksum
    pub fn finish(&self) -> u16 {
        let mut sum = self.sum;
        if let Some(high) = self.pending {
            sum += u32::from(u16::from_be_bytes([high, 0]));
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        #[allow(clippy::cast_possible_truncation)]
        let folded = sum as u16;
        !folded
    }
}

/// Checksum of a single contiguous buffer
pub fn internet_checksum(data: &[u8]) -> u16 {
    Checksum::new().add_bytes(data).finish()
}

/// Start a transport checksum seeded with the pseudo-header.
///
/// IPv4 uses src, dst, zero, protocol, 16-bit length. IPv6 uses src, dst,
/// 32-bit length, three zero bytes, next header. Both reduce to the same
/// one's-complement sum, so they share one code path.
pub fn pseudo_header(src: IpAddr, dst: IpAddr, protocol: u8, length: usize) -> Checksum {
    let mut sum = Checksum::new();
    sum.add_addr(src).add_addr(dst);
    #[allow(clippy::cast_possible_truncation)]
    match (src, dst) {
        (IpAddr::V4(_), IpAddr::V4(_)) => {
            sum.add_u16(u16::from(protocol)).add_u16(length as u16);
        }
        _ => {
            sum.add_u32(length as u32).add_u32(u32::from(protocol));
        }
    }
    sum
}

/// Compute a TCP/UDP checksum over pseudo-header, header and payload.
///
/// `header` must carry a zeroed checksum field.
pub fn transport_checksum(
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    header: &[u8],
    payload: &[u8],
) -> u16 {
    pseudo_header(src, dst, protocol, header.len() + payload.len())
        .add_bytes(header)
        .add_bytes(payload)
        .finish()
}
