//! HC01 next header compression (UDP only)
//!
//! ``` text
//! +----------+----------------------+----------+
//! | 11111 0PP| ports (1 or 4 bytes) | checksum |
//! +----------+----------------------+----------+
//! ```
//!
//! `PP = 11`: both ports in `0xF0B0..=0xF0BF`, packed as two nibbles. `PP = 00`: ports in-line.
//! The checksum is always in-line.

use core::fmt;

use byteorder::{ByteOrder, NetworkEndian as NE};

use crate::{fmt::Hex, ipv6, udp};

use super::{DecodeError, EncodeError, Reader, Writer};

/* Header format */
mod id {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = super::p::OFFSET + super::p::SIZE;
    pub const SIZE: usize = 6;
    pub const VALUE: u8 = 0b111110;
}

mod p {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = 0;
    pub const SIZE: usize = 2;
}

/// NHC byte of a UDP header with both ports in-line
pub const UDP_INLINE: u8 = 0xf8;

/// NHC byte of a UDP header with both ports compressed
pub const UDP_COMPRESSED: u8 = 0xfb;

/// Smallest compressible port
pub const PORT_MIN: u16 = 0xf0b0;

/// Largest compressible port
pub const PORT_MAX: u16 = 0xf0bf;

/// Returns `true` if `port` can be sent as a nibble
pub fn is_port_compressible(port: u16) -> bool {
    port >= PORT_MIN && port <= PORT_MAX
}

/// A compressed UDP header
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct UdpHeader {
    /// Source port
    pub source: u16,
    /// Destination port
    pub destination: u16,
    /// Checksum
    pub checksum: u16,
}

impl UdpHeader {
    /// Builds the header of a datagram that carries `payload`, computing its checksum
    pub fn new(ip: &ipv6::Repr, source: u16, destination: u16, payload: &[u8]) -> Self {
        let repr = udp::Repr {
            source,
            destination,
        };

        UdpHeader {
            source,
            destination,
            checksum: repr.checksum(&ip.source, &ip.destination, payload),
        }
    }

    /// Parses a compressed UDP header
    ///
    /// Returns the header and the number of bytes it occupies
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut reader = Reader::new(bytes);
        let header = Self::read(&mut reader)?;
        Ok((header, reader.position()))
    }

    /// Writes this header into `buffer`
    ///
    /// Returns the number of bytes written
    pub fn emit(&self, buffer: &mut [u8]) -> Result<usize, EncodeError> {
        let mut writer = Writer::new(buffer);
        self.write(&mut writer)?;
        Ok(writer.position())
    }

    /// Returns `true` if both ports fit in the compressed form
    pub fn ports_compressible(&self) -> bool {
        is_port_compressible(self.source) && is_port_compressible(self.destination)
    }

    /// Size of the compressed header
    pub fn size(&self) -> usize {
        // NHC + ports + checksum
        1 + if self.ports_compressible() { 1 } else { 4 } + 2
    }

    /// Checks the 'Checksum' field against the payload and the enclosing IPv6 header
    pub fn verify_checksum(&self, ip: &ipv6::Repr, payload: &[u8]) -> bool {
        UdpHeader::new(ip, self.source, self.destination, payload).checksum == self.checksum
    }

    /// Expands this header into the uncompressed 8-byte form
    pub fn decompress(&self, buffer: &mut [u8], payload_len: usize) {
        let repr = udp::Repr {
            source: self.source,
            destination: self.destination,
        };

        repr.emit(buffer, payload_len, self.checksum)
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let nhc = reader.u8()?;

        if get!(nhc, id) != id::VALUE {
            return Err(DecodeError::UnsupportedCompression);
        }

        let (source, destination) = match get!(nhc, p) {
            0b11 => {
                let ports = reader.u8()?;
                (
                    PORT_MIN + u16::from(ports >> 4),
                    PORT_MIN + u16::from(ports & 0x0f),
                )
            }
            0b00 => {
                let ports = reader.take(4)?;
                (NE::read_u16(&ports[..2]), NE::read_u16(&ports[2..]))
            }
            // only one port compressed: not part of HC01
            _ => return Err(DecodeError::UnsupportedCompression),
        };

        let checksum = NE::read_u16(reader.take(2)?);

        Ok(UdpHeader {
            source,
            destination,
            checksum,
        })
    }

    pub(crate) fn write(&self, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.ports_compressible() {
            writer.u8(UDP_COMPRESSED)?;
            writer.u8(((self.source - PORT_MIN) as u8) << 4 | (self.destination - PORT_MIN) as u8)?;
        } else {
            writer.u8(UDP_INLINE)?;
            NE::write_u16(writer.reserve(2)?, self.source);
            NE::write_u16(writer.reserve(2)?, self.destination);
        }

        NE::write_u16(writer.reserve(2)?, self.checksum);

        Ok(())
    }
}

impl fmt::Debug for UdpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("nhc::UdpHeader")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("checksum", &Hex(self.checksum))
            .finish()
    }
}
