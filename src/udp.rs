//! UDP: User Datagram Protocol

use core::ops::{Range, RangeFrom};

use byteorder::{ByteOrder, NetworkEndian as NE};
use cast::{u16, usize};

use crate::ipv6;

/* Packet structure */
const SOURCE: Range<usize> = 0..2;
const DESTINATION: Range<usize> = 2..4;
const LENGTH: Range<usize> = 4..6;
const CHECKSUM: Range<usize> = 6..8;
const PAYLOAD: RangeFrom<usize> = 8..;

/// Size of the UDP header
pub const HEADER_SIZE: u16 = PAYLOAD.start as u16;

/// The ports of a UDP datagram
///
/// The 'Length' and 'Checksum' fields are always derived from the payload and the enclosing IPv6
/// header
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Repr {
    /// Source port
    pub source: u16,
    /// Destination port
    pub destination: u16,
}

impl Repr {
    /// Parses an uncompressed UDP datagram
    ///
    /// Returns the ports, the 'Checksum' field and the payload, trimmed to the 'Length' field
    pub fn parse(bytes: &[u8]) -> Result<(Self, u16, &[u8]), ()> {
        if bytes.len() < usize(HEADER_SIZE) {
            return Err(());
        }

        let len = NE::read_u16(&bytes[LENGTH]);
        if len < HEADER_SIZE || usize(len) > bytes.len() {
            return Err(());
        }

        let repr = Repr {
            source: NE::read_u16(&bytes[SOURCE]),
            destination: NE::read_u16(&bytes[DESTINATION]),
        };

        Ok((
            repr,
            NE::read_u16(&bytes[CHECKSUM]),
            &bytes[usize(HEADER_SIZE)..usize(len)],
        ))
    }

    /// Computes the checksum of a datagram that carries `payload` between `src` and `dest`
    pub fn checksum(&self, src: &ipv6::Addr, dest: &ipv6::Addr, payload: &[u8]) -> u16 {
        let mut header = [0; HEADER_SIZE as usize];
        self.emit_(&mut header, payload.len(), 0);

        match ipv6::checksum(src, dest, ipv6::NextHeader::Udp, &[&header[..], payload]) {
            // an all-zeros checksum means "no checksum"; its one's complement is sent instead
            0 => 0xffff,
            cksum => cksum,
        }
    }

    /// Writes the header into the first `HEADER_SIZE` bytes of `buffer`
    ///
    /// # Panics
    ///
    /// This function panics if `buffer` is smaller than `HEADER_SIZE`
    pub fn emit(&self, buffer: &mut [u8], payload_len: usize, checksum: u16) {
        assert!(buffer.len() >= usize(HEADER_SIZE));

        self.emit_(&mut buffer[..usize(HEADER_SIZE)], payload_len, checksum)
    }

    fn emit_(&self, header: &mut [u8], payload_len: usize, checksum: u16) {
        let len = u16(payload_len + usize(HEADER_SIZE)).unwrap_or(u16::max_value());

        NE::write_u16(&mut header[SOURCE], self.source);
        NE::write_u16(&mut header[DESTINATION], self.destination);
        NE::write_u16(&mut header[LENGTH], len);
        NE::write_u16(&mut header[CHECKSUM], checksum);
    }
}
