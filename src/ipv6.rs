//! IPv6: Internet Protocol v6
//!
//! # References
//!
//! - [RFC 2460 Internet Protocol, Version 6 (IPv6) Specification][0]
//!
//! [0]: https://tools.ietf.org/html/rfc2460
//!
//! - [RFC 4291 IP Version 6 Addressing Architecture][rfc]
//!
//! [rfc]: https://tools.ietf.org/html/rfc4291

use core::{
    fmt,
    ops::{Range, RangeTo},
};

use byteorder::{ByteOrder, NetworkEndian as NE};
use cast::{u32, usize};

use crate::fmt::Quoted;

/* Packet structure */
const V: usize = 0;
mod v {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = 4;
    pub const SIZE: usize = 4;
}

const TC: RangeTo<usize> = ..2;
mod tc {
    pub const MASK: u16 = (1 << SIZE) - 1;
    pub const OFFSET: usize = 4;
    pub const SIZE: usize = 8;
}

const FLH: usize = 1;
const FLL: Range<usize> = 2..4;

const LENGTH: Range<usize> = 4..6;
const NEXT_HEADER: usize = 6;
const HOP_LIMIT: usize = 7;
const SOURCE: Range<usize> = 8..24;
const DESTINATION: Range<usize> = 24..40;

/// Fixed header size, in bytes
pub const HEADER_SIZE: u8 = DESTINATION.end as u8;

/// The 'Flow label' field is 20 bits wide
pub const FLOW_LABEL_MASK: u32 = (1 << 20) - 1;

full_range!(
    u8,
    /// Next header
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum NextHeader {
        /// TCP
        Tcp = 0x06,
        /// UDP
        Udp = 0x11,
        /// ICMPv6
        Ipv6Icmp = 0x3a,
    }
);

/// The fields of an IPv6 header
///
/// The 'Version' field is always 6 and the 'Payload length' field is derived from the payload
/// whenever the header is serialized, so neither is stored here.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Repr {
    /// Traffic class
    pub traffic_class: u8,
    /// Flow label (20 bits)
    pub flow_label: u32,
    /// Next header
    pub next_header: NextHeader,
    /// Hop limit
    pub hop_limit: u8,
    /// Source address
    pub source: Addr,
    /// Destination address
    pub destination: Addr,
}

impl Repr {
    /// Parses an uncompressed IPv6 packet
    ///
    /// Returns the header and the payload; the payload is trimmed to the 'Payload length' field
    pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ()> {
        if bytes.len() < usize(HEADER_SIZE) {
            // smaller than header
            return Err(());
        }

        if get!(bytes[V], v) != 6 {
            // version is not `6`
            return Err(());
        }

        let len = usize(NE::read_u16(&bytes[LENGTH]));
        let payload = &bytes[usize(HEADER_SIZE)..];
        if payload.len() < len {
            return Err(());
        }

        let mut source = Addr::UNSPECIFIED;
        source.0.copy_from_slice(&bytes[SOURCE]);

        let mut destination = Addr::UNSPECIFIED;
        destination.0.copy_from_slice(&bytes[DESTINATION]);

        let fl_mask = (1 << 4) - 1;
        let repr = Repr {
            traffic_class: get!(NE::read_u16(&bytes[TC]), tc) as u8,
            flow_label: (u32(bytes[FLH]) & fl_mask) << 16 | u32(NE::read_u16(&bytes[FLL])),
            next_header: bytes[NEXT_HEADER].into(),
            hop_limit: bytes[HOP_LIMIT],
            source,
            destination,
        };

        Ok((repr, &payload[..len]))
    }

    /// Writes this header into the first `HEADER_SIZE` bytes of `buffer`
    ///
    /// # Panics
    ///
    /// This function panics if `buffer` is smaller than `HEADER_SIZE`
    pub fn emit(&self, buffer: &mut [u8], payload_len: u16) {
        assert!(buffer.len() >= usize(HEADER_SIZE));

        let header = &mut buffer[..usize(HEADER_SIZE)];

        let fl = self.flow_label & FLOW_LABEL_MASK;
        header[0] = 0;
        set!(header[V], v, 6);
        header[0] |= self.traffic_class >> 4;
        header[FLH] = (self.traffic_class << 4) | (fl >> 16) as u8;
        NE::write_u16(&mut header[FLL], fl as u16);

        NE::write_u16(&mut header[LENGTH], payload_len);
        header[NEXT_HEADER] = self.next_header.into();
        header[HOP_LIMIT] = self.hop_limit;
        header[SOURCE].copy_from_slice(&self.source.0);
        header[DESTINATION].copy_from_slice(&self.destination.0);
    }
}

/// IPv6 address
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Addr(pub [u8; 16]);

impl Addr {
    // Section 2.5.2
    /// Unspecified address
    pub const UNSPECIFIED: Self = Addr([0; 16]);

    /// All link-local nodes multicast address
    pub const ALL_NODES: Self = Addr([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    /// All link-local routers multicast address
    pub const ALL_ROUTERS: Self = Addr([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);

    /// Builds an address from a 64-bit prefix and a 64-bit interface identifier
    pub fn new(prefix: [u8; 8], iid: [u8; 8]) -> Self {
        let mut bytes = [0; 16];
        bytes[..8].copy_from_slice(&prefix);
        bytes[8..].copy_from_slice(&iid);
        Addr(bytes)
    }

    /// Builds a link-local (fe80::/64) address from an interface identifier
    pub fn link_local(iid: [u8; 8]) -> Self {
        Addr::new([0xfe, 0x80, 0, 0, 0, 0, 0, 0], iid)
    }

    /// The upper 64 bits of the address
    pub fn prefix(&self) -> [u8; 8] {
        let mut prefix = [0; 8];
        prefix.copy_from_slice(&self.0[..8]);
        prefix
    }

    /// The interface identifier: the lower 64 bits of the address
    pub fn iid(&self) -> [u8; 8] {
        let mut iid = [0; 8];
        iid.copy_from_slice(&self.0[8..]);
        iid
    }

    // Section 2.5.6
    /// Is this a link local address?
    pub fn is_link_local(&self) -> bool {
        self.0[..8] == [0xfe, 0x80, 0, 0, 0, 0, 0, 0]
    }

    // Section 2.7
    /// Is this a multicast address?
    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    /// Is this the unspecified address?
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut is_first = true;

        for chunk in self.0.chunks(2) {
            if is_first {
                is_first = false;
            } else {
                f.write_str(":")?;
            }

            write!(f, "{:x}", NE::read_u16(chunk))?;
        }

        Ok(())
    }
}

/// Formats a header the way `tcpdump` would print it
pub(crate) struct Summary<'a>(pub &'a Repr);

impl<'a> fmt::Debug for Summary<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ipv6::Repr")
            .field("next_header", &self.0.next_header)
            .field("hop_limit", &self.0.hop_limit)
            .field("source", &Quoted(self.0.source))
            .field("destination", &Quoted(self.0.destination))
            .finish()
    }
}

/// Computes the upper-layer checksum of `data` (RFC 2460 Section 8.1)
///
/// `data` holds the transport header, with the checksum field zeroed, followed by the payload.
/// The slices are summed in order; only the last one may have an odd length.
pub(crate) fn checksum(
    src: &Addr,
    dest: &Addr,
    next_header: NextHeader,
    data: &[&[u8]],
) -> u16 {
    let mut sum: u32 = 0;

    /* Pseudo-header */
    for chunk in src.0.chunks_exact(2).chain(dest.0.chunks_exact(2)) {
        sum += u32(NE::read_u16(chunk));
    }

    let len = data.iter().map(|part| part.len()).sum::<usize>() as u32;
    sum += len >> 16;
    sum += len & 0xffff;

    sum += u32(u8::from(next_header));

    /* Upper-layer packet */
    for part in data {
        for chunk in part.chunks(2) {
            if chunk.len() == 2 {
                sum += u32(NE::read_u16(chunk));
            } else {
                sum += u32(chunk[0]) << 8;
            }
        }
    }

    // fold carry-over
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
