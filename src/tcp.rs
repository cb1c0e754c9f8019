//! TCP: Transmission Control Protocol
//!
//! A small TCP for slow, lossy links. Every write is sent as a single segment; unacknowledged
//! bytes live in a 128-byte ring; a fixed-interval timer retransmits the oldest unacknowledged
//! bytes. Out-of-order segments are not buffered: they are dropped and answered with a duplicate
//! ACK.
//!
//! - [`Tcb`] is the connection state machine. It's `no_std` and doesn't block: it's driven by
//!   inbound segments (`receive`), application calls (`send`, `close`) and a periodic `tick`.
//! - [`Connection`] (`std` only) wraps a `Tcb` in a mutex and blocks writers until the ring has
//!   room.
//! - [`ConnectionTable`] (`std` only) routes inbound segments to their connection.
//!
//! # References
//!
//! - [RFC 793 Transmission Control Protocol][0]
//!
//! [0]: https://tools.ietf.org/html/rfc793

use core::{
    fmt,
    ops::{BitOr, BitOrAssign, Range, Sub},
    time::Duration,
};

use byteorder::{ByteOrder, NetworkEndian as NE};
use cast::usize;

use crate::ipv6;

pub mod ring;
mod tcb;

#[cfg(feature = "std")]
mod connection;
#[cfg(feature = "std")]
mod table;

#[cfg(feature = "std")]
pub use self::{
    connection::{Clock, Connection, Listener, SystemClock},
    table::ConnectionTable,
};
pub use self::tcb::{Outcome, State, Tcb};

/* Segment structure */
const SOURCE: Range<usize> = 0..2;
const DESTINATION: Range<usize> = 2..4;
const SEQ_NUMBER: Range<usize> = 4..8;
const ACK_NUMBER: Range<usize> = 8..12;

const DATA_OFFSET: usize = 12;
mod doff {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = 4;
    pub const SIZE: usize = 4;
}

const FLAGS: usize = 13;
const WINDOW: Range<usize> = 14..16;
const CHECKSUM: Range<usize> = 16..18;
const URGENT: Range<usize> = 18..20;

/// Size of a header without options
pub const HEADER_SIZE: u8 = URGENT.end as u8;

/// Control flags
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Flags(pub u8);

impl Flags {
    /// No more data from sender
    pub const FIN: Self = Flags(1 << 0);
    /// Synchronize sequence numbers
    pub const SYN: Self = Flags(1 << 1);
    /// Reset the connection
    pub const RST: Self = Flags(1 << 2);
    /// Push function
    pub const PSH: Self = Flags(1 << 3);
    /// Acknowledgment field significant
    pub const ACK: Self = Flags(1 << 4);
    /// Urgent pointer field significant
    pub const URG: Self = Flags(1 << 5);

    /// No flags
    pub fn empty() -> Self {
        Flags(0)
    }

    /// Returns `true` if all the flags in `other` are set
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 6] = [
            (Flags::SYN, "SYN"),
            (Flags::ACK, "ACK"),
            (Flags::FIN, "FIN"),
            (Flags::RST, "RST"),
            (Flags::PSH, "PSH"),
            (Flags::URG, "URG"),
        ];

        let mut is_first = true;
        for (flag, name) in NAMES.iter() {
            if self.contains(*flag) {
                if is_first {
                    is_first = false;
                } else {
                    f.write_str("|")?;
                }

                f.write_str(name)?;
            }
        }

        if is_first {
            f.write_str("-")?;
        }

        Ok(())
    }
}

/// The fields of a TCP header
///
/// Options are skipped when parsing and never emitted. The urgent pointer is always zero.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Repr {
    /// Source port
    pub source_port: u16,
    /// Destination port
    pub destination_port: u16,
    /// Sequence number
    pub seq_number: u32,
    /// Acknowledgment number
    pub ack_number: u32,
    /// Control flags
    pub flags: Flags,
    /// Window
    pub window: u16,
}

impl Repr {
    /// Parses a TCP segment
    ///
    /// Returns the header and the payload. The checksum is not verified; see `verify_checksum`
    pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ()> {
        if bytes.len() < usize(HEADER_SIZE) {
            return Err(());
        }

        let header_len = usize(get!(bytes[DATA_OFFSET], doff)) * 4;
        if header_len < usize(HEADER_SIZE) || header_len > bytes.len() {
            return Err(());
        }

        let repr = Repr {
            source_port: NE::read_u16(&bytes[SOURCE]),
            destination_port: NE::read_u16(&bytes[DESTINATION]),
            seq_number: NE::read_u32(&bytes[SEQ_NUMBER]),
            ack_number: NE::read_u32(&bytes[ACK_NUMBER]),
            flags: Flags(bytes[FLAGS] & 0x3f),
            window: NE::read_u16(&bytes[WINDOW]),
        };

        Ok((repr, &bytes[header_len..]))
    }

    /// Writes the header, with a zeroed checksum, into the first `HEADER_SIZE` bytes of `buffer`
    ///
    /// # Panics
    ///
    /// This function panics if `buffer` is smaller than `HEADER_SIZE`
    pub fn emit(&self, buffer: &mut [u8]) {
        assert!(buffer.len() >= usize(HEADER_SIZE));

        NE::write_u16(&mut buffer[SOURCE], self.source_port);
        NE::write_u16(&mut buffer[DESTINATION], self.destination_port);
        NE::write_u32(&mut buffer[SEQ_NUMBER], self.seq_number);
        NE::write_u32(&mut buffer[ACK_NUMBER], self.ack_number);
        buffer[DATA_OFFSET] = 0;
        set!(buffer[DATA_OFFSET], doff, HEADER_SIZE / 4);
        buffer[FLAGS] = self.flags.0;
        NE::write_u16(&mut buffer[WINDOW], self.window);
        NE::write_u16(&mut buffer[CHECKSUM], 0);
        NE::write_u16(&mut buffer[URGENT], 0);
    }

    /// Number of sequence numbers a segment with this header and `payload_len` bytes of data
    /// occupies
    pub fn segment_len(&self, payload_len: usize) -> u32 {
        let mut len = payload_len as u32;
        if self.flags.contains(Flags::SYN) {
            len += 1;
        }
        if self.flags.contains(Flags::FIN) {
            len += 1;
        }
        len
    }
}

impl fmt::Debug for Repr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("tcp::Repr")
            .field("source_port", &self.source_port)
            .field("destination_port", &self.destination_port)
            .field("seq_number", &self.seq_number)
            .field("ack_number", &self.ack_number)
            .field("flags", &self.flags)
            .field("window", &self.window)
            .finish()
    }
}

/// Computes and writes the checksum of a complete segment (header + payload)
///
/// # Panics
///
/// This function panics if `segment` is smaller than `HEADER_SIZE`
pub fn fill_checksum(segment: &mut [u8], src: &ipv6::Addr, dest: &ipv6::Addr) {
    NE::write_u16(&mut segment[CHECKSUM], 0);
    let cksum = ipv6::checksum(src, dest, ipv6::NextHeader::Tcp, &[&segment[..]]);
    NE::write_u16(&mut segment[CHECKSUM], cksum);
}

/// Verifies the checksum of a complete segment (header + payload)
pub fn verify_checksum(segment: &[u8], src: &ipv6::Addr, dest: &ipv6::Addr) -> bool {
    segment.len() >= usize(HEADER_SIZE)
        && ipv6::checksum(src, dest, ipv6::NextHeader::Tcp, &[segment]) == 0
}

/// A point in time, in milliseconds since an arbitrary epoch
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Instant {
    millis: u64,
}

impl Instant {
    /// Creates an instant `millis` milliseconds after the epoch
    pub fn from_millis(millis: u64) -> Self {
        Instant { millis }
    }

    /// Milliseconds since the epoch
    pub fn total_millis(&self) -> u64 {
        self.millis
    }
}

/// Saturates at zero
impl Sub for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        Duration::from_millis(self.millis.saturating_sub(rhs.millis))
    }
}

/// Connection parameters
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    /// Time without progress after which unacknowledged data is sent again. There's no backoff
    pub retransmission_interval: Duration,
    /// How long a connection lingers in TIME-WAIT
    pub time_wait: Duration,
    /// Maximum payload of a retransmitted segment
    pub max_segment_size: usize,
    /// Advertised receive window
    pub window: u16,
    /// Hop limit of outgoing packets
    pub hop_limit: u8,
    /// Initial send sequence number
    pub initial_sequence: u32,
    /// How long `Connection::send` may block waiting for buffer space. `None` waits forever
    pub send_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            retransmission_interval: Duration::from_millis(1_000),
            time_wait: Duration::from_millis(1_000),
            max_segment_size: 40,
            window: ring::CAPACITY as u16,
            hop_limit: 64,
            initial_sequence: 0,
            send_timeout: None,
        }
    }
}

/// Destination of outgoing segments
pub trait PacketSink {
    /// Sends a TCP `segment` (header + payload, checksum filled in) inside an IPv6 packet with the
    /// given `header`
    fn send_packet(&self, header: &ipv6::Repr, segment: &[u8]);
}

impl<'a, S> PacketSink for &'a S
where
    S: PacketSink + ?Sized,
{
    fn send_packet(&self, header: &ipv6::Repr, segment: &[u8]) {
        (**self).send_packet(header, segment)
    }
}

/// Connection errors
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The connection is closed or closing; no more data can be sent
    ConnectionClosed,
    /// The send buffer has no room for the data, or the connection is not established yet
    BufferFull,
    /// An acknowledgment for data that was never sent was received and ignored
    UnexpectedAck,
    /// Gave up waiting for buffer space
    TimedOut,
    /// The operation is not valid in the current state
    InvalidState,
    /// The connection has no local address to send from
    Unaddressable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::ConnectionClosed => "connection closed",
            Error::BufferFull => "send buffer full",
            Error::UnexpectedAck => "unexpected acknowledgment",
            Error::TimedOut => "timed out",
            Error::InvalidState => "invalid state",
            Error::Unaddressable => "no local address",
        })
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// `a <= b` in sequence space
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}
