//! 6LoWPAN: IPv6 over Low-Power Wireless Personal Area Networks
//!
//! # References
//!
//! - [RFC 4944: Transmission of IPv6 Packets over IEEE 802.15.4 Networks][0]
//!
//! [0]: https://tools.ietf.org/html/rfc4944
//!
//! - [RFC 6282: Compression Format for IPv6 Datagrams over IEEE 802.15.4-Based Networks][1]
//!
//! [1]: https://tools.ietf.org/html/rfc6282

use core::fmt;

use log::{trace, warn};

use crate::{ipv6, tcp};

pub mod context;
pub mod iphc;
pub mod nhc;

/// Dispatch value that precedes an HC01 compressed header in a link-layer frame
pub const DISPATCH_HC01: u8 = 0x03;

/// Size of the scratch buffer used to build outgoing frames
const FRAME_BUFFER_SIZE: usize = 256;

/// Error returned when a compressed packet can't be decoded
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The packet ends before the fields its encoding announces
    ShortPacket,
    /// The packet refers to an address context that's not in the table
    ContextNotFound,
    /// Unknown dispatch value or next header encoding
    UnsupportedCompression,
    /// The in-line 'Version' field is not 6
    BadVersion,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecodeError::ShortPacket => "packet is truncated",
            DecodeError::ContextNotFound => "unknown address context",
            DecodeError::UnsupportedCompression => "unsupported compression",
            DecodeError::BadVersion => "IP version is not 6",
        })
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

/// Error returned when a packet can't be encoded
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncodeError {
    /// The output buffer is too small to hold the packet
    BufferTooSmall,
    /// The input is not a well-formed IPv6 packet
    Malformed,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EncodeError::BufferTooSmall => "buffer too small",
            EncodeError::Malformed => "malformed IPv6 packet",
        })
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncodeError {}

/// Read cursor over a compressed packet
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    /// Number of bytes consumed so far
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn peek(&self) -> Result<u8, DecodeError> {
        self.bytes
            .get(self.pos)
            .cloned()
            .ok_or(DecodeError::ShortPacket)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let bytes = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(DecodeError::ShortPacket)?;
        self.pos += n;
        Ok(bytes)
    }
}

/// Write cursor over an output buffer
pub(crate) struct Writer<'a> {
    buffer: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buffer: &'a mut [u8]) -> Self {
        Writer { buffer, pos: 0 }
    }

    /// Number of bytes written so far
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn u8(&mut self, byte: u8) -> Result<(), EncodeError> {
        self.put(&[byte])
    }

    pub(crate) fn put(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        self.buffer
            .get_mut(self.pos..self.pos + bytes.len())
            .ok_or(EncodeError::BufferTooSmall)?
            .copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Reserves `n` bytes to be filled in later
    pub(crate) fn reserve(&mut self, n: usize) -> Result<&mut [u8], EncodeError> {
        let start = self.pos;
        let bytes = self
            .buffer
            .get_mut(start..start + n)
            .ok_or(EncodeError::BufferTooSmall)?;
        self.pos += n;
        Ok(bytes)
    }
}

/// Provides the link-layer addresses of the frame that will carry, or carried, a packet
pub trait LinkAddressSource {
    /// Link-layer addresses for a packet with the given header
    fn link_addresses(&self, header: &ipv6::Repr) -> iphc::Context;
}

/// Link-layer transmitter
pub trait FrameSink {
    /// Sends a frame payload (dispatch byte + compressed packet)
    fn send_frame(&self, frame: &[u8]);
}

/// Glue between the IP layer and a 6LoWPAN link
///
/// Outgoing packets are compressed with HC01 and handed to the `FrameSink` prefixed with the
/// dispatch byte. Incoming frames are checked for the dispatch byte and decompressed.
pub struct Interface<L, F>
where
    L: LinkAddressSource,
    F: FrameSink,
{
    codec: iphc::Codec,
    links: L,
    frames: F,
}

impl<L, F> Interface<L, F>
where
    L: LinkAddressSource,
    F: FrameSink,
{
    /// Creates a new interface
    pub fn new(codec: iphc::Codec, links: L, frames: F) -> Self {
        Interface {
            codec,
            links,
            frames,
        }
    }

    /// Returns the codec used by this interface
    pub fn codec(&self) -> &iphc::Codec {
        &self.codec
    }

    /// Compresses and sends a UDP datagram
    pub fn send_udp(
        &self,
        header: &ipv6::Repr,
        source: u16,
        destination: u16,
        payload: &[u8],
    ) -> Result<(), EncodeError> {
        self.send(
            header,
            iphc::Transport::Udp {
                source,
                destination,
                payload,
            },
        )
    }

    /// Decodes an incoming frame payload
    ///
    /// `ctxt` holds the link-layer addresses of the frame
    pub fn receive<'a>(
        &self,
        frame: &'a [u8],
        ctxt: &iphc::Context,
    ) -> Result<iphc::Packet<&'a [u8]>, DecodeError> {
        match frame.split_first() {
            Some((&DISPATCH_HC01, rest)) => self.codec.decode(rest, ctxt),
            Some((dispatch, _)) => {
                trace!("unsupported dispatch: {:#04x}", dispatch);
                Err(DecodeError::UnsupportedCompression)
            }
            None => Err(DecodeError::ShortPacket),
        }
    }

    fn send(&self, header: &ipv6::Repr, transport: iphc::Transport<'_>) -> Result<(), EncodeError> {
        let ctxt = self.links.link_addresses(header);

        let mut buffer = [0; FRAME_BUFFER_SIZE];
        buffer[0] = DISPATCH_HC01;
        let len = self.codec.encode(header, transport, &ctxt, &mut buffer[1..])?;

        trace!("tx: {} bytes to {}", len + 1, header.destination);
        self.frames.send_frame(&buffer[..len + 1]);

        Ok(())
    }
}

impl<L, F> tcp::PacketSink for Interface<L, F>
where
    L: LinkAddressSource,
    F: FrameSink,
{
    fn send_packet(&self, header: &ipv6::Repr, segment: &[u8]) {
        if let Err(e) = self.send(header, iphc::Transport::Other(segment)) {
            warn!("dropped packet to {}: {}", header.destination, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;
    use std::vec::Vec;

    use crate::{ieee802154::ExtendedAddr, ipv6, tcp::PacketSink};

    use super::{
        context::ContextTable, iphc, DecodeError, FrameSink, Interface, LinkAddressSource,
        DISPATCH_HC01,
    };

    const SRC: ExtendedAddr = ExtendedAddr(0x20_18_05_21_23_59_59_01);
    const DEST: ExtendedAddr = ExtendedAddr(0x20_18_05_21_23_59_59_02);

    struct Links;

    impl LinkAddressSource for Links {
        fn link_addresses(&self, _: &ipv6::Repr) -> iphc::Context {
            iphc::Context {
                source: SRC,
                destination: DEST,
            }
        }
    }

    #[derive(Default)]
    struct Frames(RefCell<Vec<Vec<u8>>>);

    impl<'a> FrameSink for &'a Frames {
        fn send_frame(&self, frame: &[u8]) {
            self.0.borrow_mut().push(frame.to_vec());
        }
    }

    fn header(next_header: ipv6::NextHeader) -> ipv6::Repr {
        ipv6::Repr {
            traffic_class: 0,
            flow_label: 0,
            next_header,
            hop_limit: 64,
            source: ipv6::Addr::link_local(SRC.eui_64()),
            destination: ipv6::Addr::link_local(DEST.eui_64()),
        }
    }

    #[test]
    fn udp() {
        let frames = Frames::default();
        let iface = Interface::new(iphc::Codec::new(ContextTable::default()), Links, &frames);

        let header = header(ipv6::NextHeader::Udp);
        iface.send_udp(&header, 0xf0b0, 0xf0bf, b"hello").unwrap();

        let frames = frames.0.borrow();
        assert_eq!(frames.len(), 1);

        let frame = &frames[0];
        assert_eq!(frame[0], DISPATCH_HC01);

        let packet = iface.receive(frame, &Links.link_addresses(&header)).unwrap();
        assert_eq!(*packet.header(), header);
        assert_eq!(packet.udp().map(|udp| (udp.source, udp.destination)), Some((0xf0b0, 0xf0bf)));
        assert!(packet.verify_udp_checksum());
        assert_eq!(packet.payload(), b"hello");
    }

    #[test]
    fn segment() {
        let frames = Frames::default();
        let iface = Interface::new(iphc::Codec::new(ContextTable::default()), Links, &frames);

        let header = header(ipv6::NextHeader::Tcp);
        iface.send_packet(&header, &[0xaa; 20]);

        let frames = frames.0.borrow();
        let packet = iface.receive(&frames[0], &Links.link_addresses(&header)).unwrap();
        assert_eq!(*packet.header(), header);
        assert!(packet.udp().is_none());
        assert_eq!(packet.payload(), &[0xaa; 20][..]);
    }

    #[test]
    fn bad_dispatch() {
        let frames = Frames::default();
        let iface = Interface::new(iphc::Codec::new(ContextTable::default()), Links, &frames);
        let ctxt = Links.link_addresses(&header(ipv6::NextHeader::Udp));

        assert_eq!(
            iface.receive(&[0x41, 0x60, 0, 0, 0], &ctxt).err(),
            Some(DecodeError::UnsupportedCompression)
        );
        assert_eq!(iface.receive(&[], &ctxt).err(), Some(DecodeError::ShortPacket));
    }

    #[test]
    fn oversized() {
        let frames = Frames::default();
        let iface = Interface::new(iphc::Codec::new(ContextTable::default()), Links, &frames);

        // doesn't fit in the frame buffer; dropped
        iface.send_packet(&header(ipv6::NextHeader::Tcp), &[0; 300]);

        assert!(frames.0.borrow().is_empty());
    }
}
