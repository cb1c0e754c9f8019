//! HC01 IPv6 header compression
//!
//! ``` text
//! +------+------+------------------------------------------------+----------+
//! | enc1 | enc2 | in-line IPv6 fields (0 - 40 bytes)             | NHC, ... |
//! +------+------+------------------------------------------------+----------+
//!
//! enc1: TC VF NH HLIM(2) 000
//! enc2: SAM(2) SCI(2) DAM(2) DCI(2)
//! ```
//!
//! The in-line fields follow in this order: version + traffic class + flow label (4 bytes), version
//! + flow label (3 bytes) or traffic class (1 byte); next header; hop limit; source address;
//! destination address. When NH is set a compressed UDP header (see the `nhc` module) follows.

use core::fmt;

use as_slice::AsSlice;
use byteorder::{ByteOrder, NetworkEndian as NE};
use cast::{u16, u32, usize};
use log::trace;

use crate::{
    fmt::Binary,
    ieee802154 as ll,
    ipv6::{self, FLOW_LABEL_MASK},
    udp,
};

use super::{
    context::{ContextTable, Prefix},
    nhc::UdpHeader,
    DecodeError, EncodeError, Reader, Writer,
};

/* Header format */
const ENC1: usize = 0;

mod tc {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = super::vf::OFFSET + super::vf::SIZE;
    pub const SIZE: usize = 1;
}

mod vf {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = super::nh::OFFSET + super::nh::SIZE;
    pub const SIZE: usize = 1;
}

mod nh {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = super::hlim::OFFSET + super::hlim::SIZE;
    pub const SIZE: usize = 1;
}

mod hlim {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = 3;
    pub const SIZE: usize = 2;
}

const ENC2: usize = 1;

mod sam {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = super::sci::OFFSET + super::sci::SIZE;
    pub const SIZE: usize = 2;
}

mod sci {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = super::dam::OFFSET + super::dam::SIZE;
    pub const SIZE: usize = 2;
}

mod dam {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = super::dci::OFFSET + super::dci::SIZE;
    pub const SIZE: usize = 2;
}

mod dci {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: usize = 0;
    pub const SIZE: usize = 2;
}

/* Address modes */
const AM_INLINE: u8 = 0b00;
const AM_64: u8 = 0b01;
const AM_16: u8 = 0b10;
const AM_ELIDED: u8 = 0b11;

/* Hop limit modes */
const HLIM_INLINE: u8 = 0b00;
const HLIM_1: u8 = 0b01;
const HLIM_64: u8 = 0b10;
const HLIM_255: u8 = 0b11;

/// High bits of the first byte of a compressed multicast address
const MCAST_RANGE: u8 = 0xa0;

/// Link-layer addresses of the frame that carries a packet
///
/// Elided interface identifiers are inferred from these
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Context {
    /// Source link-layer address
    pub source: ll::ExtendedAddr,

    /// Destination link-layer address
    pub destination: ll::ExtendedAddr,
}

/// The transport part of a packet to encode
#[derive(Clone, Copy, Debug)]
pub enum Transport<'a> {
    /// UDP datagram; its header gets compressed and its checksum computed
    Udp {
        /// Source port
        source: u16,
        /// Destination port
        destination: u16,
        /// Datagram payload
        payload: &'a [u8],
    },

    /// Any other protocol, copied verbatim after the compressed IPv6 header
    Other(&'a [u8]),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum AddrMode {
    Inline,
    Iid64(u8),
    Iid16(u8),
    Elided(u8),
    Multicast,
}

impl AddrMode {
    // (address mode, context index)
    fn bits(self) -> (u8, u8) {
        match self {
            AddrMode::Inline => (AM_INLINE, 0),
            AddrMode::Iid64(ctx) => (AM_64, ctx),
            AddrMode::Iid16(ctx) => (AM_16, ctx),
            AddrMode::Elided(ctx) => (AM_ELIDED, ctx),
            AddrMode::Multicast => (AM_16, 0),
        }
    }

    fn write(self, addr: &ipv6::Addr, writer: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            AddrMode::Inline => writer.put(&addr.0),
            AddrMode::Iid64(_) => writer.put(&addr.0[8..]),
            AddrMode::Iid16(_) => writer.put(&addr.0[14..]),
            AddrMode::Elided(_) => Ok(()),
            AddrMode::Multicast => {
                // 101 + 4-bit scope + 9-bit group (only the low byte is ever non-zero)
                writer.u8(MCAST_RANGE | (addr.0[1] & 0x0f) << 1)?;
                writer.u8(addr.0[15])
            }
        }
    }
}

/// The interface identifier is 16 bits wide: the upper 49 bits are zero
fn is_16bit_compressible(addr: &ipv6::Addr) -> bool {
    addr.0[8..14].iter().all(|b| *b == 0) && addr.0[14] & 0x80 == 0
}

/// `ffXS::1` or `ffXS::2` where the flags nibble `X` is zero
fn is_multicast_compressible(addr: &ipv6::Addr) -> bool {
    addr.is_multicast()
        && addr.0[1] & 0xf0 == 0
        && addr.0[2..15].iter().all(|b| *b == 0)
        && (addr.0[15] == 1 || addr.0[15] == 2)
}

/// HC01 compressor / decompressor
#[derive(Clone, Debug)]
pub struct Codec {
    contexts: ContextTable,
}

impl Codec {
    /// Creates a codec that shares `contexts` with its peers
    pub fn new(contexts: ContextTable) -> Self {
        Codec { contexts }
    }

    /// Returns the context table
    pub fn contexts(&self) -> &ContextTable {
        &self.contexts
    }

    /// Compresses `header` and appends the transport header and payload
    ///
    /// Returns the number of bytes written into `buffer`. The 'Payload length' field is never
    /// sent and a UDP checksum is always computed from `header` and the payload.
    pub fn encode(
        &self,
        header: &ipv6::Repr,
        transport: Transport<'_>,
        ctxt: &Context,
        buffer: &mut [u8],
    ) -> Result<usize, EncodeError> {
        let (udp, payload) = match transport {
            Transport::Udp {
                source,
                destination,
                payload,
            } => (
                Some(UdpHeader::new(header, source, destination, payload)),
                payload,
            ),
            Transport::Other(payload) => (None, payload),
        };

        let flow_label = header.flow_label & FLOW_LABEL_MASK;
        let source = self.unicast_mode(&header.source, &ctxt.source);
        let destination = if header.destination.is_multicast() {
            if is_multicast_compressible(&header.destination) {
                AddrMode::Multicast
            } else {
                AddrMode::Inline
            }
        } else {
            self.unicast_mode(&header.destination, &ctxt.destination)
        };

        let mut enc = [0; 2];
        set!(enc[ENC1], tc, (header.traffic_class == 0) as u8);
        set!(enc[ENC1], vf, (flow_label == 0) as u8);
        set!(enc[ENC1], nh, udp.is_some() as u8);
        set!(
            enc[ENC1],
            hlim,
            match header.hop_limit {
                1 => HLIM_1,
                64 => HLIM_64,
                255 => HLIM_255,
                _ => HLIM_INLINE,
            }
        );

        let (am, ci) = source.bits();
        set!(enc[ENC2], sam, am);
        set!(enc[ENC2], sci, ci);
        let (am, ci) = destination.bits();
        set!(enc[ENC2], dam, am);
        set!(enc[ENC2], dci, ci);

        let mut writer = Writer::new(buffer);
        writer.put(&enc)?;

        match (header.traffic_class, flow_label) {
            (0, 0) => {}
            (0, fl) => writer.put(&[0x60 | (fl >> 16) as u8, (fl >> 8) as u8, fl as u8])?,
            (tc, 0) => writer.u8(tc)?,
            (tc, fl) => writer.put(&[
                0x60 | tc >> 4,
                tc << 4 | (fl >> 16) as u8,
                (fl >> 8) as u8,
                fl as u8,
            ])?,
        }

        if udp.is_none() {
            writer.u8(header.next_header.into())?;
        }

        if get!(enc[ENC1], hlim) == HLIM_INLINE {
            writer.u8(header.hop_limit)?;
        }

        source.write(&header.source, &mut writer)?;
        destination.write(&header.destination, &mut writer)?;

        if let Some(udp) = udp {
            udp.write(&mut writer)?;
        }

        writer.put(payload)?;

        trace!(
            "compressed: enc1={:?} enc2={:?} len={}",
            Binary(enc[ENC1]),
            Binary(enc[ENC2]),
            writer.position()
        );

        Ok(writer.position())
    }

    /// Compresses an uncompressed IPv6 packet
    pub fn compress(
        &self,
        packet: &[u8],
        ctxt: &Context,
        buffer: &mut [u8],
    ) -> Result<usize, EncodeError> {
        let (header, payload) = ipv6::Repr::parse(packet).map_err(|_| EncodeError::Malformed)?;

        let transport = if header.next_header == ipv6::NextHeader::Udp {
            let (repr, _, payload) =
                udp::Repr::parse(payload).map_err(|_| EncodeError::Malformed)?;

            Transport::Udp {
                source: repr.source,
                destination: repr.destination,
                payload,
            }
        } else {
            Transport::Other(payload)
        };

        self.encode(&header, transport, ctxt, buffer)
    }

    /// Decompresses the header at the start of `bytes`
    ///
    /// `ctxt` holds the link-layer addresses of the frame that carried the packet
    pub fn decode<B>(&self, bytes: B, ctxt: &Context) -> Result<Packet<B>, DecodeError>
    where
        B: AsSlice<Element = u8>,
    {
        let (header, udp, len) = self.decode_(bytes.as_slice(), ctxt)?;

        Ok(Packet {
            buffer: bytes,
            header,
            udp,
            payload: len,
        })
    }

    fn decode_(
        &self,
        bytes: &[u8],
        ctxt: &Context,
    ) -> Result<(ipv6::Repr, Option<UdpHeader>, usize), DecodeError> {
        let mut reader = Reader::new(bytes);
        let enc1 = reader.u8()?;
        let enc2 = reader.u8()?;

        let (traffic_class, flow_label) = match (get!(enc1, tc) != 0, get!(enc1, vf) != 0) {
            (false, false) => {
                let vtf = reader.take(4)?;
                check_version(vtf[0])?;

                (
                    vtf[0] << 4 | vtf[1] >> 4,
                    u32(vtf[1] & 0x0f) << 16 | u32(NE::read_u16(&vtf[2..])),
                )
            }
            (true, false) => {
                let vf = reader.take(3)?;
                check_version(vf[0])?;

                (0, u32(vf[0] & 0x0f) << 16 | u32(NE::read_u16(&vf[1..])))
            }
            (false, true) => (reader.u8()?, 0),
            (true, true) => (0, 0),
        };

        let next_header = if get!(enc1, nh) == 0 {
            Some(ipv6::NextHeader::from(reader.u8()?))
        } else {
            None
        };

        let hop_limit = match get!(enc1, hlim) {
            HLIM_1 => 1,
            HLIM_64 => 64,
            HLIM_255 => 255,
            _ => reader.u8()?,
        };

        let source = self.read_addr(&mut reader, get!(enc2, sam), get!(enc2, sci), &ctxt.source)?;
        let destination = self.read_addr(
            &mut reader,
            get!(enc2, dam),
            get!(enc2, dci),
            &ctxt.destination,
        )?;

        let (next_header, udp) = match next_header {
            Some(nh) => (nh, None),
            None => (
                ipv6::NextHeader::Udp,
                Some(UdpHeader::read(&mut reader)?),
            ),
        };

        let header = ipv6::Repr {
            traffic_class,
            flow_label,
            next_header,
            hop_limit,
            source,
            destination,
        };

        Ok((header, udp, reader.position()))
    }

    fn unicast_mode(&self, addr: &ipv6::Addr, ll: &ll::ExtendedAddr) -> AddrMode {
        match self.contexts.find(addr) {
            Some(ctx) => {
                if addr.iid() == ll.eui_64() {
                    AddrMode::Elided(ctx)
                } else if is_16bit_compressible(addr) {
                    AddrMode::Iid16(ctx)
                } else {
                    AddrMode::Iid64(ctx)
                }
            }
            None => AddrMode::Inline,
        }
    }

    fn prefix(&self, index: u8) -> Result<&Prefix, DecodeError> {
        self.contexts.get(index).ok_or_else(|| {
            trace!("context {} not found", index);
            DecodeError::ContextNotFound
        })
    }

    fn read_addr(
        &self,
        reader: &mut Reader<'_>,
        mode: u8,
        index: u8,
        ll: &ll::ExtendedAddr,
    ) -> Result<ipv6::Addr, DecodeError> {
        let mut addr = ipv6::Addr::UNSPECIFIED;

        match mode {
            AM_INLINE => addr.0.copy_from_slice(reader.take(16)?),
            AM_64 => {
                addr.0[..8].copy_from_slice(self.prefix(index)?);
                addr.0[8..].copy_from_slice(reader.take(8)?);
            }
            AM_16 => {
                let bytes = reader.take(2)?;

                if bytes[0] & 0x80 == 0 {
                    addr.0[..8].copy_from_slice(self.prefix(index)?);
                    addr.0[14..].copy_from_slice(bytes);
                } else {
                    // ffXX::00XX
                    addr.0[0] = 0xff;
                    addr.0[1] = (bytes[0] >> 1) & 0x0f;
                    addr.0[15] = bytes[1];
                }
            }
            _ => {
                addr.0[..8].copy_from_slice(self.prefix(index)?);
                addr.0[8..].copy_from_slice(&ll.eui_64());
            }
        }

        Ok(addr)
    }
}

fn check_version(byte: u8) -> Result<(), DecodeError> {
    if byte >> 4 == 6 {
        Ok(())
    } else {
        Err(DecodeError::BadVersion)
    }
}

/// A decoded HC01 packet
pub struct Packet<BUFFER>
where
    BUFFER: AsSlice<Element = u8>,
{
    buffer: BUFFER,
    header: ipv6::Repr,
    udp: Option<UdpHeader>,
    /// Index at which the payload starts
    payload: usize,
}

impl<B> Packet<B>
where
    B: AsSlice<Element = u8>,
{
    /// The decompressed IPv6 header
    pub fn header(&self) -> &ipv6::Repr {
        &self.header
    }

    /// The decompressed UDP header, if the packet carried one
    pub fn udp(&self) -> Option<&UdpHeader> {
        self.udp.as_ref()
    }

    /// Number of bytes the compressed headers occupy
    pub fn header_len(&self) -> usize {
        self.payload
    }

    /// Immutable view into the payload
    ///
    /// For UDP this is the datagram payload; otherwise it's the whole transport segment
    pub fn payload(&self) -> &[u8] {
        &self.bytes()[self.payload..]
    }

    /// The value of the uncompressed 'Payload length' field
    pub fn payload_length(&self) -> usize {
        self.payload().len() + if self.udp.is_some() { usize(udp::HEADER_SIZE) } else { 0 }
    }

    /// Byte representation of this packet
    pub fn bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Returns the underlying buffer
    pub fn into_buffer(self) -> B {
        self.buffer
    }

    /// Verifies the UDP checksum
    ///
    /// Returns `false` if the packet doesn't carry a compressed UDP header
    pub fn verify_udp_checksum(&self) -> bool {
        self.udp
            .map(|udp| udp.verify_checksum(&self.header, self.payload()))
            .unwrap_or(false)
    }

    /// Writes the uncompressed packet into `buffer`
    ///
    /// Returns the number of bytes written
    pub fn decompress(&self, buffer: &mut [u8]) -> Result<usize, EncodeError> {
        let plen = self.payload_length();
        let len = usize(ipv6::HEADER_SIZE) + plen;

        if buffer.len() < len {
            return Err(EncodeError::BufferTooSmall);
        }

        let plen = u16(plen).map_err(|_| EncodeError::Malformed)?;
        self.header.emit(buffer, plen);

        let mut start = usize(ipv6::HEADER_SIZE);
        if let Some(udp) = self.udp {
            udp.decompress(&mut buffer[start..], self.payload().len());
            start += usize(udp::HEADER_SIZE);
        }

        buffer[start..len].copy_from_slice(self.payload());

        Ok(len)
    }
}

impl<B> fmt::Debug for Packet<B>
where
    B: AsSlice<Element = u8>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.bytes();

        let mut s = f.debug_struct("iphc::Packet");
        s.field("enc1", &Binary(bytes[ENC1]))
            .field("enc2", &Binary(bytes[ENC2]))
            .field("header", &ipv6::Summary(&self.header));

        if let Some(udp) = self.udp.as_ref() {
            s.field("udp", udp);
        }

        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, RngCore};

    use crate::{
        ieee802154::ExtendedAddr,
        ipv6,
        sixlowpan::{
            context::{ContextTable, LINK_LOCAL},
            nhc, DecodeError, EncodeError,
        },
    };

    use super::{Codec, Context, Transport};

    const SITE: [u8; 8] = [0xaa, 0xaa, 0, 0, 0, 0, 0, 0];

    const CTXT: Context = Context {
        source: ExtendedAddr(0x20_18_05_21_23_59_59_01),
        destination: ExtendedAddr(0x20_18_05_21_23_59_59_02),
    };

    fn codec() -> Codec {
        Codec::new(ContextTable::new([Some(LINK_LOCAL), Some(SITE), None, None]))
    }

    fn repr(source: ipv6::Addr, destination: ipv6::Addr) -> ipv6::Repr {
        ipv6::Repr {
            traffic_class: 0,
            flow_label: 0,
            next_header: ipv6::NextHeader::Udp,
            hop_limit: 64,
            source,
            destination,
        }
    }

    fn mac_based(prefix: [u8; 8], ll: ExtendedAddr) -> ipv6::Addr {
        ipv6::Addr::new(prefix, ll.eui_64())
    }

    // compresses `header` + a UDP datagram, checks the compressed size, then decodes it back
    macro_rules! udp {
        ($header:expr, $ports:expr, $size:expr) => {{
            let header = $header;
            let (source, destination) = $ports;

            let mut payload = [0; 5];
            rand::thread_rng().fill_bytes(&mut payload);

            let mut bytes = [0; 128];
            rand::thread_rng().fill_bytes(&mut bytes);

            let codec = codec();
            let transport = Transport::Udp {
                source,
                destination,
                payload: &payload,
            };
            let len = codec.encode(&header, transport, &CTXT, &mut bytes).unwrap();

            assert_eq!(len, $size + payload.len());

            let packet = codec.decode(&bytes[..len], &CTXT).unwrap();
            assert_eq!(*packet.header(), header);
            assert_eq!(packet.header_len(), $size);
            assert_eq!(packet.payload(), &payload[..]);

            let udp = packet.udp().unwrap();
            assert_eq!(udp.source, source);
            assert_eq!(udp.destination, destination);
            assert!(packet.verify_udp_checksum());

            bytes
        }};
    }

    #[test]
    fn mac_based_link_local() {
        let bytes = udp!(
            repr(
                mac_based(LINK_LOCAL, CTXT.source),
                mac_based(LINK_LOCAL, CTXT.destination)
            ),
            (0xf0b1, 0xf0b2),
            2 + 4
        );

        // TC, VF, NH, HLIM = 64
        assert_eq!(bytes[0], 0b1111_0000);
        // SAM = DAM = elided, context 0
        assert_eq!(bytes[1], 0b11_00_11_00);
        assert_eq!(bytes[2], nhc::UDP_COMPRESSED);
        assert_eq!(bytes[3], 0x12);
    }

    #[test]
    fn context() {
        let bytes = udp!(
            repr(
                mac_based(SITE, CTXT.source),
                ipv6::Addr::new(SITE, [0, 0, 0, 0, 0, 0, 0x12, 0x34]),
            ),
            (0xf0b0, 0xf0bf),
            2 + 2 + 4
        );

        // SAM = elided, SCI = 1, DAM = 16-bit, DCI = 1
        assert_eq!(bytes[1], 0b11_01_10_01);
        assert_eq!(&bytes[2..4], &[0x12, 0x34]);
    }

    #[test]
    fn iid() {
        // 64-bit interface identifier
        let bytes = udp!(
            repr(
                ipv6::Addr::link_local([0x02, 0, 0, 0, 0, 0, 0, 1]),
                ipv6::Addr::link_local([0, 0, 0, 0, 0, 0, 0x80, 1]),
            ),
            (0xf0b0, 0xf0b0),
            2 + 8 + 8 + 4
        );
        assert_eq!(bytes[1], 0b01_00_01_00);

        // 16-bit interface identifier
        let bytes = udp!(
            repr(
                ipv6::Addr::link_local([0, 0, 0, 0, 0, 0, 0, 1]),
                ipv6::Addr::link_local([0, 0, 0, 0, 0, 0, 0x7f, 0xff]),
            ),
            (0xf0b0, 0xf0b0),
            2 + 2 + 2 + 4
        );
        assert_eq!(bytes[1], 0b10_00_10_00);
    }

    #[test]
    fn no_context() {
        let bytes = udp!(
            repr(
                ipv6::Addr([0x20, 0x01, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
                ipv6::Addr([0x20, 0x01, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]),
            ),
            (5683, 5683),
            2 + 16 + 16 + 7
        );

        assert_eq!(bytes[1], 0);
        assert_eq!(bytes[2 + 32], nhc::UDP_INLINE);
    }

    #[test]
    fn multicast() {
        let bytes = udp!(
            repr(mac_based(LINK_LOCAL, CTXT.source), ipv6::Addr::ALL_NODES),
            (0xf0b1, 0xf0b2),
            2 + 2 + 4
        );
        // DAM = 16-bit
        assert_eq!(bytes[1], 0b11_00_10_00);
        assert_eq!(&bytes[2..4], &[0xa4, 0x01]);

        udp!(
            repr(mac_based(LINK_LOCAL, CTXT.source), ipv6::Addr::ALL_ROUTERS),
            (0xf0b1, 0xf0b2),
            2 + 2 + 4
        );

        // site-local scope
        let mut addr = ipv6::Addr::ALL_NODES;
        addr.0[1] = 0x05;
        let bytes = udp!(
            repr(mac_based(LINK_LOCAL, CTXT.source), addr),
            (0xf0b1, 0xf0b2),
            2 + 2 + 4
        );
        assert_eq!(&bytes[2..4], &[0xaa, 0x01]);

        // not compressible: sent in full
        let mdns = ipv6::Addr([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xfb]);
        udp!(
            repr(mac_based(LINK_LOCAL, CTXT.source), mdns),
            (0xf0b1, 0xf0b2),
            2 + 16 + 4
        );

        let mut flagged = ipv6::Addr::ALL_NODES;
        flagged.0[1] = 0x12;
        udp!(
            repr(mac_based(LINK_LOCAL, CTXT.source), flagged),
            (0xf0b1, 0xf0b2),
            2 + 16 + 4
        );
    }

    #[test]
    fn ports() {
        let ll = repr(
            mac_based(LINK_LOCAL, CTXT.source),
            mac_based(LINK_LOCAL, CTXT.destination),
        );

        udp!(ll, (0xf0b0, 0xf0bf), 2 + 4);
        udp!(ll, (0xf0bf, 0xf0b0), 2 + 4);
        udp!(ll, (0xf0af, 0xf0b0), 2 + 7);
        udp!(ll, (0xf0b0, 0xf0c0), 2 + 7);
    }

    #[test]
    fn traffic_class_and_flow_label() {
        let mut header = repr(
            mac_based(LINK_LOCAL, CTXT.source),
            mac_based(LINK_LOCAL, CTXT.destination),
        );

        header.traffic_class = 0xb8;
        header.flow_label = 0xa_bcde;
        let bytes = udp!(header, (0xf0b1, 0xf0b2), 2 + 4 + 4);
        assert_eq!(bytes[0] >> 6, 0b00);
        assert_eq!(&bytes[2..6], &[0x6b, 0x8a, 0xbc, 0xde]);

        header.traffic_class = 0;
        let bytes = udp!(header, (0xf0b1, 0xf0b2), 2 + 3 + 4);
        assert_eq!(bytes[0] >> 6, 0b10);
        assert_eq!(&bytes[2..5], &[0x6a, 0xbc, 0xde]);

        header.traffic_class = 0xb8;
        header.flow_label = 0;
        let bytes = udp!(header, (0xf0b1, 0xf0b2), 2 + 1 + 4);
        assert_eq!(bytes[0] >> 6, 0b01);
        assert_eq!(bytes[2], 0xb8);
    }

    #[test]
    fn hop_limit() {
        let mut header = repr(
            mac_based(LINK_LOCAL, CTXT.source),
            mac_based(LINK_LOCAL, CTXT.destination),
        );

        for (hop_limit, code) in &[(1, 0b01), (64, 0b10), (255, 0b11)] {
            header.hop_limit = *hop_limit;
            let bytes = udp!(header, (0xf0b1, 0xf0b2), 2 + 4);
            assert_eq!((bytes[0] >> 3) & 0b11, *code);
        }

        header.hop_limit = 17;
        let bytes = udp!(header, (0xf0b1, 0xf0b2), 2 + 1 + 4);
        assert_eq!((bytes[0] >> 3) & 0b11, 0b00);
        assert_eq!(bytes[2], 17);
    }

    #[test]
    fn other_next_header() {
        let codec = codec();
        let mut header = repr(
            mac_based(LINK_LOCAL, CTXT.source),
            mac_based(LINK_LOCAL, CTXT.destination),
        );
        header.next_header = ipv6::NextHeader::Tcp;

        let segment = [0x55; 20];
        let mut bytes = [0; 64];
        let len = codec
            .encode(&header, Transport::Other(&segment), &CTXT, &mut bytes)
            .unwrap();

        // enc1 + enc2 + next header
        assert_eq!(len, 3 + segment.len());
        assert_eq!(bytes[2], 6);

        let packet = codec.decode(&bytes[..len], &CTXT).unwrap();
        assert_eq!(*packet.header(), header);
        assert!(packet.udp().is_none());
        assert!(!packet.verify_udp_checksum());
        assert_eq!(packet.header_len(), 3);
        assert_eq!(packet.payload(), &segment[..]);
    }

    #[test]
    fn random() {
        let codec = codec();
        let mut rng = rand::thread_rng();

        for _ in 0..256 {
            let mut addrs = [[0; 16]; 2];
            for addr in addrs.iter_mut() {
                rng.fill_bytes(addr);

                match rng.gen_range(0, 4) {
                    0 => addr[..8].copy_from_slice(&LINK_LOCAL),
                    1 => addr[..8].copy_from_slice(&SITE),
                    2 => addr[8..14].copy_from_slice(&[0; 6]),
                    _ => {}
                }
            }

            let header = ipv6::Repr {
                traffic_class: rng.gen(),
                flow_label: rng.gen::<u32>() & ipv6::FLOW_LABEL_MASK,
                next_header: ipv6::NextHeader::Udp,
                hop_limit: rng.gen(),
                source: ipv6::Addr(addrs[0]),
                destination: ipv6::Addr(addrs[1]),
            };
            let (source, destination) = (rng.gen(), rng.gen());

            let mut bytes = [0; 128];
            let transport = Transport::Udp {
                source,
                destination,
                payload: b"random",
            };
            let len = codec.encode(&header, transport, &CTXT, &mut bytes).unwrap();

            let packet = codec.decode(&bytes[..len], &CTXT).unwrap();
            assert_eq!(*packet.header(), header);
            assert_eq!(packet.udp().map(|udp| (udp.source, udp.destination)), Some((source, destination)));
            assert_eq!(packet.payload(), b"random");
        }
    }

    #[test]
    fn context_not_found() {
        let codec = codec();

        // SAM = 64-bit, SCI = 2 (empty slot)
        let mut bytes = [0; 2 + 1 + 8 + 16];
        bytes[0] = 0b1101_1000;
        bytes[1] = 0b01_10_00_00;
        bytes[2] = 6;
        assert_eq!(
            codec.decode(&bytes[..], &CTXT).err(),
            Some(DecodeError::ContextNotFound)
        );

        // SAM = elided, SCI = 3 (empty slot)
        let bytes = [0b1111_1000, 0b11_11_11_00, nhc::UDP_COMPRESSED, 0, 0, 0];
        assert_eq!(
            codec.decode(&bytes[..], &CTXT).err(),
            Some(DecodeError::ContextNotFound)
        );

        // DAM = 16-bit unicast, empty table
        let bytes = [0b1111_1000, 0b00_00_10_00];
        let empty = Codec::new(ContextTable::empty());
        let mut long = [0; 2 + 16 + 2 + 4];
        long[..2].copy_from_slice(&bytes);
        assert_eq!(
            empty.decode(&long[..], &CTXT).err(),
            Some(DecodeError::ContextNotFound)
        );
    }

    #[test]
    fn multicast_source() {
        // a 16-bit source with the multicast bit set needs no context
        let codec = Codec::new(ContextTable::empty());
        let mut bytes = [0; 2 + 2 + 16 + 4];
        bytes[0] = 0b1111_1000;
        bytes[1] = 0b10_00_00_00;
        bytes[2] = 0xa4;
        bytes[3] = 0x02;
        bytes[20] = nhc::UDP_COMPRESSED;

        let packet = codec.decode(&bytes[..], &CTXT).unwrap();
        assert_eq!(packet.header().source, ipv6::Addr::ALL_ROUTERS);
    }

    #[test]
    fn errors() {
        let codec = codec();

        // version nibble is 4
        let mut bytes = [0; 2 + 4 + 32 + 4];
        bytes[0] = 0b0011_1000;
        bytes[2] = 0x40;
        assert_eq!(
            codec.decode(&bytes[..], &CTXT).err(),
            Some(DecodeError::BadVersion)
        );

        bytes[0] = 0b1011_1000;
        assert_eq!(
            codec.decode(&bytes[..], &CTXT).err(),
            Some(DecodeError::BadVersion)
        );

        // NHC with one compressed port
        let bytes = [0b1111_1000, 0b11_00_11_00, 0xf9, 0, 0, 0, 0, 0];
        assert_eq!(
            codec.decode(&bytes[..], &CTXT).err(),
            Some(DecodeError::UnsupportedCompression)
        );

        // every strict prefix of a valid packet is too short
        let header = repr(
            ipv6::Addr::link_local([0, 0, 0, 0, 0, 0, 0, 1]),
            ipv6::Addr([0x20, 0x01, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]),
        );
        let mut bytes = [0; 64];
        let transport = Transport::Udp {
            source: 1,
            destination: 2,
            payload: &[],
        };
        let len = codec.encode(&header, transport, &CTXT, &mut bytes).unwrap();
        for n in 0..len {
            assert_eq!(
                codec.decode(&bytes[..n], &CTXT).err(),
                Some(DecodeError::ShortPacket)
            );
        }

        // output buffer too small
        assert_eq!(
            codec.encode(&header, transport, &CTXT, &mut bytes[..len - 1]),
            Err(EncodeError::BufferTooSmall)
        );
    }

    #[test]
    fn decompress() {
        let codec = codec();
        let header = repr(
            mac_based(LINK_LOCAL, CTXT.source),
            ipv6::Addr::ALL_NODES,
        );

        let mut compressed = [0; 64];
        let transport = Transport::Udp {
            source: 0xf0b1,
            destination: 5683,
            payload: b"hello",
        };
        let len = codec.encode(&header, transport, &CTXT, &mut compressed).unwrap();

        let packet = codec.decode(&compressed[..len], &CTXT).unwrap();
        assert_eq!(packet.payload_length(), 8 + 5);

        let mut full = [0; 128];
        let n = packet.decompress(&mut full).unwrap();
        assert_eq!(n, 40 + 8 + 5);
        assert_eq!(
            packet.decompress(&mut [0; 40 + 8 + 4]),
            Err(EncodeError::BufferTooSmall)
        );

        let (ip, payload) = ipv6::Repr::parse(&full[..n]).unwrap();
        assert_eq!(ip, header);
        assert_eq!(&payload[8..], b"hello");

        // compressing the uncompressed packet gives back the same bytes
        let mut again = [0; 64];
        assert_eq!(codec.compress(&full[..n], &CTXT, &mut again), Ok(len));
        assert_eq!(&again[..len], &compressed[..len]);
    }
}
