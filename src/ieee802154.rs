//! IEEE 802.15.4 link-layer addresses
//!
//! Only the addressing bits of 802.15.4 are needed here: the header compressor infers the
//! interface identifier of an IPv6 address from the extended (EUI-64) address of the frame that
//! carries it. Parsing MAC frames is left to the radio driver.
//!
//! # References
//!
//! - [RFC 4944 Section 6: Stateless Address Autoconfiguration][0]
//!
//! [0]: https://tools.ietf.org/html/rfc4944#section-6

use core::fmt;

use byteorder::{ByteOrder, NetworkEndian as NE};

/// Extended (64-bit) address
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExtendedAddr(pub u64);

impl ExtendedAddr {
    /// Serializes the address into an array of bytes using network endianness
    pub fn ne_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        NE::write_u64(&mut bytes, self.0);
        bytes
    }

    /// Converts the address into the interface identifier of an IPv6 address
    ///
    /// This is the address in network order with the universal / local bit toggled
    pub fn eui_64(&self) -> [u8; 8] {
        let mut bytes = self.ne_bytes();

        // toggle the universal / local bit
        bytes[0] ^= 1 << 1;

        bytes
    }

    /// Inverse of `eui_64`
    pub fn from_eui_64(iid: [u8; 8]) -> Self {
        let mut bytes = iid;
        bytes[0] ^= 1 << 1;
        ExtendedAddr(NE::read_u64(&bytes))
    }
}

// NOTE printed in BIG (Network) endian representation to match the output of `ip link`
impl fmt::Display for ExtendedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut is_first = true;

        for byte in self.ne_bytes().iter() {
            if is_first {
                is_first = false;
            } else {
                f.write_str(":")?;
            }

            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}
