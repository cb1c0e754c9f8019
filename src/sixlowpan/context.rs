//! Address contexts
//!
//! A context is a 64-bit IPv6 prefix known to both ends of the link. An address whose prefix is in
//! the table is sent as a 2-bit context index plus whatever part of its interface identifier can't
//! be inferred.

use crate::ipv6;

/// Maximum number of contexts; the wire format has 2 bits per address for the index
pub const MAX_CONTEXTS: usize = 4;

/// 64-bit IPv6 prefix
pub type Prefix = [u8; 8];

/// The link-local prefix: `fe80::/64`
pub const LINK_LOCAL: Prefix = [0xfe, 0x80, 0, 0, 0, 0, 0, 0];

/// Fixed set of prefixes indexed by the context identifiers that appear on the wire
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContextTable {
    slots: [Option<Prefix>; MAX_CONTEXTS],
}

impl ContextTable {
    /// Creates a table from its slots; slot `i` is context `i`
    pub const fn new(slots: [Option<Prefix>; MAX_CONTEXTS]) -> Self {
        ContextTable { slots }
    }

    /// A table without contexts; every address will be sent in full
    pub const fn empty() -> Self {
        ContextTable {
            slots: [None; MAX_CONTEXTS],
        }
    }

    /// Returns the prefix of context `index`
    ///
    /// Returns `None` if the slot is empty or `index` is out of range
    pub fn get(&self, index: u8) -> Option<&Prefix> {
        self.slots.get(usize::from(index)).and_then(|slot| slot.as_ref())
    }

    /// Returns the index of the first context whose prefix matches `addr`
    pub fn find(&self, addr: &ipv6::Addr) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| match slot {
                Some(prefix) => addr.0[..8] == prefix[..],
                None => false,
            })
            .map(|i| i as u8)
    }
}

/// Link-local prefix at index 0
impl Default for ContextTable {
    fn default() -> Self {
        ContextTable::new([Some(LINK_LOCAL), None, None, None])
    }
}
