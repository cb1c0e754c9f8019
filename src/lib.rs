//! lowpan-tcp: IPv6 over low-power radio links
//!
//! This crate has two halves:
//!
//! - A LOWPAN_IPHC style header compressor (the [`sixlowpan`] module) that squeezes a 40-byte
//!   IPv6 header, plus an optional UDP header, into a handful of bytes using shared address
//!   prefixes ("contexts") and the link-layer addresses of the frame that carries the packet.
//!
//! - A small TCP (the [`tcp`] module) tuned for lossy, slow links: one segment per write, a 128
//!   byte send buffer, go-back-to-oldest retransmission on a fixed timer and no reorder buffer.
//!
//! Link-layer I/O is not part of this crate. Frames are handed to and taken from the radio
//! driver through the [`sixlowpan::FrameSink`] trait and [`sixlowpan::Interface::receive`].
//!
//! The wire modules and the connection state machine ([`tcp::Tcb`]) are `no_std`. The `std`
//! feature (enabled by default) adds the blocking [`tcp::Connection`] and the
//! [`tcp::ConnectionTable`].
//!
//! # Examples
//!
//! - Compressing a UDP datagram between two link-local addresses
//!
//! ```
//! use lowpan_tcp::{
//!     ieee802154::ExtendedAddr,
//!     ipv6,
//!     sixlowpan::{context::ContextTable, iphc},
//! };
//!
//! let src_ll = ExtendedAddr(0x20_18_05_21_23_59_59_01);
//! let dst_ll = ExtendedAddr(0x20_18_05_21_23_59_59_02);
//! let ctxt = iphc::Context {
//!     source: src_ll,
//!     destination: dst_ll,
//! };
//!
//! let header = ipv6::Repr {
//!     traffic_class: 0,
//!     flow_label: 0,
//!     next_header: ipv6::NextHeader::Udp,
//!     hop_limit: 64,
//!     source: ipv6::Addr::link_local(src_ll.eui_64()),
//!     destination: ipv6::Addr::link_local(dst_ll.eui_64()),
//! };
//!
//! let codec = iphc::Codec::new(ContextTable::default());
//!
//! let mut buffer = [0; 64];
//! let transport = iphc::Transport::Udp {
//!     source: 0xf0b1,
//!     destination: 0xf0b2,
//!     payload: b"hi",
//! };
//! let len = codec.encode(&header, transport, &ctxt, &mut buffer).unwrap();
//!
//! // 2 (IPHC) + 1 (NHC) + 1 (ports) + 2 (checksum) + 2 (payload)
//! assert_eq!(len, 8);
//!
//! let packet = codec.decode(&buffer[..len], &ctxt).unwrap();
//! assert_eq!(*packet.header(), header);
//! assert_eq!(packet.payload(), b"hi");
//! ```

#![deny(missing_docs)]
#![deny(rust_2018_compatibility)]
#![deny(rust_2018_idioms)]
#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

#[macro_use]
mod macros;

mod fmt;

// Medium Access Control layer
pub mod ieee802154;

// Network layer
pub mod ipv6;
pub mod sixlowpan;

// Transport layer
pub mod tcp;
pub mod udp;
