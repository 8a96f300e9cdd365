//! IP datagram reconstruction.
//!
//! Takes raw link-layer frames (Ethernet, Linux cooked, or raw IP) and turns
//! them into parsed IP datagrams: link-header classification, IPv4/IPv6
//! header walking, transport location, and userspace reassembly of
//! fragmented datagrams with a bounded, time-expiring fragment cache.

pub mod datagram;
pub mod frame;
pub mod reasm;

pub use datagram::{parse_datagram, parse_raw, Datagram, DatagramParser, ParseError};
pub use frame::{classify, IpVersion, LinkType};
pub use reasm::{FragmentSet, IpReassembler, PktTime, SubmitOutcome};
