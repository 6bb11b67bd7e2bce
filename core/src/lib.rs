//! The translation core: RFC 7915 stateless translation (SIIT, with EAM and
//! RFC 6052 prefixes) and RFC 6146 stateful NAT64 on top of it.
//!
//! The crate is sans-IO. Packets come in as parsed [`xlat_packet::IpPacket`]s,
//! timers are driven by the caller through `poll_timeout`/`expire`, and
//! routing/statistics are traits the embedding hook implements.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod addr_xlat;
pub mod bib;
pub mod config;
pub mod eam;
pub mod instance;
pub mod pipeline;
pub mod pool4;
pub mod rfc6052;
pub mod verdict;

mod xlat4to6;
mod xlat6to4;

pub use bib::{Bib, SegFlags, TcpState, TransportAddr6};
pub use config::{EamHairpinMode, Globals, Timeouts};
pub use instance::{Instance, Registry};
pub use pipeline::{FixedMtu, RouteOracle, Translation, translate};
pub use pool4::{Pool4, TransportAddr4};
pub use rfc6052::Pool6;
pub use verdict::{IcmpError, Stat, StatSink, Verdict};

use xlat_packet::IpPacket;
use xlat_packet::etherparse::IpNumber;

/// The three transport protocols the translator tracks state for. ICMP's
/// "port" is the echo identifier, and the ICMPv4/ICMPv6 protocol numbers
/// collapse into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Tcp,
    Udp,
    Icmp,
}

impl L4Proto {
    /// Classifies a packet's upper layer; `None` for anything the stateful
    /// tables cannot track.
    pub fn of(packet: &IpPacket) -> Option<Self> {
        match packet.next_header() {
            IpNumber::TCP => Some(L4Proto::Tcp),
            IpNumber::UDP => Some(L4Proto::Udp),
            IpNumber::ICMP | IpNumber::IPV6_ICMP => Some(L4Proto::Icmp),
            _ => None,
        }
    }
}
