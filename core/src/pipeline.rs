//! The per-packet pipeline: classify, filter, translate, hairpin.
//!
//! Everything here is synchronous and lock-light; the only shared state is
//! the instance's tables. Steps communicate through `Result<_, Abort>` and
//! the entry point converts the first failure into a public [`Verdict`].

use crate::bib::{FilterError, SegFlags, TransportAddr6};
use crate::config::Globals;
use crate::instance::{Instance, Kind};
use crate::pool4::TransportAddr4;
use crate::verdict::{Abort, IcmpError, Stat, StatSink, Verdict};
use crate::{L4Proto, xlat4to6, xlat6to4};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;
use xlat_packet::etherparse::IpNumber;
use xlat_packet::{IpPacket, Ipv4Packet, Ipv6Packet, is_icmpv4_error_type};

/// Next-hop path MTUs, resolved by the embedding network stack. Lookups are
/// synchronous and must not block.
pub trait RouteOracle: Send + Sync {
    /// Path MTU toward an IPv4 destination; `None` when unroutable.
    fn mtu_to_v4(&self, dst: Ipv4Addr) -> Option<u32>;
    /// Path MTU toward an IPv6 destination; `None` when unroutable.
    fn mtu_to_v6(&self, dst: Ipv6Addr) -> Option<u32>;
}

/// A route oracle with one flat MTU. Good enough for tests and
/// point-to-point deployments.
#[derive(Debug, Clone, Copy)]
pub struct FixedMtu(pub u32);

impl RouteOracle for FixedMtu {
    fn mtu_to_v4(&self, _: Ipv4Addr) -> Option<u32> {
        Some(self.0)
    }

    fn mtu_to_v6(&self, _: Ipv6Addr) -> Option<u32> {
        Some(self.0)
    }
}

/// Mutable state of one packet's trip through the translator.
pub(crate) struct Xlation<'a> {
    pub instance: &'a Instance,
    pub route: &'a dyn RouteOracle,
    pub stats: &'a dyn StatSink,
    pub in_dev_mtu: u32,
    /// This run is the second leg of a hairpin; TTL was already paid.
    pub intrinsic_hairpin: bool,
    /// Set by the 6→4 address translator when the output must U-turn.
    pub mark_hairpin: bool,
}

impl Xlation<'_> {
    pub(crate) fn globals(&self) -> &Globals {
        &self.instance.globals
    }

    pub(crate) fn drop(&self, stat: Stat) -> Abort {
        self.stats.record(stat);
        Abort::Drop
    }

    pub(crate) fn accept(&self, stat: Stat) -> Abort {
        self.stats.record(stat);
        Abort::Accept
    }

    pub(crate) fn untranslatable(&self, stat: Stat, error: IcmpError) -> Abort {
        self.stats.record(stat);
        Abort::Untranslatable(error)
    }
}

/// Concrete IPv4-side addressing for one 6→4 build, resolved from the
/// session tables.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatefulAddrs4 {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Source/destination ports (or the ICMP identifier in the source slot)
    /// to write into the transport header.
    pub ports: Option<(u16, u16)>,
    /// Endpoints of the packet nested in an ICMP error, source first.
    pub inner: Option<(TransportAddr4, TransportAddr4)>,
}

/// Concrete IPv6-side addressing for one 4→6 build.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatefulAddrs6 {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    /// Ports as above; the ICMP identifier rides in the destination slot.
    pub ports: Option<(u16, u16)>,
    pub inner: Option<(TransportAddr6, TransportAddr6)>,
}

/// The outcome of feeding one packet to [`translate`].
#[derive(Debug)]
pub struct Translation {
    /// Verdict for the input packet. [`Verdict::Continue`] means the
    /// translation succeeded and `packets` should be transmitted.
    pub verdict: Verdict,
    /// Packets to transmit: the translation itself, plus any parked
    /// simultaneous-open packets it released.
    pub packets: Vec<IpPacket>,
}

impl Translation {
    fn forward(packet: IpPacket) -> Self {
        Self {
            verdict: Verdict::Continue,
            packets: vec![packet],
        }
    }

    fn verdict(verdict: Verdict) -> Self {
        Self {
            verdict,
            packets: Vec::new(),
        }
    }
}

/// Translates one packet.
///
/// `in_dev_mtu` is the MTU of the interface the packet arrived on (it feeds
/// ICMP path-MTU arithmetic); `now` drives session lifetimes.
pub fn translate(
    instance: &Instance,
    route: &dyn RouteOracle,
    stats: &dyn StatSink,
    packet: &IpPacket,
    in_dev_mtu: u32,
    now: Instant,
) -> Translation {
    if !instance.globals.enabled {
        return Translation::verdict(Verdict::Accept);
    }

    let mut x = Xlation {
        instance,
        route,
        stats,
        in_dev_mtu,
        intrinsic_hairpin: false,
        mark_hairpin: false,
    };

    match run(&mut x, packet, now) {
        Ok(translation) => translation,
        Err(abort) => Translation::verdict(abort.into_verdict(may_answer(packet))),
    }
}

/// No ICMP error is owed in response to another ICMP error or to a non-first
/// fragment. (Link-layer broadcasts never reach the core; the hook filters
/// them.)
fn may_answer(packet: &IpPacket) -> bool {
    packet.is_first_fragment() && !packet.is_icmp_error()
}

fn run(x: &mut Xlation<'_>, packet: &IpPacket, now: Instant) -> Result<Translation, Abort> {
    match (packet, x.instance.kind) {
        (IpPacket::Ipv6(in6), Kind::Siit) => {
            let out = xlat6to4::translate(x, in6, None)?;
            siit_emit_v4(x, out)
        }
        (IpPacket::Ipv4(in4), Kind::Siit) => {
            let out = xlat4to6::translate(x, in4, None)?;
            Ok(Translation::forward(IpPacket::Ipv6(out)))
        }
        (IpPacket::Ipv6(in6), Kind::Nat64) => {
            let (stateful, released) = nat64_6to4(x, packet, in6, now)?;
            let out = xlat6to4::translate(x, in6, Some(&stateful))?;
            let mut translation = nat64_emit_v4(x, out, now)?;

            for raw in released {
                reinject(x, raw, now, &mut translation);
            }

            Ok(translation)
        }
        (IpPacket::Ipv4(in4), Kind::Nat64) => {
            let stateful = nat64_4to6(x, packet, in4, now)?;
            let out = xlat4to6::translate(x, in4, Some(&stateful))?;
            Ok(Translation::forward(IpPacket::Ipv6(out)))
        }
    }
}

/// Runs a parked packet through the pipeline it was originally denied; its
/// session is established now. Failures only affect the parked packet.
fn reinject(x: &Xlation<'_>, raw: Vec<u8>, now: Instant, translation: &mut Translation) {
    let Ok(parked) = IpPacket::parse(raw) else {
        return;
    };

    let sub = translate(x.instance, x.route, x.stats, &parked, x.in_dev_mtu, now);
    if sub.verdict == Verdict::Continue {
        translation.packets.extend(sub.packets);
    }
}

/// EAM hairpinning: a freshly translated IPv4 packet whose destination maps
/// back into the translator makes a U-turn instead of leaving.
fn siit_emit_v4(x: &mut Xlation<'_>, out: Ipv4Packet) -> Result<Translation, Abort> {
    use crate::config::EamHairpinMode::*;

    let hairpin = match x.globals().eam_hairpin_mode {
        Off => false,
        Simple => x.instance.siit.eamt.contains4(out.destination()),
        Intrinsic => x.mark_hairpin,
    };

    if !hairpin {
        return Ok(Translation::forward(IpPacket::Ipv4(out)));
    }

    tracing::debug!(dst = %out.destination(), "U-turning a hairpinned packet");

    x.intrinsic_hairpin = x.globals().eam_hairpin_mode == Intrinsic;
    x.in_dev_mtu = u32::MAX;
    let out6 = xlat4to6::translate(x, &out, None)?;

    Ok(Translation::forward(IpPacket::Ipv6(out6)))
}

/// NAT64 hairpinning: the destination of the translated packet is one of our
/// own pool4 addresses, so it re-enters as IPv4 input (RFC 6146 section 2).
fn nat64_emit_v4(x: &mut Xlation<'_>, out: Ipv4Packet, now: Instant) -> Result<Translation, Abort> {
    if !x.instance.pool4.contains(out.destination()) {
        return Ok(Translation::forward(IpPacket::Ipv4(out)));
    }

    let is_icmp_info = out.protocol() == IpNumber::ICMP
        && out
            .payload()
            .first()
            .is_some_and(|ty| !is_icmpv4_error_type(*ty));
    if is_icmp_info {
        // Hairpinning has no BIB to resolve a ping identifier against.
        tracing::debug!("Pings are not supported by hairpinning");
        return Err(x.drop(Stat::PolicyDrop));
    }

    tracing::debug!(dst = %out.destination(), "U-turning a hairpinned packet");

    x.in_dev_mtu = u32::MAX;
    run(x, &IpPacket::Ipv4(out), now)
}

fn nat64_6to4(
    x: &Xlation<'_>,
    packet: &IpPacket,
    in6: &Ipv6Packet,
    now: Instant,
) -> Result<(StatefulAddrs4, Vec<Vec<u8>>), Abort> {
    let pool6 = x
        .globals()
        .pool6
        .ok_or_else(|| x.accept(Stat::UntranslatableAddress))?;

    if !in6.is_first_fragment() {
        // Stateful operation needs the transport header; reassembly is the
        // hook's job.
        return Err(x.drop(Stat::InHdrErrors));
    }
    if !pool6.contains(in6.destination()) {
        return Err(x.accept(Stat::UntranslatableAddress));
    }

    let proto = L4Proto::of(packet).ok_or_else(|| x.drop(Stat::PolicyDrop))?;

    if packet.is_icmpv6() {
        if packet.is_icmp_error() {
            let stateful = nat64_6to4_error(x, packet, in6, &pool6)?;
            return Ok((stateful, Vec::new()));
        }
        if x.globals().drop_icmpv6_info {
            tracing::debug!("ICMPv6 info packets disallowed by policy");
            return Err(x.drop(Stat::PolicyDrop));
        }
    }

    let src_port = packet
        .source_protocol()
        .map_err(|_| x.drop(Stat::InHdrErrors))?
        .value();
    let dst_port = packet
        .destination_protocol()
        .map_err(|_| x.drop(Stat::InHdrErrors))?
        .value();

    let src6 = TransportAddr6::new(in6.source(), src_port);
    let remote4 = TransportAddr4::new(pool6.extract(in6.destination()), dst_port);
    let remote6 = TransportAddr6::new(in6.destination(), dst_port);
    let flags = seg_flags(packet);

    let (mapping, released) = x
        .instance
        .bib
        .open_6to4(
            proto,
            &x.instance.pool4,
            src6,
            remote4,
            remote6,
            flags,
            x.globals(),
            now,
        )
        .map_err(|e| filter_abort(x, e))?;

    let stateful = StatefulAddrs4 {
        src: mapping.local4.addr,
        dst: mapping.remote4.addr,
        ports: Some((mapping.local4.port, mapping.remote4.port)),
        inner: None,
    };

    Ok((stateful, released))
}

/// Resolves an outbound ICMPv6 error against the session of the packet it
/// reports on. The error's own source may be an IPv6 router with no binding;
/// it then borrows an RFC 6791 (or pool4) address.
fn nat64_6to4_error(
    x: &Xlation<'_>,
    packet: &IpPacket,
    in6: &Ipv6Packet,
    pool6: &crate::rfc6052::Pool6,
) -> Result<StatefulAddrs4, Abort> {
    let icmp = packet.as_icmpv6().ok_or_else(|| x.drop(Stat::InHdrErrors))?;
    let inner =
        Ipv6Packet::parse_lax(icmp.payload().to_vec()).map_err(|_| x.drop(Stat::InHdrErrors))?;

    let (proto, inner_src_port, inner_dst_port) = inner_ports_v6(&inner)
        .ok_or_else(|| x.drop(Stat::InHdrErrors))?;

    if !pool6.contains(inner.source()) {
        tracing::debug!("Inner packet's source is not a translated address");
        return Err(x.drop(Stat::NoBib));
    }
    let remote_addr = pool6.extract(inner.source());
    let remote_port = match proto {
        L4Proto::Icmp => None,
        L4Proto::Tcp | L4Proto::Udp => Some(inner_src_port),
    };

    let local6 = TransportAddr6::new(inner.destination(), inner_dst_port);
    let mapping = x
        .instance
        .bib
        .find_session_by6(proto, local6, remote_addr, remote_port)
        .ok_or_else(|| x.drop(Stat::NoBib))?;

    let src = if pool6.contains(in6.source()) {
        pool6.extract(in6.source())
    } else {
        let entropy = u64::from(u32::from(mapping.remote4.addr));
        x.instance
            .siit
            .rfc6791_pick_v4(x.globals().randomize_rfc6791, entropy)
            .or_else(|| x.instance.pool4.any_addr())
            .ok_or_else(|| x.drop(Stat::UntranslatableAddress))?
    };

    Ok(StatefulAddrs4 {
        src,
        dst: mapping.remote4.addr,
        ports: None,
        inner: Some((mapping.remote4, mapping.local4)),
    })
}

fn nat64_4to6(
    x: &Xlation<'_>,
    packet: &IpPacket,
    in4: &Ipv4Packet,
    now: Instant,
) -> Result<StatefulAddrs6, Abort> {
    let pool6 = x
        .globals()
        .pool6
        .ok_or_else(|| x.accept(Stat::UntranslatableAddress))?;

    if !in4.is_first_fragment() {
        return Err(x.drop(Stat::InHdrErrors));
    }
    if !x.instance.pool4.contains(in4.destination()) {
        return Err(x.accept(Stat::UntranslatableAddress));
    }

    let proto = L4Proto::of(packet).ok_or_else(|| x.drop(Stat::PolicyDrop))?;

    if packet.is_icmpv4() && packet.is_icmp_error() {
        return nat64_4to6_error(x, packet, in4, &pool6);
    }

    let src_port = packet
        .source_protocol()
        .map_err(|_| x.drop(Stat::InHdrErrors))?
        .value();
    let dst_port = packet
        .destination_protocol()
        .map_err(|_| x.drop(Stat::InHdrErrors))?
        .value();

    let local4 = TransportAddr4::new(in4.destination(), dst_port);
    let remote4 = TransportAddr4::new(in4.source(), src_port);
    let remote6 = TransportAddr6::new(pool6.embed(in4.source()), src_port);
    let flags = seg_flags(packet);

    let mapping = x
        .instance
        .bib
        .open_4to6(
            proto,
            local4,
            remote4,
            remote6,
            flags,
            Some(packet.packet()),
            x.globals(),
            now,
        )
        .map_err(|e| filter_abort(x, e))?;

    Ok(StatefulAddrs6 {
        src: mapping.remote6.addr,
        dst: mapping.local6.addr,
        ports: Some((mapping.remote6.port, mapping.local6.port)),
        inner: None,
    })
}

/// Resolves an inbound ICMPv4 error against the session of the reported-on
/// packet.
fn nat64_4to6_error(
    x: &Xlation<'_>,
    packet: &IpPacket,
    in4: &Ipv4Packet,
    pool6: &crate::rfc6052::Pool6,
) -> Result<StatefulAddrs6, Abort> {
    let icmp = packet.as_icmpv4().ok_or_else(|| x.drop(Stat::InHdrErrors))?;
    let inner =
        Ipv4Packet::parse_lax(icmp.payload().to_vec()).map_err(|_| x.drop(Stat::InHdrErrors))?;

    let (proto, inner_src_port, inner_dst_port) = inner_ports_v4(&inner)
        .ok_or_else(|| x.drop(Stat::InHdrErrors))?;

    let local4 = TransportAddr4::new(inner.source(), inner_src_port);
    let remote_port = match proto {
        L4Proto::Icmp => None,
        L4Proto::Tcp | L4Proto::Udp => Some(inner_dst_port),
    };
    let mapping = x
        .instance
        .bib
        .find_session_by4(proto, local4, inner.destination(), remote_port)
        .ok_or_else(|| x.drop(Stat::NoBib))?;

    let src = if x.globals().src_icmp6errs_better {
        // Keep the reporting router visible (it has no binding of its own).
        pool6.embed(in4.source())
    } else {
        mapping.remote6.addr
    };

    Ok(StatefulAddrs6 {
        src,
        dst: mapping.local6.addr,
        ports: None,
        inner: Some((mapping.local6, mapping.remote6)),
    })
}

/// Transport selectors of the packet nested in an ICMPv6 error.
fn inner_ports_v6(inner: &Ipv6Packet) -> Option<(L4Proto, u16, u16)> {
    let l4 = inner.payload();

    match inner.upper_protocol() {
        IpNumber::TCP | IpNumber::UDP => {
            let proto = if inner.upper_protocol() == IpNumber::TCP {
                L4Proto::Tcp
            } else {
                L4Proto::Udp
            };
            let src = u16::from_be_bytes([*l4.first()?, *l4.get(1)?]);
            let dst = u16::from_be_bytes([*l4.get(2)?, *l4.get(3)?]);
            Some((proto, src, dst))
        }
        IpNumber::IPV6_ICMP => {
            let id = u16::from_be_bytes([*l4.get(4)?, *l4.get(5)?]);
            Some((L4Proto::Icmp, id, id))
        }
        _ => None,
    }
}

/// Transport selectors of the packet nested in an ICMPv4 error.
fn inner_ports_v4(inner: &Ipv4Packet) -> Option<(L4Proto, u16, u16)> {
    let l4 = inner.payload();

    match inner.protocol() {
        IpNumber::TCP | IpNumber::UDP => {
            let proto = if inner.protocol() == IpNumber::TCP {
                L4Proto::Tcp
            } else {
                L4Proto::Udp
            };
            let src = u16::from_be_bytes([*l4.first()?, *l4.get(1)?]);
            let dst = u16::from_be_bytes([*l4.get(2)?, *l4.get(3)?]);
            Some((proto, src, dst))
        }
        IpNumber::ICMP => {
            let id = u16::from_be_bytes([*l4.get(4)?, *l4.get(5)?]);
            Some((L4Proto::Icmp, id, id))
        }
        _ => None,
    }
}

fn seg_flags(packet: &IpPacket) -> Option<SegFlags> {
    let tcp = packet.as_tcp()?;

    Some(SegFlags {
        syn: tcp.syn(),
        fin: tcp.fin(),
        rst: tcp.rst(),
    })
}

fn filter_abort(x: &Xlation<'_>, error: FilterError) -> Abort {
    match error {
        FilterError::NoBib => x.untranslatable(Stat::NoBib, IcmpError::AddressUnreachable),
        FilterError::NoSession => x.drop(Stat::PolicyDrop),
        FilterError::PoolExhausted => {
            x.stats.record(Stat::Pool4Exhausted);
            x.drop(Stat::OutDiscards)
        }
        FilterError::PolicyDrop => x.drop(Stat::PolicyDrop),
        FilterError::IllegalTransition => {
            x.untranslatable(Stat::PolicyDrop, IcmpError::FilterProhibited)
        }
        FilterError::Stolen => Abort::Stolen,
        FilterError::StoreFull => x.drop(Stat::StoredPktOverflow),
    }
}
