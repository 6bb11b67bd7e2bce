//! The IPv4→IPv6 translator (RFC 7915 sections 4.1 through 4.3).

use crate::addr_xlat::AddrXlat;
use crate::config::EamHairpinMode;
use crate::pipeline::{StatefulAddrs6, Xlation};
use crate::verdict::{Abort, IcmpError, Stat};
use std::net::Ipv6Addr;
use xlat_packet::checksum;
use xlat_packet::etherparse::{
    Icmpv4Slice, Icmpv4Type, IpNumber, Ipv6FlowLabel, Ipv6Header, icmpv4, icmpv6,
};
use xlat_packet::{
    FRAGMENT_HEADER_LEN, FragmentHeader, Ipv4Packet, Ipv6Packet, is_icmpv4_error_type,
};

/// Everything past the IPv6 minimum MTU would get fragmented or dropped on
/// the way to the reporting node, so ICMPv6 errors are trimmed to it.
const IPV6_MIN_MTU: usize = 1280;

pub(crate) fn translate(
    x: &mut Xlation<'_>,
    in4: &Ipv4Packet,
    stateful: Option<&StatefulAddrs6>,
) -> Result<Ipv6Packet, Abort> {
    let bytes = xlat_packet(x, in4, stateful, false)?;

    debug_assert!(bytes.len() >= Ipv6Header::LEN);
    Ipv6Packet::parse(bytes).map_err(|_| x.drop(Stat::InHdrErrors))
}

fn xlat_packet(
    x: &mut Xlation<'_>,
    in4: &Ipv4Packet,
    stateful: Option<&StatefulAddrs6>,
    is_inner: bool,
) -> Result<Vec<u8>, Abort> {
    let is_error = is_icmp_error(in4);

    let (src, dst) = match stateful {
        Some(addrs) => (addrs.src, addrs.dst),
        None => translate_addrs_siit(x, in4, is_inner, is_error)?,
    };

    let hop_limit = if !is_inner && !x.intrinsic_hairpin {
        let ttl = in4.header().ttl();
        if ttl <= 1 {
            tracing::debug!("TTL ran out");
            return Err(x.untranslatable(Stat::TtlExpired, IcmpError::TtlExpired));
        }
        ttl - 1
    } else {
        in4.header().ttl()
    };

    if !is_inner && has_unexpired_source_route(in4.options()) {
        tracing::debug!("Packet has an unexpired source route");
        return Err(x.untranslatable(Stat::SourceRoute, IcmpError::SourceRouteFailed));
    }

    let needs_fragment_header = in4.is_fragment() || !in4.header().dont_fragment();
    let frag_len = if needs_fragment_header {
        FRAGMENT_HEADER_LEN
    } else {
        0
    };
    let error_cap = IPV6_MIN_MTU - Ipv6Header::LEN - frag_len;

    let l4 = build_l4(x, in4, stateful, is_inner, src, dst, error_cap)?;

    let payload_length = if is_inner {
        // Preserve the length of the original (possibly truncated) packet.
        (in4.declared_total_len() - in4.header_len() + frag_len) as u16
    } else {
        (frag_len + l4.len()) as u16
    };

    let mapped_proto = xlat_proto(in4.protocol());
    let header = Ipv6Header {
        traffic_class: if x.globals().reset_traffic_class {
            0
        } else {
            tos(in4)
        },
        flow_label: Ipv6FlowLabel::ZERO,
        payload_length,
        next_header: if needs_fragment_header {
            IpNumber::IPV6_FRAGMENTATION_HEADER
        } else {
            mapped_proto
        },
        hop_limit,
        source: src.octets(),
        destination: dst.octets(),
    };

    tracing::trace!(from = ?in4.header().to_header(), to = ?header, "Rewrote the layer-3 header");

    let mut out = Vec::with_capacity(Ipv6Header::LEN + frag_len + l4.len());
    header
        .write(&mut out)
        .map_err(|_| x.drop(Stat::OutDiscards))?;

    if needs_fragment_header {
        let frag = FragmentHeader::new(
            mapped_proto,
            in4.header().fragments_offset().value(),
            in4.header().more_fragments(),
            u32::from(in4.header().identification()),
        );
        out.extend_from_slice(&frag.to_bytes());
    }

    out.extend_from_slice(&l4);

    Ok(out)
}

fn is_icmp_error(in4: &Ipv4Packet) -> bool {
    in4.protocol() == IpNumber::ICMP
        && in4.is_first_fragment()
        && in4
            .payload()
            .first()
            .is_some_and(|ty| is_icmpv4_error_type(*ty))
}

fn xlat_proto(protocol: IpNumber) -> IpNumber {
    match protocol {
        IpNumber::ICMP => IpNumber::IPV6_ICMP,
        other => other,
    }
}

fn tos(in4: &Ipv4Packet) -> u8 {
    // The second header byte is DSCP and ECN together, which is exactly the
    // IPv6 traffic class.
    in4.packet()[1]
}

/// The stateless address-resolution step, source first. Hairpinned packets
/// disable the EAM table on one side so the U-turn resolves through pool6.
fn translate_addrs_siit(
    x: &mut Xlation<'_>,
    in4: &Ipv4Packet,
    is_inner: bool,
    is_error: bool,
) -> Result<(Ipv6Addr, Ipv6Addr), Abort> {
    let siit = &x.instance.siit;
    let pool6 = x.instance.globals.pool6;
    let enable_denylist = !is_error;

    let hairpin =
        x.globals().eam_hairpin_mode == EamHairpinMode::Simple || x.intrinsic_hairpin;
    let src_eam = !disable_src_eam(in4, hairpin, is_inner, is_error);
    let dst_eam = !(hairpin && is_inner);

    let src = match siit.xlat_4to6(in4.source(), pool6.as_ref(), src_eam, enable_denylist) {
        AddrXlat::Translated { addr, .. } => addr,
        AddrXlat::TrySomethingElse if is_error => {
            let entropy = u64::from(u32::from(in4.destination()));
            siit.rfc6791_pick_v6(x.globals().randomize_rfc6791, entropy)
                .ok_or_else(|| x.accept(Stat::UntranslatableAddress))?
        }
        AddrXlat::TrySomethingElse | AddrXlat::Accept => {
            return Err(x.accept(Stat::UntranslatableAddress));
        }
    };

    let dst = match siit.xlat_4to6(in4.destination(), pool6.as_ref(), dst_eam, enable_denylist) {
        AddrXlat::Translated { addr, .. } => addr,
        AddrXlat::TrySomethingElse | AddrXlat::Accept => {
            return Err(x.accept(Stat::UntranslatableAddress));
        }
    };

    tracing::debug!(%src, %dst, "Resolved stateless addresses");
    Ok((src, dst))
}

/// On a hairpin U-turn the source was just produced by the EAM table; running
/// it back through would undo the turn. The exception is an ICMP error whose
/// reporter sits on the hairpinned path itself.
fn disable_src_eam(in4: &Ipv4Packet, hairpin: bool, is_inner: bool, is_error: bool) -> bool {
    if !hairpin || is_inner {
        return false;
    }
    if !is_error {
        return true;
    }

    let inner_dst = in4
        .payload()
        .get(8 + 16..8 + 20)
        .and_then(|b| <[u8; 4]>::try_from(b).ok());

    inner_dst.is_some_and(|dst| in4.source().octets() == dst)
}

/// Walks the IPv4 options for a loose/strict source route whose pointer has
/// not run past its length.
fn has_unexpired_source_route(options: &[u8]) -> bool {
    const IPOPT_END: u8 = 0;
    const IPOPT_NOOP: u8 = 1;
    const IPOPT_LSRR: u8 = 0x83;
    const IPOPT_SSRR: u8 = 0x89;

    let mut cursor = 0;

    while cursor < options.len() {
        match options[cursor] {
            IPOPT_END => return false,
            IPOPT_NOOP => cursor += 1,
            IPOPT_LSRR | IPOPT_SSRR => {
                let (Some(&len), Some(&ptr)) =
                    (options.get(cursor + 1), options.get(cursor + 2))
                else {
                    return false;
                };
                return len >= ptr;
            }
            _ => {
                let Some(&len) = options.get(cursor + 1) else {
                    return false;
                };
                if len < 2 {
                    return false;
                }
                cursor += usize::from(len);
            }
        }
    }

    false
}

fn build_l4(
    x: &mut Xlation<'_>,
    in4: &Ipv4Packet,
    stateful: Option<&StatefulAddrs6>,
    is_inner: bool,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    error_cap: usize,
) -> Result<Vec<u8>, Abort> {
    if !in4.is_first_fragment() {
        return Ok(in4.payload().to_vec());
    }

    let ports = stateful.and_then(|s| s.ports);

    match in4.protocol() {
        IpNumber::TCP => build_tcpudp(x, in4, stateful, ports, src, dst, is_inner, L4Kind::Tcp),
        IpNumber::UDP => build_tcpudp(x, in4, stateful, ports, src, dst, is_inner, L4Kind::Udp),
        IpNumber::ICMP => build_icmp(x, in4, stateful, is_inner, src, dst, error_cap),
        _ => Ok(in4.payload().to_vec()),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum L4Kind {
    Tcp,
    Udp,
}

fn build_tcpudp(
    x: &Xlation<'_>,
    in4: &Ipv4Packet,
    stateful: Option<&StatefulAddrs6>,
    ports: Option<(u16, u16)>,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    is_inner: bool,
    kind: L4Kind,
) -> Result<Vec<u8>, Abort> {
    let (fixed, csum_offset) = match kind {
        L4Kind::Tcp => (20, 16),
        L4Kind::Udp => (8, 6),
    };

    let payload = in4.payload();
    if payload.len() < fixed {
        tracing::debug!("Transport header is truncated");
        return Err(x.drop(Stat::InHdrErrors));
    }

    let mut out = payload.to_vec();
    if let Some((src_port, dst_port)) = ports {
        out[0..2].copy_from_slice(&src_port.to_be_bytes());
        out[2..4].copy_from_slice(&dst_port.to_be_bytes());
    }

    let old_csum = u16::from_be_bytes([payload[csum_offset], payload[csum_offset + 1]]);

    if kind == L4Kind::Udp && old_csum == 0 {
        if is_inner {
            // An unverifiable checksum nested in an ICMP error; carried as-is.
            return Ok(out);
        }

        if in4.header().more_fragments() {
            // The full datagram is unavailable; amendment is impossible.
            tracing::debug!("Zero-checksum UDP fragment");
            return Err(x.drop(Stat::ZeroUdpChecksum));
        }
        if stateful.is_none() && !x.globals().amend_udp_checksum_zero {
            tracing::debug!("Zero-checksum UDP packet and amendment is disabled");
            return Err(x.drop(Stat::ZeroUdpChecksum));
        }

        // The checksum field is mandatory on IPv6; make up for the lazy
        // IPv4 sender by computing it whole.
        let mut acc = checksum::Checksum::new();
        acc.add_pseudo_v6(&src, &dst, out.len() as u32, checksum::IP_PROTO_UDP);
        acc.add_bytes(&out);
        let csum = checksum::mangle_zero_udp(acc.to_wire());
        out[csum_offset..csum_offset + 2].copy_from_slice(&csum.to_be_bytes());

        return Ok(out);
    }

    let mut csum = checksum::update_tcpudp_4to6(
        old_csum,
        in4.source(),
        in4.destination(),
        &src,
        &dst,
        &payload[..fixed],
        &out[..fixed],
        csum_offset,
    );
    if kind == L4Kind::Udp {
        csum = checksum::mangle_zero_udp(csum);
    }
    out[csum_offset..csum_offset + 2].copy_from_slice(&csum.to_be_bytes());

    Ok(out)
}

fn build_icmp(
    x: &mut Xlation<'_>,
    in4: &Ipv4Packet,
    stateful: Option<&StatefulAddrs6>,
    is_inner: bool,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    error_cap: usize,
) -> Result<Vec<u8>, Abort> {
    let msg = in4.payload();
    let icmp = Icmpv4Slice::from_slice(msg).map_err(|_| x.drop(Stat::InHdrErrors))?;

    match icmp.icmp_type() {
        Icmpv4Type::EchoRequest(echo) | Icmpv4Type::EchoReply(echo) => {
            let ty = match icmp.icmp_type() {
                Icmpv4Type::EchoRequest(_) => icmpv6::TYPE_ECHO_REQUEST,
                _ => icmpv6::TYPE_ECHO_REPLY,
            };
            let id = match stateful.and_then(|s| s.ports) {
                Some((_, id)) => id,
                None => echo.id,
            };

            let mut out = vec![ty, 0, 0, 0, 0, 0, 0, 0];
            out[4..6].copy_from_slice(&id.to_be_bytes());
            out[6..8].copy_from_slice(&echo.seq.to_be_bytes());
            out.extend_from_slice(&msg[8..]);

            let csum = checksum::update_icmp_4to6(
                icmp.checksum(),
                &src,
                &dst,
                out.len() as u32,
                &msg[..8],
                &out[..8],
            );
            out[2..4].copy_from_slice(&csum.to_be_bytes());

            Ok(out)
        }
        error_type => {
            if is_inner {
                tracing::debug!("ICMP error inside an ICMP error");
                return Err(x.drop(Stat::UntranslatableIcmp));
            }

            build_icmp_error(x, in4, stateful, error_type, src, dst, error_cap)
        }
    }
}

fn build_icmp_error(
    x: &mut Xlation<'_>,
    in4: &Ipv4Packet,
    stateful: Option<&StatefulAddrs6>,
    icmp_type: Icmpv4Type,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    error_cap: usize,
) -> Result<Vec<u8>, Abort> {
    let msg = in4.payload();

    // A corrupted ICMPv4 error must not become a valid ICMPv6 one.
    if !checksum::verify_icmpv4(msg) {
        tracing::debug!("ICMPv4 checksum does not verify");
        return Err(x.drop(Stat::BadChecksum));
    }

    let inner =
        Ipv4Packet::parse_lax(msg[8..].to_vec()).map_err(|_| x.drop(Stat::InHdrErrors))?;

    let (ty, code, rest_of_header): (u8, u8, [u8; 4]) = match icmp_type {
        Icmpv4Type::DestinationUnreachable(header) => {
            xlat_dest_unreach(x, header, &inner, dst)?
        }
        Icmpv4Type::TimeExceeded(code) => {
            (icmpv6::TYPE_TIME_EXCEEDED, code.code_u8(), [0; 4])
        }
        Icmpv4Type::ParameterProblem(header) => {
            if matches!(header, icmpv4::ParameterProblemHeader::MissingRequiredOption) {
                tracing::debug!("Parameter problem has no ICMPv6 counterpart");
                return Err(x.drop(Stat::UntranslatableIcmp));
            }

            // Both remaining codes carry the pointer in the 5th octet.
            let pointer = xlat_param_prob_pointer(x, msg[4])?;

            (
                icmpv6::TYPE_PARAMETER_PROBLEM,
                0, // Erroneous header field encountered.
                pointer.to_be_bytes(),
            )
        }
        other => {
            tracing::debug!(?other, "ICMPv4 type has no ICMPv6 counterpart");
            return Err(x.drop(Stat::UntranslatableIcmp));
        }
    };

    let inner_stateful = stateful.map(|s| match s.inner {
        Some((inner_src, inner_dst)) => StatefulAddrs6 {
            src: inner_src.addr,
            dst: inner_dst.addr,
            ports: Some((inner_src.port, inner_dst.port)),
            inner: None,
        },
        None => StatefulAddrs6 {
            src: s.dst,
            dst: s.src,
            ports: None,
            inner: None,
        },
    });
    let inner_bytes = xlat_packet(x, &inner, inner_stateful.as_ref(), true)?;

    let mut out = vec![ty, code, 0, 0];
    out.extend_from_slice(&rest_of_header);
    out.extend_from_slice(&inner_bytes);
    out.truncate(error_cap);

    let csum = checksum::icmpv6_checksum(&src, &dst, &out);
    out[2..4].copy_from_slice(&csum.to_be_bytes());

    Ok(out)
}

fn xlat_dest_unreach(
    x: &Xlation<'_>,
    header: icmpv4::DestUnreachableHeader,
    inner: &Ipv4Packet,
    dst: Ipv6Addr,
) -> Result<(u8, u8, [u8; 4]), Abort> {
    use icmpv4::DestUnreachableHeader::*;

    let unreach = |code: u8| (icmpv6::TYPE_DST_UNREACH, code, [0u8; 4]);

    let translated = match header {
        Network | Host | SourceRouteFailed | NetworkUnknown | HostUnknown | Isolated
        | TosNetwork | TosHost => unreach(icmpv6::CODE_DST_UNREACH_NO_ROUTE),
        Protocol => {
            // Point at the IPv6 Next Header field.
            let mut rest = [0u8; 4];
            rest[3] = 6;
            (
                icmpv6::TYPE_PARAMETER_PROBLEM,
                icmpv6::CODE_PARAM_PROBLEM_UNRECOG_NEXT_HEADER,
                rest,
            )
        }
        Port => unreach(icmpv6::CODE_DST_UNREACH_PORT),
        FragmentationNeeded { next_hop_mtu } => {
            let mtu = compute_mtu(x, dst, next_hop_mtu, inner.declared_total_len())?;
            (icmpv6::TYPE_PACKET_TOO_BIG, 0, mtu.to_be_bytes())
        }
        NetworkProhibited | HostProhibited | FilterProhibited | PrecedenceCutoff => {
            unreach(icmpv6::CODE_DST_UNREACH_PROHIBITED)
        }
        HostPrecedenceViolation => {
            tracing::debug!("Unreachable code has no ICMPv6 counterpart");
            return Err(x.drop(Stat::UntranslatableIcmp));
        }
    };

    Ok(translated)
}

/// The ICMPv4 Parameter Problem pointer, renumbered for the IPv6 header.
/// Identification, Flags and Checksum have nothing to point at on the IPv6
/// side.
fn xlat_param_prob_pointer(x: &Xlation<'_>, pointer: u8) -> Result<u32, Abort> {
    let translated = match pointer {
        0 => Some(0),
        1 => Some(1),
        2 | 3 => Some(4),
        6 => Some(7),
        7 => Some(6),
        8..=11 => Some(8),
        12..=16 => Some(24),
        _ => None,
    };

    translated.ok_or_else(|| {
        tracing::debug!(pointer, "Pointer has no ICMPv6 counterpart");
        x.drop(Stat::UntranslatableIcmp)
    })
}

/// The Packet Too Big MTU, adjusted for the 20 bytes the IPv4 header gains:
/// minimum(advertised + 20, next hop, incoming device + 20), floored at the
/// IPv6 minimum. A zero `advertised` means the reporting router predates
/// RFC 1191; the plateau table then guesses from the dropped packet's size.
fn compute_mtu(
    x: &Xlation<'_>,
    dst: Ipv6Addr,
    advertised: u16,
    inner_total_len: usize,
) -> Result<u32, Abort> {
    let out_mtu = x
        .route
        .mtu_to_v6(dst)
        .ok_or_else(|| x.drop(Stat::FailedRoute))?;

    let advertised = if advertised == 0 {
        x.globals()
            .mtu_plateaus
            .iter()
            .copied()
            .find(|plateau| usize::from(*plateau) < inner_total_len)
            .map(u32::from)
            .unwrap_or(0)
    } else {
        u32::from(advertised)
    };

    let result = (advertised.saturating_add(20))
        .min(out_mtu)
        .min(x.in_dev_mtu.saturating_add(20))
        .max(IPV6_MIN_MTU as u32);

    tracing::debug!(advertised, out_mtu, in_mtu = x.in_dev_mtu, result, "Computed path MTU");

    Ok(result)
}
