//! The IPv6→IPv4 translator (RFC 7915 sections 5.1 through 5.3).
//!
//! Output is a freshly allocated buffer; the input is never modified. All
//! verdicts propagate through `Result<_, Abort>`.

use crate::addr_xlat::AddrXlat;
use crate::pipeline::{StatefulAddrs4, Xlation};
use crate::verdict::{Abort, IcmpError, Stat};
use std::net::Ipv4Addr;
use xlat_packet::checksum;
use xlat_packet::etherparse::{
    Icmpv6Slice, Icmpv6Type, IpFragOffset, IpNumber, Ipv4Dscp, Ipv4Ecn, Ipv4Header, Ipv4Options,
    icmpv4, icmpv6,
};
use xlat_packet::{Ipv4Packet, Ipv6Packet, is_icmpv6_error_type};

/// An ICMPv4 error payload must not push the packet past 576 bytes
/// (RFC 1812 section 4.3.2.3).
const MAX_ICMP4_ERROR_LEN: usize = 576;

pub(crate) fn translate(
    x: &mut Xlation<'_>,
    in6: &Ipv6Packet,
    stateful: Option<&StatefulAddrs4>,
) -> Result<Ipv4Packet, Abort> {
    let bytes = xlat_packet(x, in6, stateful, false)?;

    debug_assert!(bytes.len() >= Ipv4Header::MIN_LEN);
    Ipv4Packet::parse(bytes).map_err(|_| x.drop(Stat::InHdrErrors))
}

fn xlat_packet(
    x: &mut Xlation<'_>,
    in6: &Ipv6Packet,
    stateful: Option<&StatefulAddrs4>,
    is_inner: bool,
) -> Result<Vec<u8>, Abort> {
    let is_error = is_icmp_error(in6);

    let (src, dst) = match stateful {
        Some(addrs) => (addrs.src, addrs.dst),
        None => translate_addrs_siit(x, in6, is_inner, is_error)?,
    };

    let ttl = if is_inner {
        in6.header().hop_limit()
    } else {
        let hop_limit = in6.header().hop_limit();
        if hop_limit <= 1 {
            tracing::debug!("Hop limit ran out");
            return Err(x.untranslatable(Stat::TtlExpired, IcmpError::TtlExpired));
        }
        hop_limit - 1
    };

    if !is_inner {
        if let Some((offset, segments_left)) = in6.ext().segments_left {
            if segments_left != 0 {
                tracing::debug!("Packet's Segments Left field is nonzero");
                return Err(x.untranslatable(
                    Stat::SegmentsLeft,
                    IcmpError::HeaderField {
                        pointer: offset as u32,
                    },
                ));
            }
        }
    }

    let l4 = build_l4(x, in6, stateful, is_inner, src, dst)?;

    let out_len = Ipv4Header::MIN_LEN + l4.len();
    let total_len = if is_inner {
        // Preserve the length of the original (possibly truncated) packet.
        (in6.declared_total_len() - in6.ext().l4_offset + Ipv4Header::MIN_LEN) as u16
    } else {
        out_len as u16
    };

    let tos = if x.globals().reset_tos {
        x.globals().new_tos
    } else {
        in6.header().traffic_class()
    };

    let mut header = Ipv4Header {
        options: Ipv4Options::default(),
        dscp: Ipv4Dscp::try_new(tos >> 2).unwrap_or(Ipv4Dscp::ZERO),
        ecn: Ipv4Ecn::try_new(tos & 0b11).unwrap_or_default(),
        total_len,
        identification: 0,
        more_fragments: false,
        dont_fragment: false,
        fragment_offset: IpFragOffset::ZERO,
        time_to_live: ttl,
        protocol: xlat_proto(in6.upper_protocol()),
        header_checksum: 0,
        source: src.octets(),
        destination: dst.octets(),
    };

    match in6.fragment_header() {
        Some(frag) => {
            header.identification = frag.identification as u16;
            header.more_fragments = frag.more_fragments;
            header.fragment_offset =
                IpFragOffset::try_new(frag.fragment_offset).unwrap_or(IpFragOffset::ZERO);
        }
        None => {
            header.dont_fragment = x.globals().df_always_on || out_len > 1260;
            if x.globals().build_ipv4_id && out_len <= 1260 {
                header.identification = rand::random();
            }
        }
    }

    header.header_checksum = header.calc_header_checksum();

    tracing::trace!(from = ?in6.header().to_header(), to = ?header, "Rewrote the layer-3 header");

    let mut out = Vec::with_capacity(out_len);
    header
        .write(&mut out)
        .map_err(|_| x.drop(Stat::OutDiscards))?;
    out.extend_from_slice(&l4);

    Ok(out)
}

fn is_icmp_error(in6: &Ipv6Packet) -> bool {
    in6.upper_protocol() == IpNumber::IPV6_ICMP
        && in6.is_first_fragment()
        && in6
            .payload()
            .first()
            .is_some_and(|ty| is_icmpv6_error_type(*ty))
}

/// RFC 7915 section 5.1: ICMPv6 becomes ICMPv4, everything else is carried
/// over verbatim.
fn xlat_proto(upper: IpNumber) -> IpNumber {
    match upper {
        IpNumber::IPV6_ICMP => IpNumber::ICMP,
        other => other,
    }
}

/// The stateless address-resolution step, destination first (the source's
/// RFC 6791 substitute is only acceptable once the destination resolved).
fn translate_addrs_siit(
    x: &mut Xlation<'_>,
    in6: &Ipv6Packet,
    is_inner: bool,
    is_error: bool,
) -> Result<(Ipv4Addr, Ipv4Addr), Abort> {
    let siit = &x.instance.siit;
    let pool6 = x.instance.globals.pool6;
    let enable_denylist = !is_error;

    let (dst, dst_was_6052) =
        match siit.xlat_6to4(in6.destination(), pool6.as_ref(), true, enable_denylist) {
            AddrXlat::Translated { addr, was_6052 } => (addr, was_6052),
            AddrXlat::TrySomethingElse | AddrXlat::Accept => {
                return Err(x.accept(Stat::UntranslatableAddress));
            }
        };

    let (src, src_was_6052) =
        match siit.xlat_6to4(in6.source(), pool6.as_ref(), true, enable_denylist) {
            AddrXlat::Translated { addr, was_6052 } => (addr, was_6052),
            AddrXlat::TrySomethingElse if is_error => {
                let entropy = u64::from(u32::from(dst));
                let addr = siit
                    .rfc6791_pick_v4(x.globals().randomize_rfc6791, entropy)
                    .ok_or_else(|| x.accept(Stat::UntranslatableAddress))?;
                (addr, false)
            }
            AddrXlat::TrySomethingElse | AddrXlat::Accept => {
                return Err(x.accept(Stat::UntranslatableAddress));
            }
        };

    // Intrinsic hairpinning is flagged here since this is the only place
    // that knows whether RFC 6052 was involved.
    if x.globals().eam_hairpin_mode == crate::config::EamHairpinMode::Intrinsic {
        let eamt = &siit.eamt;
        if !is_inner && !is_error && dst_was_6052 && eamt.contains4(dst) {
            x.mark_hairpin = true;
        } else if is_inner && src_was_6052 && eamt.contains4(src) {
            x.mark_hairpin = true;
        }
    }

    tracing::debug!(%src, %dst, "Resolved stateless addresses");
    Ok((src, dst))
}

fn build_l4(
    x: &mut Xlation<'_>,
    in6: &Ipv6Packet,
    stateful: Option<&StatefulAddrs4>,
    is_inner: bool,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<Vec<u8>, Abort> {
    if !in6.is_first_fragment() {
        // Later fragments carry no transport header; layer 3 only.
        return Ok(in6.payload().to_vec());
    }

    let ports = stateful.and_then(|s| s.ports);

    match in6.upper_protocol() {
        IpNumber::TCP => build_tcpudp(x, in6, ports, src, dst, L4Kind::Tcp),
        IpNumber::UDP => build_tcpudp(x, in6, ports, src, dst, L4Kind::Udp),
        IpNumber::IPV6_ICMP => build_icmp(x, in6, stateful, is_inner, dst),
        _ => Ok(in6.payload().to_vec()),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum L4Kind {
    Tcp,
    Udp,
}

fn build_tcpudp(
    x: &Xlation<'_>,
    in6: &Ipv6Packet,
    ports: Option<(u16, u16)>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    kind: L4Kind,
) -> Result<Vec<u8>, Abort> {
    let (fixed, csum_offset) = match kind {
        L4Kind::Tcp => (20, 16),
        L4Kind::Udp => (8, 6),
    };

    let payload = in6.payload();
    if payload.len() < fixed {
        tracing::debug!("Transport header is truncated");
        return Err(x.drop(Stat::InHdrErrors));
    }

    let old_csum = u16::from_be_bytes([payload[csum_offset], payload[csum_offset + 1]]);
    if kind == L4Kind::Udp && old_csum == 0 {
        // The checksum is not optional on IPv6.
        tracing::debug!("IPv6 UDP packet carries no checksum");
        return Err(x.drop(Stat::BadChecksum));
    }

    let mut out = payload.to_vec();
    if let Some((src_port, dst_port)) = ports {
        out[0..2].copy_from_slice(&src_port.to_be_bytes());
        out[2..4].copy_from_slice(&dst_port.to_be_bytes());
    }

    let mut csum = checksum::update_tcpudp_6to4(
        old_csum,
        &in6.source(),
        &in6.destination(),
        src,
        dst,
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
    in6: &Ipv6Packet,
    stateful: Option<&StatefulAddrs4>,
    is_inner: bool,
    dst: Ipv4Addr,
) -> Result<Vec<u8>, Abort> {
    let msg = in6.payload();
    let icmp = Icmpv6Slice::from_slice(msg).map_err(|_| x.drop(Stat::InHdrErrors))?;

    match icmp.icmp_type() {
        Icmpv6Type::EchoRequest(echo) | Icmpv6Type::EchoReply(echo) => {
            let ty = match icmp.icmp_type() {
                Icmpv6Type::EchoRequest(_) => icmpv4::TYPE_ECHO_REQUEST,
                _ => icmpv4::TYPE_ECHO_REPLY,
            };
            let id = match stateful.and_then(|s| s.ports) {
                Some((id, _)) => id,
                None => echo.id,
            };

            let mut out = vec![ty, 0, 0, 0, 0, 0, 0, 0];
            out[4..6].copy_from_slice(&id.to_be_bytes());
            out[6..8].copy_from_slice(&echo.seq.to_be_bytes());
            out.extend_from_slice(&msg[8..]);

            let csum = checksum::update_icmp_6to4(
                icmp.checksum(),
                &in6.source(),
                &in6.destination(),
                msg.len() as u32,
                &msg[..8],
                &out[..8],
            );
            out[2..4].copy_from_slice(&csum.to_be_bytes());

            Ok(out)
        }
        error_type => {
            if is_inner {
                // Never translate an error nested inside another error.
                tracing::debug!("ICMP error inside an ICMP error");
                return Err(x.drop(Stat::UntranslatableIcmp));
            }

            build_icmp_error(x, in6, stateful, error_type, dst)
        }
    }
}

fn build_icmp_error(
    x: &mut Xlation<'_>,
    in6: &Ipv6Packet,
    stateful: Option<&StatefulAddrs4>,
    icmp_type: Icmpv6Type,
    dst: Ipv4Addr,
) -> Result<Vec<u8>, Abort> {
    let msg = in6.payload();

    // A corrupted ICMPv6 error must not become a valid ICMPv4 one.
    if !checksum::verify_icmpv6(&in6.source(), &in6.destination(), msg) {
        tracing::debug!("ICMPv6 checksum does not verify");
        return Err(x.drop(Stat::BadChecksum));
    }

    let (ty, code, rest_of_header): (u8, u8, [u8; 4]) = match icmp_type {
        Icmpv6Type::DestinationUnreachable(code) => (
            icmpv4::TYPE_DEST_UNREACH,
            xlat_dest_unreach_code(x, code)?,
            [0; 4],
        ),
        Icmpv6Type::PacketTooBig { mtu } => {
            let mtu = compute_mtu(x, dst, mtu)?;

            let mut rest = [0; 4];
            rest[2..4].copy_from_slice(&mtu.to_be_bytes());
            (icmpv4::TYPE_DEST_UNREACH, icmpv4::CODE_DST_UNREACH_NEED_FRAG, rest)
        }
        Icmpv6Type::TimeExceeded(code) => (icmpv4::TYPE_TIME_EXCEEDED, code.code_u8(), [0; 4]),
        Icmpv6Type::ParameterProblem(header) => match header.code {
            icmpv6::ParameterProblemCode::ErroneousHeaderField => {
                let pointer = xlat_param_prob_pointer(x, header.pointer)?;
                (icmpv4::TYPE_PARAMETER_PROBLEM, 0, [pointer, 0, 0, 0])
            }
            icmpv6::ParameterProblemCode::UnrecognizedNextHeader => (
                icmpv4::TYPE_DEST_UNREACH,
                icmpv4::CODE_DST_UNREACH_PROTOCOL,
                [0; 4],
            ),
            _ => {
                tracing::debug!(code = ?header.code, "Parameter problem has no ICMPv4 counterpart");
                return Err(x.drop(Stat::UntranslatableIcmp));
            }
        },
        other => {
            tracing::debug!(?other, "ICMPv6 type has no ICMPv4 counterpart");
            return Err(x.drop(Stat::UntranslatableIcmp));
        }
    };

    let inner =
        Ipv6Packet::parse_lax(msg[8..].to_vec()).map_err(|_| x.drop(Stat::InHdrErrors))?;
    let inner_stateful = stateful.map(|s| match s.inner {
        Some((inner_src, inner_dst)) => StatefulAddrs4 {
            src: inner_src.addr,
            dst: inner_dst.addr,
            ports: Some((inner_src.port, inner_dst.port)),
            inner: None,
        },
        None => StatefulAddrs4 {
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
    out.truncate(MAX_ICMP4_ERROR_LEN - Ipv4Header::MIN_LEN);

    let csum = checksum::icmpv4_checksum(&out);
    out[2..4].copy_from_slice(&csum.to_be_bytes());

    Ok(out)
}

fn xlat_dest_unreach_code(
    x: &Xlation<'_>,
    code: icmpv6::DestUnreachableCode,
) -> Result<u8, Abort> {
    use icmpv6::DestUnreachableCode::*;

    let code = match code {
        NoRoute | BeyondScope | Address => icmpv4::CODE_DST_UNREACH_HOST,
        Prohibited => icmpv4::CODE_DST_UNREACH_HOST_PROHIB,
        Port => icmpv4::CODE_DST_UNREACH_PORT,
        SourceAddressFailedPolicy | RejectRoute => {
            tracing::debug!(?code, "Unreachable code has no ICMPv4 counterpart");
            return Err(x.drop(Stat::UntranslatableIcmp));
        }
    };

    Ok(code)
}

/// RFC 7915 figure 6: the ICMPv6 Parameter Problem pointer, renumbered for
/// the IPv4 header.
fn xlat_param_prob_pointer(x: &Xlation<'_>, pointer: u32) -> Result<u8, Abort> {
    let translated = match pointer {
        0 => Some(0),
        1 => Some(1),
        4 | 5 => Some(2),
        6 => Some(9),
        7 => Some(8),
        8..24 => Some(12),
        24..40 => Some(16),
        _ => None,
    };

    translated.ok_or_else(|| {
        tracing::debug!(pointer, "Pointer has no ICMPv4 counterpart");
        x.drop(Stat::UntranslatableIcmp)
    })
}

/// The Packet Too Big MTU, adjusted for the 20 bytes the IPv6 header loses:
/// minimum(advertised − 20, next hop, incoming device − 20).
fn compute_mtu(x: &Xlation<'_>, dst: Ipv4Addr, advertised: u32) -> Result<u16, Abort> {
    let out_mtu = x
        .route
        .mtu_to_v4(dst)
        .ok_or_else(|| x.drop(Stat::FailedRoute))?;

    let result = advertised
        .saturating_sub(20)
        .min(out_mtu)
        .min(x.in_dev_mtu.saturating_sub(20));

    tracing::debug!(advertised, out_mtu, in_mtu = x.in_dev_mtu, result, "Computed path MTU");

    Ok(result.min(u32::from(u16::MAX)) as u16)
}
