//! Factory module for making all kinds of packets.
//!
//! Only meant for tests; production input arrives from the wire.

use crate::{FragmentHeader, IpPacket};
use etherparse::{
    Icmpv4Type, Icmpv6Type, IpNumber, Ipv4HeaderSlice, Ipv6FlowLabel, Ipv6Header, PacketBuilder,
};
use std::net::{IpAddr, Ipv6Addr};

/// Helper macro to turn a [`PacketBuilder`] into an [`IpPacket`].
#[macro_export]
macro_rules! build {
    ($packet:expr, $payload:expr) => {{
        let mut buf = Vec::new();

        $packet
            .write(&mut buf, $payload)
            .expect("Buffer should be big enough");

        $crate::IpPacket::parse(buf).expect("Should be a valid IP packet")
    }};
}

pub fn icmp_request_packet(
    src: IpAddr,
    dst: impl Into<IpAddr>,
    seq: u16,
    identifier: u16,
    payload: &[u8],
) -> Result<IpPacket, IpVersionMismatch> {
    match (src, dst.into()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
                .icmpv4_echo_request(identifier, seq);

            Ok(build!(packet, payload))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet = PacketBuilder::ipv6(src.octets(), dst.octets(), 64)
                .icmpv6_echo_request(identifier, seq);

            Ok(build!(packet, payload))
        }
        _ => Err(IpVersionMismatch),
    }
}

pub fn icmp_reply_packet(
    src: IpAddr,
    dst: impl Into<IpAddr>,
    seq: u16,
    identifier: u16,
    payload: &[u8],
) -> Result<IpPacket, IpVersionMismatch> {
    match (src, dst.into()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
                .icmpv4_echo_reply(identifier, seq);

            Ok(build!(packet, payload))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet = PacketBuilder::ipv6(src.octets(), dst.octets(), 64)
                .icmpv6_echo_reply(identifier, seq);

            Ok(build!(packet, payload))
        }
        _ => Err(IpVersionMismatch),
    }
}

pub fn udp_packet<IP>(
    saddr: IP,
    daddr: IP,
    sport: u16,
    dport: u16,
    payload: Vec<u8>,
) -> Result<IpPacket, IpVersionMismatch>
where
    IP: Into<IpAddr>,
{
    match (saddr.into(), daddr.into()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).udp(sport, dport);

            Ok(build!(packet, &payload))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet = PacketBuilder::ipv6(src.octets(), dst.octets(), 64).udp(sport, dport);

            Ok(build!(packet, &payload))
        }
        _ => Err(IpVersionMismatch),
    }
}

pub fn tcp_packet<IP>(
    saddr: IP,
    daddr: IP,
    sport: u16,
    dport: u16,
    payload: Vec<u8>,
) -> Result<IpPacket, IpVersionMismatch>
where
    IP: Into<IpAddr>,
{
    match (saddr.into(), daddr.into()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet =
                PacketBuilder::ipv4(src.octets(), dst.octets(), 64).tcp(sport, dport, 0, 128);

            Ok(build!(packet, &payload))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet =
                PacketBuilder::ipv6(src.octets(), dst.octets(), 64).tcp(sport, dport, 0, 128);

            Ok(build!(packet, &payload))
        }
        _ => Err(IpVersionMismatch),
    }
}

/// TCP flags relevant to connection tracking.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

pub fn tcp_packet_with_flags<IP>(
    saddr: IP,
    daddr: IP,
    sport: u16,
    dport: u16,
    flags: TcpFlags,
) -> Result<IpPacket, IpVersionMismatch>
where
    IP: Into<IpAddr>,
{
    macro_rules! apply_flags {
        ($step:expr) => {{
            let mut step = $step;
            if flags.syn {
                step = step.syn();
            }
            if flags.fin {
                step = step.fin();
            }
            if flags.rst {
                step = step.rst();
            }
            step
        }};
    }

    match (saddr.into(), daddr.into()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let packet = apply_flags!(
                PacketBuilder::ipv4(src.octets(), dst.octets(), 64).tcp(sport, dport, 0, 128)
            );

            Ok(build!(packet, &[]))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let packet = apply_flags!(
                PacketBuilder::ipv6(src.octets(), dst.octets(), 64).tcp(sport, dport, 0, 128)
            );

            Ok(build!(packet, &[]))
        }
        _ => Err(IpVersionMismatch),
    }
}

pub fn icmpv4_packet(
    src: std::net::Ipv4Addr,
    dst: std::net::Ipv4Addr,
    icmp_type: Icmpv4Type,
    payload: &[u8],
) -> IpPacket {
    let packet = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).icmpv4(icmp_type);

    build!(packet, payload)
}

pub fn icmpv6_packet(src: Ipv6Addr, dst: Ipv6Addr, icmp_type: Icmpv6Type, payload: &[u8]) -> IpPacket {
    let packet = PacketBuilder::ipv6(src.octets(), dst.octets(), 64).icmpv6(icmp_type);

    build!(packet, payload)
}

/// Hand-assembles an IPv6 packet carrying a fragment header.
///
/// `offset` is in 8-byte units. For a first fragment, `l4` bytes must start
/// with the UDP header; for later fragments they are raw payload.
pub fn v6_fragment_udp_packet(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    id: u32,
    offset: u16,
    more_fragments: bool,
    l4: &[u8],
) -> IpPacket {
    let frag = FragmentHeader::new(IpNumber::UDP, offset, more_fragments, id);

    let header = Ipv6Header {
        traffic_class: 0,
        flow_label: Ipv6FlowLabel::ZERO,
        payload_length: (crate::FRAGMENT_HEADER_LEN + l4.len()) as u16,
        next_header: IpNumber::IPV6_FRAGMENTATION_HEADER,
        hop_limit: 64,
        source: src.octets(),
        destination: dst.octets(),
    };

    let mut buf = Vec::with_capacity(Ipv6Header::LEN + crate::FRAGMENT_HEADER_LEN + l4.len());
    header.write(&mut buf).expect("Vec writes cannot fail");
    buf.extend_from_slice(&frag.to_bytes());
    buf.extend_from_slice(l4);

    IpPacket::parse(buf).expect("Should be a valid IP packet")
}

/// Rewrites the fragmentation-related IPv4 header fields of `packet` and
/// fixes up the header checksum.
pub fn patch_ipv4_fragmentation(
    packet: IpPacket,
    id: u16,
    offset: u16,
    more_fragments: bool,
    dont_fragment: bool,
) -> IpPacket {
    let IpPacket::Ipv4(mut packet) = packet else {
        panic!("patch_ipv4_fragmentation requires an IPv4 packet");
    };

    debug_assert!(offset <= 0x1fff, "fragment offset is a 13-bit field");

    let buf = packet.packet_mut();
    buf[4..6].copy_from_slice(&id.to_be_bytes());

    let mut flags_and_offset = offset;
    if dont_fragment {
        flags_and_offset |= 0x4000;
    }
    if more_fragments {
        flags_and_offset |= 0x2000;
    }
    buf[6..8].copy_from_slice(&flags_and_offset.to_be_bytes());

    let checksum = Ipv4HeaderSlice::from_slice(buf)
        .expect("packet was valid before the patch")
        .to_header()
        .calc_header_checksum();
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());

    IpPacket::Ipv4(packet)
}

#[derive(thiserror::Error, Debug)]
#[error("IPs must be of the same version")]
pub struct IpVersionMismatch;
