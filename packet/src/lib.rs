//! Owned, validated views over raw IPv4/IPv6 packets.
//!
//! A translator rewrites layer-3 headers wholesale, so the views here own
//! their buffer (`Vec<u8>`) and hand out `etherparse` slices on demand.
//! Construction validates the layer-3 header once; accessors thereafter can
//! rely on it.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod checksum;
pub mod make;

mod ext;
mod fragment;

pub use etherparse;
pub use ext::ExtChain;
pub use fragment::{FRAGMENT_HEADER_LEN, FragmentHeader};

use anyhow::{Context as _, Result, bail, ensure};
use etherparse::{
    Icmpv4Slice, Icmpv4Type, Icmpv6Slice, Icmpv6Type, IpNumber, Ipv4Header, Ipv4HeaderSlice,
    Ipv6Header, Ipv6HeaderSlice, TcpSlice, UdpSlice, icmpv4,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

macro_rules! for_both {
    ($this:ident, |$name:ident| $body:expr) => {
        match $this {
            Self::Ipv4($name) => $body,
            Self::Ipv6($name) => $body,
        }
    };
}

/// A transport-layer selector: the port for TCP/UDP, the echo identifier
/// for ICMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// Contains either the source or destination port.
    Tcp(u16),
    /// Contains either the source or destination port.
    Udp(u16),
    /// Contains the `identifier` of the ICMP packet.
    Icmp(u16),
}

impl Protocol {
    pub fn value(&self) -> u16 {
        match self {
            Protocol::Tcp(v) | Protocol::Udp(v) | Protocol::Icmp(v) => *v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPacket {
    Ipv4(Ipv4Packet),
    Ipv6(Ipv6Packet),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    buf: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Packet {
    buf: Vec<u8>,
    ext: ExtChain,
}

impl Ipv4Packet {
    /// Validates `buf` as an IPv4 packet. Link-layer padding past Total
    /// Length is cut off; a buffer shorter than Total Length is an error.
    pub fn parse(mut buf: Vec<u8>) -> Result<Self> {
        let header = Ipv4HeaderSlice::from_slice(&buf).context("Invalid IPv4 packet")?;
        let total_len = usize::from(header.total_len());

        ensure!(
            total_len >= usize::from(header.ihl()) * 4,
            "Total Length smaller than the header"
        );
        ensure!(buf.len() >= total_len, "Buffer shorter than Total Length");
        buf.truncate(total_len);

        Ok(Self { buf })
    }

    /// Parses a possibly-truncated packet, as found in the payload of an
    /// ICMP error. The header must be complete; the L4 region may be cut
    /// short of the declared Total Length.
    pub fn parse_lax(mut buf: Vec<u8>) -> Result<Self> {
        let header = Ipv4HeaderSlice::from_slice(&buf).context("Invalid IPv4 packet")?;
        let total_len = usize::from(header.total_len());

        ensure!(
            total_len >= usize::from(header.ihl()) * 4,
            "Total Length smaller than the header"
        );
        buf.truncate(total_len.min(buf.len()));

        Ok(Self { buf })
    }

    /// The Total Length the header declares, which a truncated buffer may
    /// not actually contain.
    pub fn declared_total_len(&self) -> usize {
        usize::from(self.header().total_len())
    }

    pub fn header(&self) -> Ipv4HeaderSlice<'_> {
        Ipv4HeaderSlice::from_slice(&self.buf).expect("validated in `parse`")
    }

    pub fn source(&self) -> Ipv4Addr {
        self.header().source_addr()
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.header().destination_addr()
    }

    pub fn protocol(&self) -> IpNumber {
        self.header().protocol()
    }

    pub fn header_len(&self) -> usize {
        usize::from(self.header().ihl()) * 4
    }

    /// The IPv4 options bytes, possibly empty.
    pub fn options(&self) -> &[u8] {
        &self.buf[Ipv4Header::MIN_LEN..self.header_len()]
    }

    pub fn is_fragment(&self) -> bool {
        self.header().is_fragmenting_payload()
    }

    pub fn is_first_fragment(&self) -> bool {
        self.header().fragments_offset().value() == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header_len()..]
    }

    pub fn packet(&self) -> &[u8] {
        &self.buf
    }

    pub fn packet_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Ipv6Packet {
    /// Validates `buf` as an IPv6 packet and walks its extension chain.
    /// Link-layer padding past Payload Length is cut off.
    pub fn parse(mut buf: Vec<u8>) -> Result<Self> {
        let header = Ipv6HeaderSlice::from_slice(&buf).context("Invalid IPv6 packet")?;
        let total_len = Ipv6Header::LEN + usize::from(header.payload_length());
        let next_header = header.next_header();

        ensure!(buf.len() >= total_len, "Buffer shorter than Payload Length");
        buf.truncate(total_len);

        let ext = ExtChain::walk(&buf, next_header)?;

        Ok(Self { buf, ext })
    }

    /// Parses a possibly-truncated packet, as found in the payload of an
    /// ICMP error. The fixed header and extension chain must be complete;
    /// the L4 region may be cut short of the declared Payload Length.
    pub fn parse_lax(mut buf: Vec<u8>) -> Result<Self> {
        let header = Ipv6HeaderSlice::from_slice(&buf).context("Invalid IPv6 packet")?;
        let total_len = Ipv6Header::LEN + usize::from(header.payload_length());
        let next_header = header.next_header();

        buf.truncate(total_len.min(buf.len()));

        let ext = ExtChain::walk(&buf, next_header)?;

        Ok(Self { buf, ext })
    }

    /// The full length the header declares, which a truncated buffer may not
    /// actually contain.
    pub fn declared_total_len(&self) -> usize {
        Ipv6Header::LEN + usize::from(self.header().payload_length())
    }

    pub fn header(&self) -> Ipv6HeaderSlice<'_> {
        Ipv6HeaderSlice::from_slice(&self.buf).expect("validated in `parse`")
    }

    pub fn source(&self) -> Ipv6Addr {
        self.header().source_addr()
    }

    pub fn destination(&self) -> Ipv6Addr {
        self.header().destination_addr()
    }

    pub fn ext(&self) -> &ExtChain {
        &self.ext
    }

    /// The upper-layer protocol at the end of the extension chain.
    pub fn upper_protocol(&self) -> IpNumber {
        self.ext.l4_protocol
    }

    pub fn fragment_header(&self) -> Option<FragmentHeader> {
        self.ext.fragment.map(|(_, hdr)| hdr)
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_header()
            .is_some_and(|f| !f.is_first() || f.more_fragments)
    }

    pub fn is_first_fragment(&self) -> bool {
        self.fragment_header().is_none_or(|f| f.is_first())
    }

    /// The bytes after the last extension header.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.ext.l4_offset..]
    }

    pub fn packet(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl IpPacket {
    pub fn parse(buf: Vec<u8>) -> Result<Self> {
        match buf.first().map(|b| b >> 4) {
            Some(4) => Ok(IpPacket::Ipv4(Ipv4Packet::parse(buf)?)),
            Some(6) => Ok(IpPacket::Ipv6(Ipv6Packet::parse(buf)?)),
            Some(v) => bail!("Invalid IP version: {v}"),
            None => bail!("Empty buffer"),
        }
    }

    pub fn source(&self) -> IpAddr {
        for_both!(self, |p| p.source().into())
    }

    pub fn destination(&self) -> IpAddr {
        for_both!(self, |p| p.destination().into())
    }

    /// The upper-layer protocol: past the extension chain for IPv6, the
    /// Protocol field for IPv4.
    pub fn next_header(&self) -> IpNumber {
        match self {
            Self::Ipv4(p) => p.protocol(),
            Self::Ipv6(p) => p.upper_protocol(),
        }
    }

    pub fn is_fragment(&self) -> bool {
        for_both!(self, |p| p.is_fragment())
    }

    pub fn is_first_fragment(&self) -> bool {
        for_both!(self, |p| p.is_first_fragment())
    }

    pub fn is_udp(&self) -> bool {
        self.next_header() == IpNumber::UDP
    }

    pub fn is_tcp(&self) -> bool {
        self.next_header() == IpNumber::TCP
    }

    pub fn is_icmpv4(&self) -> bool {
        self.next_header() == IpNumber::ICMP
    }

    pub fn is_icmpv6(&self) -> bool {
        self.next_header() == IpNumber::IPV6_ICMP
    }

    /// The transport region (L4 header plus payload). For a non-first
    /// fragment this is a middle slice of some other packet's payload.
    pub fn payload(&self) -> &[u8] {
        for_both!(self, |p| p.payload())
    }

    pub fn packet(&self) -> &[u8] {
        for_both!(self, |p| p.packet())
    }

    pub fn as_udp(&self) -> Option<UdpSlice<'_>> {
        if !self.is_udp() || !self.is_first_fragment() {
            return None;
        }

        UdpSlice::from_slice(self.payload()).ok()
    }

    pub fn as_tcp(&self) -> Option<TcpSlice<'_>> {
        if !self.is_tcp() || !self.is_first_fragment() {
            return None;
        }

        TcpSlice::from_slice(self.payload()).ok()
    }

    pub fn as_icmpv4(&self) -> Option<Icmpv4Slice<'_>> {
        if !self.is_icmpv4() || !self.is_first_fragment() {
            return None;
        }

        Icmpv4Slice::from_slice(self.payload()).ok()
    }

    pub fn as_icmpv6(&self) -> Option<Icmpv6Slice<'_>> {
        if !self.is_icmpv6() || !self.is_first_fragment() {
            return None;
        }

        Icmpv6Slice::from_slice(self.payload()).ok()
    }

    /// Whether the packet is an ICMP error message (of either family).
    pub fn is_icmp_error(&self) -> bool {
        if self.is_icmpv4() {
            return self
                .payload()
                .first()
                .is_some_and(|ty| is_icmpv4_error_type(*ty));
        }

        if self.is_icmpv6() {
            return self
                .payload()
                .first()
                .is_some_and(|ty| is_icmpv6_error_type(*ty));
        }

        false
    }

    pub fn source_protocol(&self) -> Result<Protocol, UnsupportedProtocol> {
        self.protocol_with(|tcp| tcp.source_port(), |udp| udp.source_port())
    }

    pub fn destination_protocol(&self) -> Result<Protocol, UnsupportedProtocol> {
        self.protocol_with(|tcp| tcp.destination_port(), |udp| udp.destination_port())
    }

    fn protocol_with(
        &self,
        tcp_port: impl Fn(&TcpSlice<'_>) -> u16,
        udp_port: impl Fn(&UdpSlice<'_>) -> u16,
    ) -> Result<Protocol, UnsupportedProtocol> {
        if !self.is_first_fragment() {
            return Err(UnsupportedProtocol::NotFirstFragment);
        }

        if self.is_tcp() {
            let tcp = self
                .as_tcp()
                .ok_or(UnsupportedProtocol::TruncatedTransportHeader)?;
            return Ok(Protocol::Tcp(tcp_port(&tcp)));
        }

        if self.is_udp() {
            let udp = self
                .as_udp()
                .ok_or(UnsupportedProtocol::TruncatedTransportHeader)?;
            return Ok(Protocol::Udp(udp_port(&udp)));
        }

        if self.is_icmpv4() {
            let icmp = self
                .as_icmpv4()
                .ok_or(UnsupportedProtocol::TruncatedTransportHeader)?;
            let id = icmpv4_echo_header(&icmp)
                .ok_or_else(|| UnsupportedProtocol::UnsupportedIcmpv4Type(icmp.icmp_type()))?
                .id;
            return Ok(Protocol::Icmp(id));
        }

        if self.is_icmpv6() {
            let icmp = self
                .as_icmpv6()
                .ok_or(UnsupportedProtocol::TruncatedTransportHeader)?;
            let id = icmpv6_echo_header(&icmp)
                .ok_or_else(|| UnsupportedProtocol::UnsupportedIcmpv6Type(icmp.icmp_type()))?
                .id;
            return Ok(Protocol::Icmp(id));
        }

        Err(UnsupportedProtocol::UnsupportedIpPayload(self.next_header()))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        for_both!(self, |p| p.into_bytes())
    }
}

fn icmpv4_echo_header(slice: &Icmpv4Slice<'_>) -> Option<etherparse::IcmpEchoHeader> {
    use Icmpv4Type::*;

    let (EchoReply(header) | EchoRequest(header)) = slice.icmp_type() else {
        return None;
    };

    Some(header)
}

fn icmpv6_echo_header(slice: &Icmpv6Slice<'_>) -> Option<etherparse::IcmpEchoHeader> {
    use Icmpv6Type::*;

    let (EchoReply(header) | EchoRequest(header)) = slice.icmp_type() else {
        return None;
    };

    Some(header)
}

pub fn is_icmpv4_error_type(ty: u8) -> bool {
    matches!(
        ty,
        icmpv4::TYPE_DEST_UNREACH
            | icmpv4::TYPE_SOURCE_QUENCH
            | icmpv4::TYPE_REDIRECT
            | icmpv4::TYPE_TIME_EXCEEDED
            | icmpv4::TYPE_PARAMETER_PROBLEM
    )
}

pub fn is_icmpv6_error_type(ty: u8) -> bool {
    // High-bit-clear types are errors by ICMPv6's numbering plan.
    ty & 0x80 == 0
}

#[derive(Debug, thiserror::Error)]
pub enum UnsupportedProtocol {
    #[error("Unsupported IP protocol: {0:?}")]
    UnsupportedIpPayload(IpNumber),
    #[error("Unsupported ICMPv4 type: {0:?}")]
    UnsupportedIcmpv4Type(Icmpv4Type),
    #[error("Unsupported ICMPv6 type: {0:?}")]
    UnsupportedIcmpv6Type(Icmpv6Type),
    #[error("Transport header lives in another fragment")]
    NotFirstFragment,
    #[error("Transport header is truncated")]
    TruncatedTransportHeader,
}
