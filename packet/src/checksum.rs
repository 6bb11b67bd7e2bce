//! Internet-checksum arithmetic for cross-family header rewrites.
//!
//! Translating TCP/UDP/ICMP between IPv4 and IPv6 never touches the payload,
//! so transport checksums are updated by ones'-complement deltas: subtract the
//! words the rewrite erased, add the words it introduced. The pseudo-header's
//! length and protocol fields are identical on both sides of the family swap,
//! so both sides sum them as zero and only the addresses are exchanged.

use std::net::{Ipv4Addr, Ipv6Addr};

pub const IP_PROTO_ICMPV6: u8 = 58;
pub const IP_PROTO_UDP: u8 = 17;

/// A 32-bit ones'-complement accumulator.
///
/// Subtraction is addition of the bitwise complement (RFC 1624); the final
/// fold performs the end-around carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum(u32);

impl Checksum {
    pub fn new() -> Self {
        Self(0)
    }

    /// Resumes the accumulator from a checksum field found on the wire.
    pub fn from_wire(folded: u16) -> Self {
        Self(u32::from(!folded))
    }

    /// Resumes from a hardware-partial value, i.e. a folded sum that has not
    /// been complemented yet.
    pub fn from_partial(partial: u16) -> Self {
        Self(u32::from(partial))
    }

    pub fn add_u16(&mut self, word: u16) {
        self.0 += u32::from(word);
    }

    pub fn sub_u16(&mut self, word: u16) {
        self.add_u16(!word);
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for chunk in &mut chunks {
            self.add_u16(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        if let [last] = chunks.remainder() {
            self.add_u16(u16::from_be_bytes([*last, 0]));
        }
    }

    pub fn sub_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for chunk in &mut chunks {
            self.sub_u16(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        if let [last] = chunks.remainder() {
            self.sub_u16(u16::from_be_bytes([*last, 0]));
        }
    }

    /// Adds the address-only part of the IPv4 pseudo-header.
    pub fn add_addrs_v4(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
        self.add_bytes(&src.octets());
        self.add_bytes(&dst.octets());
    }

    pub fn sub_addrs_v4(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
        self.sub_bytes(&src.octets());
        self.sub_bytes(&dst.octets());
    }

    /// Adds the address-only part of the IPv6 pseudo-header.
    pub fn add_addrs_v6(&mut self, src: &Ipv6Addr, dst: &Ipv6Addr) {
        self.add_bytes(&src.octets());
        self.add_bytes(&dst.octets());
    }

    pub fn sub_addrs_v6(&mut self, src: &Ipv6Addr, dst: &Ipv6Addr) {
        self.sub_bytes(&src.octets());
        self.sub_bytes(&dst.octets());
    }

    /// Adds a complete IPv6 pseudo-header, length and protocol included.
    pub fn add_pseudo_v6(&mut self, src: &Ipv6Addr, dst: &Ipv6Addr, len: u32, proto: u8) {
        self.add_addrs_v6(src, dst);
        self.add_u16((len >> 16) as u16);
        self.add_u16(len as u16);
        self.add_u16(u16::from(proto));
    }

    pub fn sub_pseudo_v6(&mut self, src: &Ipv6Addr, dst: &Ipv6Addr, len: u32, proto: u8) {
        self.sub_addrs_v6(src, dst);
        self.sub_u16((len >> 16) as u16);
        self.sub_u16(len as u16);
        self.sub_u16(u16::from(proto));
    }

    fn fold(self) -> u16 {
        let mut sum = self.0;
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    /// Folds and complements: the value that goes into a checksum field.
    pub fn to_wire(self) -> u16 {
        !self.fold()
    }

    /// Folds without the final complement (hardware-partial form).
    pub fn to_partial(self) -> u16 {
        self.fold()
    }
}

/// Sums the 16-bit words of a fixed-size L4 header, treating the word at
/// `csum_offset` as zero. Only the fixed header takes part in the delta;
/// TCP options do not change across the rewrite and cancel themselves out.
fn add_l4_header(acc: &mut Checksum, hdr: &[u8], csum_offset: usize) {
    for (i, chunk) in hdr.chunks(2).enumerate() {
        if i * 2 == csum_offset {
            continue;
        }
        match *chunk {
            [a, b] => acc.add_u16(u16::from_be_bytes([a, b])),
            [a] => acc.add_u16(u16::from_be_bytes([a, 0])),
            _ => unreachable!(),
        }
    }
}

fn sub_l4_header(acc: &mut Checksum, hdr: &[u8], csum_offset: usize) {
    for (i, chunk) in hdr.chunks(2).enumerate() {
        if i * 2 == csum_offset {
            continue;
        }
        match *chunk {
            [a, b] => acc.sub_u16(u16::from_be_bytes([a, b])),
            [a] => acc.sub_u16(u16::from_be_bytes([a, 0])),
            _ => unreachable!(),
        }
    }
}

/// Delta-updates a TCP/UDP checksum for a 6→4 rewrite.
///
/// `old_l4`/`new_l4` are the fixed-size transport headers before and after
/// the rewrite; `csum_offset` locates the checksum field inside them (16 for
/// TCP, 6 for UDP).
pub fn update_tcpudp_6to4(
    old: u16,
    in_src: &Ipv6Addr,
    in_dst: &Ipv6Addr,
    out_src: Ipv4Addr,
    out_dst: Ipv4Addr,
    old_l4: &[u8],
    new_l4: &[u8],
    csum_offset: usize,
) -> u16 {
    let mut acc = Checksum::from_wire(old);
    acc.sub_addrs_v6(in_src, in_dst);
    sub_l4_header(&mut acc, old_l4, csum_offset);
    acc.add_addrs_v4(out_src, out_dst);
    add_l4_header(&mut acc, new_l4, csum_offset);
    acc.to_wire()
}

/// Delta-updates a TCP/UDP checksum for a 4→6 rewrite.
pub fn update_tcpudp_4to6(
    old: u16,
    in_src: Ipv4Addr,
    in_dst: Ipv4Addr,
    out_src: &Ipv6Addr,
    out_dst: &Ipv6Addr,
    old_l4: &[u8],
    new_l4: &[u8],
    csum_offset: usize,
) -> u16 {
    let mut acc = Checksum::from_wire(old);
    acc.sub_addrs_v4(in_src, in_dst);
    sub_l4_header(&mut acc, old_l4, csum_offset);
    acc.add_addrs_v6(out_src, out_dst);
    add_l4_header(&mut acc, new_l4, csum_offset);
    acc.to_wire()
}

/// Pseudo-header-only delta for buffers whose checksum is still in the
/// hardware-partial state. The L4 header swap is left to the offloading
/// device, which sums the header bytes itself.
pub fn update_partial_6to4(
    partial: u16,
    in_src: &Ipv6Addr,
    in_dst: &Ipv6Addr,
    out_src: Ipv4Addr,
    out_dst: Ipv4Addr,
) -> u16 {
    let mut acc = Checksum::from_partial(partial);
    acc.sub_addrs_v6(in_src, in_dst);
    acc.add_addrs_v4(out_src, out_dst);
    acc.to_partial()
}

pub fn update_partial_4to6(
    partial: u16,
    in_src: Ipv4Addr,
    in_dst: Ipv4Addr,
    out_src: &Ipv6Addr,
    out_dst: &Ipv6Addr,
) -> u16 {
    let mut acc = Checksum::from_partial(partial);
    acc.sub_addrs_v4(in_src, in_dst);
    acc.add_addrs_v6(out_src, out_dst);
    acc.to_partial()
}

/// Delta for an ICMPv6→ICMPv4 information message: the ICMPv6 pseudo-header
/// disappears (ICMPv4 checksums have none) and the 8 ICMP header bytes are
/// exchanged.
pub fn update_icmp_6to4(
    old: u16,
    in_src: &Ipv6Addr,
    in_dst: &Ipv6Addr,
    datagram_len: u32,
    old_hdr: &[u8],
    new_hdr: &[u8],
) -> u16 {
    let mut acc = Checksum::from_wire(old);
    acc.sub_pseudo_v6(in_src, in_dst, datagram_len, IP_PROTO_ICMPV6);
    sub_l4_header(&mut acc, old_hdr, 2);
    add_l4_header(&mut acc, new_hdr, 2);
    acc.to_wire()
}

/// Delta for an ICMPv4→ICMPv6 information message: header bytes exchanged,
/// ICMPv6 pseudo-header added.
pub fn update_icmp_4to6(
    old: u16,
    out_src: &Ipv6Addr,
    out_dst: &Ipv6Addr,
    datagram_len: u32,
    old_hdr: &[u8],
    new_hdr: &[u8],
) -> u16 {
    let mut acc = Checksum::from_wire(old);
    sub_l4_header(&mut acc, old_hdr, 2);
    add_l4_header(&mut acc, new_hdr, 2);
    acc.add_pseudo_v6(out_src, out_dst, datagram_len, IP_PROTO_ICMPV6);
    acc.to_wire()
}

/// UDP transmits an all-zero checksum as 0xFFFF; zero means "not computed"
/// and is illegal on IPv6.
pub fn mangle_zero_udp(csum: u16) -> u16 {
    if csum == 0 { 0xffff } else { csum }
}

/// From-scratch checksum of an ICMPv4 message (no pseudo-header), with the
/// checksum field treated as zero.
pub fn icmpv4_checksum(msg: &[u8]) -> u16 {
    let mut acc = Checksum::new();
    add_l4_header(&mut acc, msg, 2);
    acc.to_wire()
}

/// From-scratch checksum of an ICMPv6 message including its pseudo-header,
/// with the checksum field treated as zero.
pub fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, msg: &[u8]) -> u16 {
    let mut acc = Checksum::new();
    acc.add_pseudo_v6(src, dst, msg.len() as u32, IP_PROTO_ICMPV6);
    add_l4_header(&mut acc, msg, 2);
    acc.to_wire()
}

/// Verifies the checksum already present in an ICMPv4 message.
pub fn verify_icmpv4(msg: &[u8]) -> bool {
    let mut acc = Checksum::new();
    acc.add_bytes(msg);
    acc.to_wire() == 0
}

/// Verifies the checksum already present in an ICMPv6 message.
pub fn verify_icmpv6(src: &Ipv6Addr, dst: &Ipv6Addr, msg: &[u8]) -> bool {
    let mut acc = Checksum::new();
    acc.add_pseudo_v6(src, dst, msg.len() as u32, IP_PROTO_ICMPV6);
    acc.add_bytes(msg);
    acc.to_wire() == 0
}
