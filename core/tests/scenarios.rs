//! End-to-end pipeline scenarios, one per wire-visible behavior.

#![allow(clippy::unwrap_used)]

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use xlat_core::verdict::{CountingStats, NoStats};
use xlat_core::{
    FixedMtu, Globals, IcmpError, Instance, L4Proto, Pool6, Stat, TcpState, TransportAddr4,
    TransportAddr6, Verdict, translate,
};
use xlat_packet::etherparse::{
    Icmpv4Slice, Icmpv4Type, Icmpv6Slice, Icmpv6Type, IpNumber, Ipv4HeaderSlice, UdpSlice, icmpv4,
    icmpv6,
};
use xlat_packet::{IpPacket, make};

fn client6() -> Ipv6Addr {
    "2001:db8::1".parse().unwrap()
}

fn remote4() -> Ipv4Addr {
    Ipv4Addr::new(192, 0, 2, 1)
}

fn pool4_addr() -> Ipv4Addr {
    Ipv4Addr::new(192, 0, 2, 7)
}

fn embed(addr: Ipv4Addr) -> Ipv6Addr {
    Pool6::well_known().embed(addr)
}

fn nat64() -> Instance {
    let globals = Globals {
        pool6: Some(Pool6::well_known()),
        ..Globals::default()
    };
    let instance = Instance::new_nat64("test", globals).unwrap();
    instance.pool4.add(pool4_addr(), 0..=65535);
    instance
}

fn siit() -> Instance {
    let globals = Globals {
        pool6: Some(Pool6::well_known()),
        ..Globals::default()
    };
    Instance::new_siit("test", globals, xlat_core::addr_xlat::Siit::new()).unwrap()
}

fn run(instance: &Instance, packet: &IpPacket) -> xlat_core::Translation {
    translate(instance, &FixedMtu(1500), &NoStats, packet, 1500, Instant::now())
}

#[test]
fn outbound_udp_creates_a_binding_and_translates() {
    let instance = nat64();
    let packet = make::udp_packet(
        client6(),
        embed(remote4()),
        5000,
        6000,
        vec![0xab; 100],
    )
    .unwrap();

    let translation = run(&instance, &packet);

    assert_eq!(translation.verdict, Verdict::Continue);
    let IpPacket::Ipv4(out) = &translation.packets[0] else {
        panic!("expected an IPv4 packet");
    };

    assert_eq!(out.source(), pool4_addr());
    assert_eq!(out.destination(), remote4());
    assert_eq!(out.protocol(), IpNumber::UDP);

    let header = Ipv4HeaderSlice::from_slice(out.packet()).unwrap();
    assert_eq!(
        header.to_header().calc_header_checksum(),
        header.header_checksum()
    );

    let udp = UdpSlice::from_slice(out.payload()).unwrap();
    assert_eq!(udp.destination_port(), 6000);
    assert_eq!(udp.payload(), &[0xab; 100][..]);

    let expected = udp
        .to_header()
        .calc_checksum_ipv4_raw(out.source().octets(), out.destination().octets(), udp.payload())
        .unwrap();
    assert_eq!(udp.to_header().checksum, expected);

    assert_eq!(instance.bib.bib_count(L4Proto::Udp), 1);
    assert_eq!(instance.bib.session_count(L4Proto::Udp), 1);
}

#[test]
fn inbound_reply_follows_the_binding_back() {
    let instance = nat64();

    // Outbound first, to open the session.
    let outbound =
        make::udp_packet(client6(), embed(remote4()), 5000, 6000, b"ping".to_vec()).unwrap();
    let translation = run(&instance, &outbound);
    let IpPacket::Ipv4(out) = &translation.packets[0] else {
        panic!("expected an IPv4 packet");
    };
    let allocated = UdpSlice::from_slice(out.payload()).unwrap().source_port();

    // The remote answers toward the allocated transport address.
    let reply =
        make::udp_packet(remote4(), pool4_addr(), 6000, allocated, b"pong".to_vec()).unwrap();
    let reply = make::patch_ipv4_fragmentation(reply, 0, 0, false, true);

    let translation = run(&instance, &reply);

    assert_eq!(translation.verdict, Verdict::Continue);
    let IpPacket::Ipv6(out) = &translation.packets[0] else {
        panic!("expected an IPv6 packet");
    };
    assert_eq!(out.source(), embed(remote4()));
    assert_eq!(out.destination(), client6());

    let udp = UdpSlice::from_slice(out.payload()).unwrap();
    assert_eq!(udp.source_port(), 6000);
    assert_eq!(udp.destination_port(), 5000);
    assert_eq!(udp.payload(), b"pong");
}

#[test]
fn external_tcp_syn_without_binding_is_refused() {
    let instance = nat64();
    let stats = CountingStats::new();

    let syn = make::tcp_packet_with_flags(
        remote4(),
        pool4_addr(),
        10000,
        8080,
        make::TcpFlags {
            syn: true,
            ..make::TcpFlags::default()
        },
    )
    .unwrap();
    let syn = make::patch_ipv4_fragmentation(syn, 1, 0, false, true);

    let translation = translate(
        &instance,
        &FixedMtu(1500),
        &stats,
        &syn,
        1500,
        Instant::now(),
    );

    assert_eq!(
        translation.verdict,
        Verdict::Untranslatable(IcmpError::AddressUnreachable)
    );
    assert!(translation.packets.is_empty());
    assert_eq!(stats.get(Stat::NoBib), 1);
}

#[test]
fn external_tcp_syn_policy_gates_the_simultaneous_open() {
    let open = |drop_external: bool| {
        let globals = Globals {
            pool6: Some(Pool6::well_known()),
            drop_external_tcp: drop_external,
            ..Globals::default()
        };
        let instance = Instance::new_nat64("test", globals).unwrap();
        instance.pool4.add(pool4_addr(), 0..=65535);

        // The client's own SYN mints the binding.
        let outbound = make::tcp_packet_with_flags(
            client6(),
            embed(remote4()),
            5000,
            6000,
            make::TcpFlags {
                syn: true,
                ..make::TcpFlags::default()
            },
        )
        .unwrap();
        let translation = run(&instance, &outbound);
        let IpPacket::Ipv4(out) = &translation.packets[0] else {
            panic!("expected an IPv4 packet");
        };
        let local_port = xlat_packet::etherparse::TcpHeaderSlice::from_slice(out.payload())
            .unwrap()
            .source_port();

        // A different remote initiates toward the same binding.
        let external = make::tcp_packet_with_flags(
            Ipv4Addr::new(198, 51, 100, 9),
            pool4_addr(),
            10000,
            local_port,
            make::TcpFlags {
                syn: true,
                ..make::TcpFlags::default()
            },
        )
        .unwrap();
        let external = make::patch_ipv4_fragmentation(external, 2, 0, false, true);

        let result = run(&instance, &external);
        (instance, result)
    };

    let (_, refused) = open(true);
    assert_eq!(refused.verdict, Verdict::Drop);

    let (instance, parked) = open(false);
    assert_eq!(parked.verdict, Verdict::Stolen);
    assert_eq!(instance.bib.session_count(L4Proto::Tcp), 2);
}

#[test]
fn released_simultaneous_open_packets_ride_along() {
    let globals = Globals {
        pool6: Some(Pool6::well_known()),
        drop_external_tcp: false,
        ..Globals::default()
    };
    let instance = Instance::new_nat64("test", globals).unwrap();
    instance.pool4.add(pool4_addr(), 0..=65535);
    let external_remote = Ipv4Addr::new(198, 51, 100, 9);

    let syn6 = |dst: Ipv6Addr, dport: u16| {
        make::tcp_packet_with_flags(
            client6(),
            dst,
            5000,
            dport,
            make::TcpFlags {
                syn: true,
                ..make::TcpFlags::default()
            },
        )
        .unwrap()
    };

    // Mint the binding, then park an external SYN against it.
    let translation = run(&instance, &syn6(embed(remote4()), 6000));
    let IpPacket::Ipv4(out) = &translation.packets[0] else {
        panic!("expected an IPv4 packet");
    };
    let local_port = xlat_packet::etherparse::TcpHeaderSlice::from_slice(out.payload())
        .unwrap()
        .source_port();

    let external = make::tcp_packet_with_flags(
        external_remote,
        pool4_addr(),
        10000,
        local_port,
        make::TcpFlags {
            syn: true,
            ..make::TcpFlags::default()
        },
    )
    .unwrap();
    let external = make::patch_ipv4_fragmentation(external, 2, 0, false, true);
    assert_eq!(run(&instance, &external).verdict, Verdict::Stolen);

    // The matching IPv6 SYN releases the parked packet; both come out.
    let translation = run(&instance, &syn6(embed(external_remote), 10000));

    assert_eq!(translation.verdict, Verdict::Continue);
    assert_eq!(translation.packets.len(), 2);
    let IpPacket::Ipv6(released) = &translation.packets[1] else {
        panic!("expected the released packet to be IPv6");
    };
    assert_eq!(released.destination(), client6());
    assert_eq!(
        instance.bib.tcp_state(
            TransportAddr6::new(client6(), 5000),
            TransportAddr4::new(external_remote, 10000),
        ),
        Some(TcpState::Established)
    );
}

#[test]
fn echo_identifier_comes_from_the_binding() {
    let instance = nat64();
    instance
        .bib
        .add_static(
            L4Proto::Icmp,
            &instance.pool4,
            TransportAddr6::new(client6(), 0x1234),
            TransportAddr4::new(pool4_addr(), 0xabcd),
        )
        .unwrap();

    let ping = make::icmp_request_packet(
        client6().into(),
        embed(remote4()),
        7,
        0x1234,
        b"payload",
    )
    .unwrap();

    let translation = run(&instance, &ping);

    assert_eq!(translation.verdict, Verdict::Continue);
    let IpPacket::Ipv4(out) = &translation.packets[0] else {
        panic!("expected an IPv4 packet");
    };

    let icmp = Icmpv4Slice::from_slice(out.payload()).unwrap();
    let Icmpv4Type::EchoRequest(echo) = icmp.icmp_type() else {
        panic!("expected an echo request, got {:?}", icmp.icmp_type());
    };
    assert_eq!(echo.id, 0xabcd);
    assert_eq!(echo.seq, 7);
    assert_eq!(icmp.icmp_type().calc_checksum(icmp.payload()), icmp.checksum());
}

#[test]
fn packet_too_big_becomes_fragmentation_needed() {
    let instance = nat64();

    // Open the session the error refers to.
    let outbound =
        make::udp_packet(client6(), embed(remote4()), 5000, 6000, b"x".to_vec()).unwrap();
    let translation = run(&instance, &outbound);
    let IpPacket::Ipv4(out) = &translation.packets[0] else {
        panic!("expected an IPv4 packet");
    };
    let allocated = UdpSlice::from_slice(out.payload()).unwrap().source_port();

    // A router on the IPv6 side reports the reply as too big.
    let failed = make::udp_packet(embed(remote4()), client6(), 6000, 5000, vec![0; 64]).unwrap();
    let ptb = make::icmpv6_packet(
        "2001:db8:ffff::9".parse().unwrap(),
        embed(remote4()),
        Icmpv6Type::PacketTooBig { mtu: 1400 },
        failed.packet(),
    );

    let translation = run(&instance, &ptb);

    assert_eq!(translation.verdict, Verdict::Continue);
    let IpPacket::Ipv4(out) = &translation.packets[0] else {
        panic!("expected an IPv4 packet");
    };
    assert_eq!(out.destination(), remote4());
    // The reporting router has no binding; the error borrows a pool4 address.
    assert_eq!(out.source(), pool4_addr());

    let icmp = Icmpv4Slice::from_slice(out.payload()).unwrap();
    let Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::FragmentationNeeded {
        next_hop_mtu,
    }) = icmp.icmp_type()
    else {
        panic!("expected FragmentationNeeded, got {:?}", icmp.icmp_type());
    };
    assert_eq!(next_hop_mtu, 1380);

    // The nested packet follows the binding.
    let inner = Ipv4HeaderSlice::from_slice(icmp.payload()).unwrap();
    assert_eq!(inner.source_addr(), remote4());
    assert_eq!(inner.destination_addr(), pool4_addr());
    let inner_udp = &icmp.payload()[20..];
    assert_eq!(
        u16::from_be_bytes([inner_udp[2], inner_udp[3]]),
        allocated
    );
}

#[test]
fn parameter_problem_pointer_is_renumbered() {
    let instance = siit();

    let failed = make::udp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        1,
        2,
        vec![0; 16],
    )
    .unwrap();
    let param_prob = make::icmpv4_packet(
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(10, 0, 0, 2),
        Icmpv4Type::ParameterProblem(icmpv4::ParameterProblemHeader::PointerIndicatesError(13)),
        failed.packet(),
    );
    let param_prob = make::patch_ipv4_fragmentation(param_prob, 3, 0, false, true);

    let translation = run(&instance, &param_prob);

    assert_eq!(translation.verdict, Verdict::Continue);
    let IpPacket::Ipv6(out) = &translation.packets[0] else {
        panic!("expected an IPv6 packet");
    };

    let icmp = Icmpv6Slice::from_slice(out.payload()).unwrap();
    let Icmpv6Type::ParameterProblem(header) = icmp.icmp_type() else {
        panic!("expected a parameter problem, got {:?}", icmp.icmp_type());
    };
    assert_eq!(header.code, icmpv6::ParameterProblemCode::ErroneousHeaderField);
    assert_eq!(header.pointer, 24);
}

#[test]
fn hop_limit_exhaustion_asks_for_an_icmp_error() {
    let instance = siit();
    let stats = CountingStats::new();

    let mut buf = Vec::new();
    xlat_packet::etherparse::PacketBuilder::ipv6(
        embed(Ipv4Addr::new(10, 0, 0, 2)).octets(),
        embed(remote4()).octets(),
        1,
    )
    .udp(5000, 6000)
    .write(&mut buf, b"doomed")
    .unwrap();
    let packet = IpPacket::parse(buf).unwrap();

    let translation = translate(
        &instance,
        &FixedMtu(1500),
        &stats,
        &packet,
        1500,
        Instant::now(),
    );

    assert_eq!(
        translation.verdict,
        Verdict::Untranslatable(IcmpError::TtlExpired)
    );
    assert!(translation.packets.is_empty());
    assert_eq!(stats.get(Stat::TtlExpired), 1);
}

#[test]
fn fragment_identification_is_preserved() {
    let instance = siit();

    let packet = make::v6_fragment_udp_packet(
        embed(Ipv4Addr::new(10, 0, 0, 2)),
        embed(remote4()),
        0x1234_5678,
        185,
        true,
        &[0u8; 64],
    );

    let translation = run(&instance, &packet);

    assert_eq!(translation.verdict, Verdict::Continue);
    let IpPacket::Ipv4(out) = &translation.packets[0] else {
        panic!("expected an IPv4 packet");
    };

    let header = Ipv4HeaderSlice::from_slice(out.packet()).unwrap();
    assert_eq!(header.identification(), 0x5678);
    assert!(header.more_fragments());
    assert!(!header.dont_fragment());
    assert_eq!(header.fragments_offset().value(), 185);
    assert_eq!(out.payload(), &[0u8; 64][..]);
}

#[test]
fn checksums_survive_a_round_trip() {
    let instance = siit();
    let src6 = embed(Ipv4Addr::new(10, 0, 0, 2));
    let dst6 = embed(remote4());
    let payload = b"some payload that must come back unchanged".to_vec();

    let original = make::udp_packet(src6, dst6, 5000, 6000, payload.clone()).unwrap();

    let translation = run(&instance, &original);
    assert_eq!(translation.verdict, Verdict::Continue);
    let forward = translation.packets.into_iter().next().unwrap();

    let translation = run(&instance, &forward);
    assert_eq!(translation.verdict, Verdict::Continue);
    let IpPacket::Ipv6(back) = translation.packets.into_iter().next().unwrap() else {
        panic!("expected an IPv6 packet");
    };

    assert_eq!(back.source(), src6);
    assert_eq!(back.destination(), dst6);

    let udp = UdpSlice::from_slice(back.payload()).unwrap();
    assert_eq!(udp.payload(), &payload[..]);

    let expected = udp
        .to_header()
        .calc_checksum_ipv6_raw(src6.octets(), dst6.octets(), udp.payload())
        .unwrap();
    assert_eq!(udp.to_header().checksum, expected);
}

#[test]
fn icmpv6_pointers_translate_per_the_table() {
    let instance = siit();

    let expected = |ptr: u32| -> Option<u8> {
        match ptr {
            0 => Some(0),
            1 => Some(1),
            4 | 5 => Some(2),
            6 => Some(9),
            7 => Some(8),
            8..24 => Some(12),
            24..40 => Some(16),
            _ => None,
        }
    };

    for pointer in 0..40 {
        let failed =
            make::udp_packet(embed(remote4()), embed(Ipv4Addr::new(10, 0, 0, 2)), 1, 2, vec![0; 8])
                .unwrap();
        let packet = make::icmpv6_packet(
            embed(Ipv4Addr::new(10, 0, 0, 2)),
            embed(remote4()),
            Icmpv6Type::ParameterProblem(icmpv6::ParameterProblemHeader {
                code: icmpv6::ParameterProblemCode::ErroneousHeaderField,
                pointer,
            }),
            failed.packet(),
        );

        let translation = run(&instance, &packet);

        match expected(pointer) {
            Some(want) => {
                assert_eq!(translation.verdict, Verdict::Continue, "pointer {pointer}");
                let IpPacket::Ipv4(out) = &translation.packets[0] else {
                    panic!("expected an IPv4 packet");
                };
                let icmp = Icmpv4Slice::from_slice(out.payload()).unwrap();
                let Icmpv4Type::ParameterProblem(
                    icmpv4::ParameterProblemHeader::PointerIndicatesError(got),
                ) = icmp.icmp_type()
                else {
                    panic!("expected a parameter problem for pointer {pointer}");
                };
                assert_eq!(got, want, "pointer {pointer}");
            }
            None => {
                assert_eq!(translation.verdict, Verdict::Drop, "pointer {pointer}");
            }
        }
    }
}

#[test]
fn icmpv4_pointers_translate_per_the_table() {
    let instance = siit();

    let expected = |ptr: u8| -> Option<u32> {
        match ptr {
            0 => Some(0),
            1 => Some(1),
            2 | 3 => Some(4),
            6 => Some(7),
            7 => Some(6),
            8..=11 => Some(8),
            12..=16 => Some(24),
            _ => None,
        }
    };

    for pointer in 0..20 {
        let failed = make::udp_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            1,
            2,
            vec![0; 8],
        )
        .unwrap();
        let packet = make::icmpv4_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            Icmpv4Type::ParameterProblem(icmpv4::ParameterProblemHeader::PointerIndicatesError(
                pointer,
            )),
            failed.packet(),
        );
        let packet = make::patch_ipv4_fragmentation(packet, 9, 0, false, true);

        let translation = run(&instance, &packet);

        match expected(pointer) {
            Some(want) => {
                assert_eq!(translation.verdict, Verdict::Continue, "pointer {pointer}");
                let IpPacket::Ipv6(out) = &translation.packets[0] else {
                    panic!("expected an IPv6 packet");
                };
                let icmp = Icmpv6Slice::from_slice(out.payload()).unwrap();
                let Icmpv6Type::ParameterProblem(header) = icmp.icmp_type() else {
                    panic!("expected a parameter problem for pointer {pointer}");
                };
                assert_eq!(header.pointer, want, "pointer {pointer}");
            }
            None => {
                assert_eq!(translation.verdict, Verdict::Drop, "pointer {pointer}");
            }
        }
    }
}

#[test]
fn zero_checksum_udp_policy() {
    let make_zero_csum = || {
        let packet = make::udp_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            5000,
            6000,
            b"lazy sender".to_vec(),
        )
        .unwrap();
        let packet = make::patch_ipv4_fragmentation(packet, 4, 0, false, true);
        let IpPacket::Ipv4(mut packet) = packet else {
            unreachable!()
        };
        let header_len = packet.header_len();
        packet.packet_mut()[header_len + 6] = 0;
        packet.packet_mut()[header_len + 7] = 0;
        IpPacket::Ipv4(packet)
    };

    // Default policy: drop.
    let stats = CountingStats::new();
    let translation = translate(
        &siit(),
        &FixedMtu(1500),
        &stats,
        &make_zero_csum(),
        1500,
        Instant::now(),
    );
    assert_eq!(translation.verdict, Verdict::Drop);
    assert_eq!(stats.get(Stat::ZeroUdpChecksum), 1);

    // Amendment enabled: the checksum is computed from scratch.
    let globals = Globals {
        pool6: Some(Pool6::well_known()),
        amend_udp_checksum_zero: true,
        ..Globals::default()
    };
    let instance = Instance::new_siit("test", globals, xlat_core::addr_xlat::Siit::new()).unwrap();

    let translation = run(&instance, &make_zero_csum());
    assert_eq!(translation.verdict, Verdict::Continue);
    let IpPacket::Ipv6(out) = &translation.packets[0] else {
        panic!("expected an IPv6 packet");
    };
    let udp = UdpSlice::from_slice(out.payload()).unwrap();
    let expected = udp
        .to_header()
        .calc_checksum_ipv6_raw(
            out.source().octets(),
            out.destination().octets(),
            udp.payload(),
        )
        .unwrap();
    assert_eq!(udp.to_header().checksum, expected);
}

#[test]
fn eam_hairpin_makes_a_u_turn() {
    use ip_network::{Ipv4Network, Ipv6Network};

    for mode in [
        xlat_core::EamHairpinMode::Simple,
        xlat_core::EamHairpinMode::Intrinsic,
    ] {
        let globals = Globals {
            pool6: Some(Pool6::well_known()),
            eam_hairpin_mode: mode,
            ..Globals::default()
        };
        let mut tables = xlat_core::addr_xlat::Siit::new();
        tables
            .eamt
            .add(
                Ipv6Network::new("2001:db8:aaaa::".parse().unwrap(), 120).unwrap(),
                Ipv4Network::new("198.51.100.0".parse().unwrap(), 24).unwrap(),
            )
            .unwrap();
        let instance = Instance::new_siit("test", globals, tables).unwrap();

        // An IPv6 node talks to an EAM-mapped host through the pool6 prefix.
        let packet = make::udp_packet(
            embed(Ipv4Addr::new(10, 0, 0, 1)),
            embed(Ipv4Addr::new(198, 51, 100, 5)),
            5000,
            6000,
            b"u-turn".to_vec(),
        )
        .unwrap();

        let translation = run(&instance, &packet);

        assert_eq!(translation.verdict, Verdict::Continue, "{mode:?}");
        let IpPacket::Ipv6(out) = &translation.packets[0] else {
            panic!("expected the hairpinned packet to come out as IPv6");
        };
        assert_eq!(out.source(), embed(Ipv4Addr::new(10, 0, 0, 1)), "{mode:?}");
        assert_eq!(
            out.destination(),
            "2001:db8:aaaa::5".parse::<Ipv6Addr>().unwrap(),
            "{mode:?}"
        );
    }
}

#[test]
fn session_expiry_is_driven_by_the_caller() {
    let instance = nat64();
    let now = Instant::now();

    let packet =
        make::udp_packet(client6(), embed(remote4()), 5000, 6000, b"x".to_vec()).unwrap();
    let translation = translate(&instance, &FixedMtu(1500), &NoStats, &packet, 1500, now);
    assert_eq!(translation.verdict, Verdict::Continue);

    let deadline = instance.bib.poll_timeout().unwrap();
    assert!(deadline > now);

    instance.bib.expire(&instance.pool4, deadline);

    assert_eq!(instance.bib.session_count(L4Proto::Udp), 0);
    assert_eq!(instance.bib.bib_count(L4Proto::Udp), 0);
    assert_eq!(instance.bib.poll_timeout(), None);
}

#[test]
fn nat64_drops_untracked_transports() {
    let instance = nat64();
    let stats = CountingStats::new();

    let mut buf = Vec::new();
    xlat_packet::etherparse::PacketBuilder::ipv6(
        client6().octets(),
        embed(remote4()).octets(),
        64,
    )
    .udp(1, 2)
    .write(&mut buf, &[])
    .unwrap();
    // Overwrite the next-header with an untracked protocol (SCTP).
    buf[6] = 132;
    let packet = IpPacket::parse(buf).unwrap();

    let translation = translate(
        &instance,
        &FixedMtu(1500),
        &stats,
        &packet,
        1500,
        Instant::now(),
    );

    assert_eq!(translation.verdict, Verdict::Drop);
    assert_eq!(stats.get(Stat::PolicyDrop), 1);
}

#[test_strategy::proptest]
fn udp_translation_preserves_payload_and_ports(
    #[strategy(proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256))] payload: Vec<u8>,
    sport: u16,
    dport: u16,
) {
    let instance = siit();
    let src6 = embed(Ipv4Addr::new(10, 0, 0, 2));
    let dst6 = embed(remote4());

    let original = make::udp_packet(src6, dst6, sport, dport, payload.clone()).unwrap();

    let translation = run(&instance, &original);

    assert_eq!(translation.verdict, Verdict::Continue);
    let IpPacket::Ipv4(out) = &translation.packets[0] else {
        panic!("expected an IPv4 packet");
    };

    let udp = UdpSlice::from_slice(out.payload()).unwrap();
    assert_eq!(udp.source_port(), sport);
    assert_eq!(udp.destination_port(), dport);
    assert_eq!(udp.payload(), &payload[..]);

    let expected = udp
        .to_header()
        .calc_checksum_ipv4_raw(out.source().octets(), out.destination().octets(), udp.payload())
        .unwrap();
    assert_eq!(udp.to_header().checksum, expected);
}
