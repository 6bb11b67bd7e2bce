//! The pool of IPv4 transport addresses NAT64 allocates from.
//!
//! Ports are pre-partitioned into classes: UDP splits on parity and on the
//! well-known boundary (1024), TCP only on the boundary, ICMP identifiers
//! are one flat class. An allocation prefers the class of the port it is
//! standing in for and degrades gracefully: same range first, then parity.

use crate::L4Proto;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

/// An (address, port) pair on the IPv4 side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportAddr4 {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl TransportAddr4 {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for TransportAddr4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.port)
    }
}

/// A set of free port numbers within one class.
#[derive(Debug, Default)]
struct PortSet {
    free: BTreeSet<u16>,
}

impl PortSet {
    fn fill(&mut self, range: RangeInclusive<u16>, step: usize) {
        self.free.extend(range.step_by(step));
    }

    fn pop_any(&mut self) -> Option<u16> {
        let port = *self.free.iter().next()?;
        self.free.remove(&port);
        Some(port)
    }

    fn claim(&mut self, port: u16) -> bool {
        self.free.remove(&port)
    }

    fn put_back(&mut self, port: u16) {
        self.free.insert(port);
    }
}

#[derive(Debug)]
struct AddrEntry {
    addr: Ipv4Addr,
    /// UDP: [low even, low odd, high even, high odd].
    udp: [PortSet; 4],
    /// TCP: [low, high].
    tcp: [PortSet; 2],
    icmp: PortSet,
}

impl AddrEntry {
    fn empty(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            udp: Default::default(),
            tcp: Default::default(),
            icmp: PortSet::default(),
        }
    }

    /// Distributes `range` over the classes of `proto`.
    fn extend(&mut self, proto: L4Proto, range: &RangeInclusive<u16>) {
        let clamp = |class: RangeInclusive<u16>| -> RangeInclusive<u16> {
            (*range.start()).max(*class.start())..=(*range.end()).min(*class.end())
        };

        match proto {
            L4Proto::Udp => {
                for (i, (from, to)) in [(0, 1023), (0, 1023), (1024, 65535), (1024, 65535)]
                    .into_iter()
                    .enumerate()
                {
                    let parity = (i % 2) as u16;
                    let class = clamp(from..=to);
                    let start = if *class.start() % 2 == parity {
                        *class.start()
                    } else {
                        class.start().saturating_add(1)
                    };
                    self.udp[i].fill(start..=*class.end(), 2);
                }
            }
            L4Proto::Tcp => {
                self.tcp[0].fill(clamp(0..=1023), 1);
                self.tcp[1].fill(clamp(1024..=65535), 1);
            }
            L4Proto::Icmp => self.icmp.fill(range.clone(), 1),
        }
    }

    fn class_mut(&mut self, proto: L4Proto, class: usize) -> &mut PortSet {
        match proto {
            L4Proto::Udp => &mut self.udp[class],
            L4Proto::Tcp => &mut self.tcp[class],
            L4Proto::Icmp => &mut self.icmp,
        }
    }
}

/// The class a port belongs to, then the fallback order away from it.
fn class_preference(proto: L4Proto, port: u16) -> &'static [usize] {
    match proto {
        // (low even, low odd, high even, high odd) indices 0..4.
        L4Proto::Udp => match (port < 1024, port % 2 == 0) {
            (true, true) => &[0, 1, 2, 3],
            (true, false) => &[1, 0, 3, 2],
            (false, true) => &[2, 3, 0, 1],
            (false, false) => &[3, 2, 1, 0],
        },
        L4Proto::Tcp => {
            if port < 1024 {
                &[0, 1]
            } else {
                &[1, 0]
            }
        }
        L4Proto::Icmp => &[0],
    }
}

#[derive(Debug, Default)]
struct Pool4Inner {
    addrs: Vec<AddrEntry>,
    /// Round-robin cursor over `addrs`. Approximate under contention, which
    /// is fine.
    cursor: usize,
}

/// The per-instance IPv4 transport-address pool.
#[derive(Debug, Default)]
pub struct Pool4 {
    inner: Mutex<Pool4Inner>,
}

impl Pool4 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `addr` with `range` as the usable port interval for every
    /// protocol.
    pub fn add(&self, addr: Ipv4Addr, range: RangeInclusive<u16>) {
        for proto in [L4Proto::Udp, L4Proto::Tcp, L4Proto::Icmp] {
            self.add_proto(proto, addr, range.clone());
        }
    }

    /// Registers the (address, port-range, protocol) triple.
    pub fn add_proto(&self, proto: L4Proto, addr: Ipv4Addr, range: RangeInclusive<u16>) {
        let mut inner = self.inner.lock();

        let idx = match inner.addrs.iter().position(|entry| entry.addr == addr) {
            Some(idx) => idx,
            None => {
                inner.addrs.push(AddrEntry::empty(addr));
                inner.addrs.len() - 1
            }
        };

        inner.addrs[idx].extend(proto, &range);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().addrs.is_empty()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.inner.lock().addrs.iter().any(|entry| entry.addr == addr)
    }

    /// First address of the pool, used as a last-resort ICMP error source.
    pub fn any_addr(&self) -> Option<Ipv4Addr> {
        self.inner.lock().addrs.first().map(|entry| entry.addr)
    }

    /// Allocates a transport address for a flow whose inner port is
    /// `reference_port`, preserving its parity/range class when possible.
    ///
    /// Addresses are tried round-robin from one past the last successful
    /// pick; classes degrade in preference order.
    pub fn allocate(&self, proto: L4Proto, reference_port: u16) -> Option<TransportAddr4> {
        let mut inner = self.inner.lock();
        let count = inner.addrs.len();

        if count == 0 {
            tracing::warn!("The IPv4 pool is empty");
            return None;
        }

        for &class in class_preference(proto, reference_port) {
            for i in 0..count {
                let idx = (inner.cursor + 1 + i) % count;
                let entry = &mut inner.addrs[idx];

                if let Some(port) = entry.class_mut(proto, class).pop_any() {
                    let addr = entry.addr;
                    inner.cursor = idx;
                    return Some(TransportAddr4::new(addr, port));
                }
            }
        }

        tracing::warn!("Ran out of IPv4 addresses and ports");
        None
    }

    /// Claims one specific transport address, for static bindings.
    pub fn claim(&self, proto: L4Proto, addr: TransportAddr4) -> bool {
        let mut inner = self.inner.lock();

        let Some(entry) = inner.addrs.iter_mut().find(|entry| entry.addr == addr.addr) else {
            return false;
        };

        let class = class_preference(proto, addr.port)[0];
        entry.class_mut(proto, class).claim(addr.port)
    }

    /// Returns a transport address to the free sets.
    pub fn release(&self, proto: L4Proto, addr: TransportAddr4) {
        let mut inner = self.inner.lock();

        let Some(entry) = inner.addrs.iter_mut().find(|entry| entry.addr == addr.addr) else {
            tracing::debug!(%addr, "Released an address the pool does not know");
            return;
        };

        let class = class_preference(proto, addr.port)[0];
        entry.class_mut(proto, class).put_back(addr.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_range(range: RangeInclusive<u16>) -> Pool4 {
        let pool = Pool4::new();
        pool.add(Ipv4Addr::new(192, 0, 2, 7), range);
        pool
    }

    #[test]
    fn udp_parity_and_range_are_preserved() {
        let pool = pool_with_range(0..=65535);

        let alloc = pool.allocate(L4Proto::Udp, 88).unwrap();
        assert!(alloc.port < 1024);
        assert_eq!(alloc.port % 2, 0);

        let alloc = pool.allocate(L4Proto::Udp, 5001).unwrap();
        assert!(alloc.port >= 1024);
        assert_eq!(alloc.port % 2, 1);
    }

    #[test]
    fn udp_fallback_order_for_a_low_even_port() {
        // Two ports per class would complicate the test; one of each.
        let pool = Pool4::new();
        pool.add(Ipv4Addr::new(192, 0, 2, 7), 1022..=1025);

        // Classes now hold: low-even {1022}, low-odd {1023},
        // high-even {1024}, high-odd {1025}.
        let ports: Vec<u16> = std::iter::from_fn(|| pool.allocate(L4Proto::Udp, 10))
            .map(|a| a.port)
            .take(5)
            .collect();

        assert_eq!(ports, vec![1022, 1023, 1024, 1025]);
    }

    #[test]
    fn tcp_range_class_fallback() {
        let pool = Pool4::new();
        pool.add(Ipv4Addr::new(192, 0, 2, 7), 1000..=1001);

        let a = pool.allocate(L4Proto::Tcp, 500).unwrap();
        let b = pool.allocate(L4Proto::Tcp, 500).unwrap();

        assert_eq!((a.port, b.port), (1000, 1001));
        assert_eq!(pool.allocate(L4Proto::Tcp, 500), None);
    }

    #[test]
    fn round_robin_across_addresses() {
        let pool = Pool4::new();
        pool.add(Ipv4Addr::new(192, 0, 2, 1), 1024..=65535);
        pool.add(Ipv4Addr::new(192, 0, 2, 2), 1024..=65535);

        let a = pool.allocate(L4Proto::Icmp, 1).unwrap();
        let b = pool.allocate(L4Proto::Icmp, 1).unwrap();

        assert_ne!(a.addr, b.addr);
    }

    #[test]
    fn release_makes_the_port_reusable() {
        let pool = Pool4::new();
        pool.add(Ipv4Addr::new(192, 0, 2, 7), 2000..=2000);

        let a = pool.allocate(L4Proto::Tcp, 3000).unwrap();
        assert_eq!(pool.allocate(L4Proto::Tcp, 3000), None);

        pool.release(L4Proto::Tcp, a);
        assert_eq!(pool.allocate(L4Proto::Tcp, 3000), Some(a));
    }

    #[test]
    fn claim_takes_a_specific_port() {
        let pool = pool_with_range(0..=65535);
        let addr = TransportAddr4::new(Ipv4Addr::new(192, 0, 2, 7), 8080);

        assert!(pool.claim(L4Proto::Tcp, addr));
        assert!(!pool.claim(L4Proto::Tcp, addr));
    }
}
