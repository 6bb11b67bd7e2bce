//! The stateless address-translation decision tree.
//!
//! Order of resolution: EAM table, then pool6, then the accept-set (denylist
//! plus addresses that must never be translated). A miss is not final —
//! ICMP-error sources get one more chance through RFC 6791 substitution.

use crate::eam::Eamt;
use crate::rfc6052::Pool6;
use ip_network::Ipv4Network;
use ip_network_table::IpNetworkTable;
use std::hash::{Hash as _, Hasher as _};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Stateless-mode tables of one instance.
pub struct Siit {
    pub eamt: Eamt,
    denylist: IpNetworkTable<()>,
    /// Addresses usable as the source of ICMPv4 errors whose real source has
    /// no translation.
    rfc6791_v4: Vec<Ipv4Addr>,
    /// Prefix to mint ICMPv6 error sources from, for the reverse direction.
    rfc6791_v6: Option<ip_network::Ipv6Network>,
}

impl Default for Siit {
    fn default() -> Self {
        Self {
            eamt: Eamt::new(),
            denylist: IpNetworkTable::new(),
            rfc6791_v4: Vec::new(),
            rfc6791_v6: None,
        }
    }
}

impl std::fmt::Debug for Siit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Siit")
            .field("eamt", &self.eamt)
            .field("rfc6791_v4", &self.rfc6791_v4)
            .field("rfc6791_v6", &self.rfc6791_v6)
            .finish_non_exhaustive()
    }
}

/// Outcome of translating one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddrXlat<T> {
    /// Use this address; `was_6052` tells whether pool6 produced it.
    Translated { addr: T, was_6052: bool },
    /// No mapping applies; the caller may have a fallback.
    TrySomethingElse,
    /// The address is deliberately out of scope for translation.
    Accept,
}

impl Siit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&mut self, prefix: Ipv4Network) {
        self.denylist.insert(prefix, ());
    }

    pub fn denylist_contains(&self, addr: Ipv4Addr) -> bool {
        self.denylist.longest_match(IpAddr::V4(addr)).is_some()
    }

    pub fn set_rfc6791_v4(&mut self, addrs: Vec<Ipv4Addr>) {
        self.rfc6791_v4 = addrs;
    }

    pub fn set_rfc6791_v6(&mut self, prefix: ip_network::Ipv6Network) {
        self.rfc6791_v6 = Some(prefix);
    }

    /// Resolves an IPv6 address to IPv4 (RFC 7915 sections 5.1/5.2 plus the
    /// EAM extension).
    pub(crate) fn xlat_6to4(
        &self,
        addr: Ipv6Addr,
        pool6: Option<&Pool6>,
        enable_eam: bool,
        enable_denylist: bool,
    ) -> AddrXlat<Ipv4Addr> {
        if enable_eam {
            if let Some(mapped) = self.eamt.xlat_6to4(addr) {
                if must_not_translate(mapped) {
                    tracing::debug!(%mapped, "Resulting address is not meant to be translated");
                    return AddrXlat::Accept;
                }

                return AddrXlat::Translated {
                    addr: mapped,
                    was_6052: false,
                };
            }
        }

        let Some(pool6) = pool6.filter(|p| p.contains(addr)) else {
            tracing::debug!(%addr, "Address lacks both the translation prefix and an EAM entry");
            return AddrXlat::TrySomethingElse;
        };

        let mapped = pool6.extract(addr);

        if enable_denylist && self.denylist_contains(mapped) {
            tracing::debug!(%mapped, "Resulting address is denylisted");
            return AddrXlat::Accept;
        }
        if must_not_translate(mapped) {
            tracing::debug!(%mapped, "Resulting address is not meant to be translated");
            return AddrXlat::Accept;
        }

        AddrXlat::Translated {
            addr: mapped,
            was_6052: true,
        }
    }

    /// Resolves an IPv4 address to IPv6, the mirror of [`Siit::xlat_6to4`].
    pub(crate) fn xlat_4to6(
        &self,
        addr: Ipv4Addr,
        pool6: Option<&Pool6>,
        enable_eam: bool,
        enable_denylist: bool,
    ) -> AddrXlat<Ipv6Addr> {
        if must_not_translate(addr) {
            tracing::debug!(%addr, "Address is not meant to be translated");
            return AddrXlat::Accept;
        }

        if enable_eam {
            if let Some(mapped) = self.eamt.xlat_4to6(addr) {
                return AddrXlat::Translated {
                    addr: mapped,
                    was_6052: false,
                };
            }
        }

        if enable_denylist && self.denylist_contains(addr) {
            tracing::debug!(%addr, "Address is denylisted");
            return AddrXlat::Accept;
        }

        match pool6 {
            Some(pool6) => AddrXlat::Translated {
                addr: pool6.embed(addr),
                was_6052: true,
            },
            None => AddrXlat::TrySomethingElse,
        }
    }

    /// Picks an RFC 6791 source for an ICMPv4 error whose real source failed
    /// translation. `entropy` seeds the deterministic pick.
    pub(crate) fn rfc6791_pick_v4(&self, randomize: bool, entropy: u64) -> Option<Ipv4Addr> {
        pick(&self.rfc6791_v4, randomize, entropy).copied()
    }

    /// Mints an RFC 6791 source for an ICMPv6 error from the configured
    /// prefix.
    pub(crate) fn rfc6791_pick_v6(&self, randomize: bool, entropy: u64) -> Option<Ipv6Addr> {
        let prefix = self.rfc6791_v6?;
        let host_bits = 128 - u32::from(prefix.netmask());

        let host = if randomize {
            rand::random::<u128>()
        } else {
            u128::from(entropy) | (u128::from(entropy) << 64)
        };
        let mask = match host_bits {
            128 => u128::MAX,
            bits => (1u128 << bits) - 1,
        };

        Some(Ipv6Addr::from(
            u128::from(prefix.network_address()) | (host & mask),
        ))
    }
}

fn pick<T>(pool: &[T], randomize: bool, entropy: u64) -> Option<&T> {
    if pool.is_empty() {
        return None;
    }

    let idx = if randomize {
        rand::random::<usize>()
    } else {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        entropy.hash(&mut hasher);
        hasher.finish() as usize
    };

    pool.get(idx % pool.len())
}

/// Addresses no translator output should ever carry: unspecified, loopback,
/// link-local, multicast and the limited broadcast.
pub(crate) fn must_not_translate(addr: Ipv4Addr) -> bool {
    addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_multicast()
        || addr.is_broadcast()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ip_network::{Ipv4Network, Ipv6Network};

    fn siit() -> Siit {
        let mut siit = Siit::new();
        siit.eamt
            .add(
                Ipv6Network::new("2001:db8:aaaa::".parse().unwrap(), 120).unwrap(),
                Ipv4Network::new("198.51.100.0".parse().unwrap(), 24).unwrap(),
            )
            .unwrap();
        siit.deny(Ipv4Network::new("192.0.2.128".parse().unwrap(), 25).unwrap());
        siit
    }

    fn pool6() -> Pool6 {
        Pool6::well_known()
    }

    #[test]
    fn eam_wins_over_pool6() {
        let siit = siit();
        let pool = pool6();
        // Address matches both the EAMT and (hypothetically) nothing else.
        let outcome = siit.xlat_6to4("2001:db8:aaaa::7".parse().unwrap(), Some(&pool), true, true);

        assert_eq!(
            outcome,
            AddrXlat::Translated {
                addr: Ipv4Addr::new(198, 51, 100, 7),
                was_6052: false
            }
        );
    }

    #[test]
    fn pool6_extraction_marks_was_6052() {
        let siit = siit();
        let pool = pool6();
        let addr = pool.embed(Ipv4Addr::new(192, 0, 2, 1));

        assert_eq!(
            siit.xlat_6to4(addr, Some(&pool), true, true),
            AddrXlat::Translated {
                addr: Ipv4Addr::new(192, 0, 2, 1),
                was_6052: true
            }
        );
    }

    #[test]
    fn denylisted_extraction_accepts() {
        let siit = siit();
        let pool = pool6();
        let addr = pool.embed(Ipv4Addr::new(192, 0, 2, 200));

        assert_eq!(siit.xlat_6to4(addr, Some(&pool), true, true), AddrXlat::Accept);
        // With the denylist disabled (ICMP errors), translation goes through.
        assert_eq!(
            siit.xlat_6to4(addr, Some(&pool), true, false),
            AddrXlat::Translated {
                addr: Ipv4Addr::new(192, 0, 2, 200),
                was_6052: true
            }
        );
    }

    #[test]
    fn unknown_address_requests_fallback() {
        let siit = siit();

        assert_eq!(
            siit.xlat_6to4("2001:db8:ffff::1".parse().unwrap(), Some(&pool6()), true, true),
            AddrXlat::TrySomethingElse
        );
    }

    #[test]
    fn loopback_is_never_translated() {
        let siit = siit();

        assert_eq!(
            siit.xlat_4to6(Ipv4Addr::LOCALHOST, Some(&pool6()), true, true),
            AddrXlat::Accept
        );
    }

    #[test]
    fn rfc6791_pool_pick_is_stable_without_randomization() {
        let mut siit = siit();
        siit.set_rfc6791_v4(vec![
            Ipv4Addr::new(203, 0, 113, 1),
            Ipv4Addr::new(203, 0, 113, 2),
        ]);

        let a = siit.rfc6791_pick_v4(false, 1234);
        let b = siit.rfc6791_pick_v4(false, 1234);

        assert_eq!(a, b);
        assert!(a.is_some());
        assert_eq!(siit.rfc6791_pick_v6(false, 1), None);
    }
}
