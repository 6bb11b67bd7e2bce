//! Explicit Address Mappings (RFC 7757).
//!
//! Pairs of prefixes with equally many trailing bits; within a pair the
//! mapping is a bijection obtained by carrying the host bits across. Lookup
//! is longest-prefix-match on either side, so overlapping entries shadow
//! each other instead of conflicting.

use ip_network::{Ipv4Network, Ipv6Network};
use ip_network_table::IpNetworkTable;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EamEntry {
    pub prefix6: Ipv6Network,
    pub prefix4: Ipv4Network,
}

impl EamEntry {
    fn map_6to4(&self, addr: Ipv6Addr) -> Ipv4Addr {
        let host_bits = 128 - u32::from(self.prefix6.netmask());
        let suffix = u128::from(addr) & host_mask_128(host_bits);

        Ipv4Addr::from(u32::from(self.prefix4.network_address()) | suffix as u32)
    }

    fn map_4to6(&self, addr: Ipv4Addr) -> Ipv6Addr {
        let host_bits = 32 - u32::from(self.prefix4.netmask());
        let suffix = u32::from(addr) & host_mask_32(host_bits);

        Ipv6Addr::from(u128::from(self.prefix6.network_address()) | u128::from(suffix))
    }
}

fn host_mask_128(bits: u32) -> u128 {
    match bits {
        128 => u128::MAX,
        bits => (1u128 << bits) - 1,
    }
}

fn host_mask_32(bits: u32) -> u32 {
    match bits {
        32 => u32::MAX,
        bits => (1u32 << bits) - 1,
    }
}

/// The EAM table: one LPM trie per family, both pointing at the same entries.
pub struct Eamt {
    by6: IpNetworkTable<EamEntry>,
    by4: IpNetworkTable<EamEntry>,
    len: usize,
}

impl Default for Eamt {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Eamt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eamt").field("len", &self.len).finish_non_exhaustive()
    }
}

impl Eamt {
    pub fn new() -> Self {
        Self {
            by6: IpNetworkTable::new(),
            by4: IpNetworkTable::new(),
            len: 0,
        }
    }

    /// Adds a mapping. The two prefixes must have the same number of host
    /// bits, otherwise the mapping cannot be a bijection.
    pub fn add(&mut self, prefix6: Ipv6Network, prefix4: Ipv4Network) -> Result<(), EamError> {
        let host6 = 128 - u32::from(prefix6.netmask());
        let host4 = 32 - u32::from(prefix4.netmask());

        if host6 != host4 {
            return Err(EamError::SuffixMismatch { host6, host4 });
        }
        if self.by6.exact_match(prefix6).is_some() || self.by4.exact_match(prefix4).is_some() {
            return Err(EamError::Duplicate);
        }

        let entry = EamEntry { prefix6, prefix4 };
        self.by6.insert(prefix6, entry);
        self.by4.insert(prefix4, entry);
        self.len += 1;

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn xlat_6to4(&self, addr: Ipv6Addr) -> Option<Ipv4Addr> {
        let (_, entry) = self.by6.longest_match(IpAddr::V6(addr))?;

        Some(entry.map_6to4(addr))
    }

    pub fn xlat_4to6(&self, addr: Ipv4Addr) -> Option<Ipv6Addr> {
        let (_, entry) = self.by4.longest_match(IpAddr::V4(addr))?;

        Some(entry.map_4to6(addr))
    }

    pub fn contains4(&self, addr: Ipv4Addr) -> bool {
        self.by4.longest_match(IpAddr::V4(addr)).is_some()
    }

    pub fn contains6(&self, addr: Ipv6Addr) -> bool {
        self.by6.longest_match(IpAddr::V6(addr)).is_some()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EamError {
    #[error("prefix host-bit counts differ (IPv6 has {host6}, IPv4 has {host4})")]
    SuffixMismatch { host6: u32, host4: u32 },
    #[error("an entry with one of these prefixes already exists")]
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net6(s: &str, len: u8) -> Ipv6Network {
        Ipv6Network::new(s.parse().unwrap(), len).unwrap()
    }

    fn net4(s: &str, len: u8) -> Ipv4Network {
        Ipv4Network::new(s.parse().unwrap(), len).unwrap()
    }

    fn table() -> Eamt {
        let mut eamt = Eamt::new();
        eamt.add(net6("2001:db8:aaaa::", 120), net4("198.51.100.0", 24))
            .unwrap();
        eamt.add(net6("2001:db8:bbbb::b", 128), net4("203.0.113.9", 32))
            .unwrap();
        eamt
    }

    #[test]
    fn bijection_inside_the_pair() {
        let eamt = table();

        for host in [0u8, 1, 77, 255] {
            let v6: Ipv6Addr = format!("2001:db8:aaaa::{host:x}").parse().unwrap();
            let v4 = eamt.xlat_6to4(v6).unwrap();

            assert_eq!(v4, Ipv4Addr::new(198, 51, 100, host));
            assert_eq!(eamt.xlat_4to6(v4), Some(v6));
        }
    }

    #[test]
    fn host_to_host_mapping() {
        let eamt = table();

        assert_eq!(
            eamt.xlat_4to6(Ipv4Addr::new(203, 0, 113, 9)),
            Some("2001:db8:bbbb::b".parse().unwrap())
        );
    }

    #[test]
    fn miss_is_none() {
        let eamt = table();

        assert_eq!(eamt.xlat_6to4("2001:db8:cccc::1".parse().unwrap()), None);
        assert_eq!(eamt.xlat_4to6(Ipv4Addr::new(192, 0, 2, 1)), None);
    }

    #[test]
    fn longest_prefix_wins_on_overlap() {
        let mut eamt = table();
        eamt.add(net6("2001:db8:aaaa::80", 121), net4("192.0.2.128", 25))
            .unwrap();

        // Inside the /121: the more specific pair applies.
        assert_eq!(
            eamt.xlat_6to4("2001:db8:aaaa::81".parse().unwrap()),
            Some(Ipv4Addr::new(192, 0, 2, 129))
        );
        // Outside it: the /120 still does.
        assert_eq!(
            eamt.xlat_6to4("2001:db8:aaaa::7f".parse().unwrap()),
            Some(Ipv4Addr::new(198, 51, 100, 0x7f))
        );
    }

    #[test]
    fn mismatched_suffixes_are_rejected() {
        let mut eamt = Eamt::new();

        assert_eq!(
            eamt.add(net6("2001:db8::", 96), net4("10.0.0.0", 24)),
            Err(EamError::SuffixMismatch { host6: 32, host4: 8 })
        );
    }
}
