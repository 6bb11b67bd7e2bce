//! RFC 6052 algorithmic address embedding.
//!
//! An IPv4 address is spliced into an IPv6 prefix at a position that depends
//! on the prefix length; bits 64..72 (the "u" octet) are skipped and stay
//! zero in every layout.

use ip_network::Ipv6Network;
use std::net::{Ipv4Addr, Ipv6Addr};

/// The well-known prefix, 64:ff9b::/96.
pub const WELL_KNOWN_PREFIX: Ipv6Addr = Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0);

/// Prefix lengths RFC 6052 defines.
pub const LEGAL_PREFIX_LENGTHS: [u8; 6] = [32, 40, 48, 56, 64, 96];

/// An IPv6 prefix configured for algorithmic translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool6 {
    prefix: Ipv6Network,
}

impl Pool6 {
    /// Validates `prefix` as an RFC 6052 translation prefix: the length must
    /// be one of {32, 40, 48, 56, 64, 96} and the u octet must be zero.
    ///
    /// `force` skips the u-octet check, mirroring the operator override for
    /// deployments that knowingly violate it.
    pub fn new(prefix: Ipv6Network, force: bool) -> Result<Self, Pool6Error> {
        let len = prefix.netmask();

        if !LEGAL_PREFIX_LENGTHS.contains(&len) {
            return Err(Pool6Error::IllegalLength(len));
        }
        if !force && prefix.network_address().octets()[8] != 0 {
            return Err(Pool6Error::NonZeroUOctet);
        }

        Ok(Self { prefix })
    }

    /// The well-known 64:ff9b::/96 pool.
    pub fn well_known() -> Self {
        let prefix = match Ipv6Network::new(WELL_KNOWN_PREFIX, 96) {
            Ok(prefix) => prefix,
            Err(_) => unreachable!("the well-known prefix is canonical"),
        };

        Self { prefix }
    }

    pub fn prefix(&self) -> Ipv6Network {
        self.prefix
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        self.prefix.contains(addr)
    }

    /// Splices `addr` into the prefix (RFC 6052 section 2.2).
    pub fn embed(&self, addr: Ipv4Addr) -> Ipv6Addr {
        let mut out = self.prefix.network_address().octets();
        let v4 = addr.octets();

        match self.prefix.netmask() {
            32 => out[4..8].copy_from_slice(&v4),
            40 => {
                out[5..8].copy_from_slice(&v4[..3]);
                out[9] = v4[3];
            }
            48 => {
                out[6..8].copy_from_slice(&v4[..2]);
                out[9] = v4[2];
                out[10] = v4[3];
            }
            56 => {
                out[7] = v4[0];
                out[9..12].copy_from_slice(&v4[1..]);
            }
            64 => out[9..13].copy_from_slice(&v4),
            96 => out[12..16].copy_from_slice(&v4),
            len => unreachable!("illegal pool6 length {len} rejected in the constructor"),
        }

        Ipv6Addr::from(out)
    }

    /// Recovers the IPv4 address embedded in `addr`.
    ///
    /// Callers check [`Pool6::contains`] first; the prefix bits are not
    /// re-validated here.
    pub fn extract(&self, addr: Ipv6Addr) -> Ipv4Addr {
        let v6 = addr.octets();

        let v4: [u8; 4] = match self.prefix.netmask() {
            32 => [v6[4], v6[5], v6[6], v6[7]],
            40 => [v6[5], v6[6], v6[7], v6[9]],
            48 => [v6[6], v6[7], v6[9], v6[10]],
            56 => [v6[7], v6[9], v6[10], v6[11]],
            64 => [v6[9], v6[10], v6[11], v6[12]],
            96 => [v6[12], v6[13], v6[14], v6[15]],
            len => unreachable!("illegal pool6 length {len} rejected in the constructor"),
        };

        Ipv4Addr::from(v4)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Pool6Error {
    #[error("{0} is not an RFC 6052 prefix length")]
    IllegalLength(u8),
    #[error("bits 64..72 of the prefix must be zero")]
    NonZeroUOctet,
}
