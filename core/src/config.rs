//! Per-instance configuration.
//!
//! The control plane writes these atomically by replacing the whole instance;
//! the data path only ever reads them.

use crate::rfc6052::Pool6;
use std::time::Duration;

/// How aggressively EAM-translated packets are turned around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EamHairpinMode {
    /// Never hairpin.
    Off,
    /// Re-run every translated IPv4 packet whose destination maps back.
    Simple,
    /// Hairpin only packets whose addresses were produced via pool6 and map
    /// into an EAM entry.
    #[default]
    Intrinsic,
}

/// Idle timeouts per protocol/state, with the RFC 6146 floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub udp: Duration,
    pub icmp: Duration,
    pub tcp_est: Duration,
    pub tcp_trans: Duration,
}

impl Timeouts {
    pub const UDP_MIN: Duration = Duration::from_secs(2 * 60);
    pub const ICMP_MIN: Duration = Duration::from_secs(60);
    pub const TCP_EST_MIN: Duration = Duration::from_secs(2 * 60 * 60 + 4 * 60);
    pub const TCP_TRANS_MIN: Duration = Duration::from_secs(4 * 60);

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.udp < Self::UDP_MIN {
            return Err(ConfigError::TimeoutTooSmall("udp", Self::UDP_MIN));
        }
        if self.icmp < Self::ICMP_MIN {
            return Err(ConfigError::TimeoutTooSmall("icmp", Self::ICMP_MIN));
        }
        if self.tcp_est < Self::TCP_EST_MIN {
            return Err(ConfigError::TimeoutTooSmall("tcp-est", Self::TCP_EST_MIN));
        }
        if self.tcp_trans < Self::TCP_TRANS_MIN {
            return Err(ConfigError::TimeoutTooSmall("tcp-trans", Self::TCP_TRANS_MIN));
        }
        Ok(())
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            udp: Duration::from_secs(5 * 60),
            icmp: Self::ICMP_MIN,
            tcp_est: Self::TCP_EST_MIN,
            tcp_trans: Self::TCP_TRANS_MIN,
        }
    }
}

/// Session-replication knobs. The sync transport itself lives outside the
/// core; only the shape of the options is kept here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSync {
    pub enabled: bool,
    pub flush_asap: bool,
    pub flush_deadline: Duration,
    pub capacity: usize,
    pub max_payload: usize,
}

impl Default for SessionSync {
    fn default() -> Self {
        Self {
            enabled: false,
            flush_asap: true,
            flush_deadline: Duration::from_secs(2),
            capacity: 512,
            max_payload: 1452,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Globals {
    pub enabled: bool,
    pub pool6: Option<Pool6>,

    /// Overwrite the IPv4 TOS octet with `new_tos` instead of copying the
    /// IPv6 traffic class.
    pub reset_tos: bool,
    pub new_tos: u8,
    /// Zero the IPv6 traffic class instead of copying the IPv4 TOS.
    pub reset_traffic_class: bool,

    /// Generate a random IPv4 Identification for small unfragmented packets.
    pub build_ipv4_id: bool,
    pub df_always_on: bool,

    /// SIIT: compute the missing checksum of zero-checksum IPv4 UDP instead
    /// of dropping.
    pub amend_udp_checksum_zero: bool,
    pub randomize_rfc6791: bool,
    pub eam_hairpin_mode: EamHairpinMode,

    /// NAT64: address-dependent filtering for UDP/ICMP.
    pub drop_by_addr: bool,
    pub drop_icmpv6_info: bool,
    pub drop_external_tcp: bool,
    /// Derive the source of translated ICMPv6 errors from the error's own
    /// IPv4 source instead of the session tuple.
    pub src_icmp6errs_better: bool,
    /// Fields feeding the port-allocation hash, as a bitmap.
    pub f_args: u8,
    pub handle_rst_during_fin_rcv: bool,

    /// RFC 1191 plateau table, strictly descending.
    pub mtu_plateaus: Vec<u16>,
    pub timeouts: Timeouts,

    pub log_bibs: bool,
    pub log_sessions: bool,
    /// Upper bound on packets parked for TCP simultaneous-open.
    pub max_stored_pkts: usize,
    pub session_sync: SessionSync,
}

/// The RFC 1191 plateau values.
pub const DEFAULT_MTU_PLATEAUS: [u16; 11] = [
    65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 508, 296, 68,
];

impl Default for Globals {
    fn default() -> Self {
        Self {
            enabled: true,
            pool6: None,
            reset_tos: false,
            new_tos: 0,
            reset_traffic_class: false,
            build_ipv4_id: true,
            df_always_on: false,
            amend_udp_checksum_zero: false,
            randomize_rfc6791: false,
            eam_hairpin_mode: EamHairpinMode::default(),
            drop_by_addr: true,
            drop_icmpv6_info: false,
            drop_external_tcp: false,
            src_icmp6errs_better: true,
            f_args: 0b1011,
            handle_rst_during_fin_rcv: false,
            mtu_plateaus: DEFAULT_MTU_PLATEAUS.to_vec(),
            timeouts: Timeouts::default(),
            log_bibs: false,
            log_sessions: false,
            max_stored_pkts: 10,
            session_sync: SessionSync::default(),
        }
    }
}

impl Globals {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu_plateaus.is_empty() {
            return Err(ConfigError::EmptyPlateaus);
        }
        if !self.mtu_plateaus.windows(2).all(|w| w[0] > w[1]) {
            return Err(ConfigError::UnsortedPlateaus);
        }
        if self.mtu_plateaus.contains(&0) {
            return Err(ConfigError::ZeroPlateau);
        }
        self.timeouts.validate()
    }

    /// Brings a user-supplied plateau list into canonical form: descending,
    /// deduplicated, zeroes removed.
    pub fn sanitize_plateaus(mut values: Vec<u16>) -> Vec<u16> {
        values.retain(|v| *v != 0);
        values.sort_unstable_by(|a, b| b.cmp(a));
        values.dedup();
        values
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} timeout is below the RFC floor of {1:?}")]
    TimeoutTooSmall(&'static str, Duration),
    #[error("the MTU plateau list must not be empty")]
    EmptyPlateaus,
    #[error("MTU plateaus must be strictly descending")]
    UnsortedPlateaus,
    #[error("0 is not a valid MTU plateau")]
    ZeroPlateau,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Globals::default().validate().unwrap();
    }

    #[test]
    fn plateau_sanitizing() {
        let sane = Globals::sanitize_plateaus(vec![0, 1500, 68, 1500, 9000]);
        assert_eq!(sane, vec![9000, 1500, 68]);
    }

    #[test]
    fn timeout_floors_are_enforced() {
        let timeouts = Timeouts {
            udp: Duration::from_secs(10),
            ..Timeouts::default()
        };

        assert_eq!(
            timeouts.validate(),
            Err(ConfigError::TimeoutTooSmall("udp", Timeouts::UDP_MIN))
        );
    }
}
