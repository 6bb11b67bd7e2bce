//! The Binding Information Base and session tables (RFC 6146).
//!
//! One table per protocol, each behind its own lock. A lookup-or-insert is
//! one atomic operation under that lock; nothing is held across packet I/O.
//! Expiry is sans-IO: callers drive it with [`Bib::poll_timeout`] and
//! [`Bib::expire`].

use crate::L4Proto;
use crate::config::Globals;
use crate::pool4::{Pool4, TransportAddr4};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv6Addr;
use std::time::Instant;

/// An (address, port) pair on the IPv6 side. For ICMP the port is the echo
/// identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportAddr6 {
    pub addr: Ipv6Addr,
    pub port: u16,
}

impl TransportAddr6 {
    pub fn new(addr: Ipv6Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for TransportAddr6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.port)
    }
}

/// The RFC 6146 TCP connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    V4Init,
    V6Init,
    Established,
    V4FinRcv,
    V6FinRcv,
    V4V6FinRcv,
    Trans,
}

/// TCP header bits that drive the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Why a packet did not make it through filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum FilterError {
    #[error("no binding for this packet")]
    NoBib,
    #[error("no session and the packet may not create one")]
    NoSession,
    #[error("the transport-address pool is exhausted")]
    PoolExhausted,
    #[error("dropped by filtering policy")]
    PolicyDrop,
    #[error("packet is not acceptable in the current connection state")]
    IllegalTransition,
    #[error("packet was queued awaiting the matching SYN")]
    Stolen,
    #[error("the simultaneous-open queue is full")]
    StoreFull,
}

/// The addresses of one flow on both sides of the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapping {
    /// The IPv6 endpoint behind the translator.
    pub local6: TransportAddr6,
    /// Its IPv4 face, allocated from pool4.
    pub local4: TransportAddr4,
    /// The IPv4 remote node.
    pub remote4: TransportAddr4,
    /// The remote node as seen on the IPv6 side (pool6-embedded).
    pub remote6: TransportAddr6,
}

#[derive(Debug)]
struct Session {
    remote4: TransportAddr4,
    remote6: TransportAddr6,
    /// Only meaningful while the table's protocol is TCP.
    state: TcpState,
    expires_at: Instant,
    /// Packets parked until the IPv6 side confirms the connection.
    stored: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct BibEntry {
    addr6: TransportAddr6,
    addr4: TransportAddr4,
    is_static: bool,
    sessions: HashMap<TransportAddr4, Session>,
}

#[derive(Debug)]
struct ProtoTable {
    proto: L4Proto,
    by6: HashMap<TransportAddr6, BibEntry>,
    by4: HashMap<TransportAddr4, TransportAddr6>,
    /// Sessions sorted by deadline; tuples disambiguate equal instants.
    deadlines: BTreeSet<(Instant, TransportAddr6, TransportAddr4)>,
}

impl ProtoTable {
    fn new(proto: L4Proto) -> Self {
        Self {
            proto,
            by6: HashMap::new(),
            by4: HashMap::new(),
            deadlines: BTreeSet::new(),
        }
    }

    fn reschedule(
        deadlines: &mut BTreeSet<(Instant, TransportAddr6, TransportAddr4)>,
        key6: TransportAddr6,
        session: &mut Session,
        deadline: Instant,
    ) {
        deadlines.remove(&(session.expires_at, key6, session.remote4));
        session.expires_at = deadline;
        deadlines.insert((deadline, key6, session.remote4));
    }
}

/// The BIB/session store of one NAT64 instance.
#[derive(Debug)]
pub struct Bib {
    tcp: Mutex<ProtoTable>,
    udp: Mutex<ProtoTable>,
    icmp: Mutex<ProtoTable>,
}

impl Default for Bib {
    fn default() -> Self {
        Self::new()
    }
}

impl Bib {
    pub fn new() -> Self {
        Self {
            tcp: Mutex::new(ProtoTable::new(L4Proto::Tcp)),
            udp: Mutex::new(ProtoTable::new(L4Proto::Udp)),
            icmp: Mutex::new(ProtoTable::new(L4Proto::Icmp)),
        }
    }

    fn table(&self, proto: L4Proto) -> &Mutex<ProtoTable> {
        match proto {
            L4Proto::Tcp => &self.tcp,
            L4Proto::Udp => &self.udp,
            L4Proto::Icmp => &self.icmp,
        }
    }

    /// Registers a static binding, claiming its IPv4 side from the pool.
    pub fn add_static(
        &self,
        proto: L4Proto,
        pool4: &Pool4,
        addr6: TransportAddr6,
        addr4: TransportAddr4,
    ) -> Result<(), StaticBibError> {
        let mut table = self.table(proto).lock();

        if table.by6.contains_key(&addr6) || table.by4.contains_key(&addr4) {
            return Err(StaticBibError::Taken);
        }
        if !pool4.claim(proto, addr4) {
            return Err(StaticBibError::NotInPool);
        }

        table.by4.insert(addr4, addr6);
        table.by6.insert(
            addr6,
            BibEntry {
                addr6,
                addr4,
                is_static: true,
                sessions: HashMap::new(),
            },
        );

        Ok(())
    }

    /// The 6→4 lookup-or-create of RFC 6146: find (or mint) the BIB for the
    /// packet's source, then find (or open) the session toward `remote4`.
    pub(crate) fn open_6to4(
        &self,
        proto: L4Proto,
        pool4: &Pool4,
        src6: TransportAddr6,
        remote4: TransportAddr4,
        remote6: TransportAddr6,
        flags: Option<SegFlags>,
        cfg: &Globals,
        now: Instant,
    ) -> Result<(Mapping, Vec<Vec<u8>>), FilterError> {
        let mut table = self.table(proto).lock();
        let ProtoTable {
            proto,
            by6,
            by4,
            deadlines,
        } = &mut *table;
        let proto = *proto;

        if !by6.contains_key(&src6) {
            // Without an existing binding there is no session either; a TCP
            // non-SYN must not leave a tentative binding behind.
            if proto == L4Proto::Tcp && !flags.unwrap_or_default().syn {
                return Err(FilterError::NoSession);
            }

            let addr4 = pool4
                .allocate(proto, src6.port)
                .ok_or(FilterError::PoolExhausted)?;

            if cfg.log_bibs {
                tracing::info!(%src6, %addr4, ?proto, "New binding");
            }

            by4.insert(addr4, src6);
            by6.insert(
                src6,
                BibEntry {
                    addr6: src6,
                    addr4,
                    is_static: false,
                    sessions: HashMap::new(),
                },
            );
        }

        let entry = by6.get_mut(&src6).expect("present or just inserted");

        // For ICMP the v4-side identifier is the BIB's, whatever id the
        // remote used; rewrite the session key accordingly.
        let remote4 = match proto {
            L4Proto::Icmp => TransportAddr4::new(remote4.addr, entry.addr4.port),
            L4Proto::Tcp | L4Proto::Udp => remote4,
        };

        let mapping = Mapping {
            local6: entry.addr6,
            local4: entry.addr4,
            remote4,
            remote6,
        };

        let mut released = Vec::new();

        match entry.sessions.get_mut(&remote4) {
            Some(session) => {
                let timer = match proto {
                    L4Proto::Tcp => {
                        let flags = flags.unwrap_or_default();
                        let decision = tcp_transition(session.state, PacketSide::V6, flags, cfg)?;

                        if let Some(next) = decision.next_state {
                            if cfg.log_sessions && next != session.state {
                                tracing::info!(?next, prev = ?session.state, "TCP session transition");
                            }
                            if next == TcpState::Established && session.state == TcpState::V4Init {
                                released = std::mem::take(&mut session.stored);
                            }
                            session.state = next;
                        }

                        decision.timer
                    }
                    L4Proto::Udp => Some(cfg.timeouts.udp),
                    L4Proto::Icmp => Some(cfg.timeouts.icmp),
                };

                if let Some(timer) = timer {
                    ProtoTable::reschedule(deadlines, src6, session, now + timer);
                }
            }
            None => {
                let (state, timer) = match proto {
                    L4Proto::Tcp => {
                        let flags = flags.unwrap_or_default();
                        if !flags.syn {
                            // No session and no SYN: nothing to attach this to.
                            return Err(FilterError::NoSession);
                        }
                        (TcpState::V6Init, cfg.timeouts.tcp_trans)
                    }
                    L4Proto::Udp => (TcpState::Established, cfg.timeouts.udp),
                    L4Proto::Icmp => (TcpState::Established, cfg.timeouts.icmp),
                };

                if cfg.log_sessions {
                    tracing::info!(%src6, %remote4, ?proto, "New session");
                }

                let expires_at = now + timer;
                entry.sessions.insert(
                    remote4,
                    Session {
                        remote4,
                        remote6,
                        state,
                        expires_at,
                        stored: Vec::new(),
                    },
                );
                deadlines.insert((expires_at, src6, remote4));
            }
        }

        Ok((mapping, released))
    }

    /// The 4→6 lookup of RFC 6146. The BIB key is the packet's destination,
    /// because the external side addresses the binding's IPv4 face.
    ///
    /// `packet` is the raw input, stored if the connection has to wait for a
    /// simultaneous open.
    pub(crate) fn open_4to6(
        &self,
        proto: L4Proto,
        local4: TransportAddr4,
        remote4: TransportAddr4,
        remote6: TransportAddr6,
        flags: Option<SegFlags>,
        packet: Option<&[u8]>,
        cfg: &Globals,
        now: Instant,
    ) -> Result<Mapping, FilterError> {
        let mut table = self.table(proto).lock();
        let ProtoTable {
            proto,
            by6,
            by4,
            deadlines,
        } = &mut *table;
        let proto = *proto;

        let key6 = *by4.get(&local4).ok_or(FilterError::NoBib)?;
        let entry = by6.get_mut(&key6).ok_or(FilterError::NoBib)?;

        let remote4 = match proto {
            L4Proto::Icmp => TransportAddr4::new(remote4.addr, entry.addr4.port),
            L4Proto::Tcp | L4Proto::Udp => remote4,
        };
        let remote6 = match proto {
            L4Proto::Icmp => TransportAddr6::new(remote6.addr, entry.addr6.port),
            L4Proto::Tcp | L4Proto::Udp => remote6,
        };

        let mapping = Mapping {
            local6: entry.addr6,
            local4: entry.addr4,
            remote4,
            remote6,
        };

        match entry.sessions.get_mut(&remote4) {
            Some(session) => {
                let timer = match proto {
                    L4Proto::Tcp => {
                        let flags = flags.unwrap_or_default();
                        let decision = tcp_transition(session.state, PacketSide::V4, flags, cfg)?;

                        if session.state == TcpState::V4Init {
                            if flags.rst {
                                // Nothing to reset yet, and an RST must not
                                // provoke an ICMP error.
                                return Err(FilterError::NoSession);
                            }
                            if !flags.syn {
                                // Data before the IPv6 side confirmed.
                                return Err(FilterError::IllegalTransition);
                            }

                            // Still waiting for the IPv6 SYN; keep parking.
                            store_packet(session, packet, cfg)?;
                            return Err(FilterError::Stolen);
                        }

                        if let Some(next) = decision.next_state {
                            if cfg.log_sessions && next != session.state {
                                tracing::info!(?next, prev = ?session.state, "TCP session transition");
                            }
                            session.state = next;
                        }

                        decision.timer
                    }
                    L4Proto::Udp => Some(cfg.timeouts.udp),
                    L4Proto::Icmp => Some(cfg.timeouts.icmp),
                };

                if let Some(timer) = timer {
                    ProtoTable::reschedule(deadlines, key6, session, now + timer);
                }

                Ok(mapping)
            }
            None => {
                match proto {
                    L4Proto::Tcp => {
                        let flags = flags.unwrap_or_default();

                        if !flags.syn {
                            return Err(FilterError::NoSession);
                        }
                        if cfg.drop_external_tcp {
                            tracing::debug!(%local4, "Externally initiated TCP disallowed by policy");
                            return Err(FilterError::PolicyDrop);
                        }

                        // RFC 6146 simultaneous open: park the SYN and wait
                        // for the IPv6 side to confirm.
                        let expires_at = now + cfg.timeouts.tcp_trans;
                        let mut session = Session {
                            remote4,
                            remote6,
                            state: TcpState::V4Init,
                            expires_at,
                            stored: Vec::new(),
                        };
                        store_packet(&mut session, packet, cfg)?;

                        if cfg.log_sessions {
                            tracing::info!(%remote4, %key6, "New session (V4 init)");
                        }

                        entry.sessions.insert(remote4, session);
                        deadlines.insert((expires_at, key6, remote4));

                        Err(FilterError::Stolen)
                    }
                    L4Proto::Udp | L4Proto::Icmp => {
                        if cfg.drop_by_addr
                            && !entry.sessions.keys().any(|r| r.addr == remote4.addr)
                        {
                            tracing::debug!(
                                remote = %remote4,
                                "Address-dependent filtering dropped an unknown remote"
                            );
                            return Err(FilterError::PolicyDrop);
                        }

                        let timer = match proto {
                            L4Proto::Udp => cfg.timeouts.udp,
                            _ => cfg.timeouts.icmp,
                        };
                        let expires_at = now + timer;

                        if cfg.log_sessions {
                            tracing::info!(%remote4, %key6, ?proto, "New session");
                        }

                        entry.sessions.insert(
                            remote4,
                            Session {
                                remote4,
                                remote6,
                                state: TcpState::Established,
                                expires_at,
                                stored: Vec::new(),
                            },
                        );
                        deadlines.insert((expires_at, key6, remote4));

                        Ok(mapping)
                    }
                }
            }
        }
    }

    /// Looks up an existing session by its IPv6-side endpoint; never creates
    /// anything. ICMP errors use this (`remote_port` of `None` resolves to
    /// the binding's IPv4 identifier).
    pub(crate) fn find_session_by6(
        &self,
        proto: L4Proto,
        local6: TransportAddr6,
        remote_addr: std::net::Ipv4Addr,
        remote_port: Option<u16>,
    ) -> Option<Mapping> {
        let table = self.table(proto).lock();
        let entry = table.by6.get(&local6)?;
        let remote4 = TransportAddr4::new(remote_addr, remote_port.unwrap_or(entry.addr4.port));
        let session = entry.sessions.get(&remote4)?;

        Some(Mapping {
            local6: entry.addr6,
            local4: entry.addr4,
            remote4,
            remote6: session.remote6,
        })
    }

    /// Looks up an existing session by the binding's IPv4 face.
    pub(crate) fn find_session_by4(
        &self,
        proto: L4Proto,
        local4: TransportAddr4,
        remote_addr: std::net::Ipv4Addr,
        remote_port: Option<u16>,
    ) -> Option<Mapping> {
        let table = self.table(proto).lock();
        let key6 = *table.by4.get(&local4)?;
        let entry = table.by6.get(&key6)?;
        let remote4 = TransportAddr4::new(remote_addr, remote_port.unwrap_or(entry.addr4.port));
        let session = entry.sessions.get(&remote4)?;

        Some(Mapping {
            local6: entry.addr6,
            local4: entry.addr4,
            remote4,
            remote6: session.remote6,
        })
    }

    /// Deletes sessions whose deadline has passed, and bindings left without
    /// sessions. Returns the raw packets of expired simultaneous-open queues;
    /// the caller owes their senders an ICMP "port unreachable".
    pub fn expire(&self, pool4: &Pool4, now: Instant) -> Vec<Vec<u8>> {
        let mut orphans = Vec::new();

        for proto in [L4Proto::Tcp, L4Proto::Udp, L4Proto::Icmp] {
            let mut table = self.table(proto).lock();

            loop {
                let Some(&(deadline, key6, remote4)) = table.deadlines.iter().next() else {
                    break;
                };
                if deadline > now {
                    break;
                }
                table.deadlines.remove(&(deadline, key6, remote4));

                let Some(entry) = table.by6.get_mut(&key6) else {
                    continue;
                };
                let Some(session) = entry.sessions.remove(&remote4) else {
                    continue;
                };

                tracing::debug!(%key6, %remote4, ?proto, state = ?session.state, "Session expired");
                orphans.extend(session.stored);

                if entry.sessions.is_empty() && !entry.is_static {
                    let addr4 = entry.addr4;
                    table.by6.remove(&key6);
                    table.by4.remove(&addr4);
                    pool4.release(proto, addr4);
                    tracing::debug!(%key6, %addr4, ?proto, "Binding released");
                }
            }
        }

        orphans
    }

    /// The next instant at which [`Bib::expire`] has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        [&self.tcp, &self.udp, &self.icmp]
            .into_iter()
            .filter_map(|table| table.lock().deadlines.iter().next().map(|d| d.0))
            .min()
    }

    /// Number of bindings for `proto`.
    pub fn bib_count(&self, proto: L4Proto) -> usize {
        self.table(proto).lock().by6.len()
    }

    /// Number of sessions for `proto`.
    pub fn session_count(&self, proto: L4Proto) -> usize {
        self.table(proto)
            .lock()
            .by6
            .values()
            .map(|entry| entry.sessions.len())
            .sum()
    }

    /// Snapshot of the current TCP state of one session, for tests and
    /// diagnostics.
    pub fn tcp_state(&self, local6: TransportAddr6, remote4: TransportAddr4) -> Option<TcpState> {
        let table = self.tcp.lock();
        Some(table.by6.get(&local6)?.sessions.get(&remote4)?.state)
    }
}

fn store_packet(
    session: &mut Session,
    packet: Option<&[u8]>,
    cfg: &Globals,
) -> Result<(), FilterError> {
    let Some(packet) = packet else {
        return Ok(());
    };

    if session.stored.len() >= cfg.max_stored_pkts {
        return Err(FilterError::StoreFull);
    }

    session.stored.push(packet.to_vec());
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketSide {
    V4,
    V6,
}

struct TcpDecision {
    /// `None` leaves the state untouched.
    next_state: Option<TcpState>,
    /// `None` leaves the deadline untouched.
    timer: Option<std::time::Duration>,
}

/// The RFC 6146 TCP state machine, one packet at a time.
///
/// Stateless on purpose: out-of-order SYN/FIN observation across cores means
/// flags, not sequence numbers, drive the transitions.
fn tcp_transition(
    state: TcpState,
    side: PacketSide,
    flags: SegFlags,
    cfg: &Globals,
) -> Result<TcpDecision, FilterError> {
    use PacketSide::*;
    use TcpState::*;

    let est = cfg.timeouts.tcp_est;
    let trans = cfg.timeouts.tcp_trans;

    let decision = |next_state, timer| Ok(TcpDecision { next_state, timer });

    if flags.rst {
        return match state {
            Established => decision(Some(Trans), Some(trans)),
            V4FinRcv | V6FinRcv if cfg.handle_rst_during_fin_rcv => {
                decision(Some(Trans), Some(trans))
            }
            // An RST is translated but moves no other state.
            _ => decision(None, None),
        };
    }

    match (state, side) {
        (V6Init, V6) => {
            if flags.syn {
                decision(None, Some(trans))
            } else {
                decision(None, None)
            }
        }
        (V6Init, V4) => {
            if flags.syn {
                decision(Some(Established), Some(est))
            } else {
                Err(FilterError::IllegalTransition)
            }
        }
        (V4Init, V6) => {
            if flags.syn {
                decision(Some(Established), Some(est))
            } else {
                Err(FilterError::IllegalTransition)
            }
        }
        // The IPv4 side may not push data before the IPv6 SYN; the caller
        // stores the packet instead.
        (V4Init, V4) => decision(None, None),
        (Established, side) => {
            if flags.fin {
                let next = match side {
                    V4 => V4FinRcv,
                    V6 => V6FinRcv,
                };
                decision(Some(next), None)
            } else {
                decision(None, Some(est))
            }
        }
        (V4FinRcv, V6) if flags.fin => decision(Some(V4V6FinRcv), Some(trans)),
        (V6FinRcv, V4) if flags.fin => decision(Some(V4V6FinRcv), Some(trans)),
        (V4FinRcv, _) | (V6FinRcv, _) => decision(None, Some(est)),
        (V4V6FinRcv, _) => decision(None, None),
        // Data on a closing connection revives it.
        (Trans, _) => decision(Some(Established), Some(est)),
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StaticBibError {
    #[error("one side of the binding is already in use")]
    Taken,
    #[error("the IPv4 transport address is not in the pool")]
    NotInPool,
}
