//! Typed outcomes of the translation pipeline.
//!
//! Every step returns `Result<T, Abort>`; `?` propagates the first non-Continue
//! outcome to the pipeline entry point, which converts it into the public
//! [`Verdict`] after applying the ICMP-error suppression rules.

/// The ICMP error the caller should send back to the packet's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// TTL or hop limit reached zero in transit.
    TtlExpired,
    /// No route / no binding for the destination.
    AddressUnreachable,
    /// No listener on the destination port.
    PortUnreachable,
    /// A header field could not be translated; `pointer` is the byte offset
    /// of the offending field within the dropped packet's L3 header.
    HeaderField { pointer: u32 },
    /// IPv4 source route with remaining hops cannot cross the translator.
    SourceRouteFailed,
    /// Dropped by local policy.
    FilterProhibited,
}

/// Final outcome for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Processing is not finished; only ever observed inside the pipeline.
    Continue,
    /// Hand the untranslated packet to the next upstream consumer.
    Accept,
    /// Free the packet silently.
    Drop,
    /// Free the packet and answer with the given ICMP error.
    Untranslatable(IcmpError),
    /// The translator keeps the packet (TCP simultaneous-open queue).
    Stolen,
}

/// Early exit from a translation step. The pipeline short-circuits on the
/// first of these via `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Abort {
    #[error("packet accepted untranslated")]
    Accept,
    #[error("packet dropped")]
    Drop,
    #[error("packet untranslatable: {0:?}")]
    Untranslatable(IcmpError),
    #[error("packet stolen")]
    Stolen,
}

impl Abort {
    /// Converts to the public verdict, suppressing the ICMP error where one
    /// must not be sent: in response to another ICMP error, to a non-first
    /// fragment, or for a failure inside a nested packet.
    pub(crate) fn into_verdict(self, may_answer: bool) -> Verdict {
        match self {
            Abort::Accept => Verdict::Accept,
            Abort::Drop => Verdict::Drop,
            Abort::Untranslatable(err) if may_answer => Verdict::Untranslatable(err),
            Abort::Untranslatable(_) => Verdict::Drop,
            Abort::Stolen => Verdict::Stolen,
        }
    }
}

/// Counter keys handed to the [`StatSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    /// Header malformed or otherwise unusable (INHDRERRORS).
    InHdrErrors,
    /// Resource shortage on the output path (OUTDISCARDS).
    OutDiscards,
    /// Transport checksum did not verify.
    BadChecksum,
    /// Hop limit or TTL ran out.
    TtlExpired,
    /// Routing header with nonzero Segments Left.
    SegmentsLeft,
    /// Unexpired IPv4 source route.
    SourceRoute,
    /// Zero-checksum UDP that could not be amended.
    ZeroUdpChecksum,
    /// ICMP type/code/pointer with no counterpart.
    UntranslatableIcmp,
    /// Address did not resolve through EAMT/pool6.
    UntranslatableAddress,
    /// Port or ID allocation failed.
    Pool4Exhausted,
    /// Inbound packet without a binding.
    NoBib,
    /// Dropped by a filtering policy knob.
    PolicyDrop,
    /// Route oracle had no answer.
    FailedRoute,
    /// Simultaneous-open queue overflowed.
    StoredPktOverflow,
}

/// Sink for per-instance counters. The kernel hook aggregates these; tests
/// assert on them.
pub trait StatSink: Send + Sync {
    fn record(&self, stat: Stat);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStats;

impl StatSink for NoStats {
    fn record(&self, _: Stat) {}
}

/// Counting sink, mostly useful in tests.
#[derive(Debug, Default)]
pub struct CountingStats {
    counters: parking_lot::Mutex<std::collections::HashMap<Stat, u64>>,
}

impl CountingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.counters.lock().get(&stat).copied().unwrap_or(0)
    }
}

impl StatSink for CountingStats {
    fn record(&self, stat: Stat) {
        *self.counters.lock().entry(stat).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppressed_untranslatable_becomes_silent_drop() {
        let abort = Abort::Untranslatable(IcmpError::TtlExpired);

        assert_eq!(
            abort.into_verdict(true),
            Verdict::Untranslatable(IcmpError::TtlExpired)
        );
        assert_eq!(abort.into_verdict(false), Verdict::Drop);
    }

    #[test]
    fn counting_sink_counts() {
        let stats = CountingStats::new();
        stats.record(Stat::NoBib);
        stats.record(Stat::NoBib);

        assert_eq!(stats.get(Stat::NoBib), 2);
        assert_eq!(stats.get(Stat::TtlExpired), 0);
    }
}
