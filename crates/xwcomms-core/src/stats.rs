//! Diagnostic counters and reports

use core::fmt;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::conn_type::ConnType;
use crate::types::{ChannelNo, GameId, MsgId};

// ----------------------------------------------------------------------------
// Transport Statistics
// ----------------------------------------------------------------------------

/// Counters for one transport. `pending` is a gauge refreshed from the
/// queue; the rest only grow until `reset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCounters {
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub pending: u64,
}

impl TransportCounters {
    /// Fraction of send attempts that succeeded (0.0 to 1.0)
    pub fn success_rate(&self) -> f32 {
        let attempts = self.sent + self.send_failures;
        if attempts == 0 {
            0.0
        } else {
            self.sent as f32 / attempts as f32
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    counters: BTreeMap<ConnType, TransportCounters>,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, conn_type: ConnType) {
        self.counters.entry(conn_type).or_default().sent += 1;
    }

    pub fn record_failure(&mut self, conn_type: ConnType) {
        self.counters.entry(conn_type).or_default().send_failures += 1;
    }

    /// A send counted as sent turned out to have failed
    pub fn reclassify_failure(&mut self, conn_type: ConnType) {
        let counters = self.counters.entry(conn_type).or_default();
        counters.sent = counters.sent.saturating_sub(1);
        counters.send_failures += 1;
    }

    pub fn record_received(&mut self, conn_type: ConnType) {
        self.counters.entry(conn_type).or_default().received += 1;
    }

    pub fn set_pending(&mut self, conn_type: ConnType, pending: usize) {
        self.counters.entry(conn_type).or_default().pending = pending as u64;
    }

    pub fn get(&self, conn_type: ConnType) -> TransportCounters {
        self.counters.get(&conn_type).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnType, TransportCounters)> + '_ {
        self.counters.iter().map(|(t, c)| (*t, *c))
    }

    pub fn totals(&self) -> TransportCounters {
        self.counters
            .values()
            .fold(TransportCounters::default(), |mut acc, c| {
                acc.sent += c.sent;
                acc.send_failures += c.send_failures;
                acc.received += c.received;
                acc.pending += c.pending;
                acc
            })
    }

    pub fn reset(&mut self) {
        self.counters.clear();
    }
}

// ----------------------------------------------------------------------------
// Comms Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub channel: ChannelNo,
    pub conn_types: String,
    pub next_msg_id: MsgId,
    pub last_msg_acked: MsgId,
    pub last_msg_rcvd: MsgId,
    pub pending: usize,
}

/// Snapshot of one game's comms state, for diagnostics screens and logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommsReport {
    pub game_id: GameId,
    pub is_host: bool,
    pub quashed: bool,
    pub pending: usize,
    pub resend_backoff_secs: u64,
    pub channels: Vec<ChannelReport>,
    pub transports: Vec<(ConnType, TransportCounters)>,
}

impl fmt::Display for CommsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "role: {}; game: {}; queue len: {}{}",
            if self.is_host { "host" } else { "guest" },
            self.game_id,
            self.pending,
            if self.quashed { " (quashed)" } else { "" }
        )?;
        writeln!(f, "resend backoff: {}s", self.resend_backoff_secs)?;
        for channel in &self.channels {
            writeln!(
                f,
                "  channel {} [{}]: next send {}, last acked {}, last rcvd {}, pending {}",
                channel.channel,
                channel.conn_types,
                channel.next_msg_id,
                channel.last_msg_acked,
                channel.last_msg_rcvd,
                channel.pending
            )?;
        }
        for (conn_type, counters) in &self.transports {
            writeln!(
                f,
                "  {}: sent {} ({} failed), received {}, pending {}",
                conn_type.short_name(),
                counters.sent,
                counters.send_failures,
                counters.received,
                counters.pending
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_until_reset() {
        let mut stats = TransportStats::new();
        stats.record_sent(ConnType::Bt);
        stats.record_sent(ConnType::Bt);
        stats.record_failure(ConnType::Bt);
        stats.record_received(ConnType::Mqtt);
        stats.set_pending(ConnType::Bt, 4);

        let bt = stats.get(ConnType::Bt);
        assert_eq!(bt.sent, 2);
        assert_eq!(bt.pending, 4);
        assert!((bt.success_rate() - 2.0 / 3.0).abs() < f32::EPSILON);
        assert_eq!(stats.totals().received, 1);

        stats.reset();
        assert_eq!(stats.get(ConnType::Bt), TransportCounters::default());
    }
}
