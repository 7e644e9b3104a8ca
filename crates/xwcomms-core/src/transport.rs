//! Transport capability set
//!
//! The comms core never touches sockets, radios or brokers. The host hands
//! it a `TransportProcs` implementation that puts bytes on the wire, and
//! reports connectivity changes as `TransportEvent`s. `TransportHealth`
//! turns those reports into a per-transport belief about whether resending
//! is worthwhile.

use core::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::addr::AddrRecord;
use crate::conn_type::ConnType;
use crate::errors::TransportError;
use crate::invite::LaunchInfo;
use crate::mqtt::MqttTopic;
use crate::types::{ChannelNo, GameId, MsgId, Timestamp};

// ----------------------------------------------------------------------------
// Outbound Message
// ----------------------------------------------------------------------------

/// One message bound for one transport
#[derive(Debug, Clone)]
pub struct OutboundMsg<'a> {
    pub game_id: GameId,
    pub channel: ChannelNo,
    pub msg_id: MsgId,
    pub conn_type: ConnType,
    pub addr: &'a AddrRecord,
    /// Encoded comms envelope
    pub bytes: &'a [u8],
    pub stream_version: u8,
    pub created_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Transport Procs
// ----------------------------------------------------------------------------

/// Host-supplied send procedures
pub trait TransportProcs: Send {
    /// Send on a single non-MQTT transport. Returns bytes sent.
    fn send_msg(&mut self, msg: &OutboundMsg<'_>) -> Result<usize, TransportError>;

    /// Publish a batch of MQTT packets at QoS 2. Returns how many topics
    /// were published.
    fn send_mqtt(&mut self, packets: &[(MqttTopic, Vec<u8>)]) -> usize;

    /// Deliver an invitation. Returns whether it went out.
    fn send_invite(
        &mut self,
        addr: &AddrRecord,
        conn_type: ConnType,
        info: &LaunchInfo,
        now: Timestamp,
    ) -> bool;

    /// Backlog size changed, or a send was attempted
    fn count_changed(&mut self, count: usize, quashed: bool);
}

// ----------------------------------------------------------------------------
// Send Outcome
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    /// Message queued under `msg_id`; `delivered` of `attempted`
    /// transports accepted it on the first try
    Queued {
        msg_id: MsgId,
        attempted: usize,
        delivered: usize,
    },
    /// Game is quashed; nothing was queued or sent
    Quashed,
    /// Queued under `msg_id`, but the peer has no enabled transport yet.
    /// Held until a resend finds one.
    NoTransport { msg_id: MsgId },
}

impl SendOutcome {
    pub fn msg_id(&self) -> Option<MsgId> {
        match self {
            SendOutcome::Queued { msg_id, .. } | SendOutcome::NoTransport { msg_id } => {
                Some(*msg_id)
            }
            SendOutcome::Quashed => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Events and Health
// ----------------------------------------------------------------------------

/// Connectivity reports from the host's transport listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportEvent {
    Connected(ConnType),
    Disconnected(ConnType),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LinkState {
    last_success: Option<Timestamp>,
    last_failure: Option<Timestamp>,
    last_inbound: Option<Timestamp>,
    host_says_down: bool,
}

/// Per-transport belief about connectivity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportHealth {
    links: [LinkState; 9],
}

impl TransportHealth {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self, conn_type: ConnType) -> &LinkState {
        &self.links[conn_type.ordinal() as usize]
    }

    fn link_mut(&mut self, conn_type: ConnType) -> &mut LinkState {
        &mut self.links[conn_type.ordinal() as usize]
    }

    pub fn record_send(&mut self, conn_type: ConnType, ok: bool, now: Timestamp) {
        let link = self.link_mut(conn_type);
        if ok {
            link.last_success = Some(now);
        } else {
            link.last_failure = Some(now);
        }
    }

    pub fn record_inbound(&mut self, conn_type: ConnType, now: Timestamp) {
        let link = self.link_mut(conn_type);
        link.last_inbound = Some(now);
        link.host_says_down = false;
    }

    pub fn apply(&mut self, event: TransportEvent) {
        debug!(event = ?event, "transport event");
        match event {
            TransportEvent::Connected(conn_type) => self.link_mut(conn_type).host_says_down = false,
            TransportEvent::Disconnected(conn_type) => {
                self.link_mut(conn_type).host_says_down = true
            }
        }
    }

    /// Whether `conn_type` is believed disconnected or stale: the host said
    /// it's down, its latest send failed, or nothing has arrived on it for
    /// `stale_after`.
    pub fn is_stale(&self, conn_type: ConnType, now: Timestamp, stale_after: Duration) -> bool {
        let link = self.link(conn_type);
        if link.host_says_down {
            return true;
        }
        if let Some(failed) = link.last_failure {
            if link.last_success.map_or(true, |ok| failed >= ok) {
                return true;
            }
        }
        match link.last_inbound {
            Some(heard) => now.duration_since(heard) >= stale_after,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(60);

    #[test]
    fn silent_link_is_stale() {
        let health = TransportHealth::new();
        assert!(health.is_stale(ConnType::Bt, Timestamp::new(0), STALE));
    }

    #[test]
    fn recent_inbound_is_fresh_until_it_ages() {
        let mut health = TransportHealth::new();
        health.record_inbound(ConnType::Mqtt, Timestamp::from_secs(100));
        assert!(!health.is_stale(ConnType::Mqtt, Timestamp::from_secs(120), STALE));
        assert!(health.is_stale(ConnType::Mqtt, Timestamp::from_secs(160), STALE));
    }

    #[test]
    fn failure_and_host_reports_make_stale() {
        let mut health = TransportHealth::new();
        let now = Timestamp::from_secs(10);
        health.record_inbound(ConnType::Sms, now);
        health.record_send(ConnType::Sms, false, now);
        assert!(health.is_stale(ConnType::Sms, now, STALE));

        health.record_send(ConnType::Sms, true, Timestamp::from_secs(11));
        assert!(!health.is_stale(ConnType::Sms, Timestamp::from_secs(11), STALE));

        health.apply(TransportEvent::Disconnected(ConnType::Sms));
        assert!(health.is_stale(ConnType::Sms, Timestamp::from_secs(11), STALE));
        health.apply(TransportEvent::Connected(ConnType::Sms));
        assert!(!health.is_stale(ConnType::Sms, Timestamp::from_secs(11), STALE));
    }
}
