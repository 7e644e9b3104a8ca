//! Pending-packet tracking
//!
//! Every outbound message is tracked once per transport it was sent on,
//! until the peer acknowledges it. Nothing here times out: packets only move
//! on an ack, an explicit drop, or an externally triggered resend.
//!
//! A message no transport could take yet is held under an unrouted key
//! (`ConnType::None`) and gets its per-transport copies from `route` once
//! the peer becomes reachable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::conn_type::ConnType;
use crate::invite::LaunchInfo;
use crate::types::{ChannelNo, MsgId, Timestamp};
use crate::wire::payload_checksum;

// ----------------------------------------------------------------------------
// Packet State
// ----------------------------------------------------------------------------

/// Lifecycle of one tracked packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketState {
    /// Queued, not yet handed to a transport
    Created,
    /// Handed to a transport at least once, awaiting ack
    Pending,
    /// Peer confirmed receipt on this transport
    Acked,
    /// Given up on; the peer got it some other way or the game is gone
    Dropped,
}

impl PacketState {
    pub fn is_outstanding(&self) -> bool {
        matches!(self, PacketState::Created | PacketState::Pending)
    }
}

// ----------------------------------------------------------------------------
// Packet Key and Body
// ----------------------------------------------------------------------------

/// Identity of a tracked packet. Invites use `MsgId::NONE`, so there is at
/// most one invite per channel and transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PacketKey {
    pub channel: ChannelNo,
    pub conn_type: ConnType,
    pub msg_id: MsgId,
}

impl PacketKey {
    pub fn new(channel: ChannelNo, conn_type: ConnType, msg_id: MsgId) -> Self {
        Self {
            channel,
            conn_type,
            msg_id,
        }
    }

    pub fn invite(channel: ChannelNo, conn_type: ConnType) -> Self {
        Self::new(channel, conn_type, MsgId::NONE)
    }

    /// Placeholder for a message waiting for a usable transport
    pub fn unrouted(channel: ChannelNo, msg_id: MsgId) -> Self {
        Self::new(channel, ConnType::None, msg_id)
    }

    pub fn is_invite(&self) -> bool {
        self.msg_id == MsgId::NONE
    }

    pub fn is_routed(&self) -> bool {
        self.conn_type != ConnType::None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketBody {
    /// Encoded comms envelope
    Message(Vec<u8>),
    Invite(LaunchInfo),
}

impl PacketBody {
    pub fn len(&self) -> usize {
        match self {
            PacketBody::Message(bytes) => bytes.len(),
            PacketBody::Invite(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Pending Packet
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPacket {
    pub key: PacketKey,
    pub body: PacketBody,
    pub created_at: Timestamp,
    pub last_sent: Option<Timestamp>,
    /// Transmissions so far, first send included
    pub send_count: u32,
    pub state: PacketState,
}

impl PendingPacket {
    pub fn new(key: PacketKey, body: PacketBody, created_at: Timestamp) -> Self {
        Self {
            key,
            body,
            created_at,
            last_sent: None,
            send_count: 0,
            state: PacketState::Created,
        }
    }

    /// Resends so far; the first transmission isn't a retry
    pub fn retry_count(&self) -> u32 {
        self.send_count.saturating_sub(1)
    }

    /// Record a transmission attempt, successful or not
    pub fn mark_sent(&mut self, now: Timestamp) {
        self.send_count += 1;
        self.last_sent = Some(now);
        self.state = PacketState::Pending;
    }

    pub fn checksum(&self) -> u32 {
        match &self.body {
            PacketBody::Message(bytes) => payload_checksum(bytes),
            PacketBody::Invite(_) => 0,
        }
    }
}

// ----------------------------------------------------------------------------
// Pending Queue
// ----------------------------------------------------------------------------

/// Result of applying an ack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckResult {
    /// Confirmed on the transport the ack arrived on
    pub acked: Vec<PacketKey>,
    /// Copies of the same messages on other transports
    pub dropped: Vec<PacketKey>,
}

impl AckResult {
    pub fn is_empty(&self) -> bool {
        self.acked.is_empty() && self.dropped.is_empty()
    }

    pub fn len(&self) -> usize {
        self.acked.len() + self.dropped.len()
    }
}

/// Outstanding packets, ordered by channel, transport, then message id
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    packets: BTreeMap<PacketKey, PendingPacket>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a packet, replacing any earlier packet with the same key
    pub fn insert(&mut self, packet: PendingPacket) -> Option<PendingPacket> {
        trace!(key = ?packet.key, "tracking packet");
        self.packets.insert(packet.key, packet)
    }

    pub fn get(&self, key: &PacketKey) -> Option<&PendingPacket> {
        self.packets.get(key)
    }

    pub fn get_mut(&mut self, key: &PacketKey) -> Option<&mut PendingPacket> {
        self.packets.get_mut(key)
    }

    pub fn mark_sent(&mut self, key: &PacketKey, now: Timestamp) -> bool {
        match self.packets.get_mut(key) {
            Some(packet) => {
                packet.mark_sent(now);
                true
            }
            None => false,
        }
    }

    /// Apply an ack received on `conn_type` covering every message up to
    /// `last_rcvd` on `channel`. Invites on that channel are covered too:
    /// the peer evidently has the game. Settled packets are purged.
    pub fn ack(&mut self, channel: ChannelNo, conn_type: ConnType, last_rcvd: MsgId) -> AckResult {
        let mut result = AckResult::default();
        let covered: Vec<PacketKey> = self
            .packets
            .keys()
            .filter(|key| key.channel.same_peer(channel) && key.msg_id <= last_rcvd)
            .copied()
            .collect();

        for key in covered {
            if let Some(mut packet) = self.packets.remove(&key) {
                if key.conn_type == conn_type {
                    packet.state = PacketState::Acked;
                    result.acked.push(key);
                } else {
                    packet.state = PacketState::Dropped;
                    result.dropped.push(key);
                }
                trace!(key = ?key, state = ?packet.state, "settled packet");
            }
        }
        result
    }

    /// Drop every packet for a channel
    pub fn drop_channel(&mut self, channel: ChannelNo) -> usize {
        let before = self.packets.len();
        self.packets.retain(|key, _| !key.channel.same_peer(channel));
        before - self.packets.len()
    }

    /// Drop every packet on one transport
    pub fn drop_conn_type(&mut self, conn_type: ConnType) -> usize {
        let before = self.packets.len();
        self.packets.retain(|key, _| key.conn_type != conn_type);
        before - self.packets.len()
    }

    /// Drop every packet whose key matches
    pub fn drop_where<F: Fn(&PacketKey) -> bool>(&mut self, matches: F) -> usize {
        let before = self.packets.len();
        self.packets.retain(|key, _| !matches(key));
        before - self.packets.len()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.packets.len();
        self.packets.clear();
        count
    }

    /// Outstanding packets. Settled packets never linger, so this is the
    /// queue length.
    pub fn count(&self) -> usize {
        self.packets
            .values()
            .filter(|packet| packet.state.is_outstanding())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingPacket> {
        self.packets.values()
    }

    /// Routed keys matching an optional transport filter
    pub fn keys_for(&self, filter: Option<ConnType>) -> Vec<PacketKey> {
        self.packets
            .keys()
            .filter(|key| key.is_routed())
            .filter(|key| filter.map_or(true, |conn_type| key.conn_type == conn_type))
            .copied()
            .collect()
    }

    /// Give tracked packets a copy on each transport `types_for` lists for
    /// their channel. Messages fan out to every listed transport; invites
    /// only leave the unrouted state. Returns the keys added, all `Created`.
    pub fn route<F>(&mut self, types_for: F) -> Vec<PacketKey>
    where
        F: Fn(ChannelNo) -> Vec<ConnType>,
    {
        let mut groups: BTreeMap<(ChannelNo, MsgId), Vec<PacketKey>> = BTreeMap::new();
        for key in self.packets.keys() {
            groups.entry((key.channel, key.msg_id)).or_default().push(*key);
        }

        let mut added = Vec::new();
        for ((channel, msg_id), keys) in groups {
            let mut routed = keys.iter().any(PacketKey::is_routed);
            if routed && msg_id == MsgId::NONE {
                continue;
            }
            let (body, created_at) = match keys.first().and_then(|key| self.packets.get(key)) {
                Some(packet) => (packet.body.clone(), packet.created_at),
                None => continue,
            };
            for conn_type in types_for(channel) {
                if conn_type == ConnType::None {
                    continue;
                }
                routed = true;
                let key = PacketKey::new(channel, conn_type, msg_id);
                if self.packets.contains_key(&key) {
                    continue;
                }
                self.packets
                    .insert(key, PendingPacket::new(key, body.clone(), created_at));
                added.push(key);
            }
            if routed && self.packets.remove(&PacketKey::unrouted(channel, msg_id)).is_some() {
                trace!(channel = %channel, msg_id = %msg_id, "routed held packet");
            }
        }
        added
    }

    pub fn snapshot(&self) -> Vec<PendingPacket> {
        self.packets.values().cloned().collect()
    }

    pub fn snapshot_channel(&self, channel: ChannelNo) -> Vec<PendingPacket> {
        self.packets
            .values()
            .filter(|packet| packet.key.channel.same_peer(channel))
            .cloned()
            .collect()
    }

    pub fn count_for(&self, conn_type: ConnType) -> usize {
        self.packets
            .keys()
            .filter(|key| key.conn_type == conn_type)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: u16, conn_type: ConnType, id: u32) -> PendingPacket {
        PendingPacket::new(
            PacketKey::new(ChannelNo::new(channel), conn_type, MsgId::new(id)),
            PacketBody::Message(vec![id as u8]),
            Timestamp::new(1_000),
        )
    }

    #[test]
    fn resend_updates_in_place() {
        let mut queue = PendingQueue::new();
        let packet = message(1, ConnType::Bt, 1);
        let key = packet.key;
        queue.insert(packet);

        assert!(queue.mark_sent(&key, Timestamp::new(2_000)));
        assert!(queue.mark_sent(&key, Timestamp::new(3_000)));

        assert_eq!(queue.count(), 1);
        let tracked = queue.get(&key).unwrap();
        assert_eq!(tracked.state, PacketState::Pending);
        assert_eq!(tracked.retry_count(), 1);
        assert_eq!(tracked.last_sent, Some(Timestamp::new(3_000)));
    }

    #[test]
    fn ack_settles_own_transport_and_drops_siblings() {
        let mut queue = PendingQueue::new();
        for id in 1..=3 {
            queue.insert(message(1, ConnType::Bt, id));
            queue.insert(message(1, ConnType::Mqtt, id));
        }
        queue.insert(message(2, ConnType::Bt, 1));

        let result = queue.ack(ChannelNo::new(1), ConnType::Mqtt, MsgId::new(2));
        assert_eq!(result.acked.len(), 2);
        assert_eq!(result.dropped.len(), 2);
        assert!(result.acked.iter().all(|k| k.conn_type == ConnType::Mqtt));

        // Message 3 on both transports plus channel 2
        assert_eq!(queue.count(), 3);
        assert_eq!(queue.snapshot_channel(ChannelNo::new(2)).len(), 1);
    }

    #[test]
    fn ack_covers_invites() {
        let mut queue = PendingQueue::new();
        queue.insert(PendingPacket::new(
            PacketKey::invite(ChannelNo::new(0), ConnType::Sms),
            PacketBody::Invite(LaunchInfo::new(
                crate::types::GameId::new(1),
                "g",
                2,
                0,
            )),
            Timestamp::new(0),
        ));
        let result = queue.ack(ChannelNo::new(0), ConnType::Sms, MsgId::NONE);
        assert_eq!(result.acked.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn filtered_keys() {
        let mut queue = PendingQueue::new();
        queue.insert(message(1, ConnType::Bt, 1));
        queue.insert(message(1, ConnType::Sms, 1));
        assert_eq!(queue.keys_for(Some(ConnType::Sms)).len(), 1);
        assert_eq!(queue.keys_for(None).len(), 2);
        assert_eq!(queue.drop_conn_type(ConnType::Bt), 1);
        assert_eq!(queue.count_for(ConnType::Bt), 0);
    }

    #[test]
    fn held_message_is_routed_once_a_transport_appears() {
        let mut queue = PendingQueue::new();
        queue.insert(message(1, ConnType::None, 4));
        assert!(queue.keys_for(None).is_empty());
        assert_eq!(queue.count(), 1);

        assert!(queue.route(|_| Vec::new()).is_empty());
        assert_eq!(queue.count_for(ConnType::None), 1);

        let added = queue.route(|_| vec![ConnType::Sms, ConnType::Mqtt]);
        assert_eq!(added.len(), 2);
        assert_eq!(queue.count_for(ConnType::None), 0);
        assert_eq!(queue.keys_for(None), added);
        assert!(queue.iter().all(|packet| packet.state == PacketState::Created
            && packet.body == PacketBody::Message(vec![4])));
    }

    #[test]
    fn routing_adds_new_transports_but_not_to_sent_invites() {
        let mut queue = PendingQueue::new();
        queue.insert(message(1, ConnType::Sms, 1));
        queue.insert(PendingPacket::new(
            PacketKey::invite(ChannelNo::new(1), ConnType::Sms),
            PacketBody::Invite(LaunchInfo::new(
                crate::types::GameId::new(1),
                "g",
                2,
                1,
            )),
            Timestamp::new(0),
        ));

        let added = queue.route(|_| vec![ConnType::Sms, ConnType::Mqtt]);
        assert_eq!(
            added,
            vec![PacketKey::new(ChannelNo::new(1), ConnType::Mqtt, MsgId::new(1))]
        );
        assert!(queue.route(|_| vec![ConnType::Sms, ConnType::Mqtt]).is_empty());
    }
}
