//! Recording test doubles for the comms collaborators

use std::collections::BTreeSet;

use crate::addr::AddrRecord;
use crate::conn_type::{ConnType, ConnTypeSet};
use crate::demux::{GameSink, TransportControl};
use crate::errors::TransportError;
use crate::invite::LaunchInfo;
use crate::mqtt::MqttTopic;
use crate::transport::{OutboundMsg, TransportProcs};
use crate::types::{ChannelNo, GameId, MsgId};

/// One recorded `send_msg` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMsg {
    pub conn_type: ConnType,
    pub channel: ChannelNo,
    pub msg_id: MsgId,
    pub bytes: Vec<u8>,
}

/// Records every call; transports in `failing` report `Unavailable`
#[derive(Debug, Default)]
pub struct MockTransportProcs {
    pub sent: Vec<SentMsg>,
    pub mqtt_batches: Vec<Vec<(MqttTopic, Vec<u8>)>>,
    pub invites: Vec<(ConnType, LaunchInfo)>,
    pub counts: Vec<(usize, bool)>,
    pub failing: ConnTypeSet,
}

impl MockTransportProcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&mut self, conn_type: ConnType) {
        self.failing.add(conn_type);
    }

    pub fn heal(&mut self, conn_type: ConnType) {
        self.failing.remove(conn_type);
    }

    /// Wire calls on one transport, MQTT counting one per batched message
    pub fn sends_on(&self, conn_type: ConnType) -> usize {
        if conn_type == ConnType::Mqtt {
            self.mqtt_batches.iter().map(|batch| batch.len()).sum()
        } else {
            self.sent.iter().filter(|m| m.conn_type == conn_type).count()
                + self.invites.iter().filter(|(t, _)| *t == conn_type).count()
        }
    }

    pub fn total_sends(&self) -> usize {
        self.sent.len() + self.invites.len() + self.mqtt_batches.iter().map(Vec::len).sum::<usize>()
    }

    pub fn last_count(&self) -> Option<(usize, bool)> {
        self.counts.last().copied()
    }

    pub fn clear(&mut self) {
        self.sent.clear();
        self.mqtt_batches.clear();
        self.invites.clear();
        self.counts.clear();
    }
}

impl TransportProcs for MockTransportProcs {
    fn send_msg(&mut self, msg: &OutboundMsg<'_>) -> Result<usize, TransportError> {
        self.sent.push(SentMsg {
            conn_type: msg.conn_type,
            channel: msg.channel,
            msg_id: msg.msg_id,
            bytes: msg.bytes.to_vec(),
        });
        if self.failing.contains(msg.conn_type) {
            Err(TransportError::Unavailable {
                conn_type: msg.conn_type,
            })
        } else {
            Ok(msg.bytes.len())
        }
    }

    fn send_mqtt(&mut self, packets: &[(MqttTopic, Vec<u8>)]) -> usize {
        self.mqtt_batches.push(packets.to_vec());
        if self.failing.contains(ConnType::Mqtt) {
            0
        } else {
            packets.len()
        }
    }

    fn send_invite(
        &mut self,
        _addr: &AddrRecord,
        conn_type: ConnType,
        info: &LaunchInfo,
        _now: crate::types::Timestamp,
    ) -> bool {
        self.invites.push((conn_type, info.clone()));
        !self.failing.contains(conn_type)
    }

    fn count_changed(&mut self, count: usize, quashed: bool) {
        self.counts.push((count, quashed));
    }
}

/// Game layer double that records what it was handed
#[derive(Debug, Default)]
pub struct MockGameSink {
    pub known_games: BTreeSet<GameId>,
    pub messages: Vec<(GameId, ConnType, Vec<u8>)>,
    pub invites: Vec<LaunchInfo>,
    pub purged: Vec<GameId>,
}

impl GameSink for MockGameSink {
    fn on_message(
        &mut self,
        game_id: GameId,
        _from: &AddrRecord,
        arrived_on: ConnType,
        bytes: &[u8],
    ) -> bool {
        if !self.known_games.contains(&game_id) {
            return false;
        }
        self.messages.push((game_id, arrived_on, bytes.to_vec()));
        true
    }

    fn on_invite(&mut self, info: &LaunchInfo, _from: &AddrRecord) {
        self.invites.push(info.clone());
    }

    fn purge_game(&mut self, game_id: GameId) {
        self.known_games.remove(&game_id);
        self.purged.push(game_id);
    }
}

#[derive(Debug, Default)]
pub struct MockTransportControl {
    pub stopped: Vec<(GameId, AddrRecord)>,
    pub no_such_game: Vec<GameId>,
}

impl TransportControl for MockTransportControl {
    fn stop_sending(&mut self, game_id: GameId, to: &AddrRecord) {
        self.stopped.push((game_id, to.clone()));
    }

    fn reply_no_such_game(&mut self, game_id: GameId, _to: &AddrRecord) {
        self.no_such_game.push(game_id);
    }
}
