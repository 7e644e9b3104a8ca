//! MQTT topics and packet codec
//!
//! Each device subscribes to its own topic, `xw4/device/<DEVID>`. Game
//! traffic is published to `xw4/device/<DEVID>/<GAMEID>` so brokers can
//! fan it out per game. Publishing has real per-call overhead, so outbound
//! messages are batched: every message bound for the same topic rides in
//! one packet.
//!
//! Packet layouts (all integers big-endian):
//! ```text
//! PROTO_1: [u8 1][u64 sender][u32 game id][u8 cmd] payload
//! PROTO_3: [u8 3][u64 sender][u8 cmd][u8 count]{varint len, bytes}*
//! ```
//! PROTO_3 takes its game id from the topic.

use core::fmt;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::errors::{AddressError, CommsError, Result, StreamError};
use crate::invite::LaunchInfo;
use crate::stream::{InStream, OutStream};
use crate::types::{GameId, MqttDevId};

pub const PROTO_1: u8 = 1;
pub const PROTO_3: u8 = 3;

/// Exactly-once delivery; required by the broker client
pub const QOS: u8 = 2;

const TOPIC_PREFIX: &str = "xw4/device/";

// ----------------------------------------------------------------------------
// Topics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MqttTopic(String);

impl MqttTopic {
    /// The topic a device listens on
    pub fn device(dev_id: MqttDevId) -> Self {
        Self(format!("{}{}", TOPIC_PREFIX, dev_id))
    }

    /// Per-game subtopic of a device's topic
    pub fn game(dev_id: MqttDevId, game_id: GameId) -> Self {
        Self(format!("{}{}/{}", TOPIC_PREFIX, dev_id, game_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into device id and, for per-game topics, game id
    pub fn parse(topic: &str) -> Result<(MqttDevId, Option<GameId>)> {
        let rest = topic
            .strip_prefix(TOPIC_PREFIX)
            .ok_or_else(|| AddressError::BadTopic(topic.to_string()))?;
        let mut parts = rest.splitn(2, '/');
        let dev_id: MqttDevId = parts
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|_| AddressError::BadTopic(topic.to_string()))?;
        let game_id = match parts.next() {
            Some(game) => Some(GameId::new(
                u32::from_str_radix(game, 16)
                    .map_err(|_| AddressError::BadTopic(topic.to_string()))?,
            )),
            None => None,
        };
        Ok((dev_id, game_id))
    }
}

impl fmt::Display for MqttTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MqttTopic {
    fn from(topic: &str) -> Self {
        Self(topic.to_string())
    }
}

// ----------------------------------------------------------------------------
// Commands and Packets
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MqttCmd {
    Invite = 0,
    Msg = 1,
    /// Sender no longer has the game
    DevGone = 2,
}

impl TryFrom<u8> for MqttCmd {
    type Error = CommsError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MqttCmd::Invite),
            1 => Ok(MqttCmd::Msg),
            2 => Ok(MqttCmd::DevGone),
            other => Err(StreamError::UnknownValue {
                field: "mqtt cmd",
                value: other as u32,
            }
            .into()),
        }
    }
}

/// A decoded MQTT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttPacket {
    pub proto: u8,
    pub sender: MqttDevId,
    pub game_id: GameId,
    pub cmd: MqttCmd,
    pub bufs: Vec<Vec<u8>>,
}

impl MqttPacket {
    pub fn new(sender: MqttDevId, game_id: GameId, cmd: MqttCmd, bufs: Vec<Vec<u8>>) -> Self {
        Self {
            proto: PROTO_3,
            sender,
            game_id,
            cmd,
            bufs,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = OutStream::new();
        out.put_u8(self.proto);
        out.put_u64(self.sender.as_u64());
        match self.proto {
            PROTO_1 => {
                out.put_u32(self.game_id.as_u32());
                out.put_u8(self.cmd as u8);
                for buf in &self.bufs {
                    out.put_raw(buf);
                }
            }
            PROTO_3 => {
                if self.bufs.len() > u8::MAX as usize {
                    return Err(CommsError::invalid_message(format!(
                        "too many messages for one packet: {}",
                        self.bufs.len()
                    )));
                }
                out.put_u8(self.cmd as u8);
                out.put_u8(self.bufs.len() as u8);
                for buf in &self.bufs {
                    out.put_bytes(buf);
                }
            }
            other => {
                return Err(StreamError::UnknownValue {
                    field: "mqtt proto",
                    value: other as u32,
                }
                .into())
            }
        }
        Ok(out.into_bytes())
    }

    /// Decode a packet received on `topic`
    pub fn decode(topic: &str, bytes: &[u8]) -> Result<Self> {
        let (_, topic_game) = MqttTopic::parse(topic)?;
        let mut input = InStream::new(bytes);
        let proto = input.get_u8()?;
        let sender = MqttDevId::new(input.get_u64()?);
        match proto {
            PROTO_1 => {
                let game_id = GameId::new(input.get_u32()?);
                let cmd = MqttCmd::try_from(input.get_u8()?)?;
                let rest = input.rest();
                let bufs = if rest.is_empty() {
                    Vec::new()
                } else {
                    vec![rest.to_vec()]
                };
                Ok(Self {
                    proto,
                    sender,
                    game_id,
                    cmd,
                    bufs,
                })
            }
            PROTO_3 => {
                let game_id = topic_game
                    .ok_or_else(|| AddressError::BadTopic(format!("{} has no game id", topic)))?;
                let cmd = MqttCmd::try_from(input.get_u8()?)?;
                let count = input.get_u8()?;
                let mut bufs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    bufs.push(input.get_bytes()?);
                }
                Ok(Self {
                    proto,
                    sender,
                    game_id,
                    cmd,
                    bufs,
                })
            }
            other => Err(StreamError::UnknownValue {
                field: "mqtt proto",
                value: other as u32,
            }
            .into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Outbound Batching
// ----------------------------------------------------------------------------

/// Groups outbound messages by topic
#[derive(Debug)]
pub struct MqttBatch {
    sender: MqttDevId,
    proto: u8,
    by_topic: BTreeMap<MqttTopic, (GameId, Vec<Vec<u8>>)>,
}

impl MqttBatch {
    pub fn new(sender: MqttDevId) -> Self {
        Self::with_proto(sender, PROTO_3)
    }

    /// PROTO_1 peers listen on the bare device topic and take one message
    /// per packet
    pub fn with_proto(sender: MqttDevId, proto: u8) -> Self {
        Self {
            sender,
            proto,
            by_topic: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, recipient: MqttDevId, game_id: GameId, message: Vec<u8>) {
        let topic = if self.proto == PROTO_1 {
            MqttTopic::device(recipient)
        } else {
            MqttTopic::game(recipient, game_id)
        };
        trace!(topic = %topic, len = message.len(), "batching mqtt message");
        self.by_topic
            .entry(topic)
            .or_insert_with(|| (game_id, Vec::new()))
            .1
            .push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.by_topic.values().map(|(_, msgs)| msgs.len()).sum()
    }

    /// One packet per topic. A topic with more messages than fit a single
    /// packet's count byte gets several packets.
    pub fn into_packets(self) -> Result<Vec<(MqttTopic, Vec<u8>)>> {
        let mut packets = Vec::with_capacity(self.by_topic.len());
        let per_packet = if self.proto == PROTO_1 {
            1
        } else {
            u8::MAX as usize
        };
        for (topic, (game_id, messages)) in self.by_topic {
            for chunk in messages.chunks(per_packet) {
                let mut packet =
                    MqttPacket::new(self.sender, game_id, MqttCmd::Msg, chunk.to_vec());
                packet.proto = self.proto;
                packets.push((topic.clone(), packet.encode()?));
            }
        }
        debug!(packets = packets.len(), "built mqtt batch");
        Ok(packets)
    }
}

/// Invitation addressed to another device
pub fn invite_packet(
    sender: MqttDevId,
    recipient: MqttDevId,
    info: &LaunchInfo,
) -> Result<(MqttTopic, Vec<u8>)> {
    let packet = MqttPacket::new(sender, info.game_id, MqttCmd::Invite, vec![info.to_bytes()?]);
    Ok((MqttTopic::game(recipient, info.game_id), packet.encode()?))
}

/// Reply telling `recipient` that this device has no such game
pub fn no_such_game(
    sender: MqttDevId,
    recipient: MqttDevId,
    game_id: GameId,
) -> Result<(MqttTopic, Vec<u8>)> {
    let packet = MqttPacket::new(sender, game_id, MqttCmd::DevGone, Vec::new());
    Ok((MqttTopic::game(recipient, game_id), packet.encode()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: MqttDevId = MqttDevId::new(0x1111);
    const YOU: MqttDevId = MqttDevId::new(0x00AB_CDEF_0123_4567);

    #[test]
    fn topics_use_sixteen_hex_digits() {
        assert_eq!(
            MqttTopic::device(YOU).as_str(),
            "xw4/device/00ABCDEF01234567"
        );
        let topic = MqttTopic::game(YOU, GameId::new(0x2A));
        assert_eq!(topic.as_str(), "xw4/device/00ABCDEF01234567/0000002A");
        assert_eq!(
            MqttTopic::parse(topic.as_str()).unwrap(),
            (YOU, Some(GameId::new(0x2A)))
        );
        assert!(MqttTopic::parse("xw5/device/00").is_err());
    }

    #[test]
    fn batch_groups_by_topic() {
        let mut batch = MqttBatch::new(ME);
        batch.push(YOU, GameId::new(1), b"one".to_vec());
        batch.push(YOU, GameId::new(1), b"two".to_vec());
        batch.push(YOU, GameId::new(2), b"other game".to_vec());
        assert_eq!(batch.message_count(), 3);

        let packets = batch.into_packets().unwrap();
        assert_eq!(packets.len(), 2);

        let (topic, bytes) = &packets[0];
        let packet = MqttPacket::decode(topic.as_str(), bytes).unwrap();
        assert_eq!(packet.sender, ME);
        assert_eq!(packet.game_id, GameId::new(1));
        assert_eq!(packet.cmd, MqttCmd::Msg);
        assert_eq!(packet.bufs, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn proto_1_batch_sends_one_message_per_packet() {
        let mut batch = MqttBatch::with_proto(ME, PROTO_1);
        batch.push(YOU, GameId::new(1), b"one".to_vec());
        batch.push(YOU, GameId::new(1), b"two".to_vec());
        let packets = batch.into_packets().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0, MqttTopic::device(YOU));
        let decoded = MqttPacket::decode(packets[1].0.as_str(), &packets[1].1).unwrap();
        assert_eq!(decoded.game_id, GameId::new(1));
        assert_eq!(decoded.bufs, vec![b"two".to_vec()]);
    }

    #[test]
    fn proto_1_carries_game_in_header() {
        let mut packet = MqttPacket::new(ME, GameId::new(0x77), MqttCmd::Msg, vec![b"hi".to_vec()]);
        packet.proto = PROTO_1;
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes[0], PROTO_1);

        let decoded = MqttPacket::decode(MqttTopic::device(YOU).as_str(), &bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn proto_3_needs_game_topic() {
        let (_, bytes) = no_such_game(ME, YOU, GameId::new(5)).unwrap();
        assert!(MqttPacket::decode(MqttTopic::device(YOU).as_str(), &bytes).is_err());

        let decoded =
            MqttPacket::decode(MqttTopic::game(YOU, GameId::new(5)).as_str(), &bytes).unwrap();
        assert_eq!(decoded.cmd, MqttCmd::DevGone);
        assert!(decoded.bufs.is_empty());
    }

    #[test]
    fn unknown_cmd_is_rejected() {
        let mut bytes = no_such_game(ME, YOU, GameId::new(5)).unwrap().1;
        bytes[9] = 9;
        let topic = MqttTopic::game(YOU, GameId::new(5));
        assert!(MqttPacket::decode(topic.as_str(), &bytes).is_err());
    }
}
