//! Inbound demux
//!
//! Transport listeners hand every inbound packet to the `Demux`, tagged with
//! the transport it physically arrived on and the sender's address as that
//! transport sees it. The demux checks the two agree, then routes ordinary
//! messages, invitations and "game gone" signals to the game layer.

use tracing::{debug, error, info, warn};

use crate::addr::AddrRecord;
use crate::conn_type::ConnType;
use crate::errors::{CommsError, Result};
use crate::invite::LaunchInfo;
use crate::mqtt::{MqttCmd, MqttPacket, MqttTopic};
use crate::types::{GameId, MqttDevId};

// ----------------------------------------------------------------------------
// Collaborators
// ----------------------------------------------------------------------------

/// The game/session layer
pub trait GameSink {
    /// Deliver raw envelope bytes. Returns false if the game doesn't exist here.
    fn on_message(
        &mut self,
        game_id: GameId,
        from: &AddrRecord,
        arrived_on: ConnType,
        bytes: &[u8],
    ) -> bool;

    fn on_invite(&mut self, info: &LaunchInfo, from: &AddrRecord);

    /// Forget all local state for a game the peer no longer has
    fn purge_game(&mut self, game_id: GameId);
}

/// The transport layer, as seen from inbound processing
pub trait TransportControl {
    /// Stop sending anything for `game_id` to `to`
    fn stop_sending(&mut self, game_id: GameId, to: &AddrRecord);

    /// Tell a peer we have no such game, so it can stop sending
    fn reply_no_such_game(&mut self, _game_id: GameId, _to: &AddrRecord) {}
}

/// What happened to an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    UnknownGame,
}

// ----------------------------------------------------------------------------
// Demux
// ----------------------------------------------------------------------------

pub struct Demux<S: GameSink, C: TransportControl> {
    sink: S,
    control: C,
    local_dev_id: Option<MqttDevId>,
}

impl<S: GameSink, C: TransportControl> Demux<S, C> {
    pub fn new(sink: S, control: C) -> Self {
        Self {
            sink,
            control,
            local_dev_id: None,
        }
    }

    /// Only accept MQTT packets published to this device's topic
    pub fn with_local_dev_id(mut self, dev_id: MqttDevId) -> Self {
        self.local_dev_id = Some(dev_id);
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut C {
        &mut self.control
    }

    /// Route one inbound message.
    ///
    /// The sender's address must list the transport the message arrived
    /// on. A mismatch is a bug or a spoof: debug builds assert, release
    /// builds drop the message and report `Misrouted`.
    pub fn on_message_received(
        &mut self,
        game_id: GameId,
        from: &AddrRecord,
        arrived_on: ConnType,
        bytes: &[u8],
    ) -> Result<Delivery> {
        if !from.contains(arrived_on) {
            error!(
                game_id = %game_id,
                arrived_on = %arrived_on,
                from = %from.types(),
                "message arrived on a transport its sender doesn't list"
            );
            debug_assert!(
                from.contains(arrived_on),
                "misrouted message for game {} on {}",
                game_id,
                arrived_on
            );
            return Err(CommsError::Misrouted {
                game_id,
                arrived_on,
            });
        }

        if self.sink.on_message(game_id, from, arrived_on, bytes) {
            debug!(game_id = %game_id, arrived_on = %arrived_on, len = bytes.len(), "delivered");
            Ok(Delivery::Delivered)
        } else {
            info!(game_id = %game_id, "message for unknown game");
            self.control.reply_no_such_game(game_id, from);
            Ok(Delivery::UnknownGame)
        }
    }

    /// The peer says the game is gone on its end: purge it here and stop
    /// sending to that peer. Each happens exactly once per signal.
    pub fn on_game_gone_received(&mut self, game_id: GameId, from: &AddrRecord) {
        info!(game_id = %game_id, from = %from.types(), "peer reports game gone");
        self.sink.purge_game(game_id);
        self.control.stop_sending(game_id, from);
    }

    pub fn on_invite_received(&mut self, info: &LaunchInfo, from: &AddrRecord) {
        info!(game_id = %info.game_id, invite_id = %info.invite_id, "invite received");
        self.sink.on_invite(info, from);
    }

    /// Parse a packet from the MQTT broker and route what it carries.
    /// Returns the number of messages delivered.
    pub fn on_mqtt_packet(&mut self, topic: &str, bytes: &[u8]) -> Result<usize> {
        let (to_dev, _) = MqttTopic::parse(topic)?;
        if let Some(local) = self.local_dev_id {
            if local != to_dev {
                warn!(topic, "mqtt packet for some other device; dropping");
                return Ok(0);
            }
        }
        let packet = MqttPacket::decode(topic, bytes)?;
        let from = AddrRecord::with_mqtt(packet.sender);

        match packet.cmd {
            MqttCmd::Msg => {
                let mut delivered = 0;
                for buf in &packet.bufs {
                    match self.on_message_received(packet.game_id, &from, ConnType::Mqtt, buf)? {
                        Delivery::Delivered => delivered += 1,
                        // One "no such game" reply is enough
                        Delivery::UnknownGame => break,
                    }
                }
                Ok(delivered)
            }
            MqttCmd::Invite => {
                for buf in &packet.bufs {
                    let mut info = LaunchInfo::from_bytes(buf)?;
                    if !info.mqtt_dev_id.is_set() {
                        info.mqtt_dev_id = packet.sender;
                        info.conn_types.add(ConnType::Mqtt);
                    }
                    self.on_invite_received(&info, &from);
                }
                Ok(0)
            }
            MqttCmd::DevGone => {
                self.on_game_gone_received(packet.game_id, &from);
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockGameSink, MockTransportControl};

    fn demux() -> Demux<MockGameSink, MockTransportControl> {
        let mut sink = MockGameSink::default();
        sink.known_games.insert(GameId::new(7));
        Demux::new(sink, MockTransportControl::default())
    }

    #[test]
    fn matching_transport_is_delivered() {
        let mut demux = demux();
        let from = AddrRecord::with_mqtt(MqttDevId::new(1));
        let delivery = demux
            .on_message_received(GameId::new(7), &from, ConnType::Mqtt, b"x")
            .unwrap();
        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(demux.sink().messages.len(), 1);
    }

    #[test]
    fn unknown_game_gets_a_reply() {
        let mut demux = demux();
        let from = AddrRecord::with_mqtt(MqttDevId::new(1));
        let delivery = demux
            .on_message_received(GameId::new(8), &from, ConnType::Mqtt, b"x")
            .unwrap();
        assert_eq!(delivery, Delivery::UnknownGame);
        assert_eq!(demux.control().no_such_game, vec![GameId::new(8)]);
    }

    #[test]
    fn game_gone_has_both_effects_once() {
        let mut demux = demux();
        let from = AddrRecord::with_sms("555", 0);
        demux.on_game_gone_received(GameId::new(7), &from);
        assert_eq!(demux.sink().purged, vec![GameId::new(7)]);
        assert_eq!(demux.control().stopped, vec![(GameId::new(7), from)]);
    }

    #[test]
    fn mqtt_for_another_device_is_ignored() {
        let mut demux = demux().with_local_dev_id(MqttDevId::new(0xAA));
        let (topic, bytes) =
            crate::mqtt::no_such_game(MqttDevId::new(1), MqttDevId::new(0xBB), GameId::new(7))
                .unwrap();
        assert_eq!(demux.on_mqtt_packet(topic.as_str(), &bytes).unwrap(), 0);
        assert!(demux.sink().purged.is_empty());
    }
}
