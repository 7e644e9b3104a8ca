//! Invitation launch descriptor
//!
//! An invite carries enough to create the game on the receiving device and
//! to reach the inviter back over every transport the inviter offered.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::addr::AddrRecord;
use crate::conn_type::{ConnType, ConnTypeSet};
use crate::errors::Result;
use crate::stream::{InStream, OutStream};
use crate::types::{GameId, MqttDevId};

/// Structured payload of an invitation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchInfo {
    pub invite_id: Uuid,
    pub game_id: GameId,
    pub game_name: String,
    pub dict: String,
    pub iso_code: String,
    /// Channel the invitee should use when replying
    pub force_channel: u8,
    pub n_players_total: u8,
    pub n_players_here: u8,
    pub remotes_are_robots: bool,
    pub conn_types: ConnTypeSet,
    pub room: String,
    pub bt_name: String,
    pub bt_address: String,
    pub p2p_mac: String,
    pub phone: String,
    pub is_gsm: bool,
    pub mqtt_dev_id: MqttDevId,
    /// Allow a second copy of the game when the invite is received twice
    pub dupe_mode: bool,
}

impl LaunchInfo {
    pub fn new(game_id: GameId, game_name: &str, n_players_total: u8, force_channel: u8) -> Self {
        Self {
            invite_id: Uuid::new_v4(),
            game_id,
            game_name: game_name.to_string(),
            dict: String::new(),
            iso_code: String::new(),
            force_channel,
            n_players_total,
            n_players_here: 1,
            remotes_are_robots: false,
            conn_types: ConnTypeSet::new(),
            room: String::new(),
            bt_name: String::new(),
            bt_address: String::new(),
            p2p_mac: String::new(),
            phone: String::new(),
            is_gsm: false,
            mqtt_dev_id: MqttDevId::default(),
            dupe_mode: false,
        }
    }

    /// Copy the inviter's reachability into the descriptor
    pub fn add_addr(&mut self, addr: &AddrRecord) {
        for conn_type in addr.types().iter() {
            match conn_type {
                ConnType::Relay => self.room = addr.relay.invite.clone(),
                ConnType::Bt => {
                    self.bt_name = addr.bt.host_name.clone();
                    self.bt_address = addr.bt.bt_addr.clone();
                }
                ConnType::Sms => self.phone = addr.sms.phone.clone(),
                ConnType::P2p => self.p2p_mac = addr.p2p.mac_addr.clone(),
                ConnType::Mqtt => self.mqtt_dev_id = addr.mqtt.dev_id,
                _ => {}
            }
            self.conn_types.add(conn_type);
        }
    }

    /// The inviter's address as the invitee should record it
    pub fn to_addr(&self) -> AddrRecord {
        let mut addr = AddrRecord::new();
        for conn_type in self.conn_types.iter() {
            addr.add_type(conn_type);
            match conn_type {
                ConnType::Relay => addr.relay.invite = self.room.clone(),
                ConnType::Bt => {
                    addr.bt.host_name = self.bt_name.clone();
                    addr.bt.bt_addr = self.bt_address.clone();
                }
                ConnType::Sms => addr.sms.phone = self.phone.clone(),
                ConnType::P2p => addr.p2p.mac_addr = self.p2p_mac.clone(),
                ConnType::Mqtt => addr.mqtt.dev_id = self.mqtt_dev_id,
                _ => {}
            }
        }
        addr
    }

    pub fn write_to(&self, out: &mut OutStream) -> Result<()> {
        out.put_raw(self.invite_id.as_bytes());
        out.put_u32(self.game_id.as_u32());
        out.put_string(&self.game_name)?;
        out.put_string(&self.dict)?;
        out.put_string(&self.iso_code)?;
        out.put_u8(self.force_channel);
        out.put_u8(self.n_players_total);
        out.put_u8(self.n_players_here);
        out.put_bool(self.remotes_are_robots);
        out.put_u16(self.conn_types.to_bits() as u16);
        out.put_string(&self.room)?;
        out.put_string(&self.bt_name)?;
        out.put_string(&self.bt_address)?;
        out.put_string(&self.p2p_mac)?;
        out.put_string(&self.phone)?;
        out.put_bool(self.is_gsm);
        out.put_u64(self.mqtt_dev_id.as_u64());
        out.put_bool(self.dupe_mode);
        Ok(())
    }

    pub fn read_from(input: &mut InStream<'_>) -> Result<Self> {
        let mut id = [0u8; 16];
        for byte in id.iter_mut() {
            *byte = input.get_u8()?;
        }
        Ok(Self {
            invite_id: Uuid::from_bytes(id),
            game_id: GameId::new(input.get_u32()?),
            game_name: input.get_string()?,
            dict: input.get_string()?,
            iso_code: input.get_string()?,
            force_channel: input.get_u8()?,
            n_players_total: input.get_u8()?,
            n_players_here: input.get_u8()?,
            remotes_are_robots: input.get_bool()?,
            conn_types: ConnTypeSet::from_bits(input.get_u16()? as u32),
            room: input.get_string()?,
            bt_name: input.get_string()?,
            bt_address: input.get_string()?,
            p2p_mac: input.get_string()?,
            phone: input.get_string()?,
            is_gsm: input.get_bool()?,
            mqtt_dev_id: MqttDevId::new(input.get_u64()?),
            dupe_mode: input.get_bool()?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = OutStream::new();
        self.write_to(&mut out)?;
        Ok(out.into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read_from(&mut InStream::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inviter_address_survives_the_trip() {
        let mut addr = AddrRecord::with_mqtt(MqttDevId::new(0xABCD));
        addr.augment(&AddrRecord::with_sms("+15551212", 0), true);

        let mut info = LaunchInfo::new(GameId::new(0x1234), "Sunday game", 2, 1);
        info.add_addr(&addr);

        let decoded = LaunchInfo::from_bytes(&info.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoded.to_addr(), addr);
    }
}
