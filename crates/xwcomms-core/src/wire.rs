//! Comms envelope
//!
//! Every game message travels inside an envelope that names the game and
//! channel, sequences the message, and piggybacks an ack of what the sender
//! has received so far.
//!
//! Binary layout:
//! ```text
//! [u8 version][u8 flags][u32 game id][u16 channel]
//! [varint msg id][varint last msg received]
//! [varint len][payload][u32 crc32 of payload]
//! ```

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::errors::{CommsError, Result};
use crate::stream::{version, InStream, OutStream};
use crate::types::{ChannelNo, GameId, MsgId};

// ----------------------------------------------------------------------------
// Envelope Flags
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeFlags {
    /// Receiver should answer with an ack right away
    pub ack_request: bool,
    /// Sender is the game's host
    pub is_host: bool,
}

impl EnvelopeFlags {
    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.ack_request {
            flags |= 0x01;
        }
        if self.is_host {
            flags |= 0x02;
        }
        flags
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            ack_request: (byte & 0x01) != 0,
            is_host: (byte & 0x02) != 0,
        }
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub flags: EnvelopeFlags,
    pub game_id: GameId,
    pub channel: ChannelNo,
    /// `MsgId::NONE` for pure acks and ack requests
    pub msg_id: MsgId,
    pub last_msg_rcvd: MsgId,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(game_id: GameId, channel: ChannelNo, msg_id: MsgId, payload: Vec<u8>) -> Self {
        Self {
            version: version::CURRENT,
            flags: EnvelopeFlags::default(),
            game_id,
            channel,
            msg_id,
            last_msg_rcvd: MsgId::NONE,
            payload,
        }
    }

    /// Unsequenced envelope carrying only an ack
    pub fn ack(game_id: GameId, channel: ChannelNo, last_msg_rcvd: MsgId) -> Self {
        let mut envelope = Self::new(game_id, channel, MsgId::NONE, Vec::new());
        envelope.last_msg_rcvd = last_msg_rcvd;
        envelope
    }

    pub fn is_control(&self) -> bool {
        self.msg_id == MsgId::NONE
    }

    pub fn checksum(&self) -> u32 {
        payload_checksum(&self.payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = OutStream::with_version(self.version);
        out.put_u8(self.version);
        out.put_u8(self.flags.to_byte());
        out.put_u32(self.game_id.as_u32());
        out.put_u16(self.channel.raw());
        out.put_u32_vl(self.msg_id.as_u32());
        out.put_u32_vl(self.last_msg_rcvd.as_u32());
        out.put_bytes(&self.payload);
        out.put_u32(self.checksum());
        out.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut input = InStream::new(bytes);
        let version = input.get_u8()?;
        if version == 0 || version > version::CURRENT {
            return Err(CommsError::invalid_message(format!(
                "unsupported envelope version {}",
                version
            )));
        }
        input.set_version(version);
        let envelope = Self {
            version,
            flags: EnvelopeFlags::from_byte(input.get_u8()?),
            game_id: GameId::new(input.get_u32()?),
            channel: ChannelNo::new(input.get_u16()?),
            msg_id: MsgId::new(input.get_u32_vl()?),
            last_msg_rcvd: MsgId::new(input.get_u32_vl()?),
            payload: input.get_bytes()?,
        };
        let expected = input.get_u32()?;
        if envelope.checksum() != expected {
            return Err(CommsError::invalid_message(format!(
                "payload checksum mismatch: got {:08x}, expected {:08x}",
                envelope.checksum(),
                expected
            )));
        }
        if !input.is_empty() {
            return Err(CommsError::invalid_message("trailing bytes after envelope"));
        }
        Ok(envelope)
    }
}

/// CRC32 of a message payload, also used to identify messages in logs
pub fn payload_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_pack_into_one_byte() {
        let flags = EnvelopeFlags {
            ack_request: true,
            is_host: true,
        };
        assert_eq!(flags.to_byte(), 0x03);
        assert_eq!(EnvelopeFlags::from_byte(0x02), EnvelopeFlags {
            ack_request: false,
            is_host: true,
        });
    }

    #[test]
    fn ack_is_a_control_envelope() {
        let ack = Envelope::ack(GameId::new(1), ChannelNo::new(0x101), MsgId::new(4));
        assert!(ack.is_control());
        let decoded = Envelope::decode(&ack.encode()).unwrap();
        assert_eq!(decoded.last_msg_rcvd, MsgId::new(4));
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let envelope = Envelope::new(GameId::new(9), ChannelNo::new(1), MsgId::new(1), b"move".to_vec());
        let mut bytes = envelope.encode();
        let payload_at = bytes.len() - 4 - 2;
        bytes[payload_at] ^= 0xFF;
        assert!(Envelope::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = Envelope::ack(GameId::new(1), ChannelNo::NONE, MsgId::NONE).encode();
        bytes[0] = 0x7F;
        assert!(Envelope::decode(&bytes).is_err());
    }
}
