//! Core types for the comms layer
//!
//! Newtypes for the identifiers that flow through dispatch and resend: game
//! ids, channel numbers, message ids, MQTT device ids and timestamps.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::errors::{AddressError, CommsError};

// ----------------------------------------------------------------------------
// Game Identifier
// ----------------------------------------------------------------------------

/// Identifies one game; doubles as the connection id on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GameId(u32);

impl GameId {
    /// Zero means "not yet assigned"
    pub const NONE: Self = Self(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Channel Number
// ----------------------------------------------------------------------------

/// Per-peer channel number.
///
/// The low two bits select the channel (one per remote device in a game);
/// the remaining bits are a per-device random seed that helps spot packets
/// left over from an earlier game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelNo(u16);

impl ChannelNo {
    pub const MASK: u16 = 0x0003;
    pub const NONE: Self = Self(0);

    pub fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    /// The channel index (low bits)
    pub fn index(&self) -> u16 {
        self.0 & Self::MASK
    }

    /// The seed part (high bits)
    pub fn seed(&self) -> u16 {
        self.0 & !Self::MASK
    }

    /// Whether this channel has been established by real traffic
    pub fn has_seed(&self) -> bool {
        self.seed() != 0
    }

    pub fn with_index(seed: u16, index: u16) -> Self {
        Self((seed & !Self::MASK) | (index & Self::MASK))
    }

    /// Two channel numbers refer to the same peer when their indexes match
    pub fn same_peer(&self, other: ChannelNo) -> bool {
        self.index() == other.index()
    }
}

impl fmt::Display for ChannelNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}|{:x}", self.seed(), self.index())
    }
}

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Per-channel sequence number; zero is reserved for unsequenced traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MsgId(u32);

impl MsgId {
    pub const NONE: Self = Self(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// MQTT Device Identifier
// ----------------------------------------------------------------------------

/// 64-bit device id used to build MQTT topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MqttDevId(u64);

impl MqttDevId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }

    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for MqttDevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0.to_be_bytes()))
    }
}

impl FromStr for MqttDevId {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean = s.strip_prefix("0x").unwrap_or(s);
        if clean.is_empty() || clean.len() > 16 {
            return Err(AddressError::BadMqttDevId(s.to_string()).into());
        }
        // Left-pad so hex::decode sees a full 8 bytes
        let padded = format!("{:0>16}", clean);
        let bytes = hex::decode(&padded)
            .map_err(|_| AddressError::BadMqttDevId(s.to_string()))?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes);
        Ok(Self::from_be_bytes(id))
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn from_secs(secs: u32) -> Self {
        Self(secs as u64 * 1000)
    }

    /// Get current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Whole seconds, as persisted in saved games
    pub fn as_secs(&self) -> u32 {
        (self.0 / 1000) as u32
    }

    pub fn add_seconds(&self, seconds: u64) -> Self {
        Self(self.0 + seconds * 1000)
    }

    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Source of "now" for the comms state machine
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced clock; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    millis: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(start.as_millis())),
        }
    }

    pub fn advance(&self, by: core::time::Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, std::sync::atomic::Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(std::sync::atomic::Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parts() {
        let ch = ChannelNo::with_index(0xABC4, 2);
        assert_eq!(ch.index(), 2);
        assert_eq!(ch.seed(), 0xABC4);
        assert!(ch.has_seed());
        assert!(ch.same_peer(ChannelNo::new(2)));
        assert!(!ChannelNo::new(1).has_seed());
    }

    #[test]
    fn mqtt_dev_id_parses_and_displays() {
        let id: MqttDevId = "00A1B2C3D4E5F607".parse().unwrap();
        assert_eq!(id.as_u64(), 0x00A1_B2C3_D4E5_F607);
        assert_eq!(id.to_string(), "00A1B2C3D4E5F607");

        let short: MqttDevId = "0x1F".parse().unwrap();
        assert_eq!(short.as_u64(), 0x1F);

        assert!("not hex".parse::<MqttDevId>().is_err());
        assert!("".parse::<MqttDevId>().is_err());
    }

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualTimeSource::new(Timestamp::new(1_000));
        let other = clock.clone();
        clock.advance(core::time::Duration::from_secs(2));
        assert_eq!(other.now(), Timestamp::new(3_000));
        assert_eq!(other.now().as_secs(), 3);
    }
}
