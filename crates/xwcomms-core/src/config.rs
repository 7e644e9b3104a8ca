//! Comms configuration
//!
//! Tunables for the resend engine, the MQTT codec and the persisted stream
//! layout, grouped the way hosts usually override them.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{CommsError, Result};
use crate::mqtt;
use crate::stream::version;

// ----------------------------------------------------------------------------
// Resend Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResendConfig {
    /// Ceiling for the doubling backoff between unforced resends
    pub max_backoff_secs: u64,
    /// A transport with no inbound traffic for this long is considered stale
    pub stale_after_secs: u64,
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self {
            max_backoff_secs: 60 * 60,
            stale_after_secs: 5 * 60,
        }
    }
}

impl ResendConfig {
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

// ----------------------------------------------------------------------------
// MQTT Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Delivery guarantee requested from the broker
    pub qos: u8,
    /// Packet layout for outbound traffic
    pub proto: u8,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            qos: mqtt::QOS,
            proto: mqtt::PROTO_3,
        }
    }
}

// ----------------------------------------------------------------------------
// Comms Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    pub resend: ResendConfig,
    pub mqtt: MqttConfig,
    /// Layout version written into saved games and envelopes
    pub stream_version: u8,
    /// Largest payload accepted by `Comms::send`
    pub max_payload_len: usize,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            resend: ResendConfig::default(),
            mqtt: MqttConfig::default(),
            stream_version: version::CURRENT,
            max_payload_len: 16 * 1024,
        }
    }
}

impl CommsConfig {
    /// Short timers so tests don't wait on backoff
    pub fn testing() -> Self {
        Self {
            resend: ResendConfig {
                max_backoff_secs: 8,
                stale_after_secs: 30,
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.qos != mqtt::QOS {
            return Err(CommsError::config_error(format!(
                "MQTT requires QoS {}, got {}",
                mqtt::QOS,
                self.mqtt.qos
            )));
        }
        if self.mqtt.proto != mqtt::PROTO_1 && self.mqtt.proto != mqtt::PROTO_3 {
            return Err(CommsError::config_error(format!(
                "Unknown MQTT proto {}",
                self.mqtt.proto
            )));
        }
        if self.stream_version < version::SINGLE_ADDR_TYPE || self.stream_version > version::CURRENT
        {
            return Err(CommsError::config_error(format!(
                "Unsupported stream version {}",
                self.stream_version
            )));
        }
        if self.resend.max_backoff_secs == 0 {
            return Err(CommsError::config_error("Resend backoff ceiling cannot be zero"));
        }
        if self.max_payload_len == 0 {
            return Err(CommsError::config_error("Max payload length cannot be zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        assert!(CommsConfig::default().validate().is_ok());
        assert!(CommsConfig::testing().validate().is_ok());
    }

    #[test]
    fn qos_below_exactly_once_is_rejected() {
        let mut config = CommsConfig::default();
        config.mqtt.qos = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let config = CommsConfig::testing();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<CommsConfig>(&json).unwrap(), config);
    }
}
