//! Engine configuration

use core::time::Duration;

use serde::{Deserialize, Serialize};
use xwcomms_core::CommsConfig;

use crate::errors::{Result, RuntimeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Settings handed to every game's comms context
    pub comms: CommsConfig,
    /// How often each game runs an unforced resend pass
    pub resend_interval_ms: u64,
    /// How often each game acks what it has received
    pub ack_interval_ms: u64,
    /// Queued tasks per game before new network work is refused
    pub max_queued_tasks: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            comms: CommsConfig::default(),
            resend_interval_ms: 60_000,
            ack_interval_ms: 10_000,
            max_queued_tasks: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Short timers so tests see resends without waiting
    pub fn testing() -> Self {
        Self {
            comms: CommsConfig::testing(),
            resend_interval_ms: 50,
            ack_interval_ms: 20,
            max_queued_tasks: 256,
        }
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.comms.validate()?;
        if self.resend_interval_ms == 0 || self.ack_interval_ms == 0 {
            return Err(RuntimeError::Configuration {
                reason: "timer intervals must be non-zero".to_string(),
            });
        }
        if self.max_queued_tasks == 0 {
            return Err(RuntimeError::Configuration {
                reason: "max_queued_tasks must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        assert!(RuntimeConfig::default().validate().is_ok());
        assert!(RuntimeConfig::testing().validate().is_ok());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = RuntimeConfig {
            resend_interval_ms: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RuntimeError::Configuration { .. })
        ));
    }
}
