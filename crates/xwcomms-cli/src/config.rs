//! CLI configuration
//!
//! Configuration is layered with figment, lowest priority first:
//! - built-in defaults
//! - `xwcomms.toml` in the working directory
//! - the file given with `--config`
//! - `XWCOMMS_*` environment variables, nested keys separated by `__`
//!   (for example `XWCOMMS_RUNTIME__COMMS__RESEND__MAX_BACKOFF_SECS=120`)

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use xwcomms_core::{AddrRecord, ConnType, MqttDevId};
use xwcomms_runtime::RuntimeConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Configuration serialization error: {0}")]
    Serialization(String),
}

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine settings, including the comms core's resend policy
    pub runtime: RuntimeConfig,
    pub cli: CliConfig,
    /// The in-process host used by `demo`
    pub host: PeerConfig,
    /// The in-process guest used by `demo`
    pub guest: PeerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub verbose: bool,
    /// How long `demo` waits for delivery and acks
    pub demo_timeout_ms: u64,
}

/// One device's address on each transport the demo can use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub phone: String,
    /// Up to 16 hex digits
    pub mqtt_dev_id: String,
    pub bt_name: String,
    pub bt_addr: String,
    pub relay_host: String,
    pub relay_port: u16,
    pub relay_room: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            cli: CliConfig::default(),
            host: PeerConfig {
                phone: "+15550100".to_string(),
                mqtt_dev_id: "00000000000000A1".to_string(),
                bt_name: "host-device".to_string(),
                bt_addr: "02:00:00:00:00:A1".to_string(),
                ..PeerConfig::default()
            },
            guest: PeerConfig {
                phone: "+15550199".to_string(),
                mqtt_dev_id: "00000000000000B2".to_string(),
                bt_name: "guest-device".to_string(),
                bt_addr: "02:00:00:00:00:B2".to_string(),
                ..PeerConfig::default()
            },
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            demo_timeout_ms: 5_000,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            phone: String::new(),
            mqtt_dev_id: String::new(),
            bt_name: String::new(),
            bt_addr: String::new(),
            relay_host: "relay.example.org".to_string(),
            relay_port: 10997,
            relay_room: "demo-room".to_string(),
        }
    }
}

impl PeerConfig {
    pub fn mqtt_dev_id(&self) -> Result<MqttDevId, ConfigError> {
        self.mqtt_dev_id
            .parse()
            .map_err(|err| ConfigError::Validation(format!("mqtt_dev_id: {}", err)))
    }

    /// This device's address on a single transport
    pub fn addr_for(&self, conn_type: ConnType) -> Result<AddrRecord, ConfigError> {
        let addr = match conn_type {
            ConnType::Sms => AddrRecord::with_sms(&self.phone, 0),
            ConnType::Mqtt => AddrRecord::with_mqtt(self.mqtt_dev_id()?),
            ConnType::Bt => AddrRecord::with_bt(&self.bt_name, &self.bt_addr),
            ConnType::Relay => {
                AddrRecord::with_relay(&self.relay_host, self.relay_port, &self.relay_room)
            }
            other => {
                return Err(ConfigError::Validation(format!(
                    "no loopback address for {}",
                    other.long_name()
                )))
            }
        };
        Ok(addr)
    }
}

// ----------------------------------------------------------------------------
// Loading
// ----------------------------------------------------------------------------

impl AppConfig {
    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("xwcomms.toml"));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("XWCOMMS_").split("__"))
    }

    /// Load with the standard priority order and validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Loading(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
        }
        let config: AppConfig = Self::figment(path)
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.runtime
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        self.host.mqtt_dev_id()?;
        self.guest.mqtt_dev_id()?;
        if self.host.mqtt_dev_id()? == self.guest.mqtt_dev_id()? {
            return Err(ConfigError::Validation(
                "host and guest need distinct mqtt device ids".to_string(),
            ));
        }
        if self.cli.demo_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "demo_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialization(e.to_string()))
    }

    pub fn example_config() -> String {
        r#"# xwcomms configuration
# Environment overrides use XWCOMMS_ and __ between keys,
# e.g. XWCOMMS_CLI__VERBOSE=true

[cli]
verbose = false
demo_timeout_ms = 5000

[runtime]
resend_interval_ms = 60000
ack_interval_ms = 10000
max_queued_tasks = 1024

[runtime.comms]
max_payload_len = 16384

[runtime.comms.resend]
max_backoff_secs = 3600
stale_after_secs = 300

[host]
phone = "+15550100"
mqtt_dev_id = "00000000000000A1"

[guest]
phone = "+15550199"
mqtt_dev_id = "00000000000000B2"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.host.addr_for(ConnType::Sms).unwrap().sms.phone, "+15550100");
    }

    #[test]
    fn same_dev_ids_are_rejected() {
        let mut config = AppConfig::default();
        config.guest.mqtt_dev_id = config.host.mqtt_dev_id.clone();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn example_parses() {
        let parsed: AppConfig = toml::from_str(&AppConfig::example_config()).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.runtime.comms.resend.max_backoff_secs, 3600);
    }

    #[test]
    fn file_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "xwcomms.toml",
                r#"
                [cli]
                demo_timeout_ms = 1234

                [runtime.comms.resend]
                max_backoff_secs = 60
                "#,
            )?;
            jail.set_env("XWCOMMS_CLI__VERBOSE", "true");

            let config = AppConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.cli.demo_timeout_ms, 1234);
            assert!(config.cli.verbose);
            assert_eq!(config.runtime.comms.resend.max_backoff_secs, 60);
            assert_eq!(config.runtime.comms.resend.stale_after_secs, 300);
            Ok(())
        });
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/xwcomms.toml")));
        assert!(matches!(result, Err(ConfigError::Loading(_))));
    }

    #[test]
    fn unsupported_loopback_transport() {
        let config = AppConfig::default();
        assert!(config.host.addr_for(ConnType::Nfc).is_err());
    }
}
