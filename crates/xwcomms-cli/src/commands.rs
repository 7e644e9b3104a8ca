//! Command handlers for the xwcomms CLI

use tracing::info;
use xwcomms_core::{ConnTypeRegistry, ConnTypeSet, StaticDeviceCaps};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::demo::{self, DemoOptions};
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Demo {
                transport,
                messages,
                drop_first,
                json,
            } => {
                let options = DemoOptions {
                    conn_type: transport.into(),
                    messages,
                    drop_first,
                };
                Self::handle_demo_command(&config, options, json).await
            }
            Commands::Types { bits } => Self::handle_types_command(bits.as_deref()),
            Commands::Config { example } => Self::handle_config_command(&config, example),
        }
    }

    async fn handle_demo_command(config: &AppConfig, options: DemoOptions, json: bool) -> Result<()> {
        info!(
            "Running {} demo over {}",
            options.messages,
            options.conn_type.long_name()
        );
        let summary = demo::run(config, options).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            return Ok(());
        }
        println!("Delivered over {}:", summary.conn_type.long_name());
        for message in &summary.delivered {
            println!("  {}", message);
        }
        if summary.resent > 0 {
            println!("Resent after link failure: {}", summary.resent);
        }
        println!();
        print!("{}", summary.host);
        println!();
        print!("{}", summary.guest);
        println!();
        println!("Saved host game ({} bytes): {}", summary.saved.len() / 2, summary.saved);
        Ok(())
    }

    fn handle_types_command(bits: Option<&str>) -> Result<()> {
        match bits {
            None => {
                println!("Supported transports:");
                for conn_type in ConnTypeRegistry::supported(&StaticDeviceCaps::all()) {
                    println!(
                        "  {:<8} {:>2}  {}",
                        conn_type.short_name(),
                        conn_type.ordinal(),
                        conn_type.long_name()
                    );
                }
            }
            Some(raw) => {
                let set = ConnTypeSet::from_bits(parse_bits(raw)?);
                if set.is_empty() {
                    println!("(no transports)");
                } else {
                    println!("{}", set.to_display_string(true));
                }
            }
        }
        Ok(())
    }

    fn handle_config_command(config: &AppConfig, example: bool) -> Result<()> {
        if example {
            print!("{}", AppConfig::example_config());
        } else {
            print!("{}", config.to_toml()?);
        }
        Ok(())
    }
}

/// Decimal, or hex with a `0x` prefix
fn parse_bits(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| CliError::invalid_argument(format!("bits {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_parse_in_both_bases() {
        assert_eq!(parse_bits("40").unwrap(), 40);
        assert_eq!(parse_bits("0x28").unwrap(), 40);
        assert!(matches!(parse_bits("0xZZ"), Err(CliError::InvalidArgument(_))));
    }

    #[test]
    fn types_command_accepts_bits() {
        assert!(CommandDispatcher::handle_types_command(Some("0x20")).is_ok());
        assert!(CommandDispatcher::handle_types_command(None).is_ok());
        assert!(CommandDispatcher::handle_types_command(Some("nope")).is_err());
    }
}
