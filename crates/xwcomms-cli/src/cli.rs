//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand, ValueEnum};
use xwcomms_core::ConnType;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a host and a guest in-process and exchange moves between them
    Demo {
        /// Transport linking the two devices
        #[arg(short, long, value_enum, default_value_t = TransportArg::Sms)]
        transport: TransportArg,
        /// Number of messages the host sends
        #[arg(short, long, default_value_t = 3)]
        messages: u32,
        /// Start with the link down so the first sends fail and are resent
        #[arg(long)]
        drop_first: bool,
        /// Print the final stats as JSON
        #[arg(long)]
        json: bool,
    },
    /// List transport types, or decode a persisted type bit vector
    Types {
        /// Persisted bits, decimal or 0x-prefixed hex
        bits: Option<String>,
    },
    /// Print the effective configuration
    Config {
        /// Print an annotated example file instead
        #[arg(long)]
        example: bool,
    },
}

/// Transports the loopback demo can run over
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Sms,
    Mqtt,
    Bt,
    Relay,
}

impl From<TransportArg> for ConnType {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Sms => ConnType::Sms,
            TransportArg::Mqtt => ConnType::Mqtt,
            TransportArg::Bt => ConnType::Bt,
            TransportArg::Relay => ConnType::Relay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn demo_arguments_parse() {
        let cli = Cli::parse_from(["xwcomms", "-v", "demo", "--transport", "mqtt", "-m", "5"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Demo {
                transport,
                messages,
                drop_first,
                ..
            } => {
                assert_eq!(ConnType::from(transport), ConnType::Mqtt);
                assert_eq!(messages, 5);
                assert!(!drop_first);
            }
            _ => panic!("expected demo"),
        }
    }
}
