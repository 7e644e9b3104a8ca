//! Multi-transport comms core
//!
//! This crate holds the deterministic half of a game's networking: which
//! transports reach each peer, how messages are sequenced, queued and
//! resent until acknowledged, and how inbound packets are routed back to
//! the right game. Actual socket, Bluetooth, SMS and MQTT I/O stays with
//! the host, behind the `TransportProcs` trait.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod addr;
pub mod comms;
pub mod config;
pub mod conn_type;
pub mod demux;
pub mod errors;
pub mod invite;
pub mod mqtt;
pub mod pending;
pub mod stats;
pub mod stream;
pub mod transport;
pub mod types;
pub mod wire;

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "testing"))] {
        pub mod testing;
    }
}

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use addr::{
    AddrRecord, BtParams, IpDirectParams, LocalAddrProvider, MqttParams, P2pParams, RelayParams,
    SmsParams,
};
pub use comms::{ChannelRecord, Comms};
pub use config::{CommsConfig, MqttConfig, ResendConfig};
pub use conn_type::{ConnType, ConnTypeRegistry, ConnTypeSet, DeviceCaps, StaticDeviceCaps};
pub use demux::{Delivery, Demux, GameSink, TransportControl};
pub use errors::{AddressError, CommsError, CommsResult, Result, StreamError, TransportError};
pub use invite::LaunchInfo;
pub use mqtt::{MqttBatch, MqttCmd, MqttPacket, MqttTopic};
pub use pending::{PacketBody, PacketKey, PacketState, PendingPacket, PendingQueue};
pub use stats::{ChannelReport, CommsReport, TransportCounters, TransportStats};
pub use transport::{OutboundMsg, SendOutcome, TransportEvent, TransportHealth, TransportProcs};
pub use types::{
    ChannelNo, GameId, ManualTimeSource, MqttDevId, MsgId, SystemTimeSource, TimeSource, Timestamp,
};
pub use wire::Envelope;
