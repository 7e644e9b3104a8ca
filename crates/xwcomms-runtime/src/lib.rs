//! Comms runtime engine
//!
//! This crate runs the deterministic `xwcomms-core` state machines on tokio:
//! - `Engine`: the device-wide handle owning one task per game
//! - `TaskQueue`: typed-priority queue each game task drains
//! - `Transport`: async seam for real transports, bridged to the core's
//!   synchronous send procedures
//! - `LoopbackTransport`: in-process link between two engines

pub mod config;
pub mod engine;
pub mod errors;
mod game;
pub mod loopback;
pub mod procs;
pub mod queue;
pub mod transport;

pub use config::RuntimeConfig;
pub use engine::{Engine, EngineBuilder, EngineEvent};
pub use errors::{Result, RuntimeError};
pub use loopback::{spawn_pump, Frame, LoopbackTransport};
pub use procs::GameProcs;
pub use queue::{Priority, TaskQueue};
pub use transport::{PendingObserver, Transport, TransportRegistry, WireMsg};

// Re-export core types for convenience
pub use xwcomms_core::{
    AddrRecord, ChannelNo, CommsConfig, CommsReport, ConnType, Delivery, GameId, LaunchInfo,
    MqttDevId, SendOutcome, TransportEvent,
};
