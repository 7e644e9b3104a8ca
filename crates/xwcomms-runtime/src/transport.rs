//! Async transport seam
//!
//! Host applications implement `Transport` once per transport kind (a
//! relay socket, a Bluetooth link, an SMS gateway, an MQTT client) and
//! register it with the engine. The engine never blocks a game task on
//! one of these calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use xwcomms_core::{
    AddrRecord, ChannelNo, ConnType, GameId, LaunchInfo, MqttTopic, MsgId, TransportError,
};

/// One outbound envelope, owned so it can cross into a spawned task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMsg {
    pub game_id: GameId,
    pub channel: ChannelNo,
    pub msg_id: MsgId,
    pub to: AddrRecord,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn conn_type(&self) -> ConnType;

    /// Put one envelope on the wire. Returns bytes sent.
    async fn send(&self, msg: WireMsg) -> Result<usize, TransportError>;

    /// Publish to the broker. Only the MQTT transport overrides this.
    async fn publish(&self, _topic: MqttTopic, _bytes: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError::Unavailable {
            conn_type: self.conn_type(),
        })
    }

    /// Deliver an invitation out of band (an SMS link, a BT handshake)
    async fn send_invite(&self, _to: AddrRecord, _info: LaunchInfo) -> Result<(), TransportError> {
        Err(TransportError::Unavailable {
            conn_type: self.conn_type(),
        })
    }
}

/// Host hook told whenever a game's outstanding-packet count changes
pub trait PendingObserver: Send + Sync + 'static {
    fn count_changed(&self, game_id: GameId, count: usize, quashed: bool);
}

/// Transports available on this device, by kind
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: BTreeMap<ConnType, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport, replacing any earlier one of the same kind
    pub fn insert(&mut self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        self.transports.insert(transport.conn_type(), transport)
    }

    pub fn get(&self, conn_type: ConnType) -> Option<Arc<dyn Transport>> {
        self.transports.get(&conn_type).cloned()
    }

    pub fn conn_types(&self) -> impl Iterator<Item = ConnType> + '_ {
        self.transports.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl core::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.transports.keys()).finish()
    }
}
