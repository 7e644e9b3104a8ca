//! In-process loopback transport
//!
//! Connects two engines in the same process over a pair of unbounded
//! channels, one per direction. Each side can be taken down and brought
//! back to exercise resends. An MQTT loopback behaves like a broker shared
//! by exactly two devices: everything one side publishes reaches the other,
//! whose demux discards topics addressed elsewhere.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use xwcomms_core::{AddrRecord, ConnType, GameId, LaunchInfo, MqttTopic, TransportError};

use crate::engine::Engine;
use crate::transport::{Transport, WireMsg};

/// What crosses a loopback link
#[derive(Debug, Clone)]
pub enum Frame {
    Msg {
        game_id: GameId,
        from: AddrRecord,
        conn_type: ConnType,
        bytes: Vec<u8>,
    },
    Mqtt {
        topic: MqttTopic,
        bytes: Vec<u8>,
    },
    Invite {
        info: LaunchInfo,
        from: AddrRecord,
    },
}

pub struct LoopbackTransport {
    conn_type: ConnType,
    /// How the far side sees this device on this transport
    local: AddrRecord,
    peer: mpsc::UnboundedSender<Frame>,
    up: AtomicBool,
    sent: AtomicUsize,
}

/// One end of a loopback link: the transport to register and the frames
/// the far side sends to it
pub type LoopbackEnd = (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<Frame>);

impl LoopbackTransport {
    /// Link two devices. `addr_a` and `addr_b` are each device's address
    /// on `conn_type`, and must list it.
    pub fn pair(conn_type: ConnType, addr_a: AddrRecord, addr_b: AddrRecord) -> (LoopbackEnd, LoopbackEnd) {
        debug_assert!(addr_a.contains(conn_type) && addr_b.contains(conn_type));
        let (to_a, from_b) = mpsc::unbounded_channel();
        let (to_b, from_a) = mpsc::unbounded_channel();
        let a = Arc::new(Self::new(conn_type, addr_a, to_b));
        let b = Arc::new(Self::new(conn_type, addr_b, to_a));
        ((a, from_b), (b, from_a))
    }

    fn new(conn_type: ConnType, local: AddrRecord, peer: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            conn_type,
            local,
            peer,
            up: AtomicBool::new(true),
            sent: AtomicUsize::new(0),
        }
    }

    /// Take the link down (sends fail) or bring it back
    pub fn set_up(&self, up: bool) {
        debug!(conn_type = %self.conn_type, up, "loopback link state");
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Frames that made it onto the link
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    fn deliver(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_up() {
            return Err(TransportError::PeerUnreachable {
                conn_type: self.conn_type,
                reason: "loopback link down".to_string(),
            });
        }
        self.peer.send(frame).map_err(|_| TransportError::Shutdown {
            reason: "loopback peer gone".to_string(),
        })?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    async fn send(&self, msg: WireMsg) -> Result<usize, TransportError> {
        let len = msg.bytes.len();
        self.deliver(Frame::Msg {
            game_id: msg.game_id,
            from: self.local.clone(),
            conn_type: self.conn_type,
            bytes: msg.bytes,
        })?;
        trace!(conn_type = %self.conn_type, len, "loopback sent");
        Ok(len)
    }

    async fn publish(&self, topic: MqttTopic, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.conn_type != ConnType::Mqtt {
            return Err(TransportError::Unavailable {
                conn_type: self.conn_type,
            });
        }
        self.deliver(Frame::Mqtt { topic, bytes })
    }

    async fn send_invite(&self, _to: AddrRecord, info: LaunchInfo) -> Result<(), TransportError> {
        self.deliver(Frame::Invite {
            info,
            from: self.local.clone(),
        })
    }
}

/// Feed every frame arriving on `frames` to `engine`'s listener callbacks
pub fn spawn_pump(engine: Arc<Engine>, mut frames: mpsc::UnboundedReceiver<Frame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match frame {
                Frame::Msg {
                    game_id,
                    from,
                    conn_type,
                    bytes,
                } => {
                    if let Err(err) = engine.on_message_received(game_id, &from, conn_type, &bytes) {
                        warn!(game_id = %game_id, error = %err, "loopback delivery failed");
                    }
                }
                Frame::Mqtt { topic, bytes } => {
                    if let Err(err) = engine.on_mqtt_packet(topic.as_str(), &bytes) {
                        warn!(topic = topic.as_str(), error = %err, "loopback mqtt delivery failed");
                    }
                }
                Frame::Invite { info, from } => engine.on_invite_received(&info, &from),
            }
        }
        debug!("loopback pump finished");
    })
}
