//! `TransportProcs` backed by async transports
//!
//! The comms core calls its send procedures synchronously from the game
//! task. Each call here hands the work to a short-lived tokio task and
//! returns at once; the outcome comes back to the game's queue as a
//! network-priority `SendComplete`.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, trace, warn};
use xwcomms_core::{
    AddrRecord, ConnType, GameId, LaunchInfo, MqttTopic, OutboundMsg, Timestamp, TransportError,
    TransportProcs,
};

use crate::game::GameTask;
use crate::queue::{Priority, TaskQueue};
use crate::transport::{PendingObserver, TransportRegistry, WireMsg};

pub struct GameProcs {
    game_id: GameId,
    transports: Arc<TransportRegistry>,
    queue: TaskQueue<GameTask>,
    observer: Option<Arc<dyn PendingObserver>>,
}

impl GameProcs {
    pub(crate) fn new(
        game_id: GameId,
        transports: Arc<TransportRegistry>,
        queue: TaskQueue<GameTask>,
        observer: Option<Arc<dyn PendingObserver>>,
    ) -> Self {
        Self {
            game_id,
            transports,
            queue,
            observer,
        }
    }

    pub fn game_id(&self) -> GameId {
        self.game_id
    }

    pub(crate) fn set_game_id(&mut self, game_id: GameId) {
        self.game_id = game_id;
    }

    fn spawn_send<F>(&self, conn_type: ConnType, send: F)
    where
        F: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        let queue = self.queue.clone();
        let game_id = self.game_id;
        tokio::spawn(async move {
            let ok = match send.await {
                Ok(()) => true,
                Err(err) => {
                    debug!(game_id = %game_id, conn_type = %conn_type, error = %err, "send failed");
                    false
                }
            };
            if let Err(err) = queue.push(Priority::Network, GameTask::SendComplete { conn_type, ok }) {
                trace!(game_id = %game_id, error = %err, "send completion not delivered");
            }
        });
    }
}

impl TransportProcs for GameProcs {
    fn send_msg(&mut self, msg: &OutboundMsg<'_>) -> Result<usize, TransportError> {
        let transport = self
            .transports
            .get(msg.conn_type)
            .ok_or(TransportError::Unavailable {
                conn_type: msg.conn_type,
            })?;
        let wire = WireMsg {
            game_id: msg.game_id,
            channel: msg.channel,
            msg_id: msg.msg_id,
            to: msg.addr.clone(),
            bytes: msg.bytes.to_vec(),
        };
        let len = wire.bytes.len();
        self.spawn_send(msg.conn_type, async move { transport.send(wire).await.map(|_| ()) });
        Ok(len)
    }

    fn send_mqtt(&mut self, packets: &[(MqttTopic, Vec<u8>)]) -> usize {
        let Some(transport) = self.transports.get(ConnType::Mqtt) else {
            warn!(game_id = %self.game_id, "no mqtt transport registered");
            return 0;
        };
        for (topic, bytes) in packets {
            let transport = Arc::clone(&transport);
            let (topic, bytes) = (topic.clone(), bytes.clone());
            self.spawn_send(ConnType::Mqtt, async move { transport.publish(topic, bytes).await });
        }
        packets.len()
    }

    fn send_invite(
        &mut self,
        addr: &AddrRecord,
        conn_type: ConnType,
        info: &LaunchInfo,
        _now: Timestamp,
    ) -> bool {
        let Some(transport) = self.transports.get(conn_type) else {
            return false;
        };
        let (to, info) = (addr.clone(), info.clone());
        self.spawn_send(conn_type, async move { transport.send_invite(to, info).await });
        true
    }

    fn count_changed(&mut self, count: usize, quashed: bool) {
        if let Some(observer) = &self.observer {
            observer.count_changed(self.game_id, count, quashed);
        }
    }
}
