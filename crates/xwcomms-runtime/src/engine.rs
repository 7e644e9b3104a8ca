//! Comms engine
//!
//! The `Engine` is the explicitly owned handle a host application keeps for
//! the life of the device: it runs one task per active game, holds the
//! registered transports, and is the entry point for transport listeners.
//! Listener callbacks never touch game state directly; they validate the
//! packet and enqueue it on the owning game's queue.
//!
//! Events for the host (accepted messages, redraw hints, invitations,
//! games the peer gave up on) go to a device-level `TaskQueue` drained with
//! [`Engine::next_event`].

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use xwcomms_core::demux::{GameSink, TransportControl};
use xwcomms_core::{
    mqtt, AddrRecord, ChannelNo, Comms, CommsReport, ConnType, Delivery, Demux, GameId, LaunchInfo,
    SendOutcome, SystemTimeSource, TransportEvent,
};

use crate::config::RuntimeConfig;
use crate::errors::{Result, RuntimeError};
use crate::game::{GameActor, GameComms, GameTask};
use crate::procs::GameProcs;
use crate::queue::{Priority, TaskQueue};
use crate::transport::{PendingObserver, Transport, TransportRegistry};

/// Something the host application should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A game accepted the next in-order message from a peer
    Message { game_id: GameId, payload: Vec<u8> },
    /// A game's state changed; coalesced per game
    Redraw { game_id: GameId },
    Invite { info: LaunchInfo, from: AddrRecord },
    /// A peer reported the game gone; it has been stopped here
    GameGone { game_id: GameId },
}

// ----------------------------------------------------------------------------
// Engine Builder
// ----------------------------------------------------------------------------

pub struct EngineBuilder {
    self_addr: AddrRecord,
    config: RuntimeConfig,
    transports: TransportRegistry,
    observer: Option<Arc<dyn PendingObserver>>,
}

impl EngineBuilder {
    pub fn new(self_addr: AddrRecord) -> Self {
        Self {
            self_addr,
            config: RuntimeConfig::default(),
            transports: TransportRegistry::new(),
            observer: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a transport; a later one of the same kind replaces it
    pub fn add_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        if let Some(replaced) = self.transports.insert(transport) {
            debug!(conn_type = %replaced.conn_type(), "replacing registered transport");
        }
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PendingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        info!(
            transports = ?self.transports,
            self_types = %self.self_addr.types(),
            "building comms engine"
        );
        Ok(Engine {
            events: TaskQueue::new(self.config.max_queued_tasks),
            config: self.config,
            self_addr: self.self_addr,
            transports: Arc::new(self.transports),
            observer: self.observer,
            games: DashMap::new(),
        })
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

struct GameHandle {
    queue: TaskQueue<GameTask>,
    actor: JoinHandle<()>,
    timers: Vec<JoinHandle<()>>,
}

impl GameHandle {
    /// Ask the game task to exit after anything already blocking
    fn stop(self) -> JoinHandle<()> {
        for timer in &self.timers {
            timer.abort();
        }
        let _ = self.queue.push(Priority::Blocking, GameTask::Shutdown);
        self.queue.close();
        self.actor
    }
}

pub struct Engine {
    config: RuntimeConfig,
    self_addr: AddrRecord,
    transports: Arc<TransportRegistry>,
    observer: Option<Arc<dyn PendingObserver>>,
    games: DashMap<GameId, GameHandle>,
    events: TaskQueue<EngineEvent>,
}

impl Engine {
    pub fn builder(self_addr: AddrRecord) -> EngineBuilder {
        EngineBuilder::new(self_addr)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn self_addr(&self) -> &AddrRecord {
        &self.self_addr
    }

    pub fn transport_types(&self) -> Vec<ConnType> {
        self.transports.conn_types().collect()
    }

    pub fn games(&self) -> Vec<GameId> {
        let mut games: Vec<GameId> = self.games.iter().map(|entry| *entry.key()).collect();
        games.sort();
        games
    }

    pub fn is_running(&self, game_id: GameId) -> bool {
        self.games.contains_key(&game_id)
    }

    // ------------------------------------------------------------------------
    // Game Lifecycle
    // ------------------------------------------------------------------------

    /// Start a fresh game. Must be called from within a tokio runtime.
    pub fn start_game(&self, game_id: GameId, is_host: bool) -> Result<()> {
        if self.games.contains_key(&game_id) {
            return Err(RuntimeError::GameExists { game_id });
        }
        let queue = TaskQueue::new(self.config.max_queued_tasks);
        let comms = Comms::new(
            game_id,
            is_host,
            self.self_addr.clone(),
            self.config.comms.clone(),
            self.procs_for(game_id, &queue),
            SystemTimeSource,
        )?;
        self.spawn_game(comms, queue)
    }

    /// Resume a game saved with [`Engine::save`]
    pub fn restore_game(&self, bytes: &[u8]) -> Result<GameId> {
        let queue = TaskQueue::new(self.config.max_queued_tasks);
        let mut comms = Comms::make_from_stream(
            bytes,
            self.config.comms.clone(),
            self.procs_for(GameId::NONE, &queue),
            SystemTimeSource,
        )?;
        let game_id = comms.game_id();
        if self.games.contains_key(&game_id) {
            return Err(RuntimeError::GameExists { game_id });
        }
        comms.procs_mut().set_game_id(game_id);
        self.spawn_game(comms, queue)?;
        Ok(game_id)
    }

    fn procs_for(&self, game_id: GameId, queue: &TaskQueue<GameTask>) -> GameProcs {
        GameProcs::new(
            game_id,
            Arc::clone(&self.transports),
            queue.clone(),
            self.observer.clone(),
        )
    }

    fn spawn_game(&self, comms: GameComms, queue: TaskQueue<GameTask>) -> Result<()> {
        let game_id = comms.game_id();
        let actor = GameActor::new(comms, queue.clone(), self.events.clone());
        let handle = GameHandle {
            actor: tokio::spawn(actor.run()),
            timers: vec![
                spawn_timer(queue.clone(), self.config.resend_interval(), || {
                    GameTask::Resend {
                        force: false,
                        filter: None,
                        also_ack: false,
                        reply: None,
                    }
                }),
                spawn_timer(queue.clone(), self.config.ack_interval(), || {
                    GameTask::AckAny { force: false }
                }),
            ],
            queue,
        };
        self.games.insert(game_id, handle);
        info!(game_id = %game_id, "game started");
        Ok(())
    }

    /// Stop one game and wait for its task to finish
    pub async fn stop_game(&self, game_id: GameId) -> Result<()> {
        let (_, handle) = self
            .games
            .remove(&game_id)
            .ok_or(RuntimeError::GameNotFound { game_id })?;
        if let Err(err) = handle.stop().await {
            warn!(game_id = %game_id, error = %err, "game task ended abnormally");
        }
        Ok(())
    }

    /// Stop every game and close the event queue
    pub async fn shutdown(&self) {
        let games = self.games();
        let stopping: Vec<JoinHandle<()>> = games
            .iter()
            .filter_map(|game_id| self.games.remove(game_id))
            .map(|(_, handle)| handle.stop())
            .collect();
        for result in join_all(stopping).await {
            if let Err(err) = result {
                warn!(error = %err, "game task ended abnormally");
            }
        }
        self.events.close();
        info!(stopped = games.len(), "engine shut down");
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    fn post(&self, game_id: GameId, task: GameTask) -> Result<bool> {
        let game = self
            .games
            .get(&game_id)
            .ok_or(RuntimeError::GameNotFound { game_id })?;
        game.queue.push(task.priority(), task)
    }

    async fn request<R>(
        &self,
        game_id: GameId,
        make: impl FnOnce(oneshot::Sender<R>) -> GameTask,
    ) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.post(game_id, make(reply))?;
        response
            .await
            .map_err(|_| RuntimeError::channel_closed("game task"))
    }

    pub async fn add_peer(&self, game_id: GameId, index: u16, addr: AddrRecord) -> Result<ChannelNo> {
        self.request(game_id, |reply| GameTask::AddPeer { index, addr, reply })
            .await
    }

    pub async fn send(&self, game_id: GameId, channel: ChannelNo, payload: Vec<u8>) -> Result<SendOutcome> {
        self.request(game_id, |reply| GameTask::Send {
            channel,
            payload,
            reply,
        })
        .await?
    }

    pub async fn invite(&self, game_id: GameId, info: LaunchInfo, addr: AddrRecord) -> Result<SendOutcome> {
        self.request(game_id, |reply| GameTask::Invite { info, addr, reply })
            .await?
    }

    pub async fn resend_all(
        &self,
        game_id: GameId,
        force: bool,
        filter: Option<ConnType>,
        also_ack: bool,
    ) -> Result<usize> {
        self.request(game_id, |reply| GameTask::Resend {
            force,
            filter,
            also_ack,
            reply: Some(reply),
        })
        .await
    }

    pub fn ack_any(&self, game_id: GameId, force: bool) -> Result<()> {
        self.post(game_id, GameTask::AckAny { force }).map(|_| ())
    }

    /// Quash a game ahead of anything else it has queued. One-way.
    pub fn quash(&self, game_id: GameId) -> Result<()> {
        self.post(game_id, GameTask::Quash).map(|_| ())
    }

    pub fn set_addr_disabled(
        &self,
        game_id: GameId,
        conn_type: ConnType,
        send: bool,
        disabled: bool,
    ) -> Result<()> {
        self.post(
            game_id,
            GameTask::SetAddrDisabled {
                conn_type,
                send,
                disabled,
            },
        )
        .map(|_| ())
    }

    pub async fn stats(&self, game_id: GameId) -> Result<CommsReport> {
        self.request(game_id, |reply| GameTask::Stats { reply }).await
    }

    pub async fn save(&self, game_id: GameId) -> Result<Vec<u8>> {
        self.request(game_id, |reply| GameTask::Save { reply }).await?
    }

    // ------------------------------------------------------------------------
    // Host Events
    // ------------------------------------------------------------------------

    /// Next event for the host. `None` after shutdown.
    pub async fn next_event(&self) -> Option<EngineEvent> {
        self.events.pop().await.map(|(_, event)| event)
    }

    pub fn try_next_event(&self) -> Option<EngineEvent> {
        self.events.try_pop().map(|(_, event)| event)
    }

    // ------------------------------------------------------------------------
    // Listener Callbacks
    // ------------------------------------------------------------------------

    fn demux(&self) -> Demux<EngineSink<'_>, EngineControl<'_>> {
        let demux = Demux::new(EngineSink { engine: self }, EngineControl { engine: self });
        if self.self_addr.mqtt.dev_id.is_set() {
            demux.with_local_dev_id(self.self_addr.mqtt.dev_id)
        } else {
            demux
        }
    }

    /// A transport received an envelope for `game_id` from `from`
    pub fn on_message_received(
        &self,
        game_id: GameId,
        from: &AddrRecord,
        arrived_on: ConnType,
        bytes: &[u8],
    ) -> Result<Delivery> {
        Ok(self
            .demux()
            .on_message_received(game_id, from, arrived_on, bytes)?)
    }

    pub fn on_game_gone_received(&self, game_id: GameId, from: &AddrRecord) {
        self.demux().on_game_gone_received(game_id, from);
    }

    pub fn on_invite_received(&self, info: &LaunchInfo, from: &AddrRecord) {
        self.demux().on_invite_received(info, from);
    }

    /// A packet arrived from the MQTT broker. Returns messages delivered.
    pub fn on_mqtt_packet(&self, topic: &str, bytes: &[u8]) -> Result<usize> {
        Ok(self.demux().on_mqtt_packet(topic, bytes)?)
    }

    /// A transport came up or went down; every game hears about it
    pub fn on_transport_event(&self, event: TransportEvent) {
        for game in self.games.iter() {
            if let Err(err) = game.queue.push(Priority::Network, GameTask::Transport(event)) {
                debug!(game_id = %game.key(), error = %err, "transport event not queued");
            }
        }
    }

    fn push_event(&self, priority: Priority, event: EngineEvent) {
        if let Err(err) = self.events.push(priority, event) {
            warn!(error = %err, "engine event dropped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for game in self.games.iter() {
            for timer in &game.timers {
                timer.abort();
            }
            game.actor.abort();
        }
    }
}

fn spawn_timer(
    queue: TaskQueue<GameTask>,
    period: core::time::Duration,
    make: fn() -> GameTask,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = queue.push(Priority::Network, make()) {
                if queue.is_closed() {
                    break;
                }
                debug!(error = %err, "timer task not queued");
            }
        }
    })
}

// ----------------------------------------------------------------------------
// Demux Collaborators
// ----------------------------------------------------------------------------

struct EngineSink<'a> {
    engine: &'a Engine,
}

impl GameSink for EngineSink<'_> {
    fn on_message(
        &mut self,
        game_id: GameId,
        from: &AddrRecord,
        arrived_on: ConnType,
        bytes: &[u8],
    ) -> bool {
        let task = GameTask::Inbound {
            bytes: bytes.to_vec(),
            from: from.clone(),
            arrived_on,
        };
        match self.engine.post(game_id, task) {
            Ok(_) => true,
            Err(RuntimeError::GameNotFound { .. }) => false,
            Err(err) => {
                // The peer will resend
                warn!(game_id = %game_id, error = %err, "inbound packet dropped");
                true
            }
        }
    }

    fn on_invite(&mut self, info: &LaunchInfo, from: &AddrRecord) {
        self.engine.push_event(
            Priority::Ui,
            EngineEvent::Invite {
                info: info.clone(),
                from: from.clone(),
            },
        );
    }

    fn purge_game(&mut self, game_id: GameId) {
        if let Some((_, handle)) = self.engine.games.remove(&game_id) {
            let _ = handle.queue.push(Priority::Blocking, GameTask::Quash);
            drop(handle.stop());
        }
        self.engine
            .push_event(Priority::Blocking, EngineEvent::GameGone { game_id });
    }
}

struct EngineControl<'a> {
    engine: &'a Engine,
}

impl TransportControl for EngineControl<'_> {
    fn stop_sending(&mut self, game_id: GameId, to: &AddrRecord) {
        match self.engine.post(game_id, GameTask::Quash) {
            Ok(_) => info!(game_id = %game_id, to = %to.types(), "stopped sending"),
            Err(_) => debug!(game_id = %game_id, "game already stopped"),
        }
    }

    fn reply_no_such_game(&mut self, game_id: GameId, to: &AddrRecord) {
        let local = self.engine.self_addr.mqtt.dev_id;
        if !to.contains(ConnType::Mqtt) || !to.mqtt.dev_id.is_set() || !local.is_set() {
            return;
        }
        let Some(transport) = self.engine.transports.get(ConnType::Mqtt) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(game_id = %game_id, "no async runtime; not replying");
            return;
        };
        match mqtt::no_such_game(local, to.mqtt.dev_id, game_id) {
            Ok((topic, bytes)) => {
                runtime.spawn(async move {
                    if let Err(err) = transport.publish(topic, bytes).await {
                        debug!(game_id = %game_id, error = %err, "no-such-game reply failed");
                    }
                });
            }
            Err(err) => warn!(game_id = %game_id, error = %err, "can't build no-such-game reply"),
        }
    }
}
