//! Per-game task
//!
//! One tokio task owns each game's `Comms` and drains its `TaskQueue`.
//! Everything that touches that state, from UI sends to inbound packets to
//! send completions, arrives here as a `GameTask`.

use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use xwcomms_core::{
    AddrRecord, ChannelNo, Comms, CommsReport, ConnType, GameId, LaunchInfo, SendOutcome,
    SystemTimeSource, TransportEvent,
};

use crate::engine::EngineEvent;
use crate::errors::Result;
use crate::procs::GameProcs;
use crate::queue::{Priority, TaskQueue};

pub(crate) type GameComms = Comms<GameProcs, SystemTimeSource>;

pub(crate) enum GameTask {
    Send {
        channel: ChannelNo,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<SendOutcome>>,
    },
    Invite {
        info: LaunchInfo,
        addr: AddrRecord,
        reply: oneshot::Sender<Result<SendOutcome>>,
    },
    AddPeer {
        index: u16,
        addr: AddrRecord,
        reply: oneshot::Sender<ChannelNo>,
    },
    Resend {
        force: bool,
        filter: Option<ConnType>,
        also_ack: bool,
        reply: Option<oneshot::Sender<usize>>,
    },
    AckAny {
        force: bool,
    },
    Inbound {
        bytes: Vec<u8>,
        from: AddrRecord,
        arrived_on: ConnType,
    },
    SendComplete {
        conn_type: ConnType,
        ok: bool,
    },
    Transport(TransportEvent),
    SetAddrDisabled {
        conn_type: ConnType,
        send: bool,
        disabled: bool,
    },
    Quash,
    Stats {
        reply: oneshot::Sender<CommsReport>,
    },
    Save {
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Draw,
    Shutdown,
}

impl GameTask {
    pub fn priority(&self) -> Priority {
        match self {
            GameTask::Quash | GameTask::Shutdown => Priority::Blocking,
            GameTask::Send { .. }
            | GameTask::Invite { .. }
            | GameTask::AddPeer { .. }
            | GameTask::SetAddrDisabled { .. }
            | GameTask::Stats { .. }
            | GameTask::Save { .. } => Priority::Ui,
            GameTask::Draw => Priority::Draw,
            GameTask::Resend { .. }
            | GameTask::AckAny { .. }
            | GameTask::Inbound { .. }
            | GameTask::SendComplete { .. }
            | GameTask::Transport(_) => Priority::Network,
        }
    }
}

// ----------------------------------------------------------------------------
// Game Actor
// ----------------------------------------------------------------------------

pub(crate) struct GameActor {
    comms: GameComms,
    queue: TaskQueue<GameTask>,
    events: TaskQueue<EngineEvent>,
}

impl GameActor {
    pub(crate) fn new(
        comms: GameComms,
        queue: TaskQueue<GameTask>,
        events: TaskQueue<EngineEvent>,
    ) -> Self {
        Self {
            comms,
            queue,
            events,
        }
    }

    fn game_id(&self) -> GameId {
        self.comms.game_id()
    }

    pub(crate) async fn run(mut self) {
        info!(game_id = %self.game_id(), is_host = self.comms.is_host(), "game task starting");
        while let Some((_, task)) = self.queue.pop().await {
            if !self.handle(task) {
                break;
            }
        }
        self.queue.close();
        info!(game_id = %self.game_id(), "game task stopped");
    }

    /// Returns false when the task should exit
    fn handle(&mut self, task: GameTask) -> bool {
        match task {
            GameTask::Send {
                channel,
                payload,
                reply,
            } => {
                let outcome = self.comms.send(channel, &payload).map_err(Into::into);
                let _ = reply.send(outcome);
            }
            GameTask::Invite { info, addr, reply } => {
                let outcome = self.comms.invite(&info, &addr).map_err(Into::into);
                let _ = reply.send(outcome);
            }
            GameTask::AddPeer { index, addr, reply } => {
                let _ = reply.send(self.comms.add_peer(index, addr));
            }
            GameTask::Resend {
                force,
                filter,
                also_ack,
                reply,
            } => {
                let resent = self.comms.resend_all(force, filter, also_ack);
                if let Some(reply) = reply {
                    let _ = reply.send(resent);
                }
            }
            GameTask::AckAny { force } => {
                self.comms.ack_any(force);
            }
            GameTask::Inbound {
                bytes,
                from,
                arrived_on,
            } => self.on_inbound(&bytes, &from, arrived_on),
            GameTask::SendComplete { conn_type, ok } => {
                if ok {
                    trace!(game_id = %self.game_id(), conn_type = %conn_type, "send completed");
                } else {
                    self.comms.record_send_result(conn_type, false);
                }
            }
            GameTask::Transport(event) => self.comms.apply_transport_event(event),
            GameTask::SetAddrDisabled {
                conn_type,
                send,
                disabled,
            } => self.comms.set_addr_disabled(conn_type, send, disabled),
            GameTask::Quash => self.comms.set_quashed(true),
            GameTask::Stats { reply } => {
                let _ = reply.send(self.comms.get_stats());
            }
            GameTask::Save { reply } => {
                let _ = reply.send(self.comms.to_bytes().map_err(Into::into));
            }
            GameTask::Draw => {
                self.post_event(Priority::Network, EngineEvent::Redraw {
                    game_id: self.game_id(),
                });
            }
            GameTask::Shutdown => return false,
        }
        true
    }

    fn on_inbound(&mut self, bytes: &[u8], from: &AddrRecord, arrived_on: ConnType) {
        match self.comms.check_incoming(bytes, from, arrived_on) {
            Ok(Some(payload)) => {
                debug!(game_id = %self.game_id(), conn_type = %arrived_on, len = payload.len(), "message accepted");
                self.post_event(Priority::Ui, EngineEvent::Message {
                    game_id: self.game_id(),
                    payload,
                });
                if let Err(err) = self.queue.push(Priority::Draw, GameTask::Draw) {
                    trace!(error = %err, "redraw not queued");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(game_id = %self.game_id(), conn_type = %arrived_on, error = %err, "dropping inbound packet");
            }
        }
    }

    fn post_event(&self, priority: Priority, event: EngineEvent) {
        if let Err(err) = self.events.push(priority, event) {
            warn!(game_id = %self.game_id(), error = %err, "engine event dropped");
        }
    }
}
