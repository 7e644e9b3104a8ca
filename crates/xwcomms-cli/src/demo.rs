//! Loopback demo session
//!
//! Runs a host and a guest engine in this process, linked by a loopback
//! transport, and pushes messages from one to the other through the full
//! pending queue, resend and ack path.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use xwcomms_core::{CommsReport, ConnType, GameId};
use xwcomms_runtime::{spawn_pump, Engine, EngineEvent, LoopbackTransport};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

pub const DEMO_GAME: GameId = GameId::new(0x0D3E_0001);

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub conn_type: ConnType,
    pub messages: u32,
    pub drop_first: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoSummary {
    pub conn_type: ConnType,
    pub delivered: Vec<String>,
    pub resent: usize,
    pub host: CommsReport,
    pub guest: CommsReport,
    /// Hex of the host's saved game once everything settled
    pub saved: String,
}

struct Session {
    host: Arc<Engine>,
    guest: Arc<Engine>,
    host_link: Arc<LoopbackTransport>,
}

impl Session {
    async fn start(config: &AppConfig, conn_type: ConnType) -> Result<Self> {
        let host_addr = config.host.addr_for(conn_type)?;
        let guest_addr = config.guest.addr_for(conn_type)?;
        let ((host_link, host_rx), (guest_link, guest_rx)) =
            LoopbackTransport::pair(conn_type, host_addr.clone(), guest_addr.clone());

        let host = Arc::new(
            Engine::builder(host_addr.clone())
                .with_config(config.runtime.clone())
                .add_transport(host_link.clone())
                .build()?,
        );
        let guest = Arc::new(
            Engine::builder(guest_addr.clone())
                .with_config(config.runtime.clone())
                .add_transport(guest_link)
                .build()?,
        );
        spawn_pump(host.clone(), host_rx);
        spawn_pump(guest.clone(), guest_rx);

        host.start_game(DEMO_GAME, true)?;
        guest.start_game(DEMO_GAME, false)?;
        host.add_peer(DEMO_GAME, 1, guest_addr).await?;
        guest.add_peer(DEMO_GAME, 1, host_addr).await?;

        Ok(Self {
            host,
            guest,
            host_link,
        })
    }

    async fn shutdown(&self) {
        self.host.shutdown().await;
        self.guest.shutdown().await;
    }
}

/// Poll `engine`'s stats until `check` holds or `deadline` passes
async fn wait_for(
    engine: &Engine,
    deadline: Instant,
    what: &str,
    check: impl Fn(&CommsReport) -> bool,
) -> Result<CommsReport> {
    loop {
        let report = engine.stats(DEMO_GAME).await?;
        if check(&report) {
            return Ok(report);
        }
        if Instant::now() >= deadline {
            return Err(CliError::Timeout(what.to_string()));
        }
        sleep(Duration::from_millis(20)).await;
    }
}

async fn collect_messages(engine: &Engine, count: usize, deadline: Instant) -> Result<Vec<String>> {
    let mut delivered = Vec::with_capacity(count);
    let remaining = deadline.saturating_duration_since(Instant::now());
    let collected = timeout(remaining, async {
        while delivered.len() < count {
            match engine.next_event().await {
                Some(EngineEvent::Message { payload, .. }) => {
                    delivered.push(String::from_utf8_lossy(&payload).into_owned());
                }
                Some(other) => debug!("guest event: {:?}", other),
                None => break,
            }
        }
    })
    .await;
    if collected.is_err() || delivered.len() < count {
        return Err(CliError::Timeout(format!(
            "{} of {} messages",
            count - delivered.len(),
            count
        )));
    }
    Ok(delivered)
}

pub async fn run(config: &AppConfig, options: DemoOptions) -> Result<DemoSummary> {
    if options.messages == 0 {
        return Err(CliError::invalid_argument("messages must be at least 1"));
    }
    let deadline = Instant::now() + Duration::from_millis(config.cli.demo_timeout_ms);
    let session = Session::start(config, options.conn_type).await?;
    let result = exchange(&session, &options, deadline).await;
    session.shutdown().await;
    result
}

async fn exchange(session: &Session, options: &DemoOptions, deadline: Instant) -> Result<DemoSummary> {
    let conn_type = options.conn_type;
    let channel = session
        .host
        .stats(DEMO_GAME)
        .await?
        .channels
        .first()
        .map(|channel| channel.channel)
        .ok_or_else(|| CliError::invalid_argument("host has no channel"))?;

    if options.drop_first {
        info!("Taking the {} link down before sending", conn_type.long_name());
        session.host_link.set_up(false);
    }

    for n in 1..=options.messages {
        let outcome = session
            .host
            .send(DEMO_GAME, channel, format!("move {}", n).into_bytes())
            .await?;
        debug!("send {}: {:?}", n, outcome);
    }

    let mut resent = 0;
    if options.drop_first {
        wait_for(&session.host, deadline, "send failures", |report| {
            report
                .transports
                .iter()
                .any(|(ct, counters)| *ct == conn_type && counters.send_failures > 0)
        })
        .await?;
        session.host_link.set_up(true);
        resent = session
            .host
            .resend_all(DEMO_GAME, true, Some(conn_type), false)
            .await?;
        info!("Link restored; resent {} packets", resent);
    }

    let delivered = collect_messages(&session.guest, options.messages as usize, deadline).await?;
    info!("Guest received {} messages", delivered.len());

    session.guest.ack_any(DEMO_GAME, true)?;
    let host = match wait_for(&session.host, deadline, "acks", |report| report.pending == 0).await {
        Ok(report) => report,
        Err(err) => {
            warn!("Host queue did not drain: {}", err);
            session.host.stats(DEMO_GAME).await?
        }
    };
    let guest = session.guest.stats(DEMO_GAME).await?;
    let saved = hex::encode(session.host.save(DEMO_GAME).await?);

    Ok(DemoSummary {
        conn_type,
        delivered,
        resent,
        host,
        guest,
        saved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use xwcomms_runtime::RuntimeConfig;

    fn config() -> AppConfig {
        AppConfig {
            runtime: RuntimeConfig::testing(),
            ..AppConfig::default()
        }
    }

    fn options(conn_type: ConnType, drop_first: bool) -> DemoOptions {
        DemoOptions {
            conn_type,
            messages: 2,
            drop_first,
        }
    }

    #[tokio::test]
    async fn messages_arrive_in_order_and_are_acked() {
        let summary = run(&config(), options(ConnType::Sms, false)).await.unwrap();
        assert_eq!(summary.delivered, vec!["move 1", "move 2"]);
        assert_eq!(summary.host.pending, 0);
        assert_eq!(summary.resent, 0);
        assert!(!summary.saved.is_empty());
    }

    #[tokio::test]
    async fn dropped_link_is_recovered_by_resend() {
        let summary = run(&config(), options(ConnType::Bt, true)).await.unwrap();
        assert_eq!(summary.delivered, vec!["move 1", "move 2"]);
        assert_eq!(summary.resent, 2);
    }

    #[tokio::test]
    async fn zero_messages_is_rejected() {
        let mut opts = options(ConnType::Sms, false);
        opts.messages = 0;
        assert!(matches!(
            run(&config(), opts).await,
            Err(CliError::InvalidArgument(_))
        ));
    }
}
