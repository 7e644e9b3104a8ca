//! Engine integration tests
//!
//! Two engines in one process, linked by loopback transports, play the
//! host and guest of the same game.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, timeout};
use xwcomms_core::mqtt;
use xwcomms_runtime::*;

const GAME: GameId = GameId::new(0x00C0FFEE);
const HOST_DEV: MqttDevId = MqttDevId::new(0x1);
const GUEST_DEV: MqttDevId = MqttDevId::new(0x2);

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

fn sms(phone: &str) -> AddrRecord {
    AddrRecord::with_sms(phone, 0)
}

#[derive(Default)]
struct RecordingObserver {
    counts: Mutex<Vec<(GameId, usize, bool)>>,
}

impl PendingObserver for RecordingObserver {
    fn count_changed(&self, game_id: GameId, count: usize, quashed: bool) {
        self.counts.lock().unwrap().push((game_id, count, quashed));
    }
}

struct Devices {
    host: Arc<Engine>,
    guest: Arc<Engine>,
    host_link: Arc<LoopbackTransport>,
    observer: Arc<RecordingObserver>,
}

/// Host and guest linked over one transport, both running `GAME`
async fn linked(conn_type: ConnType, host_addr: AddrRecord, guest_addr: AddrRecord) -> Devices {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let ((host_link, host_rx), (guest_link, guest_rx)) =
        LoopbackTransport::pair(conn_type, host_addr.clone(), guest_addr.clone());
    let observer = Arc::new(RecordingObserver::default());

    let host = Arc::new(
        Engine::builder(host_addr.clone())
            .with_config(RuntimeConfig::testing())
            .add_transport(host_link.clone())
            .with_observer(observer.clone())
            .build()
            .unwrap(),
    );
    let guest = Arc::new(
        Engine::builder(guest_addr.clone())
            .with_config(RuntimeConfig::testing())
            .add_transport(guest_link)
            .build()
            .unwrap(),
    );
    spawn_pump(host.clone(), host_rx);
    spawn_pump(guest.clone(), guest_rx);

    host.start_game(GAME, true).unwrap();
    guest.start_game(GAME, false).unwrap();
    host.add_peer(GAME, 1, guest_addr).await.unwrap();
    guest.add_peer(GAME, 1, host_addr).await.unwrap();

    Devices {
        host,
        guest,
        host_link,
        observer,
    }
}

async fn sms_devices() -> Devices {
    linked(ConnType::Sms, sms("+15550100"), sms("+15550199")).await
}

async fn next_message(engine: &Engine) -> Vec<u8> {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(EngineEvent::Message { payload, .. }) = engine.next_event().await {
                return payload;
            }
        }
    })
    .await
    .expect("no message arrived")
}

async fn wait_for_stats(engine: &Engine, check: impl Fn(&CommsReport) -> bool) -> CommsReport {
    timeout(Duration::from_secs(2), async {
        loop {
            let report = engine.stats(GAME).await.unwrap();
            if check(&report) {
                return report;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held")
}

fn channel_one() -> ChannelNo {
    ChannelNo::new(1)
}

// ----------------------------------------------------------------------------
// Delivery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn message_is_delivered_and_acked() {
    let devices = sms_devices().await;
    let host_channel = devices.host.stats(GAME).await.unwrap().channels[0].channel;

    let outcome = devices
        .host
        .send(GAME, host_channel, b"first move".to_vec())
        .await
        .unwrap();
    assert_eq!(outcome.msg_id(), Some(xwcomms_core::MsgId::new(1)));

    assert_eq!(next_message(&devices.guest).await, b"first move".to_vec());

    // The guest's ack timer settles the host's queue
    wait_for_stats(&devices.host, |report| report.pending == 0).await;
    let counts = devices.observer.counts.lock().unwrap().clone();
    assert!(counts.contains(&(GAME, 1, false)));
    assert_eq!(counts.last(), Some(&(GAME, 0, false)));
}

#[tokio::test]
async fn message_over_mqtt_reaches_the_guest() {
    let host_addr = AddrRecord::with_mqtt(HOST_DEV);
    let guest_addr = AddrRecord::with_mqtt(GUEST_DEV);
    let devices = linked(ConnType::Mqtt, host_addr, guest_addr).await;
    let channel = devices.host.stats(GAME).await.unwrap().channels[0].channel;

    devices
        .host
        .send(GAME, channel, b"via broker".to_vec())
        .await
        .unwrap();
    assert_eq!(next_message(&devices.guest).await, b"via broker".to_vec());
}

#[tokio::test]
async fn failed_send_is_recovered_by_forced_resend() {
    let devices = sms_devices().await;
    let channel = devices.host.stats(GAME).await.unwrap().channels[0].channel;
    devices.host_link.set_up(false);

    devices
        .host
        .send(GAME, channel, b"lost at first".to_vec())
        .await
        .unwrap();
    let report = wait_for_stats(&devices.host, |report| {
        report
            .transports
            .iter()
            .any(|(conn_type, counters)| *conn_type == ConnType::Sms && counters.send_failures > 0)
    })
    .await;
    assert_eq!(report.pending, 1);

    devices.host_link.set_up(true);
    let resent = devices
        .host
        .resend_all(GAME, true, Some(ConnType::Sms), false)
        .await
        .unwrap();
    assert_eq!(resent, 1);
    assert_eq!(next_message(&devices.guest).await, b"lost at first".to_vec());
}

#[tokio::test]
async fn invite_reaches_the_guest() {
    let devices = sms_devices().await;
    let info = LaunchInfo::new(GameId::new(0x42), "rematch", 2, 1);

    devices
        .host
        .invite(GAME, info.clone(), sms("+15550199"))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(EngineEvent::Invite { info, .. }) = devices.guest.next_event().await {
                return info;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.invite_id, info.invite_id);
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn quashed_game_sends_nothing() {
    let devices = sms_devices().await;
    devices.host.quash(GAME).unwrap();

    let outcome = devices
        .host
        .send(GAME, channel_one(), b"ignored".to_vec())
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Quashed);
    assert!(devices.host.stats(GAME).await.unwrap().quashed);
    assert_eq!(devices.host_link.sent(), 0);
}

#[tokio::test]
async fn saved_game_restores_its_queue() {
    let devices = sms_devices().await;
    let channel = devices.host.stats(GAME).await.unwrap().channels[0].channel;
    devices.host_link.set_up(false);
    devices
        .host
        .send(GAME, channel, b"keep me".to_vec())
        .await
        .unwrap();

    let saved = devices.host.save(GAME).await.unwrap();
    devices.host.stop_game(GAME).await.unwrap();
    assert!(!devices.host.is_running(GAME));

    assert_eq!(devices.host.restore_game(&saved).unwrap(), GAME);
    let report = devices.host.stats(GAME).await.unwrap();
    assert_eq!(report.pending, 1);
    assert!(report.is_host);
}

#[tokio::test]
async fn requests_for_unknown_games_fail() {
    let devices = sms_devices().await;
    let missing = GameId::new(0x99);

    assert!(matches!(
        devices.host.send(missing, channel_one(), vec![1]).await,
        Err(RuntimeError::GameNotFound { .. })
    ));
    assert!(matches!(
        devices.host.start_game(GAME, true),
        Err(RuntimeError::GameExists { .. })
    ));
}

#[tokio::test]
async fn shutdown_stops_every_game() {
    let devices = sms_devices().await;
    devices.host.start_game(GameId::new(0x77), true).unwrap();
    assert_eq!(devices.host.games().len(), 2);

    devices.host.shutdown().await;
    assert!(devices.host.games().is_empty());
    // Whatever was queued drains, then the event queue ends
    timeout(Duration::from_secs(1), async {
        while devices.host.next_event().await.is_some() {}
    })
    .await
    .unwrap();
}

// ----------------------------------------------------------------------------
// Listener Callbacks
// ----------------------------------------------------------------------------

#[tokio::test]
async fn message_for_unknown_game_is_reported() {
    let devices = sms_devices().await;
    let delivery = devices
        .guest
        .on_message_received(GameId::new(0x1234), &sms("+15550100"), ConnType::Sms, b"?")
        .unwrap();
    assert_eq!(delivery, Delivery::UnknownGame);
}

#[tokio::test]
async fn game_gone_over_mqtt_stops_the_game() {
    let devices = linked(
        ConnType::Mqtt,
        AddrRecord::with_mqtt(HOST_DEV),
        AddrRecord::with_mqtt(GUEST_DEV),
    )
    .await;

    let (topic, bytes) = mqtt::no_such_game(HOST_DEV, GUEST_DEV, GAME).unwrap();
    devices.guest.on_mqtt_packet(topic.as_str(), &bytes).unwrap();

    assert!(!devices.guest.is_running(GAME));
    assert_eq!(
        devices.guest.try_next_event(),
        Some(EngineEvent::GameGone { game_id: GAME })
    );
}

#[tokio::test]
async fn transport_events_reach_running_games() {
    let devices = sms_devices().await;
    devices
        .host
        .on_transport_event(TransportEvent::Disconnected(ConnType::Sms));
    // Processed in order with later requests
    assert!(devices.host.stats(GAME).await.is_ok());
}
