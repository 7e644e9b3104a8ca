//! Per-game comms context
//!
//! `Comms` owns everything one game needs to talk to its peers: the address
//! of every channel, per-channel sequence numbers, the pending-packet queue
//! and the host's send procedures. It is a plain state machine; the caller
//! serializes access (one owner per game) and supplies the clock.
//!
//! Outbound messages are sent on every enabled transport of the peer's
//! address and tracked once per transport. An ack arriving on one transport
//! settles that copy and drops the others.

use std::collections::BTreeMap;

use rand_core::{OsRng, RngCore};
use tracing::{debug, info, trace, warn};

use crate::addr::AddrRecord;
use crate::config::CommsConfig;
use crate::conn_type::{ConnType, ConnTypeSet};
use crate::errors::{AddressError, CommsError, Result, StreamError};
use crate::invite::LaunchInfo;
use crate::mqtt::MqttBatch;
use crate::pending::{PacketBody, PacketKey, PacketState, PendingPacket, PendingQueue};
use crate::stats::{ChannelReport, CommsReport, TransportStats};
use crate::stream::{version, InStream, OutStream};
use crate::transport::{OutboundMsg, SendOutcome, TransportEvent, TransportHealth, TransportProcs};
use crate::types::{ChannelNo, GameId, MqttDevId, MsgId, SystemTimeSource, TimeSource, Timestamp};
use crate::wire::{Envelope, EnvelopeFlags};

// ----------------------------------------------------------------------------
// Channel Record
// ----------------------------------------------------------------------------

/// What this device knows about one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub channel: ChannelNo,
    pub addr: AddrRecord,
    /// Id the next outbound message will get
    pub next_msg_id: MsgId,
    /// Highest inbound id we've told the peer about
    pub last_msg_acked: MsgId,
    /// Highest inbound id accepted from the peer
    pub last_msg_rcvd: MsgId,
}

impl ChannelRecord {
    pub fn new(channel: ChannelNo, addr: AddrRecord) -> Self {
        Self {
            channel,
            addr,
            next_msg_id: MsgId::new(1),
            last_msg_acked: MsgId::NONE,
            last_msg_rcvd: MsgId::NONE,
        }
    }

    fn write_to(&self, out: &mut OutStream) -> Result<()> {
        out.put_u16(self.channel.raw());
        self.addr.write_to(out)?;
        out.put_u32_vl(self.next_msg_id.as_u32());
        out.put_u32_vl(self.last_msg_acked.as_u32());
        out.put_u32_vl(self.last_msg_rcvd.as_u32());
        Ok(())
    }

    fn read_from(input: &mut InStream<'_>) -> Result<Self> {
        Ok(Self {
            channel: ChannelNo::new(input.get_u16()?),
            addr: AddrRecord::read_from(input)?,
            next_msg_id: MsgId::new(input.get_u32_vl()?),
            last_msg_acked: MsgId::new(input.get_u32_vl()?),
            last_msg_rcvd: MsgId::new(input.get_u32_vl()?),
        })
    }
}

// ----------------------------------------------------------------------------
// Comms
// ----------------------------------------------------------------------------

pub struct Comms<P: TransportProcs, T: TimeSource = SystemTimeSource> {
    config: CommsConfig,
    game_id: GameId,
    is_host: bool,
    self_addr: AddrRecord,
    channel_seed: u16,
    channels: BTreeMap<u16, ChannelRecord>,
    queue: PendingQueue,
    health: TransportHealth,
    stats: TransportStats,
    send_disabled: ConnTypeSet,
    recv_disabled: ConnTypeSet,
    quashed: bool,
    resend_backoff_secs: u64,
    next_resend: Timestamp,
    procs: P,
    time_source: T,
}

impl<P: TransportProcs, T: TimeSource> Comms<P, T> {
    pub fn new(
        game_id: GameId,
        is_host: bool,
        self_addr: AddrRecord,
        config: CommsConfig,
        procs: P,
        time_source: T,
    ) -> Result<Self> {
        config.validate()?;
        let channel_seed = random_channel_seed();
        debug!(game_id = %game_id, is_host, seed = channel_seed, "created comms");
        Ok(Self {
            config,
            game_id,
            is_host,
            self_addr,
            channel_seed,
            channels: BTreeMap::new(),
            queue: PendingQueue::new(),
            health: TransportHealth::new(),
            stats: TransportStats::new(),
            send_disabled: ConnTypeSet::new(),
            recv_disabled: ConnTypeSet::new(),
            quashed: false,
            resend_backoff_secs: 0,
            next_resend: Timestamp::default(),
            procs,
            time_source,
        })
    }

    pub fn game_id(&self) -> GameId {
        self.game_id
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn self_addr(&self) -> &AddrRecord {
        &self.self_addr
    }

    pub fn config(&self) -> &CommsConfig {
        &self.config
    }

    pub fn channel_seed(&self) -> u16 {
        self.channel_seed
    }

    pub fn procs(&self) -> &P {
        &self.procs
    }

    pub fn procs_mut(&mut self) -> &mut P {
        &mut self.procs
    }

    fn now(&self) -> Timestamp {
        self.time_source.now()
    }

    // ------------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------------

    /// Register a peer on channel `index`, merging with anything already known
    pub fn add_peer(&mut self, index: u16, addr: AddrRecord) -> ChannelNo {
        let index = index & ChannelNo::MASK;
        let seed = self.channel_seed;
        let record = self
            .channels
            .entry(index)
            .or_insert_with(|| ChannelRecord::new(ChannelNo::with_index(seed, index), AddrRecord::new()));
        record.addr.augment(&addr, true);
        debug!(channel = %record.channel, types = %record.addr.types(), "added peer");
        record.channel
    }

    pub fn addr_for(&self, channel: ChannelNo) -> Option<&AddrRecord> {
        self.channels.get(&channel.index()).map(|record| &record.addr)
    }

    pub fn channel(&self, channel: ChannelNo) -> Option<&ChannelRecord> {
        self.channels.get(&channel.index())
    }

    pub fn get_addrs(&self) -> Vec<(ChannelNo, AddrRecord)> {
        self.channels
            .values()
            .map(|record| (record.channel, record.addr.clone()))
            .collect()
    }

    /// Learn a peer's MQTT device id. Returns true if the address changed.
    pub fn add_mqtt_dev_id(&mut self, channel: ChannelNo, dev_id: MqttDevId) -> Result<bool> {
        let record = self
            .channels
            .get_mut(&channel.index())
            .ok_or(AddressError::NoChannel { channel })?;
        let changed = record.addr.augment(&AddrRecord::with_mqtt(dev_id), true);
        if changed {
            info!(channel = %channel, dev_id = %dev_id, "added mqtt device id");
        }
        Ok(changed)
    }

    /// Guest only: stop using `conn_type` to reach the host, dropping what
    /// was queued on it. Returns the number of packets dropped.
    pub fn drop_host_addr(&mut self, conn_type: ConnType) -> usize {
        if self.is_host {
            warn!(conn_type = %conn_type, "drop_host_addr called on host; ignoring");
            return 0;
        }
        for record in self.channels.values_mut() {
            record.addr.remove(conn_type);
        }
        let dropped = self.queue.drop_conn_type(conn_type);
        info!(conn_type = %conn_type, dropped, "dropped host address type");
        self.notify_count();
        dropped
    }

    // ------------------------------------------------------------------------
    // Switches
    // ------------------------------------------------------------------------

    /// Quash the game. One-way: once set it stays set.
    pub fn set_quashed(&mut self, quashed: bool) {
        if self.quashed && !quashed {
            warn!(game_id = %self.game_id, "ignoring attempt to unquash");
            return;
        }
        if quashed && !self.quashed {
            info!(game_id = %self.game_id, "quashed");
            self.quashed = true;
            self.notify_count();
        }
    }

    pub fn is_quashed(&self) -> bool {
        self.quashed
    }

    /// Turn sending (or receiving) on one transport off or back on
    pub fn set_addr_disabled(&mut self, conn_type: ConnType, send: bool, disabled: bool) {
        let set = if send {
            &mut self.send_disabled
        } else {
            &mut self.recv_disabled
        };
        if disabled {
            set.add(conn_type);
        } else {
            set.remove(conn_type);
        }
        debug!(conn_type = %conn_type, send, disabled, "transport switch");
    }

    pub fn is_addr_disabled(&self, conn_type: ConnType, send: bool) -> bool {
        if send {
            self.send_disabled.contains(conn_type)
        } else {
            self.recv_disabled.contains(conn_type)
        }
    }

    pub fn apply_transport_event(&mut self, event: TransportEvent) {
        self.health.apply(event);
    }

    /// Outcome of a send the host completed after `send_msg` accepted it.
    /// The handoff already counted as sent, so a failure moves that count
    /// over to the failures.
    pub fn record_send_result(&mut self, conn_type: ConnType, ok: bool) {
        let now = self.now();
        self.health.record_send(conn_type, ok, now);
        if !ok {
            self.stats.reclassify_failure(conn_type);
        }
        self.notify_count();
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    fn enabled_types(&self, addr: &AddrRecord) -> Vec<ConnType> {
        addr.types()
            .iter()
            .filter(|conn_type| !self.send_disabled.contains(*conn_type))
            .collect()
    }

    /// Queue `payload` for the peer on `channel` and send it on every
    /// enabled transport of its address
    pub fn send(&mut self, channel: ChannelNo, payload: &[u8]) -> Result<SendOutcome> {
        if self.quashed {
            self.notify_count();
            return Ok(SendOutcome::Quashed);
        }
        if payload.len() > self.config.max_payload_len {
            return Err(CommsError::invalid_message(format!(
                "payload of {} bytes exceeds limit of {}",
                payload.len(),
                self.config.max_payload_len
            )));
        }
        let index = channel.index();
        let types = match self.channels.get(&index) {
            Some(record) => self.enabled_types(&record.addr),
            None => return Err(AddressError::NoChannel { channel }.into()),
        };

        let now = self.now();
        let (key_channel, msg_id, bytes) = {
            let record = self
                .channels
                .get_mut(&index)
                .ok_or(AddressError::NoChannel { channel })?;
            let msg_id = record.next_msg_id;
            record.next_msg_id = msg_id.next();
            let mut envelope = Envelope::new(self.game_id, record.channel, msg_id, payload.to_vec());
            envelope.version = self.config.stream_version;
            envelope.last_msg_rcvd = record.last_msg_rcvd;
            envelope.flags.is_host = self.is_host;
            record.last_msg_acked = record.last_msg_rcvd;
            (record.channel, msg_id, envelope.encode())
        };

        if types.is_empty() {
            warn!(channel = %key_channel, msg_id = %msg_id, "no enabled transport for peer; holding");
            self.queue.insert(PendingPacket::new(
                PacketKey::unrouted(key_channel, msg_id),
                PacketBody::Message(bytes),
                now,
            ));
            self.notify_count();
            return Ok(SendOutcome::NoTransport { msg_id });
        }

        let keys: Vec<PacketKey> = types
            .iter()
            .map(|conn_type| PacketKey::new(key_channel, *conn_type, msg_id))
            .collect();
        for key in &keys {
            self.queue
                .insert(PendingPacket::new(*key, PacketBody::Message(bytes.clone()), now));
        }
        debug!(channel = %key_channel, msg_id = %msg_id, transports = keys.len(), "queued message");

        let (attempted, delivered) = self.dispatch(&keys, now);
        self.notify_count();
        Ok(SendOutcome::Queued {
            msg_id,
            attempted,
            delivered,
        })
    }

    /// Send an invitation to the peer at `addr`. The channel comes from the
    /// launch info; any earlier invite on that channel is replaced.
    pub fn invite(&mut self, info: &LaunchInfo, addr: &AddrRecord) -> Result<SendOutcome> {
        if self.quashed {
            self.notify_count();
            return Ok(SendOutcome::Quashed);
        }
        let channel = self.add_peer(info.force_channel as u16, addr.clone());
        let replaced = self
            .queue
            .drop_where(|key| key.is_invite() && key.channel.same_peer(channel));
        if replaced > 0 {
            debug!(channel = %channel, replaced, "replacing earlier invite");
        }

        let types = self.enabled_types(addr);
        let now = self.now();
        if types.is_empty() {
            warn!(channel = %channel, "no enabled transport for invitee; holding");
            self.queue.insert(PendingPacket::new(
                PacketKey::unrouted(channel, MsgId::NONE),
                PacketBody::Invite(info.clone()),
                now,
            ));
            self.notify_count();
            return Ok(SendOutcome::NoTransport {
                msg_id: MsgId::NONE,
            });
        }
        let keys: Vec<PacketKey> = types
            .iter()
            .map(|conn_type| PacketKey::invite(channel, *conn_type))
            .collect();
        for key in &keys {
            self.queue
                .insert(PendingPacket::new(*key, PacketBody::Invite(info.clone()), now));
        }
        info!(channel = %channel, invite_id = %info.invite_id, "sending invite");

        let (attempted, delivered) = self.dispatch(&keys, now);
        self.notify_count();
        Ok(SendOutcome::Queued {
            msg_id: MsgId::NONE,
            attempted,
            delivered,
        })
    }

    /// Hand queued packets to the transports. Returns (attempted, delivered).
    fn dispatch(&mut self, keys: &[PacketKey], now: Timestamp) -> (usize, usize) {
        let mut attempted = 0;
        let mut delivered = 0;
        let mut batch = MqttBatch::with_proto(self.self_addr.mqtt.dev_id, self.config.mqtt.proto);
        let mut batched = Vec::new();

        for key in keys {
            let packet = match self.queue.get(key) {
                Some(packet) => packet,
                None => continue,
            };
            let record = match self.channels.get(&key.channel.index()) {
                Some(record) => record,
                None => {
                    warn!(key = ?key, "no address for queued packet");
                    continue;
                }
            };
            attempted += 1;

            let ok = match &packet.body {
                PacketBody::Invite(info) => {
                    self.procs
                        .send_invite(&record.addr, key.conn_type, info, now)
                }
                PacketBody::Message(bytes) if key.conn_type == ConnType::Mqtt => {
                    let recipient = record.addr.mqtt.dev_id;
                    if recipient.is_set() {
                        batch.push(recipient, self.game_id, bytes.clone());
                        batched.push(*key);
                        continue;
                    }
                    warn!(channel = %key.channel, "peer has no mqtt device id");
                    false
                }
                PacketBody::Message(bytes) => {
                    let msg = OutboundMsg {
                        game_id: self.game_id,
                        channel: key.channel,
                        msg_id: key.msg_id,
                        conn_type: key.conn_type,
                        addr: &record.addr,
                        bytes: bytes.as_slice(),
                        stream_version: self.config.stream_version,
                        created_at: packet.created_at,
                    };
                    match self.procs.send_msg(&msg) {
                        Ok(sent) => {
                            trace!(key = ?key, sent, "sent");
                            true
                        }
                        Err(err) => {
                            warn!(key = ?key, error = %err, "send failed; will retry");
                            false
                        }
                    }
                }
            };
            self.queue.mark_sent(key, now);
            self.note_attempt(key.conn_type, ok, now);
            if ok {
                delivered += 1;
            }
        }

        if !batched.is_empty() {
            let ok = match batch.into_packets() {
                Ok(packets) => {
                    let published = self.procs.send_mqtt(&packets);
                    if published < packets.len() {
                        warn!(published, total = packets.len(), "mqtt batch partly published");
                    }
                    published == packets.len()
                }
                Err(err) => {
                    warn!(error = %err, "failed to build mqtt batch");
                    false
                }
            };
            for key in &batched {
                self.queue.mark_sent(key, now);
                self.note_attempt(ConnType::Mqtt, ok, now);
                if ok {
                    delivered += 1;
                }
            }
        }
        (attempted, delivered)
    }

    fn note_attempt(&mut self, conn_type: ConnType, ok: bool, now: Timestamp) {
        self.health.record_send(conn_type, ok, now);
        if ok {
            self.stats.record_sent(conn_type);
        } else {
            self.stats.record_failure(conn_type);
        }
    }

    fn notify_count(&mut self) {
        let count = self.queue.count();
        for conn_type in ConnType::ALL.iter().skip(1) {
            let pending = self.queue.count_for(*conn_type);
            if pending > 0 || self.stats.get(*conn_type).pending > 0 {
                self.stats.set_pending(*conn_type, pending);
            }
        }
        self.procs.count_changed(count, self.quashed);
    }

    /// Send an unsequenced envelope carrying our latest ack to one channel.
    /// Not tracked; returns the number of transports it went out on.
    fn send_control(&mut self, index: u16, ack_request: bool, only: Option<ConnType>) -> usize {
        let now = self.now();
        let (addr, envelope) = match self.channels.get_mut(&index) {
            Some(record) => {
                let mut envelope = Envelope::ack(self.game_id, record.channel, record.last_msg_rcvd);
                envelope.version = self.config.stream_version;
                envelope.flags = EnvelopeFlags {
                    ack_request,
                    is_host: self.is_host,
                };
                record.last_msg_acked = record.last_msg_rcvd;
                (record.addr.clone(), envelope)
            }
            None => return 0,
        };
        let bytes = envelope.encode();
        let mut sent = 0;
        for conn_type in self.enabled_types(&addr) {
            if only.map_or(false, |wanted| wanted != conn_type) {
                continue;
            }
            let ok = if conn_type == ConnType::Mqtt {
                if !addr.mqtt.dev_id.is_set() {
                    continue;
                }
                let mut batch =
                    MqttBatch::with_proto(self.self_addr.mqtt.dev_id, self.config.mqtt.proto);
                batch.push(addr.mqtt.dev_id, self.game_id, bytes.clone());
                match batch.into_packets() {
                    Ok(packets) => self.procs.send_mqtt(&packets) == packets.len(),
                    Err(_) => false,
                }
            } else {
                let msg = OutboundMsg {
                    game_id: self.game_id,
                    channel: envelope.channel,
                    msg_id: MsgId::NONE,
                    conn_type,
                    addr: &addr,
                    bytes: bytes.as_slice(),
                    stream_version: self.config.stream_version,
                    created_at: now,
                };
                self.procs.send_msg(&msg).is_ok()
            };
            self.note_attempt(conn_type, ok, now);
            if ok {
                sent += 1;
            }
        }
        trace!(channel = %envelope.channel, ack_request, sent, "sent control envelope");
        sent
    }

    // ------------------------------------------------------------------------
    // Resend
    // ------------------------------------------------------------------------

    /// Re-transmit outstanding packets.
    ///
    /// Unforced resends only touch transports believed disconnected or
    /// stale, and back off (doubling) after each successful round. `filter`
    /// limits the resend to one transport. `also_ack` additionally asks
    /// every peer to re-confirm what it has. Returns the number of packets
    /// re-transmitted.
    pub fn resend_all(&mut self, force: bool, filter: Option<ConnType>, also_ack: bool) -> usize {
        if self.quashed {
            debug!(game_id = %self.game_id, "quashed; not resending");
            return 0;
        }
        let now = self.now();
        if !force && now < self.next_resend {
            debug!(
                wait_ms = self.next_resend.duration_since(now).as_millis() as u64,
                "resend backoff in effect"
            );
            return 0;
        }

        self.route_held();
        let stale_after = self.config.resend.stale_after();
        let keys: Vec<PacketKey> = self
            .queue
            .keys_for(filter)
            .into_iter()
            .filter(|key| !self.send_disabled.contains(key.conn_type))
            .filter(|key| {
                force
                    || self.health.is_stale(key.conn_type, now, stale_after)
                    || self.queue.get(key).map_or(false, |packet| packet.send_count == 0)
            })
            .collect();

        let mut resent = 0;
        if !keys.is_empty() {
            let (attempted, delivered) = self.dispatch(&keys, now);
            resent = attempted;
            if !force && delivered > 0 {
                self.resend_backoff_secs = (2 * (1 + self.resend_backoff_secs))
                    .min(self.config.resend.max_backoff_secs);
                self.next_resend = now.add_seconds(self.resend_backoff_secs);
            }
            debug!(resent, delivered, force, filter = ?filter, "resent packets");
            self.notify_count();
        }

        if also_ack {
            let indexes: Vec<u16> = self.channels.keys().copied().collect();
            for index in indexes {
                self.send_control(index, true, filter);
            }
        }
        resent
    }

    /// Copy queued packets onto transports that became usable since they
    /// were queued: a re-enabled type, or one learned for the peer later
    fn route_held(&mut self) {
        let types: BTreeMap<u16, Vec<ConnType>> = self
            .channels
            .iter()
            .map(|(index, record)| (*index, self.enabled_types(&record.addr)))
            .collect();
        let added = self
            .queue
            .route(|channel| types.get(&channel.index()).cloned().unwrap_or_default());
        if !added.is_empty() {
            debug!(added = added.len(), "routed queued packets to new transports");
        }
    }

    /// Send a bare ack to every channel with received messages we haven't
    /// acked yet (or to every channel, when forced). Returns channels acked.
    pub fn ack_any(&mut self, force: bool) -> usize {
        if self.quashed {
            return 0;
        }
        let indexes: Vec<u16> = self
            .channels
            .iter()
            .filter(|(_, record)| force || record.last_msg_acked < record.last_msg_rcvd)
            .map(|(index, _)| *index)
            .collect();
        let mut acked = 0;
        for index in indexes {
            if self.send_control(index, false, None) > 0 {
                acked += 1;
            }
        }
        acked
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Process an inbound envelope. Applies its ack, answers ack requests,
    /// and returns the payload if it's the next message expected on its
    /// channel. Duplicates and control envelopes yield `None`.
    pub fn check_incoming(
        &mut self,
        bytes: &[u8],
        from: &AddrRecord,
        arrived_on: ConnType,
    ) -> Result<Option<Vec<u8>>> {
        if self.quashed {
            debug!(game_id = %self.game_id, "quashed; dropping inbound");
            return Ok(None);
        }
        if self.recv_disabled.contains(arrived_on) {
            debug!(conn_type = %arrived_on, "receive disabled; dropping inbound");
            return Ok(None);
        }
        let envelope = Envelope::decode(bytes)?;
        if envelope.game_id != self.game_id {
            return Err(CommsError::WrongGame {
                expected: self.game_id,
                got: envelope.game_id,
            });
        }

        let now = self.now();
        self.health.record_inbound(arrived_on, now);
        self.stats.record_received(arrived_on);
        self.resend_backoff_secs = 0;
        self.next_resend = now;

        let index = envelope.channel.index();
        if !self.channels.contains_key(&index) {
            if envelope.msg_id > MsgId::new(1) {
                return Err(AddressError::NoChannel {
                    channel: envelope.channel,
                }
                .into());
            }
            info!(channel = %envelope.channel, from = %from.types(), "new peer");
            self.channels
                .insert(index, ChannelRecord::new(envelope.channel, AddrRecord::new()));
        }

        let (channel, last_rcvd) = {
            let is_host = self.is_host;
            let record = self.channels.get_mut(&index).ok_or(AddressError::NoChannel {
                channel: envelope.channel,
            })?;
            record.addr.augment(from, true);
            if record.channel != envelope.channel {
                if envelope.flags.is_host && !is_host {
                    debug!(old = %record.channel, new = %envelope.channel, "adopting host channel");
                    record.channel = envelope.channel;
                } else {
                    trace!(ours = %record.channel, theirs = %envelope.channel, "peer uses its own seed");
                }
            }
            (record.channel, record.last_msg_rcvd)
        };

        let settled = self.queue.ack(channel, arrived_on, envelope.last_msg_rcvd);
        if !settled.is_empty() {
            debug!(
                channel = %channel,
                acked = settled.acked.len(),
                dropped = settled.dropped.len(),
                "peer acked"
            );
            self.notify_count();
        }

        if envelope.flags.ack_request {
            self.send_control(index, false, Some(arrived_on));
        }
        if envelope.is_control() {
            return Ok(None);
        }

        let expected = last_rcvd.next();
        if envelope.msg_id < expected {
            trace!(msg_id = %envelope.msg_id, "duplicate; dropping");
            return Ok(None);
        }
        if envelope.msg_id != expected {
            warn!(msg_id = %envelope.msg_id, expected = %expected, "out of order; dropping");
            return Ok(None);
        }
        if let Some(record) = self.channels.get_mut(&index) {
            record.last_msg_rcvd = envelope.msg_id;
        }
        trace!(channel = %channel, msg_id = %envelope.msg_id, "accepted");
        Ok(Some(envelope.payload))
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn count_pending_packets(&self) -> usize {
        self.queue.count()
    }

    pub fn pending_packets(&self) -> Vec<PendingPacket> {
        self.queue.snapshot()
    }

    pub fn pending_for(&self, channel: ChannelNo) -> Vec<PendingPacket> {
        self.queue.snapshot_channel(channel)
    }

    pub fn transport_stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn get_stats(&self) -> CommsReport {
        CommsReport {
            game_id: self.game_id,
            is_host: self.is_host,
            quashed: self.quashed,
            pending: self.queue.count(),
            resend_backoff_secs: self.resend_backoff_secs,
            channels: self
                .channels
                .values()
                .map(|record| ChannelReport {
                    channel: record.channel,
                    conn_types: record.addr.types().to_display_string(false),
                    next_msg_id: record.next_msg_id,
                    last_msg_acked: record.last_msg_acked,
                    last_msg_rcvd: record.last_msg_rcvd,
                    pending: self.queue.snapshot_channel(record.channel).len(),
                })
                .collect(),
            transports: self.stats.iter().collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub fn write_to_stream(&self, out: &mut OutStream) -> Result<()> {
        out.put_u8(out.version());
        out.put_u32(self.game_id.as_u32());
        out.put_u8((self.is_host as u8) | ((self.quashed as u8) << 1));
        out.put_u16(self.channel_seed);
        out.put_u32(self.resend_backoff_secs as u32);
        out.put_u64(self.next_resend.as_millis());
        if out.version() >= version::DISABLED_TYPES {
            out.put_u8(self.send_disabled.raw_bits());
            out.put_u8(self.recv_disabled.raw_bits());
        }
        self.self_addr.write_to(out)?;

        out.put_u8(self.channels.len() as u8);
        for record in self.channels.values() {
            record.write_to(out)?;
        }

        let packets = self.queue.snapshot();
        let count = u16::try_from(packets.len()).map_err(|_| StreamError::TooMany {
            field: "pending packets",
            count: packets.len(),
        })?;
        out.put_u16(count);
        for packet in &packets {
            out.put_u16(packet.key.channel.raw());
            out.put_u8(packet.key.conn_type.ordinal());
            out.put_u32_vl(packet.key.msg_id.as_u32());
            out.put_u64(packet.created_at.as_millis());
            out.put_u32_vl(packet.send_count);
            match &packet.body {
                PacketBody::Message(bytes) => {
                    out.put_u8(0);
                    out.put_bytes(bytes);
                }
                PacketBody::Invite(info) => {
                    out.put_u8(1);
                    info.write_to(out)?;
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = OutStream::with_version(self.config.stream_version);
        self.write_to_stream(&mut out)?;
        Ok(out.into_bytes())
    }

    /// Restore a context saved by `to_bytes`
    pub fn make_from_stream(
        bytes: &[u8],
        config: CommsConfig,
        procs: P,
        time_source: T,
    ) -> Result<Self> {
        config.validate()?;
        let mut input = InStream::new(bytes);
        let stream_version = input.get_u8()?;
        if stream_version == 0 || stream_version > version::CURRENT {
            return Err(StreamError::UnknownValue {
                field: "stream version",
                value: stream_version as u32,
            }
            .into());
        }
        input.set_version(stream_version);

        let game_id = GameId::new(input.get_u32()?);
        let flags = input.get_u8()?;
        let channel_seed = input.get_u16()?;
        let resend_backoff_secs = input.get_u32()? as u64;
        let next_resend = Timestamp::new(input.get_u64()?);
        let (send_disabled, recv_disabled) = if stream_version >= version::DISABLED_TYPES {
            (
                ConnTypeSet::from_raw_bits(input.get_u8()?),
                ConnTypeSet::from_raw_bits(input.get_u8()?),
            )
        } else {
            (ConnTypeSet::new(), ConnTypeSet::new())
        };
        let self_addr = AddrRecord::read_from(&mut input)?;

        let mut channels = BTreeMap::new();
        for _ in 0..input.get_u8()? {
            let record = ChannelRecord::read_from(&mut input)?;
            channels.insert(record.channel.index(), record);
        }

        let mut queue = PendingQueue::new();
        for _ in 0..input.get_u16()? {
            let channel = ChannelNo::new(input.get_u16()?);
            let ordinal = input.get_u8()?;
            let conn_type = ConnType::from_ordinal(ordinal).ok_or(StreamError::UnknownValue {
                field: "conn type",
                value: ordinal as u32,
            })?;
            let msg_id = MsgId::new(input.get_u32_vl()?);
            let created_at = Timestamp::new(input.get_u64()?);
            let send_count = input.get_u32_vl()?;
            let body = match input.get_u8()? {
                0 => PacketBody::Message(input.get_bytes()?),
                1 => PacketBody::Invite(LaunchInfo::read_from(&mut input)?),
                other => {
                    return Err(StreamError::UnknownValue {
                        field: "packet body",
                        value: other as u32,
                    }
                    .into())
                }
            };
            let mut packet =
                PendingPacket::new(PacketKey::new(channel, conn_type, msg_id), body, created_at);
            packet.send_count = send_count;
            if send_count > 0 {
                packet.state = PacketState::Pending;
            }
            queue.insert(packet);
        }

        debug!(game_id = %game_id, channels = channels.len(), pending = queue.count(), "restored comms");
        Ok(Self {
            config,
            game_id,
            is_host: flags & 0x01 != 0,
            self_addr,
            channel_seed,
            channels,
            queue,
            health: TransportHealth::new(),
            stats: TransportStats::new(),
            send_disabled,
            recv_disabled,
            quashed: flags & 0x02 != 0,
            resend_backoff_secs,
            next_resend,
            procs,
            time_source,
        })
    }
}

/// High bits for this device's channel numbers; never zero
fn random_channel_seed() -> u16 {
    loop {
        let seed = (OsRng.next_u32() as u16) & !ChannelNo::MASK;
        if seed != 0 {
            return seed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransportProcs;
    use crate::types::ManualTimeSource;

    fn comms() -> Comms<MockTransportProcs, ManualTimeSource> {
        Comms::new(
            GameId::new(7),
            true,
            AddrRecord::with_sms("+15550002", 0),
            CommsConfig::testing(),
            MockTransportProcs::new(),
            ManualTimeSource::new(Timestamp::from_secs(10)),
        )
        .unwrap()
    }

    #[test]
    fn oversized_queue_is_refused_not_truncated() {
        let mut comms = comms();
        let channel = comms.add_peer(1, AddrRecord::with_sms("+15550001", 0));
        for id in 1..=u16::MAX as u32 + 1 {
            comms.queue.insert(PendingPacket::new(
                PacketKey::new(channel, ConnType::Sms, MsgId::new(id)),
                PacketBody::Message(Vec::new()),
                Timestamp::default(),
            ));
        }
        assert!(matches!(
            comms.to_bytes(),
            Err(CommsError::Stream(StreamError::TooMany { count: 65_536, .. }))
        ));

        comms.queue.drop_where(|key| key.msg_id > MsgId::new(1));
        assert!(comms.to_bytes().is_ok());
    }

    #[test]
    fn late_failure_moves_the_send_count() {
        let mut comms = comms();
        let channel = comms.add_peer(1, AddrRecord::with_sms("+15550001", 0));
        comms.send(channel, b"move").unwrap();
        assert_eq!(comms.transport_stats().get(ConnType::Sms).sent, 1);
        let notified = comms.procs().counts.len();

        comms.record_send_result(ConnType::Sms, false);
        let counters = comms.transport_stats().get(ConnType::Sms);
        assert_eq!(counters.sent, 0);
        assert_eq!(counters.send_failures, 1);
        assert_eq!(comms.procs().counts.len(), notified + 1);
        assert_eq!(comms.procs().last_count(), Some((1, false)));
    }
}
