use std::collections::{HashMap, HashSet};
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use bytestring::ByteString;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use fieldmq_codec::{Connect, ConnectAck, Packet, Publish, QoS, SubscribeReturnCode};

use crate::binding::{BindingTable, FieldDef};
use crate::error::EngineError;
use crate::event::{ConnState, DriverEvent, EventSender, IoEvent, WriteStatus};
use crate::settings::{ConfigSource, Settings};
use crate::transport::{build_tls_config, MqttStream};
use crate::value::Decoded;

/// Upper bound on any single wait, so the shutdown flag is observed promptly.
const POLL_SLICE: Duration = Duration::from_millis(500);
/// Cooldown before retrying a failed configuration load.
const CONFIG_RETRY: Duration = Duration::from_secs(30);
/// Cooldown before retrying an unreachable broker.
const SERVER_RETRY: Duration = Duration::from_secs(8);
/// How long to wait for CONNACK after sending CONNECT.
const CONNACK_WAIT: Duration = Duration::from_secs(3);
/// Cooldown after a refused or unanswered CONNECT.
const CONNECT_FAIL_COOLDOWN: Duration = Duration::from_secs(15);
/// How long to wait for each SUBACK.
const SUBACK_WAIT: Duration = Duration::from_secs(10);
/// Cooldown after a failed subscribe round.
const SUBSCRIBE_FAIL_COOLDOWN: Duration = Duration::from_secs(30);
/// Per-packet send deadline.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for the best-effort DISCONNECT/close on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Max bytes of topic filters carried by one SUBSCRIBE.
const SUBSCRIBE_CHUNK_BYTES: usize = 1024;

/// Monotonic MQTT packet-id allocator; wraps 65535 -> 1, never issues 0.
struct PacketIdAllocator {
    next: NonZeroU16,
}

impl PacketIdAllocator {
    fn new() -> Self {
        PacketIdAllocator { next: NonZeroU16::MIN }
    }

    fn next(&mut self) -> NonZeroU16 {
        let id = self.next;
        self.next = NonZeroU16::new(id.get().wrapping_add(1)).unwrap_or(NonZeroU16::MIN);
        id
    }
}

/// Per-connection bookkeeping, dropped on every reconnect.
struct Session {
    ids: PacketIdAllocator,
    /// Outstanding QoS 1 publishes, packet id -> field name.
    inflight: HashMap<u16, String>,
    /// Inbound QoS 2 packet ids between our PUBREC and the broker's PUBREL.
    qos2: HashSet<u16>,
    /// Topics the broker refused in SUBACK; their fields stay silent until reload.
    rejected: HashSet<String>,
    last_send: Instant,
    keepalive: Duration,
}

impl Session {
    fn new(settings: &Settings) -> Self {
        Session {
            ids: PacketIdAllocator::new(),
            inflight: HashMap::new(),
            qos2: HashSet::new(),
            rejected: HashSet::new(),
            last_send: Instant::now(),
            keepalive: Duration::from_secs(settings.keepalive as u64),
        }
    }

    /// PINGREQ is due once idle time reaches 3/4 of the keepalive interval.
    fn ping_due(&self) -> bool {
        self.last_send.elapsed() >= self.keepalive.mul_f32(0.75)
    }
}

enum Next {
    Reconnect,
    Reload,
    Shutdown,
}

enum Wait {
    Done,
    Reload,
    Stop,
}

/// The connection manager: one task owning the socket, driving the lifecycle
/// LoadConfig -> Initialize -> WaitServer -> Connecting -> Subscribing -> Ready,
/// falling back on failure and never skipping forward.
pub(crate) struct Manager {
    source: Box<dyn ConfigSource>,
    driver_rx: mpsc::Receiver<DriverEvent>,
    io_tx: EventSender<IoEvent>,
    defs: Arc<RwLock<Option<Vec<FieldDef>>>>,
    stop: Arc<AtomicBool>,
    state: ConnState,
}

impl Manager {
    pub(crate) fn new(
        source: Box<dyn ConfigSource>,
        driver_rx: mpsc::Receiver<DriverEvent>,
        io_tx: EventSender<IoEvent>,
        defs: Arc<RwLock<Option<Vec<FieldDef>>>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Manager { source, driver_rx, io_tx, defs, stop, state: ConnState::LoadConfig }
    }

    pub(crate) async fn run(mut self) -> Result<(), EngineError> {
        'lifecycle: loop {
            self.set_state(ConnState::LoadConfig);
            let (settings, table) = loop {
                if self.stopping() {
                    return self.finish(None).await;
                }
                match self.load_config() {
                    Ok(loaded) => break loaded,
                    Err(e) => {
                        log::warn!("configuration load failed, retrying in {CONFIG_RETRY:?}, {e}");
                        match self.cooldown(CONFIG_RETRY).await {
                            Wait::Stop => return self.finish(None).await,
                            Wait::Done | Wait::Reload => {}
                        }
                    }
                }
            };

            self.set_state(ConnState::Initialize);
            let tls = if settings.server.is_tls() {
                match build_tls_config(&settings) {
                    Ok(cfg) => Some(cfg),
                    Err(e) => {
                        // one-time setup failure is not recoverable by waiting
                        log::error!("TLS setup failed, {e}");
                        let _ = self.finish(None).await;
                        return Err(e);
                    }
                }
            } else {
                None
            };

            loop {
                if self.stopping() {
                    return self.finish(None).await;
                }

                self.set_state(ConnState::WaitServer);
                let mut stream = match MqttStream::connect(&settings, tls.as_ref()).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        log::warn!("broker {} unreachable, {e}", settings.server.addr);
                        match self.cooldown(SERVER_RETRY).await {
                            Wait::Stop => return self.finish(None).await,
                            Wait::Reload => continue 'lifecycle,
                            Wait::Done => continue,
                        }
                    }
                };

                self.set_state(ConnState::Connecting);
                let mut session = Session::new(&settings);
                if let Err(e) = self.handshake(&mut stream, &settings).await {
                    log::warn!("connect to {} failed, {e}", settings.server.addr);
                    let _ = stream.close(CLOSE_TIMEOUT).await;
                    match self.cooldown(CONNECT_FAIL_COOLDOWN).await {
                        Wait::Stop => return self.finish(None).await,
                        Wait::Reload => continue 'lifecycle,
                        Wait::Done => continue,
                    }
                }

                self.set_state(ConnState::Subscribing);
                if let Err(e) = self.establish(&mut stream, &table, &mut session).await {
                    log::warn!("subscribe failed, {e}");
                    let _ = stream.close(CLOSE_TIMEOUT).await;
                    match self.cooldown(SUBSCRIBE_FAIL_COOLDOWN).await {
                        Wait::Stop => return self.finish(None).await,
                        Wait::Reload => continue 'lifecycle,
                        Wait::Done => continue,
                    }
                }

                *self.defs.write() = Some(table.field_defs());
                self.set_state(ConnState::Ready);
                let next = self.ready_loop(&mut stream, &table, &mut session).await;
                if !session.inflight.is_empty() {
                    log::warn!(
                        "connection lost with {} unacknowledged publishes, fields: {:?}",
                        session.inflight.len(),
                        session.inflight.values().collect::<Vec<_>>()
                    );
                }
                match next {
                    Next::Reconnect => {
                        let _ = stream.close(CLOSE_TIMEOUT).await;
                    }
                    Next::Reload => {
                        let _ = stream.close(CLOSE_TIMEOUT).await;
                        continue 'lifecycle;
                    }
                    Next::Shutdown => return self.finish(Some(&mut stream)).await,
                }
            }
        }
    }

    #[inline]
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn set_state(&mut self, state: ConnState) {
        if self.state != state {
            log::info!("state {} -> {state}", self.state);
            self.state = state;
            self.io_tx.emit(IoEvent::StateChange(state));
        }
    }

    fn load_config(&mut self) -> crate::Result<(Settings, BindingTable)> {
        let settings = self.source.load()?;
        let table = BindingTable::build(settings.bindings.clone())?;
        log::info!(
            "configuration loaded, broker {}, {} bindings, {} read topics",
            settings.server.addr,
            settings.bindings.len(),
            table.read_topics().len()
        );
        Ok((settings, table))
    }

    /// Sliced, interruptible sleep. Driver events arriving during the wait are
    /// drained: writes are answered with LostConnection, reload cuts the wait
    /// short.
    async fn cooldown(&mut self, d: Duration) -> Wait {
        let deadline = Instant::now() + d;
        loop {
            if self.stopping() {
                return Wait::Stop;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => return Wait::Done,
            };
            match tokio::time::timeout(remaining.min(POLL_SLICE), self.driver_rx.recv()).await {
                Ok(Some(DriverEvent::Reload)) => return Wait::Reload,
                Ok(Some(DriverEvent::FieldWrite { field, .. })) => {
                    self.io_tx.emit(IoEvent::WriteResult { field, status: WriteStatus::LostConnection });
                }
                Ok(None) => return Wait::Stop,
                Err(_) => {}
            }
        }
    }

    async fn handshake(&mut self, stream: &mut MqttStream, settings: &Settings) -> Result<(), EngineError> {
        let connect = Connect {
            // persistent sessions are out of scope; always a clean session
            clean_session: true,
            keep_alive: settings.keepalive,
            client_id: ByteString::from(settings.client_id.clone()),
            username: settings.username.clone().map(ByteString::from),
            password: settings.password.clone().map(Bytes::from),
        };
        stream.send(connect.into(), SEND_TIMEOUT).await?;

        let reply = match stream.recv(CONNACK_WAIT).await {
            Ok(reply) => reply,
            Err(EngineError::ReadTimeout) => return Err(EngineError::NoConnAck),
            Err(e) => return Err(e),
        };
        match reply {
            Some(Packet::ConnectAck(ConnectAck { return_code, session_present })) => {
                if !return_code.is_accepted() {
                    return Err(EngineError::ConnectRefused(return_code.reason()));
                }
                if session_present {
                    log::warn!("broker reports session present despite clean session request");
                }
                Ok(())
            }
            Some(_) => Err(EngineError::UnexpectedPacket),
            None => Err(EngineError::Closed),
        }
    }

    /// Subscribe every unique read topic (chunked rounds), then publish the
    /// configured seed values.
    async fn establish(
        &mut self,
        stream: &mut MqttStream,
        table: &BindingTable,
        session: &mut Session,
    ) -> Result<(), EngineError> {
        for chunk in chunk_topics(table.read_topics(), SUBSCRIBE_CHUNK_BYTES) {
            let packet_id = session.ids.next();
            let topic_filters: Vec<(ByteString, QoS)> =
                chunk.iter().map(|t| (ByteString::from(t.as_str()), QoS::AtLeastOnce)).collect();
            send_tracked(stream, session, Packet::Subscribe { packet_id, topic_filters }).await?;

            let status = self.await_suback(stream, table, session, packet_id).await?;
            if status.len() != chunk.len() {
                return Err(EngineError::SubscribeFailed);
            }
            for (topic, code) in chunk.iter().zip(status) {
                match code {
                    SubscribeReturnCode::Success(qos) => {
                        log::debug!("subscribed {topic:?} at qos {}", u8::from(qos));
                    }
                    SubscribeReturnCode::Failure => {
                        log::warn!("broker refused subscription to {topic:?}");
                        session.rejected.insert(topic.clone());
                    }
                }
            }
        }

        self.publish_seeds(stream, table, session).await
    }

    async fn await_suback(
        &mut self,
        stream: &mut MqttStream,
        table: &BindingTable,
        session: &mut Session,
        expected_id: NonZeroU16,
    ) -> Result<Vec<SubscribeReturnCode>, EngineError> {
        let deadline = Instant::now() + SUBACK_WAIT;
        loop {
            if self.stopping() || Instant::now() >= deadline {
                return Err(EngineError::SubscribeFailed);
            }
            match stream.recv(POLL_SLICE).await {
                Ok(Some(Packet::SubscribeAck { packet_id, status })) if packet_id == expected_id => {
                    return Ok(status);
                }
                Ok(Some(Packet::SubscribeAck { packet_id, .. })) => {
                    log::warn!("SUBACK for unexpected packet id {packet_id}");
                }
                // retained messages for already-subscribed topics may arrive
                // before the final SUBACK
                Ok(Some(Packet::Publish(publish))) => {
                    self.handle_publish(stream, table, session, publish).await?;
                }
                Ok(Some(other)) => {
                    log::warn!("unexpected packet while subscribing, {other:?}");
                }
                Ok(None) => return Err(EngineError::Closed),
                Err(EngineError::ReadTimeout) => {}
                Err(e) => return Err(e),
            }
        }
    }

    async fn publish_seeds(
        &mut self,
        stream: &mut MqttStream,
        table: &BindingTable,
        session: &mut Session,
    ) -> Result<(), EngineError> {
        for b in table.iter() {
            let seed = match (&b.seed, b.direction.writable()) {
                (Some(seed), true) => seed,
                (Some(_), false) => {
                    log::warn!("seed configured for non-writable field {:?}, ignored", b.field);
                    continue;
                }
                _ => continue,
            };
            let payload = match b.codec.encode(seed) {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("seed value {seed:?} for field {:?} rejected, {e}", b.field);
                    continue;
                }
            };
            let packet_id = (b.qos == QoS::AtLeastOnce).then(|| session.ids.next());
            let publish = Publish {
                dup: false,
                retain: b.retain,
                qos: b.qos,
                topic: ByteString::from(b.topic.clone()),
                packet_id,
                payload,
            };
            send_tracked(stream, session, publish.into()).await?;
            if let Some(id) = packet_id {
                session.inflight.insert(id.get(), b.field.clone());
            }
            log::debug!("seeded field {:?}", b.field);
        }
        Ok(())
    }

    /// Steady state: alternate between draining driver events and short framed
    /// reads; idle read timeouts drive the keepalive check.
    async fn ready_loop(
        &mut self,
        stream: &mut MqttStream,
        table: &BindingTable,
        session: &mut Session,
    ) -> Next {
        loop {
            if self.stopping() {
                return Next::Shutdown;
            }

            while let Ok(ev) = self.driver_rx.try_recv() {
                match ev {
                    DriverEvent::Reload => {
                        log::info!("reload requested");
                        return Next::Reload;
                    }
                    DriverEvent::FieldWrite { field, value } => {
                        if let Err(e) = self.write_field(stream, table, session, field, value).await {
                            log::warn!("write failed, reconnecting, {e}");
                            return Next::Reconnect;
                        }
                    }
                }
            }

            match stream.recv(POLL_SLICE).await {
                Ok(Some(packet)) => {
                    if let Err(e) = self.handle_packet(stream, table, session, packet).await {
                        log::warn!("protocol error, reconnecting, {e}");
                        return Next::Reconnect;
                    }
                }
                Ok(None) => {
                    log::warn!("broker closed the connection");
                    return Next::Reconnect;
                }
                Err(EngineError::ReadTimeout) => {
                    if session.ping_due() {
                        if let Err(e) = send_tracked(stream, session, Packet::PingRequest).await {
                            log::warn!("keepalive failed, reconnecting, {e}");
                            return Next::Reconnect;
                        }
                        log::debug!("PINGREQ sent");
                    }
                }
                Err(e) => {
                    log::warn!("read failed, reconnecting, {e}");
                    return Next::Reconnect;
                }
            }
        }
    }

    async fn handle_packet(
        &mut self,
        stream: &mut MqttStream,
        table: &BindingTable,
        session: &mut Session,
        packet: Packet,
    ) -> Result<(), EngineError> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(stream, table, session, publish).await,
            Packet::PublishAck { packet_id } => {
                match session.inflight.remove(&packet_id.get()) {
                    Some(field) => log::debug!("PUBACK {packet_id} for field {field:?}"),
                    None => log::warn!("PUBACK {packet_id} matches no outstanding publish"),
                }
                Ok(())
            }
            Packet::PublishRelease { packet_id } => {
                if !session.qos2.remove(&packet_id.get()) {
                    log::warn!("PUBREL {packet_id} matches no outstanding receive");
                }
                send_tracked(stream, session, Packet::PublishComplete { packet_id }).await
            }
            Packet::PublishReceived { packet_id } | Packet::PublishComplete { packet_id } => {
                // we never publish at QoS 2
                log::warn!("unexpected QoS 2 ack {packet_id} from broker");
                Ok(())
            }
            Packet::SubscribeAck { packet_id, .. } => {
                log::warn!("late SUBACK {packet_id}");
                Ok(())
            }
            Packet::PingResponse => {
                log::debug!("PINGRESP received");
                Ok(())
            }
            Packet::Connect(_)
            | Packet::ConnectAck(_)
            | Packet::Subscribe { .. }
            | Packet::PingRequest
            | Packet::Disconnect => Err(EngineError::UnexpectedPacket),
        }
    }

    async fn handle_publish(
        &mut self,
        stream: &mut MqttStream,
        table: &BindingTable,
        session: &mut Session,
        publish: Publish,
    ) -> Result<(), EngineError> {
        // acknowledge first; the handshake is owed regardless of dispatch
        let mut first_delivery = true;
        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                if let Some(packet_id) = publish.packet_id {
                    send_tracked(stream, session, Packet::PublishAck { packet_id }).await?;
                }
            }
            QoS::ExactlyOnce => {
                if let Some(packet_id) = publish.packet_id {
                    first_delivery = session.qos2.insert(packet_id.get());
                    send_tracked(stream, session, Packet::PublishReceived { packet_id }).await?;
                }
            }
        }
        if first_delivery {
            self.dispatch(table, session, &publish);
        }
        Ok(())
    }

    fn dispatch(&mut self, table: &BindingTable, session: &Session, publish: &Publish) {
        let topic = publish.topic.as_ref();
        if publish.payload.is_empty() {
            log::debug!("empty payload on {topic:?}, dropped");
            return;
        }
        if session.rejected.contains(topic) {
            log::debug!("publish on rejected topic {topic:?}, dropped");
            return;
        }
        let readers = table.readers(topic);
        if readers.is_empty() {
            if table.iter().any(|b| b.topic == topic) {
                log::debug!("publish on write-only topic {topic:?}, dropped");
            } else {
                log::debug!("publish on unbound topic {topic:?}, dropped");
            }
            return;
        }
        for idx in readers {
            let b = table.binding(*idx);
            match b.codec.decode(&publish.payload) {
                Decoded::Value(value) => {
                    self.io_tx.emit(IoEvent::NewValue { field: b.field.clone(), value });
                }
                Decoded::Bad => {
                    log::warn!("bad payload on {topic:?} for field {:?}", b.field);
                    self.io_tx.emit(IoEvent::BadValue { field: b.field.clone() });
                }
                Decoded::Ignore => {}
            }
        }
    }

    async fn write_field(
        &mut self,
        stream: &mut MqttStream,
        table: &BindingTable,
        session: &mut Session,
        field: String,
        value: String,
    ) -> Result<(), EngineError> {
        let b = match table.get(&field) {
            Some(b) => b,
            None => {
                log::warn!("write to unknown field {field:?}");
                self.io_tx.emit(IoEvent::WriteResult { field, status: WriteStatus::FieldNotFound });
                return Ok(());
            }
        };
        if !b.direction.writable() {
            log::warn!("write to read-only field {field:?}");
            self.io_tx.emit(IoEvent::WriteResult { field, status: WriteStatus::ValueRejected });
            return Ok(());
        }
        let payload = match b.codec.encode(&value) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("value {value:?} rejected for field {field:?}, {e}");
                self.io_tx.emit(IoEvent::WriteResult { field, status: WriteStatus::ValueRejected });
                return Ok(());
            }
        };
        let packet_id = (b.qos == QoS::AtLeastOnce).then(|| session.ids.next());
        let publish = Publish {
            dup: false,
            retain: b.retain,
            qos: b.qos,
            topic: ByteString::from(b.topic.clone()),
            packet_id,
            payload,
        };
        send_tracked(stream, session, publish.into()).await?;
        if let Some(id) = packet_id {
            session.inflight.insert(id.get(), field.clone());
        }
        self.io_tx.emit(IoEvent::WriteResult { field, status: WriteStatus::Success });
        Ok(())
    }

    /// Best-effort DISCONNECT, then the terminal states.
    async fn finish(&mut self, stream: Option<&mut MqttStream>) -> Result<(), EngineError> {
        self.set_state(ConnState::Disconnecting);
        if let Some(stream) = stream {
            let _ = stream.send(Packet::Disconnect, CLOSE_TIMEOUT).await;
            let _ = stream.close(CLOSE_TIMEOUT).await;
        }
        self.set_state(ConnState::Disconnected);
        Ok(())
    }
}

#[inline]
async fn send_tracked(
    stream: &mut MqttStream,
    session: &mut Session,
    packet: Packet,
) -> Result<(), EngineError> {
    stream.send(packet, SEND_TIMEOUT).await?;
    session.last_send = Instant::now();
    Ok(())
}

/// Split topics into SUBSCRIBE-sized chunks; each filter costs its length
/// prefix, the name and the QoS byte on the wire.
fn chunk_topics(topics: &[String], max_bytes: usize) -> Vec<Vec<String>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut used = 0usize;
    for topic in topics {
        let cost = 2 + topic.len() + 1;
        if !current.is_empty() && used + cost > max_bytes {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        used += cost;
        current.push(topic.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_id_wraps_skipping_zero() {
        let mut ids = PacketIdAllocator::new();
        assert_eq!(ids.next().get(), 1);
        assert_eq!(ids.next().get(), 2);

        ids.next = NonZeroU16::new(u16::MAX).unwrap();
        assert_eq!(ids.next().get(), u16::MAX);
        assert_eq!(ids.next().get(), 1);
    }

    #[test]
    fn test_chunk_topics() {
        let topics: Vec<String> = (0..100).map(|i| format!("home/room{i:02}/sensor")).collect();
        let chunks = chunk_topics(&topics, SUBSCRIBE_CHUNK_BYTES);

        assert!(chunks.len() > 1);
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), topics.len());
        let flat: Vec<&String> = chunks.iter().flatten().collect();
        assert!(flat.iter().zip(&topics).all(|(a, b)| **a == *b));
        for chunk in &chunks {
            let bytes: usize = chunk.iter().map(|t| 2 + t.len() + 1).sum();
            assert!(bytes <= SUBSCRIBE_CHUNK_BYTES);
        }
    }

    #[test]
    fn test_chunk_single_oversized_topic() {
        let topics = vec!["t".repeat(2048)];
        let chunks = chunk_topics(&topics, SUBSCRIBE_CHUNK_BYTES);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1);
    }

    #[test]
    fn test_ping_due() {
        let settings: Settings = toml::from_str(r#"server = "tcp://127.0.0.1:1883""#).unwrap();
        let mut session = Session::new(&settings);
        assert!(!session.ping_due());
        session.last_send = Instant::now() - Duration::from_secs(60);
        assert!(session.ping_due());
    }
}
