//! Remote MQTT Backend
//!
//! MQTT v5.0 client over TCP. Each `connect()` is one attempt with a single
//! deadline covering the TCP connect and the CONNACK wait; there is no
//! internal reconnect. Every attempt gets a fresh epoch, and anything that
//! completes under an older epoch (a late CONNACK, a dying session task) is
//! discarded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{BackendAdapter, BackendError, BackendKind, InboundHandler, LinkEvent, LinkEventSender};
use crate::codec::{Decoder, Encoder};
use crate::config::BrokerConfig;
use crate::message::Message;
use crate::protocol::{
    Connect, Disconnect, Packet, Properties, PubAck, Publish, QoS, ReasonCode, Subscribe,
    Subscription, SubscriptionOptions, Unsubscribe,
};
use crate::topic::to_mqtt_filter;

/// User property carrying the message VPN name in CONNECT
pub const VPN_USER_PROPERTY: &str = "vpn";

const COMMAND_CHANNEL_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = 4096;

type Reply = oneshot::Sender<Result<(), BackendError>>;

/// Operations handed to the session task
enum Command {
    Publish(Publish),
    Subscribe { filter: String, reply: Reply },
    Unsubscribe { filter: String, reply: Reply },
    Shutdown,
}

/// Handle to a running session task
struct Session {
    epoch: u64,
    command_tx: mpsc::Sender<Command>,
    request_timeout: Duration,
}

/// TCP link that completed the CONNECT/CONNACK exchange
struct Link {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    /// Bytes read past the CONNACK
    read_buf: BytesMut,
    server_keep_alive: Option<u16>,
}

struct Shared {
    epoch: AtomicU64,
    connected: AtomicBool,
    session: Mutex<Option<Session>>,
    cancel: Notify,
    inbound: RwLock<Option<InboundHandler>>,
    link_tx: RwLock<Option<LinkEventSender>>,
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Called by a session task that ended on its own
    fn end_session(&self, epoch: u64, reason: String) {
        {
            let mut session = self.session.lock();
            if session.as_ref().map(|s| s.epoch) != Some(epoch) {
                return;
            }
            *session = None;
            self.connected.store(false, Ordering::SeqCst);
        }

        warn!("Remote backend: link lost: {}", reason);
        if let Some(tx) = self.link_tx.read().as_ref() {
            let _ = tx.send(LinkEvent::Lost {
                kind: BackendKind::Remote,
                epoch,
                reason,
            });
        }
    }

    fn deliver(&self, epoch: u64, publish: Publish) {
        if !self.is_current(epoch) {
            return;
        }

        let handler = self.inbound.read().clone();
        if let Some(handler) = handler {
            handler(Message {
                topic: publish.topic,
                payload: publish.payload,
                content_type: publish.properties.content_type,
                correlation_id: publish
                    .properties
                    .correlation_data
                    .map(|d| String::from_utf8_lossy(&d).into_owned()),
            });
        }
    }
}

/// MQTT v5.0 remote backend
pub struct RemoteBackend {
    shared: Arc<Shared>,
}

impl RemoteBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                epoch: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                session: Mutex::new(None),
                cancel: Notify::new(),
                inbound: RwLock::new(None),
                link_tx: RwLock::new(None),
            }),
        }
    }

    /// TCP connect, CONNECT, wait for CONNACK
    async fn handshake(config: &BrokerConfig, addr: &str) -> Result<Link, BackendError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        debug!("Remote backend: TCP connected to {}", addr);

        let (mut read_half, mut write_half) = stream.into_split();

        let mut properties = Properties::new();
        if !config.vpn.is_empty() {
            properties
                .user_properties
                .push((VPN_USER_PROPERTY.to_string(), config.vpn.clone()));
        }

        let connect = Packet::Connect(Box::new(Connect {
            client_id: config.client_id.clone(),
            clean_start: true,
            keep_alive: config.keep_alive_secs(),
            username: config.username.clone(),
            password: config.password.as_ref().map(|p| Bytes::from(p.clone())),
            properties,
        }));

        let mut buf = BytesMut::new();
        Encoder::new()
            .encode(&connect, &mut buf)
            .map_err(|e| BackendError::Protocol(format!("Encode error: {}", e)))?;
        write_half
            .write_all(&buf)
            .await
            .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;

        debug!("Remote backend: CONNECT sent");

        let decoder = Decoder::new();
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let packet = loop {
            let decoded = decoder
                .decode(&read_buf)
                .map_err(|e| BackendError::Protocol(format!("Decode error: {}", e)))?;
            if let Some((packet, used)) = decoded {
                read_buf.advance(used);
                break packet;
            }

            let n = read_half
                .read_buf(&mut read_buf)
                .await
                .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;
            if n == 0 {
                return Err(BackendError::ConnectionLost(
                    "Connection closed before CONNACK".to_string(),
                ));
            }
        };

        match packet {
            Packet::ConnAck(connack) if connack.reason_code == ReasonCode::Success => {
                debug!(
                    "Remote backend: CONNACK received (session_present={})",
                    connack.session_present
                );
                Ok(Link {
                    read_half,
                    write_half,
                    read_buf,
                    server_keep_alive: connack.properties.server_keep_alive,
                })
            }
            Packet::ConnAck(connack) => Err(BackendError::Rejected(
                match connack.properties.reason_string {
                    Some(reason) => format!("CONNACK {}: {}", connack.reason_code, reason),
                    None => format!("CONNACK {}", connack.reason_code),
                },
            )),
            other => Err(BackendError::Protocol(format!(
                "Expected CONNACK, got packet type {}",
                other.packet_type()
            ))),
        }
    }

    fn command_tx(&self) -> Result<(mpsc::Sender<Command>, Duration), BackendError> {
        match self.shared.session.lock().as_ref() {
            Some(session) => Ok((session.command_tx.clone(), session.request_timeout)),
            None => Err(BackendError::NotConnected),
        }
    }

    /// Send a command that expects an acknowledgement from the broker
    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), BackendError> {
        let (tx, request_timeout) = self.command_tx()?;
        let (reply_tx, reply_rx) = oneshot::channel();

        tx.send(make(reply_tx))
            .await
            .map_err(|_| BackendError::ConnectionLost("Session closed".to_string()))?;

        match timeout(request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BackendError::ConnectionLost(
                "Session closed before acknowledgement".to_string(),
            )),
            Err(_) => Err(BackendError::Timeout),
        }
    }
}

impl Default for RemoteBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        // The session task keeps `shared` alive, so stop it explicitly
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = self.shared.session.lock().take() {
            let _ = session.command_tx.try_send(Command::Shutdown);
        }
    }
}

#[async_trait]
impl BackendAdapter for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn set_inbound(&self, handler: InboundHandler) {
        *self.shared.inbound.write() = Some(handler);
    }

    fn set_link_events(&self, tx: LinkEventSender) {
        *self.shared.link_tx.write() = Some(tx);
    }

    async fn connect(&self, config: &BrokerConfig) -> Result<(), BackendError> {
        let endpoint = config.parse_endpoint().map_err(|e| {
            BackendError::Unavailable(format!("Invalid endpoint '{}': {}", config.endpoint, e))
        })?;

        // Retire whatever session the previous epoch left behind
        let epoch = {
            let mut session = self.shared.session.lock();
            let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(old) = session.take() {
                let _ = old.command_tx.try_send(Command::Shutdown);
            }
            self.shared.connected.store(false, Ordering::SeqCst);
            epoch
        };

        let cancelled = self.shared.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();
        if !self.shared.is_current(epoch) {
            return Err(BackendError::Cancelled);
        }

        let addr = endpoint.socket_addr_string();
        debug!("Remote backend: connecting to {} (epoch {})", endpoint, epoch);

        let link = tokio::select! {
            result = timeout(config.connect_timeout, Self::handshake(config, &addr)) => {
                match result {
                    Ok(Ok(link)) => link,
                    Ok(Err(e)) => {
                        warn!("Remote backend: connect to {} failed: {}", endpoint, e);
                        return Err(e);
                    }
                    Err(_) => {
                        warn!(
                            "Remote backend: connect to {} timed out after {:?}",
                            endpoint, config.connect_timeout
                        );
                        return Err(BackendError::Timeout);
                    }
                }
            }
            _ = &mut cancelled => {
                debug!("Remote backend: connect to {} cancelled", endpoint);
                return Err(BackendError::Cancelled);
            }
        };

        let keep_alive = match link.server_keep_alive {
            Some(secs) => Duration::from_secs(secs as u64),
            None => config.keep_alive,
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        {
            let mut session = self.shared.session.lock();
            if !self.shared.is_current(epoch) {
                // Dropping the link closes the socket
                debug!("Remote backend: discarding late CONNACK for epoch {}", epoch);
                return Err(BackendError::Cancelled);
            }
            *session = Some(Session {
                epoch,
                command_tx,
                request_timeout: config.connect_timeout,
            });
            self.shared.connected.store(true, Ordering::SeqCst);
        }

        info!(
            "Remote backend: connected to {} as '{}' (vpn '{}')",
            endpoint, config.client_id, config.vpn
        );

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = run_session(shared.clone(), epoch, link, command_rx, keep_alive).await;
            match result {
                Ok(()) => debug!("Remote backend: session {} closed", epoch),
                Err(e) => shared.end_session(epoch, e.to_string()),
            }
        });

        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<(), BackendError> {
        let (tx, _) = self.command_tx()?;

        let mut properties = Properties::new();
        properties.content_type = message.content_type;
        properties.correlation_data = message.correlation_id.map(Bytes::from);

        let publish = Publish {
            qos: QoS::AtMostOnce,
            topic: message.topic,
            payload: message.payload,
            properties,
            ..Default::default()
        };

        tx.send(Command::Publish(publish))
            .await
            .map_err(|_| BackendError::ConnectionLost("Session closed".to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), BackendError> {
        let filter = to_mqtt_filter(pattern);
        debug!("Remote backend: subscribing to '{}' as '{}'", pattern, filter);
        self.request(|reply| Command::Subscribe { filter, reply })
            .await
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), BackendError> {
        let filter = to_mqtt_filter(pattern);
        debug!("Remote backend: unsubscribing from '{}'", filter);
        self.request(|reply| Command::Unsubscribe { filter, reply })
            .await
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        let old = {
            let mut session = self.shared.session.lock();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            self.shared.connected.store(false, Ordering::SeqCst);
            session.take()
        };
        self.shared.cancel.notify_waiters();

        if let Some(old) = old {
            let _ = old.command_tx.send(Command::Shutdown).await;
            info!("Remote backend: disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }
}

/// Encodes and writes packets on the session socket
struct PacketWriter {
    write_half: OwnedWriteHalf,
    encoder: Encoder,
    buf: BytesMut,
}

impl PacketWriter {
    async fn write(&mut self, packet: &Packet) -> Result<(), BackendError> {
        self.buf.clear();
        self.encoder
            .encode(packet, &mut self.buf)
            .map_err(|e| BackendError::Protocol(format!("Encode error: {}", e)))?;
        self.write_half
            .write_all(&self.buf)
            .await
            .map_err(|e| BackendError::ConnectionLost(e.to_string()))
    }
}

/// Per-session state owned by the session task
struct SessionState {
    shared: Arc<Shared>,
    epoch: u64,
    writer: PacketWriter,
    decoder: Decoder,
    read_buf: BytesMut,
    pending: AHashMap<u16, Reply>,
    next_packet_id: u16,
    awaiting_pingresp: bool,
}

impl SessionState {
    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }

    async fn handle_command(&mut self, command: Command) -> Result<bool, BackendError> {
        match command {
            Command::Publish(publish) => {
                self.writer.write(&Packet::Publish(publish)).await?;
            }
            Command::Subscribe { filter, reply } => {
                let packet_id = self.next_packet_id();
                let packet = Packet::Subscribe(Subscribe {
                    packet_id,
                    subscriptions: vec![Subscription {
                        filter,
                        options: SubscriptionOptions {
                            qos: QoS::AtMostOnce,
                            no_local: false,
                        },
                    }],
                    properties: Properties::default(),
                });
                self.writer.write(&packet).await?;
                self.pending.insert(packet_id, reply);
            }
            Command::Unsubscribe { filter, reply } => {
                let packet_id = self.next_packet_id();
                let packet = Packet::Unsubscribe(Unsubscribe {
                    packet_id,
                    filters: vec![filter],
                    properties: Properties::default(),
                });
                self.writer.write(&packet).await?;
                self.pending.insert(packet_id, reply);
            }
            Command::Shutdown => {
                let _ = self
                    .writer
                    .write(&Packet::Disconnect(Disconnect::default()))
                    .await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn resolve(&mut self, packet_id: u16, reason_codes: &[ReasonCode], what: &str) {
        let Some(reply) = self.pending.remove(&packet_id) else {
            debug!("Remote backend: unsolicited {} for packet {}", what, packet_id);
            return;
        };

        let result = match reason_codes.iter().find(|code| code.is_error()) {
            Some(code) => Err(BackendError::Rejected(format!("{} {}", what, code))),
            None => Ok(()),
        };
        let _ = reply.send(result);
    }

    /// Handle every complete packet in the read buffer
    async fn process_buffer(&mut self) -> Result<(), BackendError> {
        loop {
            let decoded = self
                .decoder
                .decode(&self.read_buf)
                .map_err(|e| BackendError::Protocol(format!("Decode error: {}", e)))?;
            let Some((packet, used)) = decoded else {
                return Ok(());
            };
            self.read_buf.advance(used);

            match packet {
                Packet::Publish(publish) => {
                    if publish.qos == QoS::AtLeastOnce {
                        if let Some(packet_id) = publish.packet_id {
                            self.writer
                                .write(&Packet::PubAck(PubAck::new(packet_id)))
                                .await?;
                        }
                    }
                    self.shared.deliver(self.epoch, publish);
                }
                Packet::SubAck(ack) => self.resolve(ack.packet_id, &ack.reason_codes, "SUBACK"),
                Packet::UnsubAck(ack) => {
                    self.resolve(ack.packet_id, &ack.reason_codes, "UNSUBACK")
                }
                Packet::PingResp => {
                    self.awaiting_pingresp = false;
                }
                Packet::Disconnect(disconnect) => {
                    return Err(BackendError::ConnectionLost(format!(
                        "Broker sent DISCONNECT: {}",
                        disconnect.reason_code
                    )));
                }
                other => {
                    debug!(
                        "Remote backend: ignoring packet type {}",
                        other.packet_type()
                    );
                }
            }
        }
    }
}

/// Session loop: commands, inbound packets and keep alive
///
/// Returns `Ok(())` on a requested shutdown and the failure otherwise.
async fn run_session(
    shared: Arc<Shared>,
    epoch: u64,
    link: Link,
    mut command_rx: mpsc::Receiver<Command>,
    keep_alive: Duration,
) -> Result<(), BackendError> {
    let Link {
        mut read_half,
        write_half,
        read_buf,
        ..
    } = link;

    let mut state = SessionState {
        shared,
        epoch,
        writer: PacketWriter {
            write_half,
            encoder: Encoder::new(),
            buf: BytesMut::new(),
        },
        decoder: Decoder::new(),
        read_buf,
        pending: AHashMap::new(),
        next_packet_id: 1,
        awaiting_pingresp: false,
    };

    // Packets that arrived together with the CONNACK
    state.process_buffer().await?;

    let keep_alive_enabled = !keep_alive.is_zero();
    let period = keep_alive.max(Duration::from_secs(1));
    let mut keepalive_timer = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let command = command.unwrap_or(Command::Shutdown);
                if !state.handle_command(command).await? {
                    return Ok(());
                }
            }

            result = read_half.read_buf(&mut state.read_buf) => {
                let n = result.map_err(|e| BackendError::ConnectionLost(e.to_string()))?;
                if n == 0 {
                    return Err(BackendError::ConnectionLost(
                        "Connection closed by broker".to_string(),
                    ));
                }
                state.process_buffer().await?;
            }

            _ = keepalive_timer.tick(), if keep_alive_enabled => {
                if state.awaiting_pingresp {
                    return Err(BackendError::ConnectionLost("Keep alive timeout".to_string()));
                }
                state.awaiting_pingresp = true;
                state.writer.write(&Packet::PingReq).await?;
            }
        }
    }
}
