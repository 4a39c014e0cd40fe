//! Broker core: acceptor, event loop, packet dispatch, and background tasks.
//!
//! Everything runs on one thread: a single `mio::Poll` multiplexes the
//! listener and every client socket, and the cooperative background scans
//! (QoS retry, keep-alive, session expiry, `$SYS` stats, memory) run from
//! deadline checks between poll iterations. Shared state sits behind locks
//! only so the cloneable [`BrokerHandle`] can take management snapshots and
//! inject commands from other threads.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use parking_lot::RwLock;

use crate::auth::{self, AuthProvider};
use crate::config::Config;
use crate::conn::{ConnState, Connection};
use crate::error::{ProtocolError, Result};
use crate::hooks::{guarded, Hooks, Interceptor, NoHooks, SubscribeOutcome};
use crate::packet::{
    validate_topic_filter, validate_topic_name, Connack, ConnackCode, Packet, QoS, Suback,
    SUBACK_FAILURE,
};
use crate::router::{MessageContext, Router};
use crate::session::SessionStore;
use crate::stats::{BrokerMetrics, MemoryGuard, MemoryLevel, StatsSnapshot, SysPublisher};
use crate::topic::{RetainedMessage, TopicTree};

/// Token reserved for the listening socket.
const LISTENER: Token = Token(0);

/// First token handed to client connections.
const CLIENT_START: usize = 1;

/// Capacity of the management control channel.
const CONTROL_CAPACITY: usize = 256;

/// Upper bound on one poll wait, so background scans run on time.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How often offline persistent sessions are checked for expiry.
const EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// How often the memory guard samples free memory.
const MEMORY_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// State shared between the event loop and management handles.
pub struct SharedState {
    pub sessions: RwLock<SessionStore>,
    pub topics: RwLock<TopicTree>,
    pub metrics: BrokerMetrics,
    pub started_at: Instant,
}

/// Commands injected into the event loop by management handles.
enum ControlMsg {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    DisconnectClient {
        client_id: String,
        graceful: bool,
    },
    ClearRetained {
        topic: Option<String>,
    },
    Shutdown,
}

/// Management view of one client.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub username: Option<String>,
    pub connected: bool,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub subscriptions: Vec<(String, QoS)>,
}

/// Cloneable handle for read-only snapshots and broker commands.
///
/// Snapshots read the shared state directly; commands are queued and applied
/// by the event loop on its next tick.
#[derive(Clone)]
pub struct BrokerHandle {
    shared: Arc<SharedState>,
    control: Sender<ControlMsg>,
}

impl BrokerHandle {
    /// Connected and stored clients with their subscription sets.
    pub fn clients(&self) -> Vec<ClientSnapshot> {
        let sessions = self.shared.sessions.read();
        sessions
            .iter()
            .map(|s| ClientSnapshot {
                client_id: s.client_id.clone(),
                username: s.username.clone(),
                connected: s.is_online(),
                clean_session: s.clean_session,
                keep_alive: s.keep_alive,
                subscriptions: s
                    .subscriptions
                    .iter()
                    .map(|(f, q)| (f.clone(), *q))
                    .collect(),
            })
            .collect()
    }

    /// Subscription set of one client, or None if the client is unknown.
    pub fn subscriptions(&self, client_id: &str) -> Option<Vec<(String, QoS)>> {
        let sessions = self.shared.sessions.read();
        sessions
            .get(client_id)
            .map(|s| s.subscriptions.iter().map(|(f, q)| (f.clone(), *q)).collect())
    }

    /// Aggregate statistics snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        use std::sync::atomic::Ordering;

        let sessions = self.shared.sessions.read();
        let topics = self.shared.topics.read();
        let metrics = &self.shared.metrics;
        StatsSnapshot {
            uptime: self.shared.started_at.elapsed(),
            clients_connected: sessions.connected_count(),
            clients_total: sessions.len(),
            messages_received: metrics.messages_received.load(Ordering::Relaxed),
            messages_sent: metrics.messages_sent.load(Ordering::Relaxed),
            publishes_received: metrics.publishes_received.load(Ordering::Relaxed),
            publishes_sent: metrics.publishes_sent.load(Ordering::Relaxed),
            bytes_received: metrics.bytes_received.load(Ordering::Relaxed),
            bytes_sent: metrics.bytes_sent.load(Ordering::Relaxed),
            connections_total: metrics.connections_total.load(Ordering::Relaxed),
            subscriptions: topics.subscription_count(),
            retained_messages: topics.retained_count(),
        }
    }

    /// Dump of every retained message.
    pub fn retained_messages(&self) -> Vec<RetainedMessage> {
        self.shared.topics.read().retained_dump()
    }

    /// Publish a broker-origin message. Returns false if the topic is
    /// invalid or the broker is gone.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> bool {
        if topic.is_empty() || topic.contains('+') || topic.contains('#') {
            return false;
        }
        self.control
            .send(ControlMsg::Publish {
                topic: topic.to_string(),
                payload: payload.into(),
                qos,
                retain,
            })
            .is_ok()
    }

    /// Forcibly disconnect a client. A graceful disconnect suppresses the
    /// will, like a client-sent DISCONNECT.
    pub fn disconnect_client(&self, client_id: &str, graceful: bool) -> bool {
        self.control
            .send(ControlMsg::DisconnectClient {
                client_id: client_id.to_string(),
                graceful,
            })
            .is_ok()
    }

    /// Clear one retained topic, or all of them.
    pub fn clear_retained(&self, topic: Option<&str>) -> bool {
        self.control
            .send(ControlMsg::ClearRetained {
                topic: topic.map(str::to_string),
            })
            .is_ok()
    }

    /// Stop the broker: close every connection and exit the event loop.
    pub fn shutdown(&self) -> bool {
        self.control.send(ControlMsg::Shutdown).is_ok()
    }
}

/// The MQTT broker.
pub struct Broker {
    config: Config,
    poll: Poll,
    listener: TcpListener,
    connections: AHashMap<Token, Connection>,
    next_token: usize,
    shared: Arc<SharedState>,
    router: Router,
    auth: Box<dyn AuthProvider>,
    hooks: Box<dyn Hooks>,
    control_tx: Sender<ControlMsg>,
    control_rx: Receiver<ControlMsg>,
    sys: SysPublisher,
    memory_guard: MemoryGuard,
    memory_level: MemoryLevel,
    next_retry_scan: Instant,
    next_expiry_scan: Instant,
    next_stats: Instant,
    next_memory_scan: Instant,
    client_id_counter: u64,
    write_limit: usize,
    running: bool,
}

impl Broker {
    /// Bind the listener and build a broker with the configured auth
    /// provider and no hooks.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let addr = config.server.socket_addr()?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let (control_tx, control_rx) = bounded(CONTROL_CAPACITY);
        let now = Instant::now();
        let auth = auth::from_config(&config);
        let write_limit = config.limits.max_packet_size * (config.limits.max_inflight + 4);

        Ok(Self {
            poll,
            listener,
            connections: AHashMap::new(),
            next_token: CLIENT_START,
            shared: Arc::new(SharedState {
                sessions: RwLock::new(SessionStore::new()),
                topics: RwLock::new(TopicTree::new()),
                metrics: BrokerMetrics::new(),
                started_at: now,
            }),
            router: Router::new(Vec::new()),
            auth,
            hooks: Box::new(NoHooks),
            control_tx,
            control_rx,
            sys: SysPublisher::new(now),
            memory_guard: MemoryGuard::new(),
            memory_level: MemoryLevel::Ok,
            next_retry_scan: now + config.qos.retry_interval(),
            next_expiry_scan: now + EXPIRY_SCAN_INTERVAL,
            next_stats: now + config.mqtt.stats_interval(),
            next_memory_scan: now + MEMORY_SCAN_INTERVAL,
            client_id_counter: 0,
            write_limit,
            config,
            running: false,
        })
    }

    /// Replace the auth provider (overrides the configuration's choice).
    pub fn set_auth_provider(&mut self, provider: Box<dyn AuthProvider>) {
        self.auth = provider;
    }

    /// Install lifecycle hooks.
    pub fn set_hooks(&mut self, hooks: Box<dyn Hooks>) {
        self.hooks = hooks;
    }

    /// Append an interceptor to the pipeline (runs in registration order).
    pub fn add_interceptor(&mut self, interceptor: Box<dyn Interceptor>) {
        self.router.add(interceptor);
    }

    /// Management handle, cloneable and usable from other threads.
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            shared: Arc::clone(&self.shared),
            control: self.control_tx.clone(),
        }
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the event loop until shutdown.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "apiary listening on {} (max_clients={})",
            self.listener.local_addr()?,
            self.config.server.max_clients
        );
        self.running = true;

        let mut events = Events::with_capacity(1024);
        while self.running {
            match self.poll.poll(&mut events, Some(TICK_INTERVAL)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                let token = event.token();
                if token == LISTENER {
                    self.accept_connections()?;
                } else {
                    if event.is_readable() {
                        self.handle_readable(token);
                    }
                    if event.is_writable() {
                        self.handle_writable(token);
                    }
                }
            }

            self.drain_control();
            self.tick(Instant::now());
        }

        // Shutdown: tear everything down; wills still honor the hook
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.teardown_connection(token);
        }
        info!("apiary stopped");
        Ok(())
    }

    fn accept_connections(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => {
                    if self.connections.len() >= self.config.server.max_clients {
                        warn!("Max clients reached, refusing connection from {}", addr);
                        drop(socket);
                        continue;
                    }
                    if self.memory_level == MemoryLevel::Critical {
                        warn!("Memory critical, refusing connection from {}", addr);
                        drop(socket);
                        continue;
                    }
                    self.register_connection(socket, addr)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn register_connection(
        &mut self,
        mut socket: TcpStream,
        addr: std::net::SocketAddr,
    ) -> Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)?;

        debug!("Accepted connection from {} as {:?}", addr, token);
        let conn = Connection::new(
            token,
            socket,
            addr,
            self.config.server.recv_buffer_size,
            self.write_limit,
            Instant::now(),
        );
        self.connections.insert(token, conn);
        Ok(())
    }

    fn handle_readable(&mut self, token: Token) {
        {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            match conn.read() {
                Ok(n) => self.shared.metrics.add_bytes_received(n as u64),
                Err(e) => {
                    debug!("Read error on {:?}: {}", token, e);
                    conn.state = ConnState::Disconnecting;
                    return;
                }
            }
        }

        loop {
            let packet = {
                let Some(conn) = self.connections.get_mut(&token) else {
                    return;
                };
                if conn.state == ConnState::Disconnecting || conn.state == ConnState::Closed {
                    break;
                }
                match conn.decode_packet(self.config.limits.max_packet_size) {
                    Ok(Some(packet)) => {
                        conn.last_activity = Instant::now();
                        self.shared.metrics.add_messages_received(1);
                        packet
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Protocol error on {:?}: {}", token, e);
                        // A wrong protocol name/level still gets the 0x01 refusal
                        if conn.state == ConnState::AwaitConnect
                            && matches!(
                                e,
                                ProtocolError::InvalidProtocolName(_)
                                    | ProtocolError::UnsupportedProtocolLevel(_)
                            )
                        {
                            let _ = conn.queue_packet(&Packet::Connack(Connack {
                                session_present: false,
                                code: ConnackCode::UnacceptableProtocolVersion,
                            }));
                        }
                        conn.state = ConnState::Disconnecting;
                        break;
                    }
                }
            };

            self.handle_packet(token, packet);
        }

        if let Some(conn) = self.connections.get_mut(&token) {
            if conn.eof && conn.state != ConnState::Closed {
                conn.state = ConnState::Disconnecting;
            }
        }

        self.flush_connection(token);
    }

    fn handle_writable(&mut self, token: Token) {
        self.flush_connection(token);
    }

    /// Flush buffered writes and keep WRITABLE interest only while data is
    /// pending.
    fn flush_connection(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.state == ConnState::Closed {
            return;
        }

        match conn.flush() {
            Ok(_) => {}
            Err(e) => {
                debug!("Write error on {:?}: {}", token, e);
                conn.state = ConnState::Disconnecting;
                return;
            }
        }

        let wants = conn.has_pending_writes();
        if wants != conn.wants_writable {
            let interest = if wants {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if self
                .poll
                .registry()
                .reregister(&mut conn.socket, token, interest)
                .is_ok()
            {
                conn.wants_writable = wants;
            }
        }
    }

    /// Queue a packet on one connection, counting it in the metrics.
    /// QoS >= 1 frames refused by backpressure stay inflight and are
    /// retransmitted by the retry scanner.
    fn send_packet(&mut self, token: Token, packet: &Packet) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        match conn.queue_packet(packet) {
            Ok(n) => {
                self.shared.metrics.add_messages_sent(1);
                self.shared.metrics.add_bytes_sent(n as u64);
                if matches!(packet, Packet::Publish(_)) {
                    self.shared.metrics.add_publishes_sent(1);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("Backpressure: dropped frame to slow client {:?}", token);
            }
            Err(e) => {
                debug!("Queue error on {:?}: {}", token, e);
                conn.state = ConnState::Disconnecting;
            }
        }
    }

    fn send_frames(&mut self, frames: Vec<(Token, Packet)>) {
        let mut touched: Vec<Token> = Vec::new();
        for (token, packet) in frames {
            self.send_packet(token, &packet);
            if !touched.contains(&token) {
                touched.push(token);
            }
        }
        for token in touched {
            self.flush_connection(token);
        }
    }

    fn handle_packet(&mut self, token: Token, packet: Packet) {
        let state = match self.connections.get(&token) {
            Some(conn) => conn.state,
            None => return,
        };

        // MQTT-3.1.0-1: the first packet must be CONNECT
        if state == ConnState::AwaitConnect && !matches!(packet, Packet::Connect(_)) {
            debug!("First packet from {:?} was not CONNECT", token);
            self.mark_disconnecting(token);
            return;
        }

        match packet {
            Packet::Connect(connect) => {
                if state != ConnState::AwaitConnect {
                    // MQTT-3.1.0-2: a second CONNECT is a protocol violation
                    warn!("Duplicate CONNECT on {:?}", token);
                    self.mark_disconnecting(token);
                    return;
                }
                self.handle_connect(token, connect);
            }

            Packet::Publish(publish) => {
                if state != ConnState::Connected {
                    self.mark_disconnecting(token);
                    return;
                }
                self.handle_publish(token, publish);
            }

            Packet::Puback { packet_id } => {
                if let Some(client_id) = self.client_of(token) {
                    let acked = self
                        .shared
                        .sessions
                        .write()
                        .get_mut(&client_id)
                        .map(|s| s.outbound.handle_puback(packet_id))
                        .unwrap_or(false);
                    if acked {
                        self.pump_queue(&client_id);
                    }
                }
            }

            Packet::Pubrec { packet_id } => {
                if let Some(client_id) = self.client_of(token) {
                    let pubrel = self
                        .shared
                        .sessions
                        .write()
                        .get_mut(&client_id)
                        .and_then(|s| s.outbound.handle_pubrec(packet_id, Instant::now()));
                    if let Some(frame) = pubrel {
                        self.send_packet(token, &frame);
                        self.flush_connection(token);
                    }
                }
            }

            Packet::Pubrel { packet_id } => {
                if let Some(client_id) = self.client_of(token) {
                    if let Some(session) = self.shared.sessions.write().get_mut(&client_id) {
                        session.release_inbound_qos2(packet_id);
                    }
                }
                // PUBCOMP is sent even when the inbound state was lost
                self.send_packet(token, &Packet::Pubcomp { packet_id });
                self.flush_connection(token);
            }

            Packet::Pubcomp { packet_id } => {
                if let Some(client_id) = self.client_of(token) {
                    let done = self
                        .shared
                        .sessions
                        .write()
                        .get_mut(&client_id)
                        .map(|s| s.outbound.handle_pubcomp(packet_id))
                        .unwrap_or(false);
                    if done {
                        self.pump_queue(&client_id);
                    }
                }
            }

            Packet::Subscribe(subscribe) => {
                if state != ConnState::Connected {
                    self.mark_disconnecting(token);
                    return;
                }
                self.handle_subscribe(token, subscribe);
            }

            Packet::Unsubscribe(unsub) => {
                if state != ConnState::Connected {
                    self.mark_disconnecting(token);
                    return;
                }
                self.handle_unsubscribe(token, unsub);
            }

            Packet::Pingreq => {
                self.send_packet(token, &Packet::Pingresp);
                self.flush_connection(token);
            }

            Packet::Disconnect => {
                if let Some(client_id) = self.client_of(token) {
                    if let Some(session) = self.shared.sessions.write().get_mut(&client_id) {
                        session.will = None;
                    }
                }
                if let Some(conn) = self.connections.get_mut(&token) {
                    conn.graceful = true;
                    conn.state = ConnState::Disconnecting;
                }
            }

            // Server-to-client packets arriving from a client
            Packet::Connack(_) | Packet::Suback(_) | Packet::Unsuback { .. } | Packet::Pingresp => {
                warn!("Unexpected server-side packet from {:?}", token);
                self.mark_disconnecting(token);
            }
        }
    }

    fn handle_connect(&mut self, token: Token, connect: crate::packet::Connect) {
        let client_id = if connect.client_id.is_empty() {
            // MQTT-3.1.3-7: empty id needs clean session, and our permission
            if !connect.clean_session || !self.config.mqtt.allow_zero_length_clientid {
                self.reject_connect(token, ConnackCode::IdentifierRejected);
                return;
            }
            self.client_id_counter += 1;
            format!("apiary-{:x}-{}", std::process::id(), self.client_id_counter)
        } else {
            connect.client_id.clone()
        };

        if !self.config.mqtt.allow_anonymous && connect.username.is_none() {
            info!("Anonymous connection rejected: {}", client_id);
            self.reject_connect(token, ConnackCode::NotAuthorized);
            return;
        }

        if !self.auth.authenticate(
            &client_id,
            connect.username.as_deref(),
            connect.password.as_deref(),
        ) {
            info!(
                "Authentication failed for {} (user={:?})",
                client_id, connect.username
            );
            self.reject_connect(token, ConnackCode::BadUsernamePassword);
            return;
        }

        let will_topic = connect.will.as_ref().map(|w| w.topic.as_str());
        let accepted = guarded("on_connect", true, || {
            self.hooks
                .on_connect(&client_id, connect.username.as_deref(), will_topic)
        });
        if !accepted {
            info!("on_connect rejected client {}", client_id);
            self.reject_connect(token, ConnackCode::NotAuthorized);
            return;
        }

        // Evict any previous connection with this identifier (no will)
        let takeover = self
            .shared
            .sessions
            .write()
            .create_or_takeover(&client_id, connect.clean_session);
        if let Some(previous) = takeover.previous_connection {
            if previous != token {
                info!("Taking over client id {} from {:?}", client_id, previous);
                if let Some(old) = self.connections.get_mut(&previous) {
                    // The session moved on; teardown must only close the socket
                    old.client_id = None;
                    old.state = ConnState::Disconnecting;
                }
            }
        }
        if connect.clean_session {
            // Stale tree entries from an earlier persistent incarnation
            self.shared.topics.write().remove_client(&client_id);
        }

        let now = Instant::now();
        {
            let mut sessions = self.shared.sessions.write();
            let session = sessions
                .get_mut(&client_id)
                .expect("session exists after create_or_takeover");
            session.connection = Some(token);
            session.keep_alive = connect.keep_alive;
            session.will = connect.will.clone();
            session.username = connect.username.clone();
        }

        {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            conn.client_id = Some(client_id.clone());
            conn.keep_alive = connect.keep_alive;
            conn.state = ConnState::Connected;
        }

        self.shared.metrics.record_connection();
        info!(
            "Client connected: {} (clean_session={}, keep_alive={}s, session_present={})",
            client_id, connect.clean_session, connect.keep_alive, takeover.session_present
        );

        self.send_packet(
            token,
            &Packet::Connack(Connack {
                session_present: takeover.session_present,
                code: ConnackCode::Accepted,
            }),
        );

        if takeover.session_present {
            // Unfinished QoS handshakes resume first (DUP set), then the
            // offline queue in arrival order
            let replay = self
                .shared
                .sessions
                .write()
                .get_mut(&client_id)
                .map(|s| s.outbound.replay_all(now))
                .unwrap_or_default();
            for frame in replay {
                self.send_packet(token, &frame);
            }

            let queued = {
                let mut sessions = self.shared.sessions.write();
                self.router
                    .deliver_queued(&mut sessions, &self.config, &client_id, now)
            };
            self.send_frames(queued);
        }

        self.flush_connection(token);
    }

    fn reject_connect(&mut self, token: Token, code: ConnackCode) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let _ = conn.queue_packet(&Packet::Connack(Connack {
            session_present: false,
            code,
        }));
        conn.state = ConnState::Disconnecting;
    }

    fn handle_publish(&mut self, token: Token, mut publish: crate::packet::Publish) {
        let Some(client_id) = self.client_of(token) else {
            return;
        };
        self.shared.metrics.add_publishes_received(1);

        // Resource errors drop the message but keep the connection, and the
        // sender's state machine still gets its ACKs
        let oversized = publish.payload.len() > self.config.limits.max_payload_size;
        let bad_topic = validate_topic_name(
            &publish.topic,
            self.config.limits.max_topic_length,
            self.config.limits.max_topic_levels,
        )
        .is_err();
        if oversized || bad_topic {
            if oversized {
                warn!(
                    "Dropping oversized payload from {} ({} > {} bytes)",
                    client_id,
                    publish.payload.len(),
                    self.config.limits.max_payload_size
                );
            } else {
                warn!("Dropping publish with invalid topic from {}", client_id);
            }
            self.ack_publish(token, &publish);
            return;
        }

        if publish.qos == QoS::ExactlyOnce && !self.config.mqtt.qos2_enabled {
            publish.qos = QoS::AtLeastOnce;
        }

        if !self.auth.authorize_publish(&client_id, &publish.topic) {
            debug!("Publish denied for {} on '{}'", client_id, publish.topic);
            self.ack_publish(token, &publish);
            return;
        }

        let route = match publish.qos {
            QoS::AtMostOnce => true,
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    self.mark_disconnecting(token);
                    return;
                };
                self.send_packet(token, &Packet::Puback { packet_id });
                true
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    self.mark_disconnecting(token);
                    return;
                };
                // Exactly-once: only the first receipt is routed; duplicates
                // just get another PUBREC
                let first = self
                    .shared
                    .sessions
                    .write()
                    .get_mut(&client_id)
                    .map(|s| s.register_inbound_qos2(packet_id))
                    .unwrap_or(false);
                self.send_packet(token, &Packet::Pubrec { packet_id });
                first
            }
        };
        self.flush_connection(token);

        if route {
            self.route_message(MessageContext::new(
                publish.topic,
                publish.payload,
                publish.qos,
                publish.retain,
                Some(client_id),
            ));
        }
    }

    /// Send whatever ACK the sender's QoS expects without routing.
    fn ack_publish(&mut self, token: Token, publish: &crate::packet::Publish) {
        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.send_packet(token, &Packet::Puback { packet_id });
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                self.send_packet(token, &Packet::Pubrec { packet_id });
            }
            _ => {}
        }
        self.flush_connection(token);
    }

    /// Route a message and fire the publish hook for non-dropped client
    /// messages.
    fn route_message(&mut self, ctx: MessageContext) {
        let from_client = ctx.sender_id.is_some();
        let outcome = {
            let mut sessions = self.shared.sessions.write();
            let mut topics = self.shared.topics.write();
            self.router
                .route(&mut sessions, &mut topics, &self.config, ctx, Instant::now())
        };

        let Some(outcome) = outcome else {
            return;
        };

        if from_client {
            let message = &outcome.message;
            guarded("on_publish", (), || {
                self.hooks.on_publish(
                    message.sender_id.as_deref(),
                    &message.topic,
                    &message.payload,
                    message.qos,
                    message.retain,
                )
            });
        }

        self.send_frames(outcome.frames);
    }

    fn handle_subscribe(&mut self, token: Token, subscribe: crate::packet::Subscribe) {
        let Some(client_id) = self.client_of(token) else {
            return;
        };

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted_filters: Vec<(String, QoS)> = Vec::new();

        for (filter, requested_qos) in &subscribe.filters {
            if validate_topic_filter(
                filter,
                self.config.limits.max_topic_length,
                self.config.limits.max_topic_levels,
            )
            .is_err()
            {
                debug!("Invalid filter '{}' from {}", filter, client_id);
                return_codes.push(SUBACK_FAILURE);
                continue;
            }

            let at_limit = {
                let sessions = self.shared.sessions.read();
                sessions
                    .get(&client_id)
                    .map(|s| {
                        !s.subscriptions.contains_key(filter)
                            && s.subscriptions.len()
                                >= self.config.limits.max_subscriptions_per_client
                    })
                    .unwrap_or(true)
            };
            if at_limit {
                warn!("Subscription limit reached for {}", client_id);
                return_codes.push(SUBACK_FAILURE);
                continue;
            }

            let mut granted = *requested_qos;
            if !self.config.mqtt.qos2_enabled && granted == QoS::ExactlyOnce {
                granted = QoS::AtLeastOnce;
            }

            match self.auth.authorize_subscribe(&client_id, filter) {
                Some(max_qos) => granted = granted.min(max_qos),
                None => {
                    debug!("Subscribe denied for {} on '{}'", client_id, filter);
                    return_codes.push(SUBACK_FAILURE);
                    continue;
                }
            }

            match guarded("on_subscribe", SubscribeOutcome::Grant(granted), || {
                self.hooks.on_subscribe(&client_id, filter, granted)
            }) {
                SubscribeOutcome::Grant(qos) => granted = qos,
                SubscribeOutcome::Reject => {
                    return_codes.push(SUBACK_FAILURE);
                    continue;
                }
            }

            self.shared
                .topics
                .write()
                .subscribe(filter, &client_id, granted);
            if let Some(session) = self.shared.sessions.write().get_mut(&client_id) {
                session.subscriptions.insert(filter.clone(), granted);
            }

            return_codes.push(granted as u8);
            granted_filters.push((filter.clone(), granted));
        }

        self.send_packet(
            token,
            &Packet::Suback(Suback {
                packet_id: subscribe.packet_id,
                return_codes,
            }),
        );
        self.flush_connection(token);

        // Matching retained messages follow the SUBACK
        let now = Instant::now();
        for (filter, granted) in granted_filters {
            let frames = {
                let mut sessions = self.shared.sessions.write();
                let topics = self.shared.topics.read();
                self.router.deliver_retained(
                    &mut sessions,
                    &topics,
                    &self.config,
                    &client_id,
                    &filter,
                    granted,
                    now,
                )
            };
            self.send_frames(frames);
        }
    }

    fn handle_unsubscribe(&mut self, token: Token, unsub: crate::packet::Unsubscribe) {
        let Some(client_id) = self.client_of(token) else {
            return;
        };

        for filter in &unsub.filters {
            self.shared.topics.write().unsubscribe(filter, &client_id);
            if let Some(session) = self.shared.sessions.write().get_mut(&client_id) {
                session.subscriptions.remove(filter);
            }
            guarded("on_unsubscribe", (), || {
                self.hooks.on_unsubscribe(&client_id, filter)
            });
        }

        self.send_packet(
            token,
            &Packet::Unsuback {
                packet_id: unsub.packet_id,
            },
        );
        self.flush_connection(token);
    }

    /// After an ACK freed an inflight slot, move queued messages forward.
    fn pump_queue(&mut self, client_id: &str) {
        let frames = {
            let mut sessions = self.shared.sessions.write();
            self.router
                .deliver_queued(&mut sessions, &self.config, client_id, Instant::now())
        };
        self.send_frames(frames);
    }

    fn client_of(&self, token: Token) -> Option<String> {
        self.connections.get(&token)?.client_id.clone()
    }

    fn mark_disconnecting(&mut self, token: Token) {
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.state = ConnState::Disconnecting;
        }
    }

    fn drain_control(&mut self) {
        while let Ok(msg) = self.control_rx.try_recv() {
            match msg {
                ControlMsg::Publish {
                    topic,
                    payload,
                    qos,
                    retain,
                } => {
                    self.route_message(MessageContext::new(topic, payload, qos, retain, None));
                }
                ControlMsg::DisconnectClient { client_id, graceful } => {
                    let token = self
                        .shared
                        .sessions
                        .read()
                        .get(&client_id)
                        .and_then(|s| s.connection);
                    if let Some(token) = token {
                        info!("Management disconnect of {}", client_id);
                        if let Some(conn) = self.connections.get_mut(&token) {
                            conn.graceful = graceful;
                            conn.state = ConnState::Disconnecting;
                        }
                    }
                }
                ControlMsg::ClearRetained { topic } => {
                    let mut topics = self.shared.topics.write();
                    match topic {
                        Some(topic) => topics.clear_retained(&topic),
                        None => topics.clear_all_retained(),
                    }
                }
                ControlMsg::Shutdown => {
                    info!("Shutdown requested");
                    self.running = false;
                }
            }
        }
    }

    /// Cooperative background work, run between poll iterations.
    fn tick(&mut self, now: Instant) {
        // CONNECT deadline and keep-alive enforcement
        for conn in self.connections.values_mut() {
            match conn.state {
                ConnState::AwaitConnect => {
                    if now.duration_since(conn.opened_at) > self.config.session.connect_timeout() {
                        debug!("CONNECT timeout on {:?}", conn.token);
                        conn.state = ConnState::Disconnecting;
                    }
                }
                ConnState::Connected => {
                    let deadline = self.config.session.keep_alive_deadline(conn.keep_alive);
                    if now.duration_since(conn.last_activity) > deadline {
                        info!(
                            "Keep-alive timeout for {:?} ({:?})",
                            conn.token, conn.client_id
                        );
                        conn.state = ConnState::Disconnecting;
                    }
                }
                _ => {}
            }
        }

        self.cleanup_connections();

        if now >= self.next_retry_scan {
            self.next_retry_scan = now + self.config.qos.retry_interval();
            self.retry_scan(now);
        }

        if now >= self.next_expiry_scan {
            self.next_expiry_scan = now + EXPIRY_SCAN_INTERVAL;
            self.expiry_scan(now);
        }

        if self.config.mqtt.sys_topics_enabled && now >= self.next_stats {
            self.next_stats = now + self.config.mqtt.stats_interval();
            self.publish_sys_topics(now);
        }

        if now >= self.next_memory_scan {
            self.next_memory_scan = now + MEMORY_SCAN_INTERVAL;
            self.memory_scan();
        }
    }

    fn cleanup_connections(&mut self) {
        let disconnected: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state == ConnState::Disconnecting)
            .map(|(t, _)| *t)
            .collect();
        for token in disconnected {
            self.teardown_connection(token);
        }
    }

    fn teardown_connection(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        let _ = conn.flush();
        let _ = self.poll.registry().deregister(&mut conn.socket);
        conn.state = ConnState::Closed;
        debug!("Closed {:?} from {}", token, conn.remote_addr);

        let Some(client_id) = conn.client_id.take() else {
            return;
        };

        let now = Instant::now();
        let (still_owner, clean_session) = {
            let sessions = self.shared.sessions.read();
            match sessions.get(&client_id) {
                Some(s) => (s.connection == Some(token), s.clean_session),
                None => (false, true),
            }
        };
        if !still_owner {
            // Taken over: the identifier now belongs to another connection
            return;
        }

        let will = self
            .shared
            .sessions
            .write()
            .detach(&client_id, conn.graceful, now);
        if clean_session {
            self.shared.topics.write().remove_client(&client_id);
        }

        info!(
            "Client disconnected: {} (graceful={})",
            client_id, conn.graceful
        );

        if let Some(will) = will {
            let publish_it = guarded("on_will_publish", true, || {
                self.hooks
                    .on_will_publish(&client_id, &will.topic, &will.payload)
            });
            if publish_it {
                self.route_message(MessageContext::new(
                    will.topic,
                    will.payload,
                    will.qos,
                    will.retain,
                    Some(client_id.clone()),
                ));
            }
        }

        self.auth.cleanup_client(&client_id);
        guarded("on_disconnect", (), || {
            self.hooks.on_disconnect(&client_id, conn.graceful)
        });
    }

    /// Walk outbound inflight tables and retransmit or drop per the retry
    /// policy. Only online sessions are scanned; offline entries wait for
    /// reconnect replay.
    fn retry_scan(&mut self, now: Instant) {
        let mut frames: Vec<(Token, Packet)> = Vec::new();
        {
            let mut sessions = self.shared.sessions.write();
            for session in sessions.iter_mut() {
                let Some(token) = session.connection else {
                    continue;
                };
                let (resend, dropped) = session.outbound.retransmit_due(
                    now,
                    self.config.qos.retry_interval(),
                    self.config.qos.max_retries,
                );
                if !dropped.is_empty() {
                    warn!(
                        "Dropped {} unacknowledged message(s) to {} after {} retries",
                        dropped.len(),
                        session.client_id,
                        self.config.qos.max_retries
                    );
                }
                frames.extend(resend.into_iter().map(|f| (token, f)));
            }
        }
        self.send_frames(frames);
    }

    fn expiry_scan(&mut self, now: Instant) {
        let expired = self
            .shared
            .sessions
            .write()
            .expire_offline(now, self.config.session.session_expiry());
        if !expired.is_empty() {
            info!("Expired {} offline session(s)", expired.len());
            let mut topics = self.shared.topics.write();
            for client_id in &expired {
                topics.remove_client(client_id);
                self.auth.cleanup_client(client_id);
            }
        }
        self.shared.topics.write().prune();
    }

    fn publish_sys_topics(&mut self, now: Instant) {
        let (connected, total) = {
            let sessions = self.shared.sessions.read();
            (sessions.connected_count(), sessions.len())
        };
        let (subscriptions, retained) = {
            let topics = self.shared.topics.read();
            (topics.subscription_count(), topics.retained_count())
        };

        let topics = self.sys.topics(
            &self.shared.metrics,
            connected,
            total,
            subscriptions,
            retained,
            now,
        );
        for (topic, value) in topics {
            self.route_message(MessageContext::new(
                topic,
                Bytes::from(value),
                QoS::AtMostOnce,
                true,
                None,
            ));
        }
    }

    fn memory_scan(&mut self) {
        let level = self.memory_guard.check();
        if level != self.memory_level {
            match level {
                MemoryLevel::Ok => info!("Memory pressure cleared"),
                MemoryLevel::Low => warn!("Memory low, trimming session queues"),
                MemoryLevel::Critical => warn!("Memory critical, refusing new connections"),
            }
        }
        if level == MemoryLevel::Low || level == MemoryLevel::Critical {
            self.memory_guard
                .trim_queues(&mut self.shared.sessions.write());
        }
        self.memory_level = level;
    }
}
