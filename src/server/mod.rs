/// === IMPORTS ===

// Tables of live connections and known peers.
use std::collections::{HashMap, HashSet};

// Pending connections are keyed by their socket endpoints.
use std::net::SocketAddr;

// Node state is shared between the accept loop, every handler's reader task
// and dial tasks. Lock sections are short and never span an `.await`.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

// Serialized lines are shared by every connection a message is flooded to.
use bytes::Bytes;

// Tokio's non-blocking TCP listener and stream for incoming/outgoing connections.
use tokio::net::{TcpListener, TcpStream};

// - broadcast: shutdown signal for the accept loop
// - mpsc: events toward the front end
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Duration};

use uuid::Uuid;


/// === MODULES ===

pub mod connection;   // one TCP socket: reader + writer tasks
pub mod discovery;    // multicast announce/listen
mod events;           // what the node reports upward

pub use events::NodeEvent;

use crate::config::NodeConfig;
use crate::dedup::DedupCache;
use crate::error::{NodeError, Result};
use crate::logger::Logger;
use crate::message::{decode_line, now_millis, Message, MessageBody, PeerInfo};
use connection::{ConnectionHandler, ConnectionObserver};
use discovery::{DiscoveredPeer, DiscoveryListener, DiscoveryService};


/// === PEER NODE ===

/// A running chat node: listens for peers, dials peers, floods chat messages.
///
/// Cloning is cheap and every clone drives the same node. A node must be
/// stopped with [`PeerNode::shutdown`]; dropping the handles does not close it.
#[derive(Clone)]
pub struct PeerNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    // Handed to handlers and background tasks, so none of them keeps the node alive.
    self_ref: Weak<NodeInner>,

    my_id: String,
    my_name: String,
    listen_port: u16,
    config: NodeConfig,
    logger: Logger,

    running: AtomicBool,

    // Handlers that completed a HELLO, by peer id. Only these receive floods.
    connections: RwLock<HashMap<String, Arc<ConnectionHandler>>>,

    // Handlers waiting for their HELLO, plus displaced duplicates.
    pending: RwLock<HashMap<(SocketAddr, SocketAddr), Arc<ConnectionHandler>>>,

    // Everyone we have heard of, connected or not. Never purged.
    peers: RwLock<HashMap<String, PeerInfo>>,

    seen: DedupCache,

    events_tx: mpsc::UnboundedSender<NodeEvent>,
    shutdown_tx: broadcast::Sender<()>,

    accept_task: Mutex<Option<JoinHandle<()>>>,
    dials: Mutex<JoinSet<()>>,
    discovery: Mutex<Option<DiscoveryService>>,
}

impl PeerNode {
    /// Bind the listening socket, start accepting and (if enabled) discovery.
    ///
    /// Returns the node and the receiving end of its event stream. Fails with
    /// [`NodeError::NoListenPort`] when every port in the probe range is taken.
    pub async fn start(
        config: NodeConfig,
        logger: Logger,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NodeEvent>)> {
        config.validate()?;

        // ────────────────────────────────────────────────────────────────
        // 1) Find a port: the configured one or the next free one after it
        // ────────────────────────────────────────────────────────────────
        let (listener, listen_port) = bind_listener(&config, &logger).await?;

        // ────────────────────────────────────────────────────────────────
        // 2) Shared state, reachable weakly from handlers and tasks
        // ────────────────────────────────────────────────────────────────
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let inner = Arc::new_cyclic(|self_ref| NodeInner {
            self_ref: self_ref.clone(),
            my_id: Uuid::new_v4().to_string(),
            my_name: config.name.clone(),
            listen_port,
            seen: DedupCache::new(config.dedup_capacity),
            config,
            logger: logger.clone(),
            running: AtomicBool::new(true),
            connections: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            events_tx,
            shutdown_tx,
            accept_task: Mutex::new(None),
            dials: Mutex::new(JoinSet::new()),
            discovery: Mutex::new(None),
        });

        // ────────────────────────────────────────────────────────────────
        // 3) Accept loop. Subscribe first so an early shutdown still reaches it
        // ────────────────────────────────────────────────────────────────
        let shutdown_rx = inner.shutdown_tx.subscribe();
        let accept = tokio::spawn(accept_loop(
            listener,
            inner.self_ref.clone(),
            Duration::from_millis(inner.config.accept_error_backoff_ms),
            logger.clone(),
            shutdown_rx,
        ));
        *lock(&inner.accept_task) = Some(accept);

        // ────────────────────────────────────────────────────────────────
        // 4) Discovery. Not being able to join the group is not fatal
        // ────────────────────────────────────────────────────────────────
        if inner.config.discovery.enabled {
            inner.start_discovery();
        }

        logger.info(&format!(
            "🚀 Node '{}' listening on {}:{} (ID: {})",
            inner.my_name, inner.config.host, listen_port, inner.my_id
        ));
        inner.emit_status(format!("Listening on {} (ID: {})", listen_port, inner.my_id));

        Ok((PeerNode { inner }, events_rx))
    }

    /// Dial `host:port` in the background. The outcome arrives as a status event.
    pub fn connect(&self, host: &str, port: u16) {
        self.inner.connect(host.to_string(), port);
    }

    /// Send a chat line to every connected peer. The message is delivered to the
    /// local front end right away and never again, even when it floods back.
    pub fn broadcast_chat(&self, text: &str) -> Result<Message> {
        let inner = &self.inner;
        let message = Message::chat(&inner.my_id, &inner.my_name, text);
        inner.seen.add(message.id());
        inner.emit(NodeEvent::MessageReceived(message.clone()));

        let line = message.to_line()?;
        let sent = inner.flood(line, None);
        inner.logger.debug(&format!("📤 Chat {} sent to {} peer(s)", message.id(), sent));
        Ok(message)
    }

    /// Stop discovery, the accept loop, every connection and in-flight dial.
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    pub fn id(&self) -> &str {
        &self.inner.my_id
    }

    pub fn name(&self) -> &str {
        &self.inner.my_name
    }

    /// The port actually bound, which may differ from the configured one.
    pub fn listen_port(&self) -> u16 {
        self.inner.listen_port
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Peers with a live, handshaken connection.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        read(&self.inner.connections)
            .values()
            .filter_map(|handler| handler.peer_info())
            .collect()
    }

    /// The whole directory, connected or not.
    pub fn known_peers(&self) -> Vec<PeerInfo> {
        self.inner.known_peers()
    }

    /// Connections still waiting for a HELLO (or displaced by a newer one).
    pub fn pending_count(&self) -> usize {
        read(&self.inner.pending).len()
    }
}


/// === LISTENING ===

/// Bind `host:port`, then `port+1` and so on, `port_probe_count` attempts in all.
/// Port 0 is a single attempt on an OS-assigned port.
async fn bind_listener(config: &NodeConfig, logger: &Logger) -> Result<(TcpListener, u16)> {
    if config.port == 0 {
        let listener = TcpListener::bind((config.host.as_str(), 0)).await?;
        let port = listener.local_addr()?.port();
        return Ok((listener, port));
    }

    let first = config.port;
    let last = first.saturating_add(config.port_probe_count.saturating_sub(1));
    for port in first..=last {
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => {
                if port != first {
                    logger.info(&format!("⚠️ Port {} busy, using {} instead", first, port));
                }
                return Ok((listener, port));
            }
            Err(e) => logger.debug(&format!("Port {} unavailable: {}", port, e)),
        }
    }

    Err(NodeError::NoListenPort { first, last })
}

/// Accept peers until the shutdown signal. Each socket gets its own handler.
async fn accept_loop(
    listener: TcpListener,
    node: Weak<NodeInner>,
    backoff: Duration,
    logger: Logger,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            // 1) New connection arrives
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        let Some(inner) = node.upgrade() else { break };
                        logger.info(&format!("🔌 Incoming connection from {}", addr));
                        inner.register_stream(stream);
                    }
                    Err(e) => {
                        logger.warn(&format!("⚠️ Failed to accept connection: {}", e));
                        time::sleep(backoff).await;
                    }
                }
            }

            // 2) Node is shutting down
            _ = shutdown_rx.recv() => {
                logger.info("🧹 Accept loop received shutdown signal.");
                break;
            }
        }
    }
    // Dropping the listener here closes the listening socket
}

/// Dial with a timeout; a socket that connects after shutdown is simply dropped.
async fn dial(node: Weak<NodeInner>, host: String, port: u16, connect_timeout: Duration) {
    let result = time::timeout(connect_timeout, TcpStream::connect((host.as_str(), port))).await;

    let Some(inner) = node.upgrade() else { return };
    match result {
        Ok(Ok(stream)) => {
            if !inner.is_running() {
                return;
            }
            inner.logger.info(&format!("🔌 Connected to {}:{}", host, port));
            inner.register_stream(stream);
            inner.emit_status(format!("Connected to {}:{}", host, port));
        }
        Ok(Err(e)) => inner.dial_failed(&host, port, &e.to_string()),
        Err(_) => inner.dial_failed(&host, port, &format!("timed out after {:?}", connect_timeout)),
    }
}


/// === NODE INTERNALS ===

impl NodeInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn emit(&self, event: NodeEvent) {
        // Nobody listening is fine
        let _ = self.events_tx.send(event);
    }

    fn emit_status(&self, status: impl Into<String>) {
        self.emit(NodeEvent::Status(status.into()));
    }

    fn start_discovery(&self) {
        let events_tx = self.events_tx.clone();
        let listener: DiscoveryListener = Arc::new(move |peer: DiscoveredPeer| {
            let _ = events_tx.send(NodeEvent::PeerDiscovered(peer));
        });

        let service = DiscoveryService::new(
            &self.my_id,
            &self.my_name,
            self.listen_port,
            self.config.discovery.clone(),
            listener,
            self.logger.clone(),
        );

        match service.start() {
            Ok(()) => *lock(&self.discovery) = Some(service),
            Err(e) => {
                self.logger.warn(&format!("⚠️ Discovery unavailable: {}", e));
                self.emit_status(format!("Discovery unavailable: {}", e));
            }
        }
    }

    /// Wrap a connected socket in a handler, park it as pending and start it.
    fn register_stream(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            self.logger.debug(&format!("Could not set TCP_NODELAY: {}", e));
        }

        let observer: Weak<dyn ConnectionObserver> = self.self_ref.clone();
        let handler = match ConnectionHandler::new(
            stream,
            observer,
            self.config.outbound_queue_capacity,
            self.logger.clone(),
        ) {
            Ok(handler) => handler,
            Err(e) => {
                self.logger.warn(&format!("❌ Dropping connection: {}", e));
                return;
            }
        };

        write(&self.pending).insert(handler.endpoints(), handler.clone());

        // Shutdown may have snapshotted the tables before our insert
        if !self.is_running() {
            handler.stop();
            return;
        }
        handler.start();
    }

    fn connect(&self, host: String, port: u16) {
        if !self.is_running() {
            self.dial_failed(&host, port, "node is not running");
            return;
        }

        let mut dials = lock(&self.dials);
        // Reap finished dials so the set does not grow for the node's lifetime
        while dials.try_join_next().is_some() {}
        dials.spawn(dial(self.self_ref.clone(), host, port, self.config.connect_timeout));
    }

    fn dial_failed(&self, host: &str, port: u16, reason: &str) {
        self.logger.warn(&format!("❌ Failed to connect to {}:{}: {}", host, port, reason));
        self.emit_status(format!("Failed to connect to {}:{}: {}", host, port, reason));
    }

    fn known_peers(&self) -> Vec<PeerInfo> {
        read(&self.peers).values().cloned().collect()
    }

    fn touch_directory(&self, id: &str, now: i64) {
        if let Some(peer) = write(&self.peers).get_mut(id) {
            peer.touch(now);
        }
    }

    /// Queue one serialized line on every handshaken connection except `except`.
    /// Returns how many connections it was queued on.
    fn flood(&self, line: Bytes, except: Option<&Arc<ConnectionHandler>>) -> usize {
        let targets: Vec<Arc<ConnectionHandler>> = read(&self.connections)
            .values()
            .filter(|handler| handler.is_running())
            .filter(|handler| except.is_none_or(|skip| !Arc::ptr_eq(handler, skip)))
            .cloned()
            .collect();

        for handler in &targets {
            handler.send_line(line.clone());
        }
        targets.len()
    }

    fn remove_pending(&self, handler: &Arc<ConnectionHandler>) {
        let key = handler.endpoints();
        let mut pending = write(&self.pending);
        if pending.get(&key).is_some_and(|h| Arc::ptr_eq(h, handler)) {
            pending.remove(&key);
        }
    }

    /// Remove `id -> handler` only if the table still maps `id` to this handler.
    fn remove_connection(&self, id: &str, handler: &Arc<ConnectionHandler>) -> bool {
        let mut connections = write(&self.connections);
        let is_current = connections.get(id).is_some_and(|h| Arc::ptr_eq(h, handler));
        if is_current {
            connections.remove(id);
        }
        is_current
    }

    /// Insert gossiped peers. Known entries only move forward in time, and only
    /// while we have no connection of our own to tell us better.
    fn merge_peers(&self, peers: &[PeerInfo]) {
        for peer in peers {
            if peer.id.is_empty() || peer.id == self.my_id {
                continue;
            }
            let connected = read(&self.connections).contains_key(&peer.id);

            let mut directory = write(&self.peers);
            match directory.get_mut(&peer.id) {
                None => {
                    directory.insert(peer.id.clone(), peer.clone());
                }
                Some(existing) if !connected && peer.last_seen > existing.last_seen => {
                    *existing = peer.clone();
                }
                Some(_) => {}
            }
        }
    }

    fn handle_hello(
        &self,
        handler: &Arc<ConnectionHandler>,
        message: &Message,
        advertised_port: u16,
        peers: &[PeerInfo],
    ) {
        let id = message.from_id();
        if id.is_empty() {
            self.logger.debug(&format!("HELLO without id from {}, ignored", handler.remote_addr()));
            return;
        }
        if id == self.my_id {
            self.logger.info(&format!("🔁 Connected to ourselves via {}, closing", handler.remote_addr()));
            handler.stop();
            return;
        }

        // ────────────────────────────────────────────────────────────────
        // 1) Bind the identity to the handler, address as seen on the socket
        // ────────────────────────────────────────────────────────────────
        let name = match message.from_name() {
            "" => "peer",
            name => name,
        };
        let info = PeerInfo {
            id: id.to_string(),
            name: name.to_string(),
            host: handler.remote_host(),
            port: handler.remote_port(),
            last_seen: now_millis(),
        };
        let previous = handler.peer_info();
        handler.set_peer_info(info.clone());

        // A repeated HELLO under a new id releases the old slot
        if let Some(previous) = previous.filter(|p| p.id != info.id) {
            self.remove_connection(&previous.id, handler);
        }

        // ────────────────────────────────────────────────────────────────
        // 2) pending -> connections. A different handler holding the id stays
        //    open but goes back to pending, out of the flood set. Each handler
        //    enters its new table before leaving the old one
        // ────────────────────────────────────────────────────────────────
        let displaced = write(&self.connections).insert(info.id.clone(), handler.clone());
        self.remove_pending(handler);
        let (newly_registered, parked) = match displaced {
            None => (true, None),
            Some(old) if Arc::ptr_eq(&old, handler) => (false, None),
            Some(old) => {
                self.logger.info(&format!(
                    "🔀 {} now reached via {}, parking {}",
                    info.id,
                    handler.remote_addr(),
                    old.remote_addr()
                ));
                write(&self.pending).insert(old.endpoints(), old.clone());
                if old.is_stopped() {
                    self.remove_pending(&old);
                }
                (false, Some(old))
            }
        };

        // Shutdown may have snapshotted the tables while we were moving handlers
        if !self.is_running() {
            handler.stop();
            if let Some(old) = parked {
                old.stop();
            }
            return;
        }

        // Stopped while we were registering it: `on_stopped` could not see it
        if handler.is_stopped() {
            self.remove_connection(&info.id, handler);
            return;
        }

        write(&self.peers).insert(info.id.clone(), info.clone());

        if newly_registered {
            self.logger.info(&format!(
                "🤝 {} ({}) connected from {}, listening on {}",
                info.name,
                info.id,
                handler.remote_addr(),
                advertised_port
            ));
            self.emit(NodeEvent::PeerConnected(info));
        }

        // ────────────────────────────────────────────────────────────────
        // 3) Gossip: learn their peers, answer with everything we know
        // ────────────────────────────────────────────────────────────────
        if !peers.is_empty() {
            self.merge_peers(peers);
            let share = Message::peer_share(&self.my_id, &self.my_name, self.known_peers());
            handler.send(&share);
        }
    }

    fn handle_chat(&self, handler: &Arc<ConnectionHandler>, message: &Message, raw: Bytes) {
        if !self.seen.add(message.id()) {
            return;
        }

        self.touch_directory(message.from_id(), now_millis());
        self.logger.info(&format!(
            "📨 {}: {}",
            message.from_name(),
            message.text().unwrap_or_default()
        ));
        self.emit(NodeEvent::MessageReceived(message.clone()));

        // Forward the line exactly as it arrived
        let forwarded = self.flood(raw, Some(handler));
        self.logger.debug(&format!("Forwarded {} to {} peer(s)", message.id(), forwarded));
    }

    fn handle_peer_share(&self, peers: &[PeerInfo]) {
        self.merge_peers(peers);

        let max_dials = self.config.max_peershare_dials;
        if max_dials == 0 || !self.is_running() {
            return;
        }

        let connected: HashSet<String> = read(&self.connections).keys().cloned().collect();
        let targets: Vec<&PeerInfo> = peers
            .iter()
            .filter(|p| !p.id.is_empty() && p.id != self.my_id && !connected.contains(&p.id))
            .filter(|p| !p.host.is_empty() && p.port != 0)
            .take(max_dials)
            .collect();

        for peer in targets {
            self.logger.info(&format!("🔗 Dialing {} ({}) learned from gossip", peer.name, peer.address()));
            self.connect(peer.host.clone(), peer.port);
        }
    }

    async fn shutdown(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.logger.warn("🛑 Shutting down node...");

        // 1) Stop announcing ourselves
        let discovery = lock(&self.discovery).take();
        if let Some(discovery) = discovery {
            discovery.shutdown().await;
        }

        // 2) Stop accepting and close the listening socket
        let _ = self.shutdown_tx.send(());
        let accept = lock(&self.accept_task).take();
        if let Some(accept) = accept {
            let _ = accept.await;
        }

        // 3) Dials still in flight never get to register
        lock(&self.dials).abort_all();

        // 4) Close every socket, handshaken or not
        let handlers: Vec<Arc<ConnectionHandler>> = {
            let mut all: Vec<_> = read(&self.connections).values().cloned().collect();
            all.extend(read(&self.pending).values().cloned());
            all
        };
        for handler in handlers {
            handler.stop();
        }

        self.logger.info("🧹 Node stopped.");
        self.emit_status("Stopped.");
        self.emit(NodeEvent::ShutdownComplete);
    }
}

impl ConnectionObserver for NodeInner {
    fn on_started(&self, handler: &Arc<ConnectionHandler>) {
        // Both sides introduce themselves, whoever dialed
        let hello = Message::hello(&self.my_id, &self.my_name, self.listen_port, self.known_peers());
        handler.send(&hello);
    }

    fn on_line(&self, handler: &Arc<ConnectionHandler>, line: String) {
        let message = match decode_line(&line) {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.logger.debug(&format!("Ignoring line from {}", handler.remote_addr()));
                return;
            }
            Err(e) => {
                self.logger.warn(&format!("⚠️ Bad message from {}: {}", handler.remote_addr(), e));
                self.emit_status(format!(
                    "Failed to process message from {}: {}",
                    handler.remote_addr(),
                    e
                ));
                return;
            }
        };

        // Any traffic from a known peer counts as a sign of life
        if let Some(peer) = handler.peer_info() {
            let now = now_millis();
            handler.touch_peer(now);
            self.touch_directory(&peer.id, now);
        }

        match message.body() {
            MessageBody::Hello { port, peers } => self.handle_hello(handler, &message, *port, peers),
            MessageBody::Chat { .. } => {
                let raw = Bytes::from(line.trim().to_string());
                self.handle_chat(handler, &message, raw);
            }
            MessageBody::PeerShare { peers } => self.handle_peer_share(peers),
        }
    }

    fn on_stopped(&self, handler: &Arc<ConnectionHandler>) {
        self.remove_pending(handler);

        let Some(peer) = handler.peer_info() else { return };
        if !self.remove_connection(&peer.id, handler) {
            return;
        }

        // Report the directory's view, it carries the freshest lastSeen
        let peer = read(&self.peers).get(&peer.id).cloned().unwrap_or(peer);
        self.logger.info(&format!("🔌 {} ({}) disconnected", peer.name, peer.address()));
        self.emit(NodeEvent::PeerDisconnected(peer));
    }
}


/// === LOCKS ===

// Every critical section leaves the tables consistent, so a poisoned lock is still usable.

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
