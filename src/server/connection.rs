/// === IMPORTS ===

// Socket address of the remote end, used for logging and the pending table key.
use std::net::SocketAddr;

// Shared ownership plus the locks guarding per-handler state.
// The observer is held weakly so a handler never keeps its node alive.
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::sync::atomic::{AtomicU8, Ordering};

// Reference-counted byte buffer: one serialized line can be queued on many handlers.
use bytes::Bytes;

// Line-based reads, buffered writes.
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

// - broadcast: stop signal, one receiver per I/O task
// - mpsc: bounded outbound queue drained by the writer task
use tokio::sync::{broadcast, mpsc};
use tokio::sync::mpsc::error::TrySendError;

use crate::logger::Logger;
use crate::message::{Message, PeerInfo};


/// === OBSERVER ===

/// The owner of a set of handlers. Callbacks run on the handler's reader task
/// (or the caller of `start`/`stop`) and must not block.
pub trait ConnectionObserver: Send + Sync {
    /// I/O tasks are up; the handler accepts `send` from here on.
    fn on_started(&self, handler: &Arc<ConnectionHandler>);

    /// One line arrived, newline stripped. Lines of one handler arrive in order.
    fn on_line(&self, handler: &Arc<ConnectionHandler>, line: String);

    /// Fired exactly once per handler, whatever closed it.
    fn on_stopped(&self, handler: &Arc<ConnectionHandler>);
}


/// === HANDLER ===

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Owns one TCP socket: a reader task feeding lines upward and a writer task
/// draining the outbound queue.
pub struct ConnectionHandler {
    // Remote end as observed on the socket, never as claimed by the peer.
    remote_addr: SocketAddr,
    local_addr: SocketAddr,

    // IDLE -> RUNNING -> STOPPED, or IDLE -> STOPPED. Never goes back.
    state: AtomicU8,

    // The socket until `start` splits it between the two tasks.
    stream: Mutex<Option<TcpStream>>,

    // Bounded queue of serialized lines; the receiver moves into the writer task.
    outbound_tx: mpsc::Sender<Bytes>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,

    // Fired once by `stop` to unblock both tasks.
    shutdown_tx: broadcast::Sender<()>,

    // Unset until the remote's HELLO tells us who it is.
    peer: RwLock<Option<PeerInfo>>,

    observer: Weak<dyn ConnectionObserver>,
    logger: Logger,
}

impl ConnectionHandler {
    /// Wrap a connected socket. Nothing runs until `start`.
    pub fn new(
        stream: TcpStream,
        observer: Weak<dyn ConnectionObserver>,
        queue_capacity: usize,
        logger: Logger,
    ) -> std::io::Result<Arc<Self>> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            remote_addr,
            local_addr,
            state: AtomicU8::new(IDLE),
            stream: Mutex::new(Some(stream)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown_tx,
            peer: RwLock::new(None),
            observer,
            logger,
        }))
    }

    /// Spawn the reader and writer tasks, then tell the observer.
    /// No-op if the handler already started or was stopped.
    pub fn start(self: &Arc<Self>) {
        // Subscribe before flipping the state so a racing `stop` can't be missed
        let reader_shutdown = self.shutdown_tx.subscribe();
        let writer_shutdown = self.shutdown_tx.subscribe();

        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let stream = lock(&self.stream).take();
        let outbound_rx = lock(&self.outbound_rx).take();
        let (Some(stream), Some(outbound_rx)) = (stream, outbound_rx) else {
            self.stop();
            return;
        };

        // Split the stream into read/write halves for independent tasks
        let (reader_half, writer_half) = stream.into_split();
        tokio::spawn(Arc::clone(self).read_loop(reader_half, reader_shutdown));
        tokio::spawn(Arc::clone(self).write_loop(writer_half, outbound_rx, writer_shutdown));

        if let Some(observer) = self.observer.upgrade() {
            observer.on_started(self);
        }
    }

    /// Close the socket and notify the observer. Safe to call any number of
    /// times from any task; only the first call does anything.
    pub fn stop(self: &Arc<Self>) {
        if self.state.swap(STOPPED, Ordering::SeqCst) == STOPPED {
            return;
        }

        // Never started: drop the socket here, there are no tasks to do it
        drop(lock(&self.stream).take());

        // Both tasks exit and drop their halves, which closes the socket
        let _ = self.shutdown_tx.send(());

        if let Some(observer) = self.observer.upgrade() {
            observer.on_stopped(self);
        }
    }

    /// Serialize and enqueue. Dropped if the handler is not running.
    pub fn send(&self, message: &Message) {
        match message.to_line() {
            Ok(line) => self.send_line(line),
            Err(e) => self.logger.warn(&format!(
                "❌ Could not serialize {} for {}: {}",
                message.kind().as_str(),
                self.remote_addr,
                e
            )),
        }
    }

    /// Enqueue one already serialized line (without its newline). Never blocks:
    /// when the queue is full the line is dropped.
    pub fn send_line(&self, line: Bytes) {
        if !self.is_running() {
            return;
        }
        match self.outbound_tx.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.logger.warn(&format!(
                "⚠️ Outbound queue full for {}, dropping line",
                self.remote_addr
            )),
            // The writer is gone, `stop` is already on its way
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STOPPED
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// (local, remote): unique among live sockets, even for two dials to one address.
    pub fn endpoints(&self) -> (SocketAddr, SocketAddr) {
        (self.local_addr, self.remote_addr)
    }

    pub fn remote_host(&self) -> String {
        self.remote_addr.ip().to_string()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_addr.port()
    }

    /// Who is on the other end, once known.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.peer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_peer_info(&self, info: PeerInfo) {
        *self.peer.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(info);
    }

    /// Bump `lastSeen` of the bound peer, if any.
    pub fn touch_peer(&self, now: i64) {
        if let Some(peer) = self
            .peer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_mut()
        {
            peer.touch(now);
        }
    }

    /// Reads incoming lines until EOF, an I/O error, or `stop`.
    async fn read_loop(
        self: Arc<Self>,
        reader_half: OwnedReadHalf,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        // Wrap the read half for line-based async I/O
        let mut lines = BufReader::new(reader_half).lines();

        loop {
            tokio::select! {
                maybe_line = lines.next_line() => {
                    match maybe_line {
                        Ok(Some(line)) => {
                            if let Some(observer) = self.observer.upgrade() {
                                observer.on_line(&self, line);
                            }
                        }
                        Ok(None) => {
                            // EOF: remote closed the connection cleanly
                            self.logger.info(&format!("⚠️ {} disconnected gracefully.", self.remote_addr));
                            break;
                        }
                        Err(e) => {
                            self.logger.warn(&format!("❌ Error reading from {}: {}", self.remote_addr, e));
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        self.stop();
    }

    /// Writes queued lines, one newline-terminated and flushed write each.
    async fn write_loop(
        self: Arc<Self>,
        writer_half: OwnedWriteHalf,
        mut outbound_rx: mpsc::Receiver<Bytes>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut writer = BufWriter::new(writer_half);

        loop {
            // Wait for work, or for the stop signal
            let line = tokio::select! {
                maybe_line = outbound_rx.recv() => match maybe_line {
                    Some(line) => line,
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            };

            // A peer that stopped reading must not pin this task past `stop`
            tokio::select! {
                result = write_line(&mut writer, &line) => {
                    if let Err(e) = result {
                        self.logger.warn(&format!("❌ Failed to send to {}: {}", self.remote_addr, e));
                        break;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        self.stop();
    }
}

async fn write_line(writer: &mut BufWriter<OwnedWriteHalf>, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
