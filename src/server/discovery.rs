// LAN discovery: every node announces itself on a multicast group and
// listens on the same group for everyone else.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::logger::Logger;

const ANNOUNCE_TYPE: &str = "DISCOVERY";

/// A node seen on the LAN. `host` is the datagram's source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub id: String,
}

/// Called for every announcement from another node, repeats included.
pub type DiscoveryListener = Arc<dyn Fn(DiscoveredPeer) + Send + Sync>;

#[derive(Debug, Serialize, Deserialize)]
struct Announcement {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    port: u16,
}

pub struct DiscoveryService {
    my_id: String,
    my_name: String,
    my_port: u16,
    config: DiscoveryConfig,
    listener: DiscoveryListener,
    logger: Logger,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(
        my_id: &str,
        my_name: &str,
        my_port: u16,
        config: DiscoveryConfig,
        listener: DiscoveryListener,
        logger: Logger,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            my_id: my_id.to_string(),
            my_name: my_name.to_string(),
            my_port,
            config,
            listener,
            logger,
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Join the group and spawn the announce and receive loops.
    /// Must run inside a tokio runtime. Calling it again while running does nothing.
    pub fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let socket = match bind_multicast(&self.config) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let payload = serde_json::to_vec(&Announcement {
            kind: ANNOUNCE_TYPE.to_string(),
            id: self.my_id.clone(),
            name: self.my_name.clone(),
            port: self.my_port,
        })?;
        let target = SocketAddr::V4(SocketAddrV4::new(self.config.group, self.config.port));

        let announcer = tokio::spawn(announce_loop(
            socket.clone(),
            payload,
            target,
            self.config.interval,
            self.shutdown_tx.subscribe(),
            self.logger.clone(),
        ));
        let receiver = tokio::spawn(receive_loop(
            socket,
            self.my_id.clone(),
            self.config.group,
            self.listener.clone(),
            self.shutdown_tx.subscribe(),
            self.logger.clone(),
        ));

        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend([announcer, receiver]);

        self.logger.info(&format!(
            "📡 Discovery on {}:{} every {:?}",
            self.config.group, self.config.port, self.config.interval
        ));
        Ok(())
    }

    /// Stop announcing, leave the group and close the socket. Idempotent.
    pub async fn shutdown(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let _ = self.shutdown_tx.send(());

        // The socket closes once both loops have let go of it
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        self.logger.info("📡 Discovery stopped.");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// A UDP socket bound to the group port, shareable by several nodes on one host.
fn bind_multicast(config: &DiscoveryConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into())?;
    socket.join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    // Nodes on the same machine must hear each other
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    payload: Vec<u8>,
    target: SocketAddr,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    logger: Logger,
) {
    // First tick fires immediately
    let mut ticker = time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Lost announcements are fine, the next tick repeats it
                if let Err(e) = socket.send_to(&payload, target).await {
                    logger.debug(&format!("Discovery announce failed: {}", e));
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    my_id: String,
    group: Ipv4Addr,
    listener: DiscoveryListener,
    mut shutdown_rx: broadcast::Receiver<()>,
    logger: Logger,
) {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        if let Some(peer) = parse_announcement(&buf[..len], src, &my_id) {
                            listener(peer);
                        }
                    }
                    Err(e) => {
                        logger.warn(&format!("Discovery receive error: {}", e));
                        time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    if let Err(e) = socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
        logger.debug(&format!("Leaving multicast group {} failed: {}", group, e));
    }
}

/// Decode one datagram. Anything that is not another node's announcement is `None`.
fn parse_announcement(datagram: &[u8], src: SocketAddr, my_id: &str) -> Option<DiscoveredPeer> {
    let announcement: Announcement = serde_json::from_slice(datagram).ok()?;
    if announcement.kind != ANNOUNCE_TYPE || announcement.id.is_empty() || announcement.id == my_id {
        return None;
    }
    Some(DiscoveredPeer {
        host: src.ip().to_string(),
        port: announcement.port,
        name: announcement.name,
        id: announcement.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> SocketAddr {
        "192.168.1.20:4446".parse().unwrap()
    }

    #[test]
    fn announcement_wire_shape() {
        let bytes = serde_json::to_vec(&Announcement {
            kind: ANNOUNCE_TYPE.into(),
            id: "abc".into(),
            name: "alice".into(),
            port: 5002,
        })
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, serde_json::json!({"type": "DISCOVERY", "id": "abc", "name": "alice", "port": 5002}));
    }

    #[test]
    fn other_nodes_are_reported_with_the_source_host() {
        let datagram = br#"{"type":"DISCOVERY","id":"other","name":"bob","port":5001}"#;
        let peer = parse_announcement(datagram, src(), "me").unwrap();
        assert_eq!(
            peer,
            DiscoveredPeer {
                host: "192.168.1.20".into(),
                port: 5001,
                name: "bob".into(),
                id: "other".into(),
            }
        );
    }

    #[test]
    fn own_and_foreign_datagrams_are_dropped() {
        let own = br#"{"type":"DISCOVERY","id":"me","name":"me","port":5000}"#;
        let other_type = br#"{"type":"SSDP","id":"x","name":"x","port":1}"#;
        assert!(parse_announcement(own, src(), "me").is_none());
        assert!(parse_announcement(other_type, src(), "me").is_none());
        assert!(parse_announcement(b"M-SEARCH * HTTP/1.1", src(), "me").is_none());
    }

    #[tokio::test]
    async fn shutdown_without_start_is_harmless() {
        let service = DiscoveryService::new(
            "me",
            "me",
            5000,
            DiscoveryConfig::default(),
            Arc::new(|_: DiscoveredPeer| {}),
            Logger,
        );
        service.shutdown().await;
        service.shutdown().await;
        assert!(!service.is_running());
    }
}
