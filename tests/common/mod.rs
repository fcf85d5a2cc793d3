#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, timeout_at, Instant};

use mesh_chat::{Logger, Message, NodeConfig, NodeEvent, PeerNode};

pub const WAIT: Duration = Duration::from_secs(5);

/// Loopback only, OS-assigned port, no multicast, quiet.
pub fn test_config(name: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.name = name.to_string();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.connect_timeout = Duration::from_secs(2);
    config.discovery.enabled = false;
    config.logger.enable_console_log = false;
    config
}

pub async fn start_node(config: NodeConfig) -> (PeerNode, UnboundedReceiver<NodeEvent>) {
    PeerNode::start(config, Logger).await.expect("node starts")
}

/// Skip events until one matches.
pub async fn wait_for(
    events: &mut UnboundedReceiver<NodeEvent>,
    mut matches: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Everything that arrives within `window`.
pub async fn drain_for(events: &mut UnboundedReceiver<NodeEvent>, window: Duration) -> Vec<NodeEvent> {
    let deadline = Instant::now() + window;
    let mut seen = Vec::new();
    while let Ok(Some(event)) = timeout_at(deadline, events.recv()).await {
        seen.push(event);
    }
    seen
}

pub fn chats(events: &[NodeEvent]) -> Vec<Message> {
    events
        .iter()
        .filter_map(|event| match event {
            NodeEvent::MessageReceived(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Poll `condition` until it holds, or fail the test.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        if Instant::now() > deadline {
            panic!("never happened: {}", what);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub fn hello_json(id: &str, name: &str, peers: JsonValue) -> JsonValue {
    json!({
        "id": format!("hello-{}", id),
        "type": "HELLO",
        "fromId": id,
        "fromName": name,
        "timestamp": 1_700_000_000_000i64,
        "port": 0,
        "peers": peers,
    })
}

pub fn chat_json(message_id: &str, from_id: &str, text: &str) -> JsonValue {
    json!({
        "id": message_id,
        "type": "CHAT",
        "fromId": from_id,
        "fromName": from_id,
        "timestamp": 1_700_000_000_000i64,
        "text": text,
    })
}

pub fn peer_json(id: &str, host: &str, port: u16, last_seen: i64) -> JsonValue {
    json!({ "id": id, "name": id, "host": host, "port": port, "lastSeen": last_seen })
}

/// A hand-driven peer speaking the line protocol over a raw socket.
pub struct FakePeer {
    pub id: String,
    /// Our end of the socket, which is the port the node records for us.
    pub local_port: u16,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakePeer {
    pub async fn connect(port: u16, id: &str) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect to node");
        let local_port = stream.local_addr().unwrap().port();
        let (reader, writer) = stream.into_split();
        Self {
            id: id.to_string(),
            local_port,
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Connect, read the node's HELLO and answer with ours.
    pub async fn handshake(port: u16, id: &str) -> Self {
        let mut peer = Self::connect(port, id).await;
        peer.expect_type("HELLO").await;
        peer.send(&hello_json(id, id, json!([]))).await;
        peer
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send(&mut self, value: &JsonValue) {
        self.send_raw(&value.to_string()).await;
    }

    /// Next line as JSON; `None` on timeout or EOF.
    pub async fn next_json(&mut self, within: Duration) -> Option<JsonValue> {
        match timeout(within, self.lines.next_line()).await {
            Ok(Ok(Some(line))) => Some(serde_json::from_str(&line).expect("node sends JSON")),
            _ => None,
        }
    }

    /// Skip lines until one of `kind` arrives.
    pub async fn expect_type(&mut self, kind: &str) -> JsonValue {
        loop {
            let value = self
                .next_json(WAIT)
                .await
                .unwrap_or_else(|| panic!("{} never arrived at {}", kind, self.id));
            if value["type"] == kind {
                return value;
            }
        }
    }

    /// Collect every line received within `window`.
    pub async fn drain(&mut self, window: Duration) -> Vec<JsonValue> {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        while let Ok(Ok(Some(line))) = timeout_at(deadline, self.lines.next_line()).await {
            seen.push(serde_json::from_str(&line).expect("node sends JSON"));
        }
        seen
    }

    /// True once the node closed the socket.
    pub async fn sees_eof(&mut self) -> bool {
        let deadline = Instant::now() + WAIT;
        loop {
            match timeout_at(deadline, self.lines.next_line()).await {
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) | Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }
}
