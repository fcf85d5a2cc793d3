// Terminal front end: turns typed lines into node commands and node events
// into printed (and recorded) lines.

use std::io::Write;

use chrono::{Local, TimeZone};

use crate::history::MessageHistory;
use crate::message::{Message, PeerInfo};
use crate::server::discovery::DiscoveredPeer;
use crate::server::{NodeEvent, PeerNode};

pub const HELP: &str = "\
Commands:
  /connect <host> <port>   dial a peer (also /connect host:port)
  /peers                   peers with a live connection
  /known                   every peer heard of
  /discovered              peers announced on the LAN
  /dial <n>                dial the n-th discovered peer
  /help                    this text
  /quit                    leave
Anything else is sent as a chat message.";

/// One line of user input, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { host: String, port: u16 },
    Peers,
    Known,
    Discovered,
    /// Zero-based index into the discovered list (`/dial 1` is index 0).
    Dial(usize),
    Help,
    Quit,
    Send(String),
    /// Blank input.
    Nothing,
    /// Looked like a command but wasn't usable; carries the message to show.
    Invalid(String),
}

pub fn parse_command(input: &str) -> Command {
    let input = input.trim();
    if input.is_empty() {
        return Command::Nothing;
    }
    if !input.starts_with('/') {
        return Command::Send(input.to_string());
    }

    let mut parts = input.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match (command, args.as_slice()) {
        ("/connect", [host, port]) => match port.parse::<u16>() {
            Ok(port) if port != 0 => Command::Connect { host: host.to_string(), port },
            _ => Command::Invalid(format!("Invalid port: {}", port)),
        },
        ("/connect", [address]) => match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(port) if port != 0 => Command::Connect { host: host.to_string(), port },
                _ => Command::Invalid(format!("Invalid port: {}", port)),
            },
            _ => Command::Invalid("Usage: /connect <host> <port>".to_string()),
        },
        ("/connect", _) => Command::Invalid("Usage: /connect <host> <port>".to_string()),
        ("/peers", []) => Command::Peers,
        ("/known", []) => Command::Known,
        ("/discovered", []) => Command::Discovered,
        ("/dial", [n]) => match n.parse::<usize>() {
            Ok(n) if n >= 1 => Command::Dial(n - 1),
            _ => Command::Invalid("Usage: /dial <n>, n as listed by /discovered".to_string()),
        },
        ("/dial", _) => Command::Invalid("Usage: /dial <n>".to_string()),
        ("/help", _) => Command::Help,
        ("/quit", _) | ("/exit", _) => Command::Quit,
        (other, _) => Command::Invalid(format!("Unknown command {}, try /help", other)),
    }
}

/// `HH:MM:SS` in local time for epoch milliseconds.
pub fn clock(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(time) => time.format("%H:%M:%S").to_string(),
        None => Local::now().format("%H:%M:%S").to_string(),
    }
}

/// `[HH:MM:SS] name: text`, stamped with the sender's clock.
pub fn render_chat(message: &Message) -> String {
    let name = match message.from_name() {
        "" => "peer",
        name => name,
    };
    format!(
        "[{}] {}: {}",
        clock(message.timestamp()),
        name,
        message.text().unwrap_or_default()
    )
}

/// `[HH:MM:SS] [system] text`, stamped now.
pub fn render_system(text: &str) -> String {
    format!("[{}] [system] {}", Local::now().format("%H:%M:%S"), text)
}

/// LAN announcements, one entry per `host:port`, in order of first sighting.
#[derive(Debug, Default)]
pub struct DiscoveredList {
    peers: Vec<DiscoveredPeer>,
}

impl DiscoveredList {
    /// Returns the 1-based position when the address is new; repeats only refresh the entry.
    pub fn remember(&mut self, peer: DiscoveredPeer) -> Option<usize> {
        match self
            .peers
            .iter_mut()
            .find(|known| known.host == peer.host && known.port == peer.port)
        {
            Some(known) => {
                *known = peer;
                None
            }
            None => {
                self.peers.push(peer);
                Some(self.peers.len())
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<&DiscoveredPeer> {
        self.peers.get(index)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredPeer> {
        self.peers.iter()
    }
}

/// Prints to `out` and records chat/system lines in the history, if any.
pub struct Console<W: Write> {
    out: W,
    history: Option<MessageHistory>,
    discovered: DiscoveredList,
}

impl<W: Write> Console<W> {
    pub fn new(out: W, history: Option<MessageHistory>) -> Self {
        Self {
            out,
            history,
            discovered: DiscoveredList::default(),
        }
    }

    pub fn discovered(&self) -> &DiscoveredList {
        &self.discovered
    }

    pub fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Status(status) => self.system(&status),
            NodeEvent::PeerConnected(peer) => {
                self.system(&format!("{} connected ({})", peer.name, peer.address()))
            }
            NodeEvent::PeerDisconnected(peer) => {
                self.system(&format!("{} disconnected ({})", peer.name, peer.address()))
            }
            NodeEvent::MessageReceived(message) => self.record(&render_chat(&message)),
            NodeEvent::PeerDiscovered(peer) => {
                let summary = format!("{} at {}:{}", peer.name, peer.host, peer.port);
                if let Some(n) = self.discovered.remember(peer) {
                    self.system(&format!("Discovered {} (/dial {})", summary, n));
                }
            }
            NodeEvent::ShutdownComplete => {}
        }
    }

    /// Run one command against the node. Returns `false` when the user wants out.
    pub fn handle_command(&mut self, command: Command, node: &PeerNode) -> bool {
        match command {
            Command::Nothing => {}
            Command::Quit => return false,
            Command::Help => self.print(HELP),
            Command::Invalid(reason) => self.system(&reason),
            Command::Send(text) => {
                // The node echoes it back as a MessageReceived event
                if let Err(e) = node.broadcast_chat(&text) {
                    self.system(&format!("Could not send: {}", e));
                }
            }
            Command::Connect { host, port } => {
                self.system(&format!("Connecting to {}:{}...", host, port));
                node.connect(&host, port);
            }
            Command::Dial(index) => match self.discovered.get(index).cloned() {
                Some(peer) => {
                    self.system(&format!("Connecting to {} at {}:{}...", peer.name, peer.host, peer.port));
                    node.connect(&peer.host, peer.port);
                }
                None => self.system(&format!("No discovered peer #{}", index + 1)),
            },
            Command::Peers => {
                let peers = node.connected_peers();
                self.print_peers("Connected peers", &peers);
            }
            Command::Known => {
                let peers = node.known_peers();
                self.print_peers("Known peers", &peers);
            }
            Command::Discovered => {
                if self.discovered.is_empty() {
                    self.print("No peers discovered yet.");
                }
                let lines: Vec<String> = self
                    .discovered
                    .iter()
                    .enumerate()
                    .map(|(i, p)| format!("  {}. {} at {}:{}", i + 1, p.name, p.host, p.port))
                    .collect();
                for line in lines {
                    self.print(&line);
                }
            }
        }
        true
    }

    /// Write the closing banner to the history. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(history) = self.history.take() {
            history.close();
        }
    }

    fn print_peers(&mut self, title: &str, peers: &[PeerInfo]) {
        if peers.is_empty() {
            self.print(&format!("{}: none", title));
            return;
        }
        self.print(&format!("{} ({}):", title, peers.len()));
        for peer in peers {
            self.print(&format!(
                "  {} {} [{}] last seen {}",
                peer.name,
                peer.address(),
                peer.id,
                clock(peer.last_seen)
            ));
        }
    }

    fn system(&mut self, text: &str) {
        self.record(&render_system(text));
    }

    fn record(&mut self, line: &str) {
        self.print(line);
        if let Some(history) = &self.history {
            history.append(line);
        }
    }

    fn print(&mut self, line: &str) {
        let _ = writeln!(self.out, "{}", line);
        let _ = self.out.flush();
    }
}
