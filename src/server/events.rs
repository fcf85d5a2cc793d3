use crate::message::{Message, PeerInfo};
use crate::server::discovery::DiscoveredPeer;

/// Everything a node reports to its front end, in the order it happened.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Human-readable progress and failures ("Connected to ...", "Stopped.").
    Status(String),
    /// A HELLO bound a new id to a live connection.
    PeerConnected(PeerInfo),
    /// A registered connection closed.
    PeerDisconnected(PeerInfo),
    /// A chat message seen for the first time, local ones included.
    MessageReceived(Message),
    /// A multicast announcement from another node. Repeats every interval.
    PeerDiscovered(DiscoveredPeer),
    /// Last event of a node.
    ShutdownComplete,
}
