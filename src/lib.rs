// Settings for the node, discovery and logging, read from JSON files.
pub mod config;

// The crate's error enum and `Result` alias.
pub mod error;

// fern-backed logging shared by every task.
pub mod logger;

// Wire model: PeerInfo, Message and the line codec.
pub mod message;

// Bounded cache of message ids already handled.
pub mod dedup;

// Per-session chat transcript.
pub mod history;

// Terminal front end used by the `mesh-chat` binary.
pub mod console;

// The peer node, its connections and LAN discovery.
pub mod server;

// Pull the everyday types up so callers can `use mesh_chat::PeerNode`.
pub use config::{DiscoveryConfig, LoggerConfig, NodeConfig};
pub use error::{NodeError, Result};
pub use logger::{init_logger, Logger};
pub use message::{Message, MessageBody, MessageKind, PeerInfo};
pub use server::discovery::DiscoveredPeer;
pub use server::{NodeEvent, PeerNode};
