use std::io;

use thiserror::Error;

/// Everything that can go wrong inside a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Every port in the probe range was taken.
    #[error("no listening port available in {first}..={last}")]
    NoListenPort { first: u16, last: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A line or datagram that is not the JSON we expect.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T, E = NodeError> = std::result::Result<T, E>;
