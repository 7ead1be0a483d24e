use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the delivery and overflow-persistence seams.
///
/// Classification failures never appear here: an unrecognized statement
/// degrades to pass-through forwarding instead of erroring.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no backend nodes registered")]
    NoServers,

    #[error("all backend nodes are down")]
    AllNodesDown,

    #[error("backend returned status {status}: {body}")]
    BackendStatus { status: u16, body: String },

    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("overflow store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed overflow file {path}: {source}")]
    MalformedDump {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("cache shard count {0} is not a power of two")]
    ShardCount(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
