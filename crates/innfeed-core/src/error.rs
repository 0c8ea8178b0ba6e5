use std::path::PathBuf;

use thiserror::Error;

use crate::article::MessageId;

/// Crate-wide result alias, as `librqbit`'s `lib.rs` does for its own `Error`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("article {0} has a malformed message-id")]
    BadMessageId(String),

    #[error("article {msgid} is missing or not a regular file: {path:?}")]
    ArticleMissing { msgid: MessageId, path: PathBuf },

    #[error("peer {0:?} is unknown and dynamic peer creation is disabled")]
    UnknownPeer(String),

    #[error("malformed dispatcher command line: {0:?}")]
    BadCommandLine(String),

    #[error("NNTP protocol violation on connection to {peer}: {detail}")]
    Protocol { peer: String, detail: String },

    #[error("lock for peer {peer} is held by another process (pid {pid})")]
    Locked { peer: String, pid: i32 },

    #[error("tape I/O error for peer {peer}: {source}")]
    Tape {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TomlParse(#[from] toml::de::Error),
}
