//! Error types for attachment-watcher
//!
//! The variants follow the failure domains of the watcher: anything
//! that breaks the mailbox session (transport, protocol, TLS, I/O,
//! timeouts) versus failures confined to a single message or
//! attachment (parse, storage, analysis).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(std::time::Duration, &'static str),

    #[error("Email parsing error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("No message body returned for UID {0}")]
    MessageNotFound(u32),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error leaves the mailbox session unusable.
    ///
    /// Session-fatal errors send the monitor back to `DISCONNECTED`;
    /// everything else is confined to the message or attachment that
    /// produced it.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Protocol(_) | Self::Tls(_) | Self::Io(_) | Self::Timeout(..)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
