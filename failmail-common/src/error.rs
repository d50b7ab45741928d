//! Error types shared across the failmail crates.

use std::io;

use thiserror::Error;

/// Errors that can occur while handling a single SMTP session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client violated the protocol badly enough to end the session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection error occurred.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// The receiving side of the pipeline went away.
    #[error("Receiver closed")]
    ReceiverClosed,

    /// Session timed out.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error is a client-side issue.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

/// Errors that can occur in the listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to socket address.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),
}

/// Configuration errors, fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("credentials must be in username:password format")]
    MalformedCredentials,

    #[error("pidfile {path} already exists")]
    PidfileExists { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
