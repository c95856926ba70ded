//! Error types for the postbox server.
//!
//! Connection, TLS, session, and server lifecycle failures are kept as
//! separate enums so callers can match on the layer that failed.

use std::io;

use thiserror::Error;

/// Errors that can occur while reading from or writing to a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error during connection operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection was closed by peer.
    #[error("Connection closed by peer")]
    Closed,

    /// A single line exceeded the configured length cap.
    #[error("Line exceeds {0} octets")]
    LineTooLong(usize),

    /// No complete line arrived within the idle window.
    #[error("Idle timeout expired")]
    Timeout,

    /// Formatting error while preparing a reply.
    #[error("Reply formatting error: {0}")]
    Format(#[from] std::fmt::Error),
}

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// I/O error during TLS operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load the TLS certificate chain.
    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to load the TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Errors that terminate a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Plaintext bytes were already buffered when STARTTLS completed.
    /// Proceeding would let an attacker smuggle commands into the
    /// encrypted session, so the connection is torn down instead.
    #[error("Pipelined plaintext after STARTTLS")]
    CommandInjection,
}

/// Errors from the server control surface.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called while the server was already running.
    #[error("Server already started")]
    AlreadyStarted,

    /// `start` was called on a server that has been stopped. The
    /// lifecycle is single-shot; build a new server instead.
    #[error("Server was stopped and cannot be restarted")]
    Stopped,

    /// A control call that requires a running server found none.
    #[error("Server is not running")]
    NotRunning,

    /// Binding the listening socket failed.
    #[error("Failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    /// The TLS acceptor could not be built from the configured context.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// No message handler factory was supplied.
    #[error("A message handler factory is required")]
    MissingHandlerFactory,

    /// `enable_tls` is set but no certificate material was configured.
    #[error("TLS is enabled but no certificate/key paths were configured")]
    MissingTlsContext,
}

/// Specialized `Result` for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Specialized `Result` for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
