//! Error types for proxy operations.
//!
//! Every variant is local to one client session: the Handler logs it, closes
//! that session and keeps serving everything else.
//! - Dispatch errors (unhandled request, malformed head)
//! - Interception errors (configuration, hijack, issuance, handshake)
//! - Re-injection errors (loopback dial, push)
//! - Upstream errors for the direct-dial filter

use crate::ca::CaError;
use std::io;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A filter is missing a collaborator it needs to serve any request.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The response sink has no raw connection that can be taken over.
    #[error("Response sink does not support hijacking")]
    HijackUnsupported,

    /// The connection was already taken over by an earlier hijack.
    #[error("Connection already hijacked")]
    AlreadyHijacked,

    /// Writing the tunnel acceptance line failed.
    #[error("Failed to accept tunnel: {0}")]
    TunnelWrite(#[source] io::Error),

    /// The certificate authority could not issue a certificate.
    #[error("Certificate issuance failed for '{host}': {source}")]
    CertificateIssuanceFailed {
        /// Host the certificate was requested for.
        host: String,
        /// The underlying CA error.
        #[source]
        source: CaError,
    },

    /// The TLS server handshake with the client failed.
    #[error("TLS handshake failed for '{host}': {message}")]
    HandshakeFailed {
        /// Intercepted host.
        host: String,
        /// Handshake error message.
        message: String,
    },

    /// The TLS server handshake did not complete in time.
    #[error("TLS handshake timed out for '{host}'")]
    HandshakeTimeout {
        /// Intercepted host.
        host: String,
    },

    /// The loopback relay could not reach the Handler's own listener.
    #[error("Failed to dial listener at {addr}: {source}")]
    RelayDialFailed {
        /// Listener address that was dialed.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The listener refused an injected connection.
    #[error("Failed to push connection: {0}")]
    PushFailed(String),

    /// No filter claimed the request.
    #[error("Unhandled request: {method} {target}")]
    Unhandled {
        /// Request method.
        method: String,
        /// Request target.
        target: String,
    },

    /// The request head could not be parsed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The request head exceeded the configured limit.
    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// The request head carried more header fields than the parser accepts.
    #[error("Request head has more than {0} header fields")]
    TooManyHeaders(usize),

    /// Failed to connect to the upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The upstream exchange failed after the connection was established.
    #[error("Upstream request to '{addr}' failed: {message}")]
    UpstreamRequest {
        /// Upstream address.
        addr: String,
        /// Error message.
        message: String,
    },

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP message construction error.
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Whether this error is the peer going away rather than a fault.
    ///
    /// Resets, broken pipes and truncated reads happen constantly on a
    /// forward proxy; they are logged at debug level only.
    pub fn is_connection_closed(&self) -> bool {
        match self {
            ProxyError::Io(e) | ProxyError::TunnelWrite(e) => is_disconnect(e),
            _ => false,
        }
    }
}

/// Whether an I/O error kind signals a normal connection termination.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
