//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `STRIP_PROXY` tag.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events emitted by the proxy.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Proxy started accepting connections.
    ProxyStart {
        /// Bound listen address.
        addr: String,
        /// Whether intercepted streams are pushed in-process.
        push: bool,
        /// Whether CONNECT interception is enabled.
        intercept: bool,
    },

    /// Proxy stopped.
    ProxyStop {
        /// Uptime in seconds.
        duration_sec: u64,
    },

    /// A CONNECT tunnel was intercepted and its plaintext re-injected.
    Intercept {
        /// Client address.
        remote: String,
        /// CONNECT target host.
        host: String,
        /// How the plaintext went back into the pipeline.
        path: ReinjectPath,
    },

    /// An interception attempt failed.
    InterceptFailed {
        /// CONNECT target host.
        host: String,
        /// Step that failed.
        stage: InterceptStage,
        /// Error message.
        message: String,
    },

    /// No filter claimed a request.
    UnhandledRequest {
        /// Client address.
        remote: String,
        /// Request method.
        method: String,
        /// Request target.
        target: String,
    },
}

/// Re-injection strategy used for an intercepted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinjectPath {
    /// Handed straight to the listener's accept queue.
    Push,
    /// Relayed over a loopback connection to the listener.
    Loopback,
}

/// Interception steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptStage {
    /// Taking over the client connection.
    Hijack,
    /// Writing the tunnel acceptance line.
    Tunnel,
    /// Issuing the host certificate.
    Issue,
    /// TLS server handshake.
    Handshake,
    /// Delivering the plaintext stream.
    Reinject,
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }

    /// Event name as it appears in the `event` field.
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::ProxyStart { .. } => "proxy_start",
            AuditEvent::ProxyStop { .. } => "proxy_stop",
            AuditEvent::Intercept { .. } => "intercept",
            AuditEvent::InterceptFailed { .. } => "intercept_failed",
            AuditEvent::UnhandledRequest { .. } => "unhandled_request",
        }
    }
}
