//! Audit logging for strip-proxy.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): interception outcomes and proxy lifecycle
//! - **Debug logging** (tracing): development logs go to stderr via `tracing`
//!
//! The Handler holds an `Arc<AuditLogger>`; tests use the null or memory
//! logger.
//!
//! # Event Format
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"intercept","remote":"127.0.0.1:50512","host":"example.com","path":"push"}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, InterceptStage, ReinjectPath};
pub use syslog::{AuditLogger, SYSLOG_TAG};
