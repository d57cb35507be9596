//! Syslog integration for audit logging.
//!
//! Audit events are logged to syslog with the `STRIP_PROXY` tag. A null
//! logger discards events, and a memory logger keeps them for inspection.

use std::sync::Mutex;

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "STRIP_PROXY";

enum Backend {
    Syslog(Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>),
    Memory(Mutex<Vec<String>>),
    Null,
}

/// Audit logger that writes structured JSON events.
///
/// Shared by reference across connection tasks; the writer sits behind a
/// mutex.
pub struct AuditLogger {
    backend: Backend,
}

impl AuditLogger {
    /// Create a new audit logger connected to syslog.
    ///
    /// Uses Unix socket connection to local syslog daemon.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter)
            .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            backend: Backend::Syslog(Mutex::new(writer)),
        })
    }

    /// Create a null audit logger that discards all events.
    pub fn new_null() -> Self {
        Self {
            backend: Backend::Null,
        }
    }

    /// Create a logger that keeps serialized events in memory.
    pub fn new_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(Vec::new())),
        }
    }

    /// Log an audit event.
    ///
    /// The event is serialized to JSON with an ISO8601 timestamp.
    /// If this is a null logger, the event is silently discarded.
    pub fn log(&self, event: AuditEvent) {
        if matches!(self.backend, Backend::Null) {
            return;
        }

        let json = match serde_json::to_string(&event.with_timestamp()) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        match &self.backend {
            Backend::Syslog(writer) => match writer.lock() {
                Ok(mut writer) => {
                    if let Err(e) = writer.info(&json) {
                        error!("Failed to write to syslog: {}", e);
                    }
                }
                Err(e) => error!("Failed to acquire syslog writer lock: {}", e),
            },
            Backend::Memory(events) => match events.lock() {
                Ok(mut events) => events.push(json.clone()),
                Err(e) => error!("Failed to acquire audit buffer lock: {}", e),
            },
            Backend::Null => {}
        }
        debug!("Logged audit event: {}", json);
    }

    /// Events recorded by a memory logger, oldest first.
    ///
    /// Always empty for syslog and null loggers.
    pub fn recorded(&self) -> Vec<String> {
        match &self.backend {
            Backend::Memory(events) => events.lock().map(|e| e.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        matches!(self.backend, Backend::Null)
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new_null()
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backend {
            Backend::Syslog(_) => "syslog",
            Backend::Memory(_) => "memory",
            Backend::Null => "null",
        };
        f.debug_struct("AuditLogger").field("backend", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_tag() {
        assert_eq!(SYSLOG_TAG, "STRIP_PROXY");
    }

    #[test]
    fn test_null_logger_discards() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());
        logger.log(AuditEvent::ProxyStop { duration_sec: 1 });
        assert!(logger.recorded().is_empty());
    }

    #[test]
    fn test_memory_logger_records_json() {
        let logger = AuditLogger::new_memory();
        logger.log(AuditEvent::ProxyStop { duration_sec: 42 });

        let events = logger.recorded();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("\"event\":\"proxy_stop\""));
        assert!(events[0].contains("\"duration_sec\":42"));
    }

    // Integration test - requires syslog daemon
    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_logger_creation() {
        let logger = AuditLogger::new();
        assert!(logger.is_ok());
    }
}
