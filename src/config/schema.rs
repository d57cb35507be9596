//! Configuration schema definitions.
//!
//! Every field is optional in a file; a value set in a later layer overrides
//! the earlier one. Accessors resolve unset values to built-in defaults.
//!
//! ```toml
//! [listen]
//! addr = "127.0.0.1:8087"
//! push = true
//!
//! [intercept]
//! enabled = true
//! handshake_timeout_secs = 30
//! relay_idle_timeout_secs = 300
//! max_head_bytes = 65536
//!
//! [ca]
//! dir = "/var/lib/strip-proxy"
//!
//! [telemetry]
//! syslog = false
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;
use crate::proxy::intercept::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::proxy::{DEFAULT_MAX_HEAD_BYTES, DEFAULT_RELAY_IDLE_TIMEOUT};

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8087";

/// Default handshake timeout in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = DEFAULT_HANDSHAKE_TIMEOUT.as_secs();

/// Default relay idle timeout in seconds.
pub const DEFAULT_RELAY_IDLE_TIMEOUT_SECS: u64 = DEFAULT_RELAY_IDLE_TIMEOUT.as_secs();

/// Smallest accepted request head cap.
const MIN_HEAD_BYTES: usize = 1024;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listener settings.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Interception settings.
    #[serde(default)]
    pub intercept: InterceptSection,

    /// Certificate authority settings.
    #[serde(default)]
    pub ca: CaConfig,

    /// Audit logging settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Merge another config into this one; values set in `other` win.
    pub fn merge(&mut self, other: Config) {
        self.listen.merge(other.listen);
        self.intercept.merge(other.intercept);
        self.ca.merge(other.ca);
        self.telemetry.merge(other.telemetry);
    }

    /// Check values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.addr()?;
        if let Some(max) = self.intercept.max_head_bytes
            && max < MIN_HEAD_BYTES
        {
            return Err(ConfigError::InvalidValue {
                field: "intercept.max_head_bytes".to_string(),
                message: format!("must be at least {}", MIN_HEAD_BYTES),
            });
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    /// Address to bind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    /// Re-inject intercepted streams in-process instead of over loopback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<bool>,
}

impl ListenConfig {
    fn merge(&mut self, other: ListenConfig) {
        if other.addr.is_some() {
            self.addr = other.addr;
        }
        if other.push.is_some() {
            self.push = other.push;
        }
    }

    /// Resolved bind address.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = self.addr.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        raw.parse().map_err(|e| ConfigError::InvalidValue {
            field: "listen.addr".to_string(),
            message: format!("'{}': {}", raw, e),
        })
    }

    /// Whether push re-injection is enabled.
    pub fn push(&self) -> bool {
        self.push.unwrap_or(true)
    }
}

/// Interception settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InterceptSection {
    /// Intercept CONNECT tunnels at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// TLS handshake timeout in seconds. 0 = no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,

    /// Relay idle timeout in seconds. 0 = no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_idle_timeout_secs: Option<u64>,

    /// Cap on a request head in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_head_bytes: Option<usize>,
}

impl InterceptSection {
    fn merge(&mut self, other: InterceptSection) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
        if other.handshake_timeout_secs.is_some() {
            self.handshake_timeout_secs = other.handshake_timeout_secs;
        }
        if other.relay_idle_timeout_secs.is_some() {
            self.relay_idle_timeout_secs = other.relay_idle_timeout_secs;
        }
        if other.max_head_bytes.is_some() {
            self.max_head_bytes = other.max_head_bytes;
        }
    }

    /// Whether interception is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Handshake timeout, `None` when disabled.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        secs_or_none(
            self.handshake_timeout_secs
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        )
    }

    /// Relay idle timeout, `None` when disabled.
    pub fn relay_idle_timeout(&self) -> Option<Duration> {
        secs_or_none(
            self.relay_idle_timeout_secs
                .unwrap_or(DEFAULT_RELAY_IDLE_TIMEOUT_SECS),
        )
    }

    /// Request head cap.
    pub fn max_head_bytes(&self) -> usize {
        self.max_head_bytes.unwrap_or(DEFAULT_MAX_HEAD_BYTES)
    }
}

fn secs_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Certificate authority settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CaConfig {
    /// Directory for a persistent root CA. Unset or empty = ephemeral.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl CaConfig {
    fn merge(&mut self, other: CaConfig) {
        if other.dir.is_some() {
            self.dir = other.dir;
        }
    }

    /// Persistent CA directory, if configured.
    pub fn dir(&self) -> Option<&PathBuf> {
        self.dir.as_ref().filter(|d| !d.as_os_str().is_empty())
    }
}

/// Audit logging settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Send audit events to syslog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog: Option<bool>,
}

impl TelemetryConfig {
    fn merge(&mut self, other: TelemetryConfig) {
        if other.syslog.is_some() {
            self.syslog = other.syslog;
        }
    }

    /// Whether syslog audit logging is enabled.
    pub fn syslog(&self) -> bool {
        self.syslog.unwrap_or(false)
    }
}
