//! Configuration system for strip-proxy.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/strip-proxy/config.toml`
//! 3. User config: `~/.config/strip-proxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! No configuration file is required.
//!
//! # Merge Behavior
//!
//! Every value is optional. A value present in a later source overrides the
//! earlier one; absent values leave the earlier one in place.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{CaConfig, Config, InterceptSection, ListenConfig, TelemetryConfig};
