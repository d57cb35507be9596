//! strip-proxy: local forward proxy with HTTPS CONNECT interception.
//!
//! Every CONNECT is answered by the proxy itself. The tunnel is terminated
//! with a certificate issued on the fly for the requested host, and the
//! decrypted HTTP/1 stream is fed back through the same request pipeline as
//! plain traffic, either straight into the listener's accept queue or over a
//! loopback connection.
//!
//! # Architecture
//!
//! - **Proxy**: listener, filter dispatch, interception, re-injection, relay
//! - **CA**: the certificate authority boundary and a self-signed root
//! - **Config**: hierarchical TOML configuration
//! - **Telemetry**: structured syslog audit events

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod config;
pub mod proxy;
pub mod telemetry;
