//! Forward proxy pipeline with CONNECT interception.
//!
//! This module provides:
//! - The [`Filter`] contract and the [`Handler`] that dispatches through it
//! - HTTP/1 request framing and connection hijacking
//! - [`InterceptFilter`]: terminates TLS for CONNECT tunnels with a freshly
//!   issued certificate and re-injects the plaintext
//! - Re-injection by in-process push or by loopback relay
//! - [`DirectFilter`]: forwards ordinary requests to their origin
//!
//! # Architecture
//!
//! ```text
//!  client ──CONNECT a.example:443──▶ Handler ──▶ InterceptFilter
//!                                                  │ hijack
//!                                                  │ "HTTP/1.1 200 OK"
//!                                                  │ issue cert, TLS accept
//!                                                  ▼
//!                                              Reinjector ──push / loopback──┐
//!                                                                            │
//!  Handler ◀──────────── decrypted HTTP/1 stream (new connection) ◀──────────┘
//!     │
//!     └──▶ DirectFilter ──TLS──▶ a.example:443
//! ```

pub mod conn;
pub mod direct;
pub mod error;
pub mod filter;
pub mod handler;
pub mod intercept;
pub mod listener;
pub mod reinject;
pub mod relay;
pub mod tls;

// Re-export main types for convenient access
pub use conn::{
    BoxedStream, ConnInfo, Connection, HijackedConnection, ProxyRequest, ProxyResponse,
    ResponseSink,
};
pub use direct::DirectFilter;
pub use error::{ProxyError, ProxyResult};
pub use filter::{Filter, FilterArgs};
pub use handler::{
    DEFAULT_MAX_HEAD_BYTES, DEFAULT_RELAY_IDLE_TIMEOUT, Handler, HandlerBuilder, HandlerConfig,
};
pub use intercept::{InterceptConfig, InterceptFilter};
pub use listener::{InterceptedPeers, Listener, PushListener, PushableListener, TcpProxyListener};
pub use reinject::{LoopbackReinjector, PushReinjector, Reinjector};
pub use relay::{RelayHandle, RelayStats};
