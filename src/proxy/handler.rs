//! The Handler: accept loop, per-connection request loop and filter dispatch.
//!
//! The Handler owns an immutable, ordered list of filters and the listener
//! it accepts from. Each accepted connection runs in its own task:
//!
//! 1. Read a request head.
//! 2. [`Handler::dispatch`] it to the first filter whose `matches` claims it.
//! 3. Write the returned response, or nothing if the filter hijacked the
//!    connection.
//! 4. Repeat while the connection is reusable.
//!
//! Streams re-injected by the interception filter arrive through the same
//! listener and go through the same loop.
//!
//! # Example
//!
//! ```ignore
//! use strip_proxy::proxy::{DirectFilter, Handler, InterceptFilter, PushableListener};
//! use std::sync::Arc;
//!
//! let listener = PushableListener::bind("127.0.0.1:8087").await?;
//! let handler = Handler::builder()
//!     .filter(Arc::new(InterceptFilter::new(ca)))
//!     .filter(Arc::new(DirectFilter::new()))
//!     .listener(Arc::new(listener))
//!     .build()?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! Arc::new(handler).serve(shutdown_rx).await?;
//! ```

use super::conn::{
    Connection, ProxyRequest, ProxyResponse, ResponseSink, text_response, wants_close,
};
use super::error::{ProxyError, ProxyResult};
use super::filter::Filter;
use super::listener::{Accepted, Listener, dial_addr};
use super::reinject::{LoopbackReinjector, PushReinjector, Reinjector};
use crate::telemetry::{AuditEvent, AuditLogger};
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Default cap on a request head.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;

/// Default idle timeout for relays started by filters.
pub const DEFAULT_RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Pause after a failed accept before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Handler settings.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Cap on a request head, in bytes.
    pub max_head_bytes: usize,
    /// Idle timeout for relays; `None` keeps them open until EOF or error.
    pub relay_idle_timeout: Option<Duration>,
    /// Re-inject through the listener's push capability when it has one.
    pub push: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            relay_idle_timeout: Some(DEFAULT_RELAY_IDLE_TIMEOUT),
            push: true,
        }
    }
}

/// Dispatches requests from a listener through an ordered filter list.
pub struct Handler {
    filters: Vec<Arc<dyn Filter>>,
    listener: Arc<dyn Listener>,
    reinjector: Arc<dyn Reinjector>,
    config: HandlerConfig,
    audit: Arc<AuditLogger>,
}

impl Handler {
    /// Start building a Handler.
    pub fn builder() -> HandlerBuilder {
        HandlerBuilder::new()
    }

    /// The filters, in dispatch order.
    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    /// The listener this Handler accepts from.
    pub fn listener(&self) -> &Arc<dyn Listener> {
        &self.listener
    }

    /// Strategy for putting decrypted streams back into the pipeline.
    pub fn reinjector(&self) -> &Arc<dyn Reinjector> {
        &self.reinjector
    }

    /// Handler settings.
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Audit logger.
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Bound listener address.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until `shutdown` turns true.
    ///
    /// Connections already being served are left to finish on their own.
    pub async fn serve(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> ProxyResult<()> {
        info!("Proxy listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => self.spawn_connection(accepted),
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, accepted: Accepted) {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let remote = accepted.info.remote();
            let conn = Connection::new(accepted.stream, accepted.info);
            if let Err(e) = handler.serve_connection(conn).await {
                // Resets and broken pipes are routine on a forward proxy.
                if e.is_connection_closed() {
                    debug!("Connection from {} ended: {}", remote, e);
                } else {
                    warn!("Connection from {} failed: {}", remote, e);
                }
            }
        });
    }

    /// Serve every request on one connection.
    pub async fn serve_connection(&self, conn: Connection) -> ProxyResult<()> {
        let mut sink = ResponseSink::from_connection(conn);

        loop {
            let Some(conn) = sink.connection_mut() else {
                break;
            };
            let remote = conn.info().remote();

            let req = match conn.read_request_head(self.config.max_head_bytes).await {
                Ok(Some(req)) => req,
                Ok(None) => {
                    trace!("Client {} closed the connection", remote);
                    break;
                }
                Err(
                    e @ (ProxyError::BadRequest(_)
                    | ProxyError::HeadTooLarge(_)
                    | ProxyError::TooManyHeaders(_)),
                ) => {
                    let status = match e {
                        ProxyError::HeadTooLarge(_) | ProxyError::TooManyHeaders(_) => {
                            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
                        }
                        _ => StatusCode::BAD_REQUEST,
                    };
                    let _ = sink.write_response(&text_response(status, format!("{}\n", e))).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            let client_close = wants_close(&req);
            let method = req.method().clone();
            let target = req.uri().clone();

            match self.dispatch(req, &mut sink).await {
                Ok(Some(resp)) => {
                    trace!("{} {} -> {}", method, target, resp.status());
                    sink.write_response(&resp).await?;
                }
                Ok(None) => trace!("{} {} handled by filter", method, target),
                Err(e @ ProxyError::Unhandled { .. }) => {
                    self.audit.log(AuditEvent::UnhandledRequest {
                        remote,
                        method: method.to_string(),
                        target: target.to_string(),
                    });
                    if !sink.is_hijacked() {
                        let resp = text_response(StatusCode::BAD_GATEWAY, format!("{}\n", e));
                        let _ = sink.write_response(&resp).await;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }

            // An unread body would be parsed as the next request head.
            let body_left = sink.connection_mut().is_some_and(|conn| conn.body_pending());
            if sink.is_hijacked() || client_close || body_left || sink.closes_after_response() {
                break;
            }
        }

        if let Err(e) = sink.close().await {
            trace!("Error closing client connection: {}", e);
        }
        Ok(())
    }

    /// Route one request to the first filter that claims it.
    ///
    /// Fails with [`ProxyError::Unhandled`] when no filter does.
    pub async fn dispatch(
        &self,
        req: ProxyRequest,
        sink: &mut ResponseSink,
    ) -> ProxyResult<Option<ProxyResponse>> {
        for filter in &self.filters {
            if let Some(args) = filter.matches(&req)? {
                trace!("{} {} claimed by {}", req.method(), req.uri(), filter.name());
                return filter.handle(self, args, sink, req).await;
            }
        }

        Err(ProxyError::Unhandled {
            method: req.method().to_string(),
            target: req.uri().to_string(),
        })
    }
}

/// Builder for [`Handler`].
pub struct HandlerBuilder {
    filters: Vec<Arc<dyn Filter>>,
    listener: Option<Arc<dyn Listener>>,
    config: HandlerConfig,
    audit: Option<Arc<AuditLogger>>,
}

impl HandlerBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            listener: None,
            config: HandlerConfig::default(),
            audit: None,
        }
    }

    /// Append a filter. Filters are consulted in the order added.
    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Set the listener.
    pub fn listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Prefer in-process re-injection when the listener supports it.
    pub fn push(mut self, push: bool) -> Self {
        self.config.push = push;
        self
    }

    /// Replace all settings.
    pub fn config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the audit logger. Defaults to a null logger.
    pub fn audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Build the Handler.
    ///
    /// The re-injection strategy is fixed here: push when enabled and the
    /// listener offers it, loopback otherwise.
    pub fn build(self) -> ProxyResult<Handler> {
        let listener = self
            .listener
            .ok_or_else(|| ProxyError::Configuration("handler requires a listener".into()))?;

        let reinjector: Arc<dyn Reinjector> = match listener.as_push().filter(|_| self.config.push) {
            Some(pusher) => Arc::new(PushReinjector::new(pusher)),
            None => {
                let loopback = LoopbackReinjector::new(
                    dial_addr(listener.local_addr()?),
                    self.config.relay_idle_timeout,
                );
                match listener.intercepted_peers() {
                    Some(peers) => Arc::new(loopback.with_peers(peers)),
                    None => Arc::new(loopback),
                }
            }
        };
        debug!("Re-injecting intercepted streams via {:?}", reinjector.path());

        Ok(Handler {
            filters: self.filters,
            listener,
            reinjector,
            config: self.config,
            audit: self.audit.unwrap_or_else(|| Arc::new(AuditLogger::new_null())),
        })
    }
}

impl Default for HandlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::conn::ConnInfo;
    use crate::proxy::filter::FilterArgs;
    use crate::proxy::listener::{PushableListener, TcpProxyListener};
    use crate::telemetry::ReinjectPath;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    /// Claims requests for one path and answers with a fixed body.
    struct PathFilter {
        path: &'static str,
        body: &'static str,
        calls: AtomicUsize,
    }

    impl PathFilter {
        fn new(path: &'static str, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                path,
                body,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Filter for PathFilter {
        fn name(&self) -> &'static str {
            "path"
        }

        fn matches(&self, req: &ProxyRequest) -> ProxyResult<Option<FilterArgs>> {
            Ok((req.uri().path() == self.path).then(FilterArgs::new))
        }

        async fn handle(
            &self,
            _handler: &Handler,
            _args: FilterArgs,
            _sink: &mut ResponseSink,
            _req: ProxyRequest,
        ) -> ProxyResult<Option<ProxyResponse>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(http::Response::new(Bytes::from_static(
                self.body.as_bytes(),
            ))))
        }
    }

    /// Fails every match.
    struct BrokenFilter;

    #[async_trait]
    impl Filter for BrokenFilter {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn matches(&self, _req: &ProxyRequest) -> ProxyResult<Option<FilterArgs>> {
            Err(ProxyError::Configuration("broken".into()))
        }

        async fn handle(
            &self,
            _handler: &Handler,
            _args: FilterArgs,
            _sink: &mut ResponseSink,
            _req: ProxyRequest,
        ) -> ProxyResult<Option<ProxyResponse>> {
            unreachable!("never matches")
        }
    }

    async fn handler_with(filters: Vec<Arc<dyn Filter>>) -> Handler {
        let listener = TcpProxyListener::bind("127.0.0.1:0").await.unwrap();
        filters
            .into_iter()
            .fold(Handler::builder(), |b, f| b.filter(f))
            .listener(Arc::new(listener))
            .build()
            .unwrap()
    }

    fn get(path: &str) -> ProxyRequest {
        Request::builder().uri(path).body(()).unwrap()
    }

    fn sink() -> ResponseSink {
        let (_client, server) = duplex(1024);
        ResponseSink::from_writer(server)
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let first = PathFilter::new("/a", "first");
        let second = PathFilter::new("/a", "second");
        let handler = handler_with(vec![first.clone() as Arc<dyn Filter>, second.clone()]).await;

        let resp = handler.dispatch(get("/a"), &mut sink()).await.unwrap().unwrap();
        assert_eq!(resp.body().as_ref(), b"first");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_declined_requests_fall_through() {
        let a = PathFilter::new("/a", "a");
        let b = PathFilter::new("/b", "b");
        let handler = handler_with(vec![a.clone() as Arc<dyn Filter>, b.clone()]).await;

        let resp = handler.dispatch(get("/b"), &mut sink()).await.unwrap().unwrap();
        assert_eq!(resp.body().as_ref(), b"b");
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unhandled_request() {
        let handler = handler_with(vec![PathFilter::new("/a", "a") as Arc<dyn Filter>]).await;
        let err = handler.dispatch(get("/zzz"), &mut sink()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Unhandled { .. }));
    }

    #[tokio::test]
    async fn test_match_error_aborts_dispatch() {
        let later = PathFilter::new("/a", "a");
        let handler =
            handler_with(vec![Arc::new(BrokenFilter) as Arc<dyn Filter>, later.clone()]).await;

        let err = handler.dispatch(get("/a"), &mut sink()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reinjector_selection() {
        let tcp = TcpProxyListener::bind("127.0.0.1:0").await.unwrap();
        let handler = Handler::builder().listener(Arc::new(tcp)).build().unwrap();
        assert_eq!(handler.reinjector().path(), ReinjectPath::Loopback);

        let pushable = PushableListener::bind("127.0.0.1:0").await.unwrap();
        let handler = Handler::builder()
            .listener(Arc::new(pushable))
            .build()
            .unwrap();
        assert_eq!(handler.reinjector().path(), ReinjectPath::Push);

        let pushable = PushableListener::bind("127.0.0.1:0").await.unwrap();
        let handler = Handler::builder()
            .listener(Arc::new(pushable))
            .push(false)
            .build()
            .unwrap();
        assert_eq!(handler.reinjector().path(), ReinjectPath::Loopback);
    }

    #[test]
    fn test_build_requires_listener() {
        assert!(matches!(
            Handler::builder().build(),
            Err(ProxyError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_connection_keep_alive_and_unhandled() {
        let audit = Arc::new(AuditLogger::new_memory());
        let listener = TcpProxyListener::bind("127.0.0.1:0").await.unwrap();
        let handler = Handler::builder()
            .filter(PathFilter::new("/a", "hello"))
            .listener(Arc::new(listener))
            .audit(audit.clone())
            .build()
            .unwrap();

        let (mut client, server) = duplex(4096);
        let conn = Connection::new(Box::new(server), ConnInfo::default());
        let serving = tokio::spawn(async move { handler.serve_connection(conn).await });

        client
            .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        let first = out.find("HTTP/1.1 200 OK").unwrap();
        let second = out.find("HTTP/1.1 502 Bad Gateway").unwrap();
        assert!(first < second);
        assert!(out.contains("hello"));

        let err = serving.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::Unhandled { .. }));

        let events = audit.recorded();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("\"event\":\"unhandled_request\""));
        assert!(events[0].contains("/nope"));
    }

    #[tokio::test]
    async fn test_connect_without_interception_gets_502() {
        let handler = handler_with(vec![Arc::new(crate::proxy::DirectFilter::new())]).await;
        let (mut client, server) = duplex(4096);
        let conn = Connection::new(Box::new(server), ConnInfo::default());
        let serving = tokio::spawn(async move { handler.serve_connection(conn).await });

        client
            .write_all(b"CONNECT a.example:443 HTTP/1.1\r\nHost: a.example:443\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));

        let err = serving.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::Unhandled { .. }));
    }

    #[tokio::test]
    async fn test_malformed_head_gets_400() {
        let handler = handler_with(vec![]).await;
        let (mut client, server) = duplex(4096);
        let conn = Connection::new(Box::new(server), ConnInfo::default());
        let serving = tokio::spawn(async move { handler.serve_connection(conn).await });

        client.write_all(b"\x00\x01garbage\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert!(serving.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_oversized_head_gets_431() {
        let listener = TcpProxyListener::bind("127.0.0.1:0").await.unwrap();
        let handler = Handler::builder()
            .listener(Arc::new(listener))
            .config(HandlerConfig {
                max_head_bytes: 1024,
                ..HandlerConfig::default()
            })
            .build()
            .unwrap();
        let (mut client, server) = duplex(16 * 1024);
        let conn = Connection::new(Box::new(server), ConnInfo::default());
        let serving = tokio::spawn(async move { handler.serve_connection(conn).await });

        let head = format!(
            "GET /a HTTP/1.1\r\nHost: x\r\nX-Filler: {}\r\n\r\n",
            "f".repeat(4096)
        );
        client.write_all(head.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 431 Request Header Fields Too Large\r\n"));
        assert!(matches!(
            serving.await.unwrap(),
            Err(ProxyError::HeadTooLarge(1024))
        ));
    }

    #[tokio::test]
    async fn test_unread_body_closes_connection() {
        let handler = handler_with(vec![PathFilter::new("/a", "ok") as Arc<dyn Filter>]).await;
        let (mut client, server) = duplex(4096);
        let conn = Connection::new(Box::new(server), ConnInfo::default());
        let serving = tokio::spawn(async move { handler.serve_connection(conn).await });

        // The body bytes would otherwise be read as a second request.
        client
            .write_all(b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 19\r\n\r\nGET /a HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = TcpProxyListener::bind("127.0.0.1:0").await.unwrap();
        let handler = Arc::new(
            Handler::builder()
                .listener(Arc::new(listener))
                .build()
                .unwrap(),
        );
        let (tx, rx) = watch::channel(false);
        let serving = tokio::spawn(handler.serve(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = HandlerConfig::default();
        assert_eq!(config.max_head_bytes, 65536);
        assert_eq!(config.relay_idle_timeout, Some(Duration::from_secs(300)));
        assert!(config.push);
    }
}
