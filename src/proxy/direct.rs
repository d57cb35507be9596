//! Direct-dial forwarding for ordinary (non-CONNECT) requests.
//!
//! The filter resolves the target from an absolute request URI or the
//! `Host` header, dials it and runs hyper's HTTP/1 client over the dialed
//! stream. The request body is streamed from the client connection as the
//! client sends it; the response is streamed back with its own framing, so
//! the client connection stays usable for the next request.
//!
//! Requests that arrive on a decrypted tunnel carry the CONNECT host in
//! [`ConnInfo::intercepted_host`] (whether they were pushed or came back over
//! the loopback relay) and are forwarded over TLS to that host.
//!
//! A `101 Switching Protocols` answer hands both connections to a raw relay.

use super::conn::{
    BoxedStream, ConnInfo, ProxyRequest, ProxyResponse, ResponseSink, encode_head, is_bodyless,
    split_host_port, text_response, wants_close,
};
use super::error::{ProxyError, ProxyResult};
use super::filter::{Filter, FilterArgs};
use super::handler::Handler;
use super::relay;
use super::tls::{create_tls_connector, domain_to_server_name};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    CONNECTION, CONTENT_LENGTH, EXPECT, HOST, HeaderMap, HeaderValue, TRANSFER_ENCODING, UPGRADE,
};
use http::{Method, Request, Response, StatusCode, Version};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

/// Default bound on dialing the upstream.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that only concern one hop.
const HOP_HEADERS: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request body pieces buffered between the client and hyper.
const BODY_CHANNEL_CAPACITY: usize = 4;

/// Where a request is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether to speak TLS to the upstream.
    pub tls: bool,
}

impl Upstream {
    /// `host:port` suitable for dialing.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for a `Host` header naming this upstream.
    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            self.addr()
        }
    }
}

/// Resolve the upstream for an ordinary request.
///
/// Returns `None` when the request names no host at all.
pub fn resolve_upstream(req: &ProxyRequest) -> Option<Upstream> {
    let intercepted = req
        .extensions()
        .get::<ConnInfo>()
        .and_then(|info| info.intercepted_host.as_ref())
        .is_some();

    let uri = req.uri();
    let tls = match uri.scheme_str() {
        Some(scheme) => scheme.eq_ignore_ascii_case("https"),
        None => intercepted,
    };
    let default_port = if tls { 443 } else { 80 };

    let authority = match uri.authority() {
        Some(authority) => authority.as_str().to_string(),
        None => req.headers().get(HOST)?.to_str().ok()?.trim().to_string(),
    };
    // Userinfo never goes upstream.
    let authority = authority.rsplit('@').next().unwrap_or_default();

    let (host, port) = split_host_port(authority, default_port).ok()?;
    Some(Upstream { host, port, tls })
}

/// Header names listed in `Connection`, lowercased.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Whether the client asks to switch protocols on this connection.
fn is_upgrade(req: &ProxyRequest) -> bool {
    req.headers().contains_key(UPGRADE)
        && connection_tokens(req.headers()).iter().any(|t| t == "upgrade")
}

/// Drop hop-by-hop headers, including those the `Connection` header names.
///
/// Names in `keep` survive.
fn strip_hop_headers(headers: &mut HeaderMap, keep: &[&str]) {
    let named = connection_tokens(headers);
    for name in HOP_HEADERS.iter().copied().chain(named.iter().map(String::as_str)) {
        if !keep.contains(&name) {
            headers.remove(name);
        }
    }
}

/// The request head sent upstream: origin form, HTTP/1.1, no hop headers.
fn upstream_request(req: &ProxyRequest, upstream: &Upstream) -> ProxyResult<Request<()>> {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");

    let mut out = Request::builder()
        .method(req.method().clone())
        .uri(target)
        .version(Version::HTTP_11)
        .body(())?;

    let mut headers = req.headers().clone();
    let chunked = headers.contains_key(TRANSFER_ENCODING);
    if is_upgrade(req) {
        strip_hop_headers(&mut headers, &["upgrade"]);
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    } else {
        strip_hop_headers(&mut headers, &[]);
    }
    // The body is re-framed by the client connection.
    if chunked {
        headers.remove(CONTENT_LENGTH);
    }
    // Continue was already answered to the client.
    headers.remove(EXPECT);
    if !headers.contains_key(HOST) {
        let host = HeaderValue::from_str(&upstream.host_header())
            .map_err(|e| ProxyError::BadRequest(format!("invalid upstream host: {}", e)))?;
        headers.insert(HOST, host);
    }

    *out.headers_mut() = headers;
    Ok(out)
}

fn expects_continue(req: &ProxyRequest) -> bool {
    req.headers()
        .get(EXPECT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
}

/// Request body fed from the client connection through a channel.
struct RequestBody {
    rx: Option<mpsc::Receiver<io::Result<Bytes>>>,
    remaining: Option<u64>,
}

impl RequestBody {
    fn empty() -> Self {
        Self {
            rx: None,
            remaining: Some(0),
        }
    }

    fn channel(remaining: Option<u64>) -> (mpsc::Sender<io::Result<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (
            tx,
            Self {
                rx: Some(rx),
                remaining,
            },
        )
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(data))) => {
                if let Some(remaining) = this.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(data.len() as u64);
                }
                Poll::Ready(Some(Ok(Frame::data(data))))
            }
            Poll::Ready(Some(Err(e))) => {
                this.rx = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.rx = None;
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.rx.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match (&self.rx, self.remaining) {
            (None, _) => SizeHint::with_exact(0),
            (Some(_), Some(n)) => SizeHint::with_exact(n),
            (Some(_), None) => SizeHint::default(),
        }
    }
}

/// Move the current request body from the client into `tx`.
///
/// Stops early when hyper drops the body; the unread rest keeps the client
/// connection from being reused.
async fn pump_body(
    sink: &mut ResponseSink,
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
) -> ProxyResult<()> {
    let (Some(tx), Some(conn)) = (tx, sink.connection_mut()) else {
        return Ok(());
    };
    loop {
        match conn.read_body_chunk().await {
            Ok(Some(chunk)) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    trace!("Upstream stopped reading the request body");
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                return Err(e);
            }
        }
    }
}

/// How a streamed response body is delimited towards the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length,
    Chunked,
    Close,
}

/// Forwards ordinary requests straight to their origin.
pub struct DirectFilter {
    connector: Option<TlsConnector>,
    connect_timeout: Duration,
}

impl DirectFilter {
    /// Filter using the system trust store for TLS upstreams.
    ///
    /// Without a usable trust store, TLS upstreams fail with 502.
    pub fn new() -> Self {
        let connector = match create_tls_connector() {
            Ok(connector) => Some(connector),
            Err(e) => {
                warn!("TLS upstreams unavailable: {}", e);
                None
            }
        };
        Self {
            connector,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Use `connector` for TLS upstreams.
    pub fn with_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Bound on dialing the upstream.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn dial(&self, upstream: &Upstream) -> ProxyResult<BoxedStream> {
        let addr = upstream.addr();
        let connect_err = |message: String| ProxyError::UpstreamConnect {
            addr: addr.clone(),
            message,
        };

        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((upstream.host.as_str(), upstream.port)),
        )
        .await
        .map_err(|_| connect_err("connect timed out".into()))?
        .map_err(|e| connect_err(e.to_string()))?;
        let _ = tcp.set_nodelay(true);

        if !upstream.tls {
            return Ok(Box::new(tcp));
        }

        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| ProxyError::Tls("no trust store for TLS upstreams".into()))?;
        let server_name = domain_to_server_name(&upstream.host)?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Tls(format!("Upstream TLS handshake failed: {}", e)))?;
        Ok(Box::new(tls))
    }

    /// Write the upstream response to the client as it arrives.
    async fn stream_response(
        &self,
        sink: &mut ResponseSink,
        req: &ProxyRequest,
        resp: Response<Incoming>,
        upstream: &Upstream,
    ) -> ProxyResult<()> {
        let (parts, mut body) = resp.into_parts();
        let mut headers = parts.headers;

        if headers.contains_key(TRANSFER_ENCODING) {
            headers.remove(CONTENT_LENGTH);
        }
        strip_hop_headers(&mut headers, &[]);

        let framing = if req.method() == Method::HEAD || is_bodyless(parts.status) {
            Framing::Empty
        } else if headers.contains_key(CONTENT_LENGTH) {
            Framing::Length
        } else if req.version() == Version::HTTP_11 {
            headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            Framing::Chunked
        } else {
            Framing::Close
        };
        if framing == Framing::Close || wants_close(req) {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
            sink.close_after_response();
        }

        sink.write_bytes(&encode_head(parts.status, &headers)).await?;
        if framing == Framing::Empty {
            return sink.flush().await;
        }

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| ProxyError::UpstreamRequest {
                addr: upstream.addr(),
                message: e.to_string(),
            })?;
            // Trailers are not forwarded.
            let Ok(data) = frame.into_data() else {
                continue;
            };
            if data.is_empty() {
                continue;
            }
            if framing == Framing::Chunked {
                sink.write_bytes(format!("{:x}\r\n", data.len()).as_bytes()).await?;
                sink.write_bytes(&data).await?;
                sink.write_bytes(b"\r\n").await?;
            } else {
                sink.write_bytes(&data).await?;
            }
            sink.flush().await?;
        }

        if framing == Framing::Chunked {
            sink.write_bytes(b"0\r\n\r\n").await?;
        }
        sink.flush().await
    }

    /// Relay raw bytes once the upstream agreed to switch protocols.
    async fn switch_protocols(
        &self,
        handler: &Handler,
        sink: &mut ResponseSink,
        mut resp: Response<Incoming>,
        upstream: &Upstream,
    ) -> ProxyResult<()> {
        let on_upgrade = hyper::upgrade::on(&mut resp);
        sink.write_bytes(&encode_head(resp.status(), resp.headers())).await?;
        sink.flush().await?;

        let upgraded = on_upgrade.await.map_err(|e| ProxyError::UpstreamRequest {
            addr: upstream.addr(),
            message: e.to_string(),
        })?;
        let client = sink.hijack()?;
        let stats = relay::link(
            client,
            TokioIo::new(upgraded),
            handler.config().relay_idle_timeout,
        )
        .join()
        .await;
        debug!(
            "Closed upgraded connection to {} ({} bytes up, {} bytes down)",
            upstream.addr(),
            stats.forward,
            stats.backward
        );
        Ok(())
    }
}

impl Default for DirectFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn bad_gateway(upstream: &Upstream) -> ProxyResponse {
    text_response(
        StatusCode::BAD_GATEWAY,
        format!("Failed to reach {}\n", upstream.addr()),
    )
}

#[async_trait]
impl Filter for DirectFilter {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn matches(&self, req: &ProxyRequest) -> ProxyResult<Option<FilterArgs>> {
        if req.method() == Method::CONNECT {
            return Ok(None);
        }
        Ok(resolve_upstream(req).map(|upstream| FilterArgs::new().with(upstream)))
    }

    async fn handle(
        &self,
        handler: &Handler,
        mut args: FilterArgs,
        sink: &mut ResponseSink,
        req: ProxyRequest,
    ) -> ProxyResult<Option<ProxyResponse>> {
        let upstream = args
            .remove::<Upstream>()
            .ok_or_else(|| ProxyError::Configuration("direct filter invoked without upstream".into()))?;
        debug!(
            "Forwarding {} {} to {} (tls: {})",
            req.method(),
            req.uri(),
            upstream.addr(),
            upstream.tls
        );

        let stream = match self.dial(&upstream).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Upstream {} unreachable: {}", upstream.addr(), e);
                return Ok(Some(bad_gateway(&upstream)));
            }
        };

        let (mut sender, connection) =
            match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("HTTP handshake with {} failed: {}", upstream.addr(), e);
                    return Ok(Some(bad_gateway(&upstream)));
                }
            };
        let addr = upstream.addr();
        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!("Upstream connection to {} ended: {}", addr, e);
            }
        });

        let body_pending = sink.connection_mut().is_some_and(|conn| conn.body_pending());
        let (tx, body) = if body_pending {
            if expects_continue(&req) {
                sink.write_bytes(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
                sink.flush().await?;
            }
            let remaining = sink.connection_mut().and_then(|conn| conn.body_remaining());
            let (tx, body) = RequestBody::channel(remaining);
            (Some(tx), body)
        } else {
            (None, RequestBody::empty())
        };

        let outbound = upstream_request(&req, &upstream)?.map(|()| body);
        let (sent, pumped) = tokio::join!(sender.send_request(outbound), pump_body(sink, tx));
        pumped?;

        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Request to {} failed: {}", upstream.addr(), e);
                return Ok(Some(bad_gateway(&upstream)));
            }
        };
        trace!("{} answered {}", upstream.addr(), resp.status());

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            self.switch_protocols(handler, sink, resp, &upstream).await?;
        } else {
            self.stream_response(sink, &req, resp, &upstream).await?;
        }
        Ok(None)
    }
}
