//! Client connections, request heads and connection hijacking.
//!
//! The Handler reads one HTTP/1 request head at a time from a [`Connection`]
//! and hands filters a [`ResponseSink`]. A filter either returns a response
//! (the Handler writes it through the sink) or takes the raw connection with
//! [`ResponseSink::hijack`], after which the sink is poisoned and the filter
//! owns every further byte.
//!
//! Bytes the client pipelined behind the request head are not lost on
//! hijack: [`HijackedConnection`] replays them before reading the socket.
//!
//! A request body stays on the connection until a filter pulls it with
//! [`Connection::read_body_chunk`], which follows `Content-Length` or
//! chunked framing and stops at the end of the body. The connection is only
//! reused for another request once the body has been read to the end.

use super::error::{ProxyError, ProxyResult};
use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Maximum number of headers accepted in one request head.
const MAX_HEADERS: usize = 96;

/// Initial read buffer capacity.
const READ_BUF_CAPACITY: usize = 8 * 1024;

/// Longest chunk-size or trailer line accepted in a chunked body.
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// A duplex byte stream the proxy can serve.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> ProxyStream for T {}

/// Type-erased duplex stream (TCP socket, TLS session, in-memory pipe).
pub type BoxedStream = Box<dyn ProxyStream>;

/// A parsed request head. Bodies stay on the connection.
pub type ProxyRequest = Request<()>;

/// A complete response produced by a filter.
pub type ProxyResponse = Response<Bytes>;

/// Per-connection metadata, attached to every request parsed from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnInfo {
    /// Peer address of the client, when known.
    pub remote_addr: Option<SocketAddr>,
    /// CONNECT host whose decrypted stream this connection carries, if it
    /// was injected by the interception filter.
    pub intercepted_host: Option<String>,
}

impl ConnInfo {
    /// Metadata for a connection accepted from the network.
    pub fn accepted(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr: Some(remote_addr),
            intercepted_host: None,
        }
    }

    /// Printable peer address for logs.
    pub fn remote(&self) -> String {
        self.remote_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Framing state of the request body still on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Done,
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailers,
}

/// A client connection plus the bytes read from it but not yet consumed.
pub struct Connection {
    stream: BoxedStream,
    buf: BytesMut,
    info: ConnInfo,
    body: BodyState,
}

impl Connection {
    /// Wrap a stream.
    pub fn new(stream: BoxedStream, info: ConnInfo) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            info,
            body: BodyState::Done,
        }
    }

    /// Connection metadata.
    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    /// Read and parse the next request head.
    ///
    /// Returns `Ok(None)` when the client closes the connection cleanly
    /// before sending a byte of a new request. Anything after the head
    /// (body, or TLS bytes after a CONNECT) stays buffered.
    ///
    /// A head longer than `max_head` fails with
    /// [`ProxyError::HeadTooLarge`] no matter how it was split across reads,
    /// and no more than `max_head` bytes are buffered while looking for it.
    pub async fn read_request_head(&mut self, max_head: usize) -> ProxyResult<Option<ProxyRequest>> {
        loop {
            if !self.buf.is_empty()
                && let Some(req) = self.try_parse(max_head)?
            {
                return Ok(Some(req));
            }

            if self.buf.len() >= max_head {
                return Err(ProxyError::HeadTooLarge(max_head));
            }

            let room = (max_head - self.buf.len()) as u64;
            let n = (&mut self.stream).take(room).read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside request head",
                )));
            }
        }
    }

    fn try_parse(&mut self, max_head: usize) -> ProxyResult<Option<ProxyRequest>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);

        let head_len = match parsed.parse(&self.buf) {
            Ok(httparse::Status::Complete(len)) if len > max_head => {
                return Err(ProxyError::HeadTooLarge(max_head));
            }
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(httparse::Error::TooManyHeaders) => {
                return Err(ProxyError::TooManyHeaders(MAX_HEADERS));
            }
            Err(e) => return Err(ProxyError::BadRequest(e.to_string())),
        };

        let method = parsed
            .method
            .ok_or_else(|| ProxyError::BadRequest("missing method".into()))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ProxyError::BadRequest(format!("invalid method: {}", e)))?;

        let target = parsed
            .path
            .ok_or_else(|| ProxyError::BadRequest("missing request target".into()))?;
        let uri = target
            .parse::<Uri>()
            .map_err(|e| ProxyError::BadRequest(format!("invalid target '{}': {}", target, e)))?;

        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .version(version)
            .body(())?;

        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| ProxyError::BadRequest(format!("invalid header name: {}", e)))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| ProxyError::BadRequest(format!("invalid header value: {}", e)))?;
            req.headers_mut().append(name, value);
        }
        req.extensions_mut().insert(self.info.clone());

        self.body = request_body(&req)?;
        self.buf.advance(head_len);
        Ok(Some(req))
    }

    /// Whether part of the current request body has not been read yet.
    pub fn body_pending(&self) -> bool {
        self.body != BodyState::Done
    }

    /// Exact number of body bytes left, when the framing says so.
    ///
    /// `None` for a chunked body that is still being read.
    pub fn body_remaining(&self) -> Option<u64> {
        match self.body {
            BodyState::Done => Some(0),
            BodyState::Length(n) => Some(n),
            _ => None,
        }
    }

    /// Read the next piece of the current request body.
    ///
    /// Returns `Ok(None)` once the body is complete. Chunk framing and
    /// trailers are stripped; only payload bytes are returned.
    pub async fn read_body_chunk(&mut self) -> ProxyResult<Option<Bytes>> {
        loop {
            match self.body {
                BodyState::Done => return Ok(None),
                BodyState::Length(remaining) => {
                    let (chunk, left) = self.take_payload(remaining).await?;
                    self.body = if left == 0 {
                        BodyState::Done
                    } else {
                        BodyState::Length(left)
                    };
                    return Ok(Some(chunk));
                }
                BodyState::ChunkSize => match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete((used, 0))) => {
                        self.buf.advance(used);
                        self.body = BodyState::Trailers;
                    }
                    Ok(httparse::Status::Complete((used, size))) => {
                        self.buf.advance(used);
                        self.body = BodyState::ChunkData(size);
                    }
                    Ok(httparse::Status::Partial) => {
                        if self.buf.len() > MAX_CHUNK_LINE {
                            return Err(ProxyError::BadRequest("chunk size line too long".into()));
                        }
                        self.fill_body().await?;
                    }
                    Err(_) => return Err(ProxyError::BadRequest("invalid chunk size".into())),
                },
                BodyState::ChunkData(remaining) => {
                    let (chunk, left) = self.take_payload(remaining).await?;
                    self.body = if left == 0 {
                        BodyState::ChunkEnd
                    } else {
                        BodyState::ChunkData(left)
                    };
                    return Ok(Some(chunk));
                }
                BodyState::ChunkEnd => {
                    while self.buf.len() < 2 {
                        self.fill_body().await?;
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ProxyError::BadRequest("chunk not terminated by CRLF".into()));
                    }
                    self.buf.advance(2);
                    self.body = BodyState::ChunkSize;
                }
                BodyState::Trailers => match self.buf.windows(2).position(|w| w == b"\r\n") {
                    Some(0) => {
                        self.buf.advance(2);
                        self.body = BodyState::Done;
                    }
                    // Trailer fields are dropped.
                    Some(end) => self.buf.advance(end + 2),
                    None => {
                        if self.buf.len() > MAX_CHUNK_LINE {
                            return Err(ProxyError::BadRequest("trailer line too long".into()));
                        }
                        self.fill_body().await?;
                    }
                },
            }
        }
    }

    /// Up to `remaining` payload bytes, reading the socket if nothing is buffered.
    async fn take_payload(&mut self, remaining: u64) -> ProxyResult<(Bytes, u64)> {
        if self.buf.is_empty() {
            self.fill_body().await?;
        }
        let n = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(self.buf.len());
        Ok((self.buf.split_to(n).freeze(), remaining - n as u64))
    }

    async fn fill_body(&mut self) -> ProxyResult<()> {
        if self.stream.read_buf(&mut self.buf).await? == 0 {
            return Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside request body",
            )));
        }
        Ok(())
    }

    fn into_hijacked(self) -> HijackedConnection {
        HijackedConnection {
            stream: self.stream,
            pending: self.buf.freeze(),
            info: self.info,
        }
    }
}

/// The raw connection detached from the Handler's response path.
///
/// Reads drain bytes that were buffered while parsing the request head
/// before touching the underlying stream.
pub struct HijackedConnection {
    stream: BoxedStream,
    pending: Bytes,
    info: ConnInfo,
}

impl HijackedConnection {
    /// Metadata of the connection this was detached from.
    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    /// Bytes the client already sent that have not been read yet.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

impl AsyncRead for HijackedConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..n]);
            this.pending.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for HijackedConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Body framing of a request, decided from its head.
fn request_body(req: &ProxyRequest) -> ProxyResult<BodyState> {
    if req.method() == Method::CONNECT {
        return Ok(BodyState::Done);
    }
    let headers = req.headers();

    if headers.contains_key(TRANSFER_ENCODING) {
        let last = headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .next_back();
        return match last {
            Some(coding) if coding.eq_ignore_ascii_case("chunked") => Ok(BodyState::ChunkSize),
            _ => Err(ProxyError::BadRequest(
                "request transfer-encoding must end with chunked".into(),
            )),
        };
    }

    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| ProxyError::BadRequest("invalid content-length".into()))?;
        if length.is_some_and(|l| l != parsed) {
            return Err(ProxyError::BadRequest("conflicting content-length values".into()));
        }
        length = Some(parsed);
    }
    Ok(match length {
        Some(n) if n > 0 => BodyState::Length(n),
        _ => BodyState::Done,
    })
}

enum SinkState {
    Connection(Connection),
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
    Hijacked,
}

/// Where a filter's response goes.
///
/// A sink built from a [`Connection`] can be hijacked exactly once; a sink
/// built from a bare writer has no read half and refuses to be hijacked.
pub struct ResponseSink {
    state: SinkState,
    close_after: bool,
}

impl ResponseSink {
    /// A hijackable sink over a full client connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            state: SinkState::Connection(conn),
            close_after: false,
        }
    }

    /// A write-only sink that cannot be hijacked.
    pub fn from_writer(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            state: SinkState::Writer(Box::new(writer)),
            close_after: false,
        }
    }

    /// Whether [`hijack`](Self::hijack) can succeed.
    pub fn can_hijack(&self) -> bool {
        matches!(self.state, SinkState::Connection(_))
    }

    /// Whether the connection has been taken over.
    pub fn is_hijacked(&self) -> bool {
        matches!(self.state, SinkState::Hijacked)
    }

    /// Take ownership of the raw connection.
    ///
    /// After a successful hijack every other operation on the sink fails
    /// with [`ProxyError::AlreadyHijacked`].
    pub fn hijack(&mut self) -> ProxyResult<HijackedConnection> {
        match std::mem::replace(&mut self.state, SinkState::Hijacked) {
            SinkState::Connection(conn) => Ok(conn.into_hijacked()),
            SinkState::Writer(writer) => {
                self.state = SinkState::Writer(writer);
                Err(ProxyError::HijackUnsupported)
            }
            SinkState::Hijacked => Err(ProxyError::AlreadyHijacked),
        }
    }

    /// Mark the connection as finished once the current response is out.
    ///
    /// Used when a response is delimited by closing the connection.
    pub fn close_after_response(&mut self) {
        self.close_after = true;
    }

    /// Whether [`close_after_response`](Self::close_after_response) was called.
    pub fn closes_after_response(&self) -> bool {
        self.close_after
    }

    /// Serialize and write a response.
    pub async fn write_response(&mut self, resp: &ProxyResponse) -> ProxyResult<()> {
        self.write_bytes(&encode_response(resp)).await?;
        self.flush().await
    }

    /// Write raw bytes, for filters that stream a response themselves.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        match &mut self.state {
            SinkState::Connection(conn) => conn.stream.write_all(bytes).await?,
            SinkState::Writer(writer) => writer.write_all(bytes).await?,
            SinkState::Hijacked => return Err(ProxyError::AlreadyHijacked),
        }
        Ok(())
    }

    /// Flush buffered response bytes.
    pub async fn flush(&mut self) -> ProxyResult<()> {
        match &mut self.state {
            SinkState::Connection(conn) => conn.stream.flush().await?,
            SinkState::Writer(writer) => writer.flush().await?,
            SinkState::Hijacked => return Err(ProxyError::AlreadyHijacked),
        }
        Ok(())
    }

    /// Shut down the write side, if the sink still owns it.
    pub async fn close(&mut self) -> ProxyResult<()> {
        match &mut self.state {
            SinkState::Connection(conn) => conn.stream.shutdown().await?,
            SinkState::Writer(writer) => writer.shutdown().await?,
            SinkState::Hijacked => {}
        }
        Ok(())
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut Connection> {
        match &mut self.state {
            SinkState::Connection(conn) => Some(conn),
            _ => None,
        }
    }
}

/// Whether the client asked to close the connection after this request.
pub fn wants_close(req: &ProxyRequest) -> bool {
    let close_token = |name: &str| {
        req.headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case("close"))
    };
    req.version() == Version::HTTP_10 || close_token("connection") || close_token("proxy-connection")
}

/// Split a `host[:port]` authority.
///
/// Bracketed IPv6 literals lose their brackets. A missing port yields
/// `default_port`.
pub fn split_host_port(authority: &str, default_port: u16) -> ProxyResult<(String, u16)> {
    let invalid_port =
        |port: &str| ProxyError::BadRequest(format!("Invalid port in '{}': {}", authority, port));

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::BadRequest(format!("Unterminated IPv6 literal: {}", authority)))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse::<u16>().map_err(|_| invalid_port(port))?,
            None if tail.is_empty() => default_port,
            None => return Err(invalid_port(tail)),
        };
        return Ok((host.to_string(), port));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid_port(port))?),
        None => (authority, default_port),
    };
    if host.is_empty() {
        return Err(ProxyError::BadRequest(format!("Missing host in '{}'", authority)));
    }
    Ok((host.to_string(), port))
}

/// A short `text/plain` response.
pub fn text_response(status: StatusCode, message: impl Into<String>) -> ProxyResponse {
    let mut resp = Response::new(Bytes::from(message.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Whether responses with `status` never carry a body.
pub fn is_bodyless(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

fn push_head_lines(out: &mut Vec<u8>, status: StatusCode, headers: &HeaderMap) {
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )
        .as_bytes(),
    );

    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

/// Serialize a status line and header block, including the blank line.
pub fn encode_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    push_head_lines(&mut out, status, headers);
    out.extend_from_slice(b"\r\n");
    out
}

/// Serialize a response as HTTP/1.1.
///
/// `Content-Length` is filled in when missing, except for statuses that
/// never carry a body.
pub fn encode_response(resp: &ProxyResponse) -> Vec<u8> {
    let status = resp.status();
    let body = resp.body();
    let mut out = Vec::with_capacity(128 + body.len());

    push_head_lines(&mut out, status, resp.headers());

    let bodyless = is_bodyless(status);
    if !bodyless && !resp.headers().contains_key(CONTENT_LENGTH) {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }

    out.extend_from_slice(b"\r\n");
    if !bodyless {
        out.extend_from_slice(body);
    }
    out
}
