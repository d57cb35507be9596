//! Listeners the Handler accepts client connections from.
//!
//! Every listener reports a dialable bind address. A listener may also
//! expose a [`PushListener`] handle that injects an already-established
//! stream into its accept path without a network round trip; the Handler
//! uses it to re-inject decrypted CONNECT tunnels.
//!
//! TCP listeners also share an [`InterceptedPeers`] table with the loopback
//! reinjector, so a decrypted stream that comes back over loopback is
//! accepted with the CONNECT host it belongs to.

use super::conn::{BoxedStream, ConnInfo};
use super::error::{ProxyError, ProxyResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace};

/// A connection produced by [`Listener::accept`].
pub struct Accepted {
    /// The client stream.
    pub stream: BoxedStream,
    /// Metadata for the connection.
    pub info: ConnInfo,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted").field("info", &self.info).finish()
    }
}

/// Source of client connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next connection.
    async fn accept(&self) -> io::Result<Accepted>;

    /// The bound address.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// In-process injection handle, if this listener supports one.
    fn as_push(&self) -> Option<Arc<dyn PushListener>> {
        None
    }

    /// Table consulted to tag loopback connections, if this listener keeps one.
    fn intercepted_peers(&self) -> Option<InterceptedPeers> {
        None
    }
}

/// CONNECT hosts keyed by the local address of loopback relay sockets.
///
/// The loopback reinjector registers its socket address before dialing; the
/// listener claims the entry when it accepts a connection from that address.
#[derive(Debug, Clone, Default)]
pub struct InterceptedPeers {
    hosts: Arc<std::sync::Mutex<HashMap<SocketAddr, String>>>,
}

impl InterceptedPeers {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_hosts<T>(&self, f: impl FnOnce(&mut HashMap<SocketAddr, String>) -> T) -> T {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut hosts)
    }

    /// Record that a connection from `peer` carries `host`.
    pub fn register(&self, peer: SocketAddr, host: impl Into<String>) {
        let host = host.into();
        self.with_hosts(|hosts| hosts.insert(peer, host));
    }

    /// Drop the entry for `peer` without claiming it.
    pub fn forget(&self, peer: SocketAddr) {
        self.with_hosts(|hosts| hosts.remove(&peer));
    }

    /// Take the host registered for `peer`.
    pub fn claim(&self, peer: SocketAddr) -> Option<String> {
        self.with_hosts(|hosts| hosts.remove(&peer))
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.with_hosts(|hosts| hosts.len())
    }

    /// Whether no entry is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Injects established streams into a listener's accept path.
pub trait PushListener: Send + Sync {
    /// Queue `stream` so the next `accept` returns it with `info`.
    fn push(&self, stream: BoxedStream, info: ConnInfo) -> ProxyResult<()>;
}

/// Address to dial to reach a listener bound at `addr`.
///
/// Wildcard binds are reached over loopback of the same family.
pub fn dial_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), v4.port())
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), v6.port())
        }
        other => other,
    }
}

async fn accept_tcp(tcp: &TcpListener, peers: &InterceptedPeers) -> io::Result<Accepted> {
    let (stream, remote) = tcp.accept().await?;
    if let Err(e) = stream.set_nodelay(true) {
        trace!("Failed to set TCP_NODELAY for {}: {}", remote, e);
    }
    let mut info = ConnInfo::accepted(remote);
    info.intercepted_host = peers.claim(remote);
    trace!(
        "Accepted TCP connection from {} (host: {:?})",
        remote, info.intercepted_host
    );
    Ok(Accepted {
        stream: Box::new(stream),
        info,
    })
}

/// Plain TCP listener with no push capability.
pub struct TcpProxyListener {
    tcp: TcpListener,
    peers: InterceptedPeers,
}

impl TcpProxyListener {
    /// Bind to `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Ok(Self {
            tcp: TcpListener::bind(addr).await?,
            peers: InterceptedPeers::new(),
        })
    }
}

#[async_trait]
impl Listener for TcpProxyListener {
    async fn accept(&self) -> io::Result<Accepted> {
        accept_tcp(&self.tcp, &self.peers).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    fn intercepted_peers(&self) -> Option<InterceptedPeers> {
        Some(self.peers.clone())
    }
}

/// Sending half of a [`PushableListener`]'s injection queue.
#[derive(Clone)]
pub struct Pusher {
    tx: mpsc::UnboundedSender<Accepted>,
}

impl PushListener for Pusher {
    fn push(&self, stream: BoxedStream, info: ConnInfo) -> ProxyResult<()> {
        debug!(
            "Injecting stream from {} (host: {:?})",
            info.remote(),
            info.intercepted_host
        );
        self.tx
            .send(Accepted { stream, info })
            .map_err(|_| ProxyError::PushFailed("listener is closed".into()))
    }
}

/// TCP listener that also accepts in-process injected streams.
///
/// Injected streams take priority over pending TCP accepts.
pub struct PushableListener {
    tcp: TcpListener,
    injected: Mutex<mpsc::UnboundedReceiver<Accepted>>,
    pusher: Arc<Pusher>,
    peers: InterceptedPeers,
}

impl PushableListener {
    /// Bind to `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            tcp,
            injected: Mutex::new(rx),
            pusher: Arc::new(Pusher { tx }),
            peers: InterceptedPeers::new(),
        })
    }
}

#[async_trait]
impl Listener for PushableListener {
    async fn accept(&self) -> io::Result<Accepted> {
        let mut injected = self.injected.lock().await;
        tokio::select! {
            biased;
            Some(accepted) = injected.recv() => Ok(accepted),
            res = accept_tcp(&self.tcp, &self.peers) => res,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    fn as_push(&self) -> Option<Arc<dyn PushListener>> {
        Some(self.pusher.clone())
    }

    fn intercepted_peers(&self) -> Option<InterceptedPeers> {
        Some(self.peers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::net::TcpStream;

    #[test]
    fn test_dial_addr_maps_wildcards() {
        let v4: SocketAddr = "0.0.0.0:8087".parse().unwrap();
        assert_eq!(dial_addr(v4), "127.0.0.1:8087".parse().unwrap());

        let v6: SocketAddr = "[::]:8087".parse().unwrap();
        assert_eq!(dial_addr(v6), "[::1]:8087".parse().unwrap());

        let fixed: SocketAddr = "10.0.0.5:3128".parse().unwrap();
        assert_eq!(dial_addr(fixed), fixed);
    }

    #[tokio::test]
    async fn test_tcp_listener_has_no_push() {
        let listener = TcpProxyListener::bind("127.0.0.1:0").await.unwrap();
        assert!(listener.as_push().is_none());

        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let accepted = listener.accept().await.unwrap();
        let client = client.await.unwrap();

        assert_eq!(accepted.info.remote_addr, Some(client.local_addr().unwrap()));
        assert!(accepted.info.intercepted_host.is_none());
    }

    #[tokio::test]
    async fn test_registered_peer_is_accepted_with_host() {
        let listener = TcpProxyListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peers = listener.intercepted_peers().unwrap();

        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        peers.register(socket.local_addr().unwrap(), "a.example");
        let _tagged = socket.connect(addr).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.info.intercepted_host.as_deref(), Some("a.example"));
        assert!(peers.is_empty());

        let _plain = TcpStream::connect(addr).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        assert!(accepted.info.intercepted_host.is_none());
    }

    #[test]
    fn test_forget_drops_entry() {
        let peers = InterceptedPeers::new();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        peers.register(peer, "a.example");
        assert_eq!(peers.len(), 1);
        peers.forget(peer);
        assert!(peers.claim(peer).is_none());
    }

    #[tokio::test]
    async fn test_pushed_stream_is_accepted() {
        let listener = PushableListener::bind("127.0.0.1:0").await.unwrap();
        let pusher = listener.as_push().unwrap();

        let (mut near, far) = duplex(64);
        let info = ConnInfo {
            remote_addr: None,
            intercepted_host: Some("a.example".into()),
        };
        pusher.push(Box::new(far), info.clone()).unwrap();

        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.info, info);

        near.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_push_after_listener_dropped_fails() {
        let listener = PushableListener::bind("127.0.0.1:0").await.unwrap();
        let pusher = listener.as_push().unwrap();
        drop(listener);

        let (_near, far) = duplex(8);
        let err = pusher.push(Box::new(far), ConnInfo::default()).unwrap_err();
        assert!(matches!(err, ProxyError::PushFailed(_)));
    }
}
