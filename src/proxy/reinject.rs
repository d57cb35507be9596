//! Delivery of decrypted streams back into the Handler's pipeline.
//!
//! Two strategies implement [`Reinjector`]:
//! - [`PushReinjector`] hands the stream to the listener's push capability;
//!   the Handler accepts it like any other connection, no sockets involved.
//! - [`LoopbackReinjector`] dials the listener's own address and relays the
//!   decrypted stream over that connection. With the listener's
//!   [`InterceptedPeers`] table it registers the CONNECT host under its
//!   socket address first, so the accepted connection keeps that host.
//!
//! The Handler picks one at construction, so filters only ever call
//! [`Reinjector::reinject`].

use super::conn::{BoxedStream, ConnInfo};
use super::error::{ProxyError, ProxyResult};
use super::listener::{InterceptedPeers, PushListener};
use super::relay;
use crate::telemetry::ReinjectPath;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace};

/// Puts a plaintext stream back into the request pipeline.
#[async_trait]
pub trait Reinjector: Send + Sync {
    /// Which strategy this is.
    fn path(&self) -> ReinjectPath;

    /// Deliver `stream`. Returns once delivery has started; the stream is
    /// then owned by the pipeline (or by a background relay).
    async fn reinject(&self, stream: BoxedStream, info: ConnInfo) -> ProxyResult<()>;
}

/// Injects streams directly into a listener's accept queue.
pub struct PushReinjector {
    target: Arc<dyn PushListener>,
}

impl PushReinjector {
    /// Push into `target`.
    pub fn new(target: Arc<dyn PushListener>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Reinjector for PushReinjector {
    fn path(&self) -> ReinjectPath {
        ReinjectPath::Push
    }

    async fn reinject(&self, stream: BoxedStream, info: ConnInfo) -> ProxyResult<()> {
        self.target.push(stream, info)
    }
}

/// Relays streams over a fresh loopback connection to the listener.
pub struct LoopbackReinjector {
    addr: SocketAddr,
    idle_timeout: Option<Duration>,
    peers: Option<InterceptedPeers>,
}

impl LoopbackReinjector {
    /// Dial `addr` for every stream; tear relays down after `idle_timeout`
    /// without traffic.
    pub fn new(addr: SocketAddr, idle_timeout: Option<Duration>) -> Self {
        Self {
            addr,
            idle_timeout,
            peers: None,
        }
    }

    /// Register each stream's CONNECT host in the listener's `peers` table.
    pub fn with_peers(mut self, peers: InterceptedPeers) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Address dialed for each stream.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn dial(&self, host: Option<&str>) -> io::Result<TcpStream> {
        let (Some(peers), Some(host)) = (&self.peers, host) else {
            return TcpStream::connect(self.addr).await;
        };

        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(self.addr.ip(), 0))?;
        let local = socket.local_addr()?;

        peers.register(local, host);
        let connected = socket.connect(self.addr).await;
        if connected.is_err() {
            peers.forget(local);
        }
        connected
    }
}

#[async_trait]
impl Reinjector for LoopbackReinjector {
    fn path(&self) -> ReinjectPath {
        ReinjectPath::Loopback
    }

    async fn reinject(&self, stream: BoxedStream, info: ConnInfo) -> ProxyResult<()> {
        let loopback = self
            .dial(info.intercepted_host.as_deref())
            .await
            .map_err(|source| ProxyError::RelayDialFailed {
                addr: self.addr.to_string(),
                source,
            })?;
        if let Err(e) = loopback.set_nodelay(true) {
            trace!("Failed to set TCP_NODELAY on loopback: {}", e);
        }

        let host = info.intercepted_host.unwrap_or_default();
        debug!("Relaying {} over loopback to {}", host, self.addr);

        let handle = relay::link(stream, loopback, self.idle_timeout);
        tokio::spawn(async move {
            let stats = handle.join().await;
            debug!(
                "Loopback relay for {} closed ({} bytes up, {} bytes down)",
                host, stats.forward, stats.backward
            );
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::listener::{Listener, PushableListener, TcpProxyListener};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_push_reinjector_delivers_to_listener() {
        let listener = PushableListener::bind("127.0.0.1:0").await.unwrap();
        let reinjector = PushReinjector::new(listener.as_push().unwrap());
        assert_eq!(reinjector.path(), ReinjectPath::Push);

        let (mut near, far) = duplex(64);
        let info = ConnInfo {
            remote_addr: None,
            intercepted_host: Some("a.example".into()),
        };
        reinjector.reinject(Box::new(far), info).await.unwrap();

        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.info.intercepted_host.as_deref(), Some("a.example"));

        accepted.stream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_loopback_reinjector_relays() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reinjector = LoopbackReinjector::new(tcp.local_addr().unwrap(), None);
        assert_eq!(reinjector.path(), ReinjectPath::Loopback);

        let (mut near, far) = duplex(64);
        reinjector
            .reinject(Box::new(far), ConnInfo::default())
            .await
            .unwrap();

        let (mut server, _) = tcp.accept().await.unwrap();
        near.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_loopback_reinjector_tags_host() {
        let listener = TcpProxyListener::bind("127.0.0.1:0").await.unwrap();
        let reinjector = LoopbackReinjector::new(listener.local_addr().unwrap(), None)
            .with_peers(listener.intercepted_peers().unwrap());

        let (_near, far) = duplex(64);
        let info = ConnInfo {
            remote_addr: None,
            intercepted_host: Some("a.example".into()),
        };
        reinjector.reinject(Box::new(far), info).await.unwrap();

        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.info.intercepted_host.as_deref(), Some("a.example"));
    }

    #[tokio::test]
    async fn test_loopback_dial_failure_forgets_peer() {
        let addr = {
            let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tcp.local_addr().unwrap()
        };
        let peers = InterceptedPeers::new();
        let reinjector = LoopbackReinjector::new(addr, None).with_peers(peers.clone());

        let (_near, far) = duplex(64);
        let info = ConnInfo {
            remote_addr: None,
            intercepted_host: Some("a.example".into()),
        };
        let err = reinjector.reinject(Box::new(far), info).await.unwrap_err();
        assert!(matches!(err, ProxyError::RelayDialFailed { .. }));
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_loopback_dial_failure() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tcp.local_addr().unwrap()
        };
        let reinjector = LoopbackReinjector::new(addr, None);

        let (_near, far) = duplex(64);
        let err = reinjector
            .reinject(Box::new(far), ConnInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::RelayDialFailed { .. }));
    }
}
