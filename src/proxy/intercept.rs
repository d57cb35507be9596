//! TLS interception of CONNECT tunnels.
//!
//! For every `CONNECT host:port` the filter:
//!
//! 1. Hijacks the client connection from the Handler.
//! 2. Writes the literal `HTTP/1.1 200 OK\r\n\r\n`, nothing more.
//! 3. Asks the certificate authority for a certificate for `host`
//!    (the CONNECT target, never the SNI) valid for three years with a
//!    2048-bit key.
//! 4. Runs a TLS server handshake over the hijacked connection. Client
//!    certificates are requested but not required.
//! 5. Hands the decrypted stream to the Handler's reinjector, which feeds it
//!    back into the pipeline as a new connection.
//!
//! Any failure closes the hijacked connection and is reported for that
//! session only; there are no retries.

use super::conn::{ConnInfo, ProxyRequest, ProxyResponse, ResponseSink, split_host_port};
use super::error::{ProxyError, ProxyResult, is_disconnect};
use super::filter::{Filter, FilterArgs};
use super::handler::Handler;
use super::tls;
use crate::ca::{CaError, CertificateAuthority, IssuedCertificate};
use crate::telemetry::{AuditEvent, InterceptStage};
use async_trait::async_trait;
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Bytes written to the client once the tunnel is accepted.
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Validity of issued host certificates (three years).
pub const CERT_VALIDITY: Duration = Duration::from_secs(3 * 365 * 24 * 60 * 60);

/// Key size of issued host certificates.
pub const CERT_KEY_BITS: u32 = 2048;

/// Default bound on the client TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interception policy knobs.
#[derive(Debug, Clone)]
pub struct InterceptConfig {
    /// Bound on the TLS server handshake; `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,
    /// Request (but never require) client certificates.
    pub verify_client_certs: bool,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            verify_client_certs: true,
        }
    }
}

/// Filter that terminates TLS for CONNECT tunnels.
///
/// Holds nothing per request; each CONNECT gets a freshly issued
/// certificate.
pub struct InterceptFilter {
    ca: Option<Arc<dyn CertificateAuthority>>,
    config: InterceptConfig,
}

impl InterceptFilter {
    /// Intercept using certificates from `ca`.
    pub fn new(ca: Arc<dyn CertificateAuthority>) -> Self {
        Self {
            ca: Some(ca),
            config: InterceptConfig::default(),
        }
    }

    /// A filter with no certificate authority. It claims CONNECT requests
    /// only to fail them with a configuration error.
    pub fn without_ca() -> Self {
        Self {
            ca: None,
            config: InterceptConfig::default(),
        }
    }

    /// Replace the interception policy.
    pub fn with_config(mut self, config: InterceptConfig) -> Self {
        self.config = config;
        self
    }

    /// The interception policy.
    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    fn ca(&self) -> ProxyResult<&Arc<dyn CertificateAuthority>> {
        self.ca.as_ref().ok_or_else(|| {
            ProxyError::Configuration("no certificate authority configured for interception".into())
        })
    }
}

/// Host named by a CONNECT request target.
pub fn connect_host(req: &ProxyRequest) -> ProxyResult<String> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::BadRequest("CONNECT without host:port target".into()))?;
    let (host, _port) = split_host_port(authority.as_str(), 443)?;
    Ok(host)
}

#[async_trait]
impl Filter for InterceptFilter {
    fn name(&self) -> &'static str {
        "intercept"
    }

    fn matches(&self, req: &ProxyRequest) -> ProxyResult<Option<FilterArgs>> {
        if req.method() != Method::CONNECT {
            return Ok(None);
        }
        self.ca()?;
        Ok(Some(FilterArgs::new()))
    }

    async fn handle(
        &self,
        handler: &Handler,
        _args: FilterArgs,
        sink: &mut ResponseSink,
        req: ProxyRequest,
    ) -> ProxyResult<Option<ProxyResponse>> {
        let ca = self.ca()?.clone();
        let host = connect_host(&req)?;
        let audit = handler.audit();
        let fail = |stage: InterceptStage, err: ProxyError| {
            audit.log(AuditEvent::InterceptFailed {
                host: host.clone(),
                stage,
                message: err.to_string(),
            });
            err
        };

        let mut conn = sink.hijack().map_err(|e| fail(InterceptStage::Hijack, e))?;
        let remote_addr = conn.info().remote_addr;
        debug!("Intercepting CONNECT {} from {}", host, conn.info().remote());

        write_tunnel_established(&mut conn)
            .await
            .map_err(|e| fail(InterceptStage::Tunnel, ProxyError::TunnelWrite(e)))?;

        let issued = match issue_certificate(ca, &host).await {
            Ok(issued) => issued,
            Err(e) => {
                close_quietly(&mut conn).await;
                return Err(fail(InterceptStage::Issue, e));
            }
        };
        debug!(
            "Issued certificate for {} ({} certs in chain)",
            issued.subject_host(),
            issued.chain.len()
        );

        let acceptor = match tls::acceptor_for(&issued, self.config.verify_client_certs) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                close_quietly(&mut conn).await;
                return Err(fail(InterceptStage::Handshake, e));
            }
        };

        let handshake = acceptor.accept(conn);
        let tls_stream = match self.config.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, handshake).await {
                Ok(res) => res,
                Err(_) => {
                    return Err(fail(
                        InterceptStage::Handshake,
                        ProxyError::HandshakeTimeout { host: host.clone() },
                    ));
                }
            },
            None => handshake.await,
        }
        .map_err(|e| {
            fail(
                InterceptStage::Handshake,
                ProxyError::HandshakeFailed {
                    host: host.clone(),
                    message: e.to_string(),
                },
            )
        })?;

        let info = ConnInfo {
            remote_addr,
            intercepted_host: Some(host.clone()),
        };
        let reinjector = handler.reinjector();
        reinjector
            .reinject(Box::new(tls_stream), info)
            .await
            .map_err(|e| fail(InterceptStage::Reinject, e))?;

        info!("Intercepted {} via {:?}", host, reinjector.path());
        audit.log(AuditEvent::Intercept {
            remote: remote_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            host,
            path: reinjector.path(),
        });

        Ok(None)
    }
}

async fn write_tunnel_established<W: AsyncWrite + Unpin>(conn: &mut W) -> std::io::Result<()> {
    conn.write_all(TUNNEL_ESTABLISHED).await?;
    conn.flush().await
}

/// Run the blocking issuance call off the reactor.
async fn issue_certificate(
    ca: Arc<dyn CertificateAuthority>,
    host: &str,
) -> ProxyResult<IssuedCertificate> {
    let owned = host.to_string();
    let result = tokio::task::spawn_blocking(move || ca.issue(&owned, CERT_VALIDITY, CERT_KEY_BITS))
        .await
        .unwrap_or_else(|e| Err(CaError::CertGeneration(format!("issuer task failed: {}", e))));

    result.map_err(|source| ProxyError::CertificateIssuanceFailed {
        host: host.to_string(),
        source,
    })
}

async fn close_quietly<W: AsyncWrite + Unpin>(conn: &mut W) {
    if let Err(e) = conn.shutdown().await {
        if is_disconnect(&e) {
            debug!("Intercepted connection already gone: {}", e);
        } else {
            warn!("Failed to close intercepted connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::RootCa;
    use http::Request;

    fn connect(target: &str) -> ProxyRequest {
        Request::builder()
            .method(Method::CONNECT)
            .uri(target)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_fixed_issuance_policy() {
        assert_eq!(TUNNEL_ESTABLISHED, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(CERT_VALIDITY.as_secs(), 94_608_000);
        assert_eq!(CERT_KEY_BITS, 2048);
    }

    #[test]
    fn test_matches_only_connect() {
        let filter = InterceptFilter::new(Arc::new(RootCa::generate().unwrap()));

        for method in [Method::GET, Method::POST, Method::OPTIONS] {
            let req = Request::builder()
                .method(method)
                .uri("http://a.example/")
                .body(())
                .unwrap();
            assert!(filter.matches(&req).unwrap().is_none());
        }

        let args = filter.matches(&connect("a.example:443")).unwrap().unwrap();
        assert!(args.is_empty());
    }

    #[test]
    fn test_match_without_ca_is_configuration_error() {
        let filter = InterceptFilter::without_ca();
        let err = filter.matches(&connect("a.example:443")).unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));

        // Non-CONNECT requests are still declined cleanly.
        let get = Request::builder().uri("/").body(()).unwrap();
        assert!(filter.matches(&get).unwrap().is_none());
    }

    #[test]
    fn test_connect_host() {
        assert_eq!(connect_host(&connect("a.example:443")).unwrap(), "a.example");
        assert_eq!(connect_host(&connect("[::1]:8443")).unwrap(), "::1");
        let no_authority = Request::builder()
            .method(Method::CONNECT)
            .uri("/")
            .body(())
            .unwrap();
        assert!(connect_host(&no_authority).is_err());
    }

    #[test]
    fn test_default_config() {
        let config = InterceptConfig::default();
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(30)));
        assert!(config.verify_client_certs);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Writer whose shutdown always fails with one error kind.
    struct FailingShutdown(std::io::ErrorKind);

    impl AsyncWrite for FailingShutdown {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::from(self.0)))
        }
    }

    #[tokio::test]
    async fn test_close_quietly_logs_disconnects_at_debug() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        close_quietly(&mut FailingShutdown(std::io::ErrorKind::BrokenPipe)).await;
        close_quietly(&mut FailingShutdown(std::io::ErrorKind::PermissionDenied)).await;

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let gone = logs.lines().find(|l| l.contains("already gone")).unwrap();
        assert!(gone.contains("DEBUG"));
        let failed = logs
            .lines()
            .find(|l| l.contains("Failed to close intercepted connection"))
            .unwrap();
        assert!(failed.contains("WARN"));
    }
}
