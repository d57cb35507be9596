//! TLS configuration for interception and upstream dialing.
//!
//! This module provides:
//! - Server configs built from freshly issued certificates
//! - Optional client-certificate verification (requested, never required)
//! - TLS connector for upstream connections (proxy as client)
//!
//! # Critical ALPN Note
//!
//! We **must** force HTTP/1.1 via ALPN. The decrypted stream is fed back into
//! an HTTP/1 request loop; if a client negotiated H2 after the handshake the
//! Handler would see binary frames instead of a request head.

use super::error::{ProxyError, ProxyResult};
use crate::ca::IssuedCertificate;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::ServerName;
use std::sync::{Arc, OnceLock};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace, warn};

/// The only ALPN protocol offered to or accepted from peers.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Process-wide system trust store, loaded on first use.
fn native_roots() -> Arc<RootCertStore> {
    static ROOTS: OnceLock<Arc<RootCertStore>> = OnceLock::new();
    ROOTS
        .get_or_init(|| {
            let mut store = RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();

            // Log any errors but continue with successfully loaded certs
            for err in native.errors {
                debug!("Warning loading native cert: {}", err);
            }
            let (added, ignored) = store.add_parsable_certificates(native.certs);
            debug!("Loaded {} root certificates ({} ignored)", added, ignored);

            Arc::new(store)
        })
        .clone()
}

/// Build a server config presenting `issued`.
///
/// With `verify_clients`, the server asks for a client certificate and
/// verifies it against the system roots plus the issuing CA if one is
/// presented. Clients without a certificate are still accepted.
pub fn server_config(issued: &IssuedCertificate, verify_clients: bool) -> ProxyResult<ServerConfig> {
    if issued.chain.is_empty() {
        return Err(ProxyError::Tls(format!(
            "Empty certificate chain for {}",
            issued.host
        )));
    }

    let builder = ServerConfig::builder();
    let builder = match verify_clients.then(|| client_verifier(issued)).flatten() {
        Some(verifier) => builder.with_client_cert_verifier(verifier),
        None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_single_cert(issued.chain.clone(), issued.key.clone_key())?;

    // CRITICAL: Force HTTP/1.1 to prevent HTTP/2 negotiation.
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

    Ok(config)
}

/// Acceptor wrapper around [`server_config`].
pub fn acceptor_for(issued: &IssuedCertificate, verify_clients: bool) -> ProxyResult<TlsAcceptor> {
    Ok(TlsAcceptor::from(Arc::new(server_config(
        issued,
        verify_clients,
    )?)))
}

fn client_verifier(
    issued: &IssuedCertificate,
) -> Option<Arc<dyn rustls::server::danger::ClientCertVerifier>> {
    let mut roots = (*native_roots()).clone();
    if let Some(issuer) = issued.issuer()
        && let Err(e) = roots.add(issuer.clone())
    {
        debug!("Issuer certificate not usable as trust anchor: {}", e);
    }

    if roots.is_empty() {
        trace!("No trust anchors for client verification; not requesting client certs");
        return None;
    }

    match WebPkiClientVerifier::builder(Arc::new(roots))
        .allow_unauthenticated()
        .build()
    {
        Ok(verifier) => Some(verifier),
        Err(e) => {
            warn!("Client verifier unavailable, continuing without: {}", e);
            None
        }
    }
}

/// Create a TLS connector for upstream connections.
///
/// The proxy acts as a client, verifying the upstream server's certificate
/// against system root CAs.
pub fn create_tls_connector() -> ProxyResult<TlsConnector> {
    let roots = native_roots();
    if roots.is_empty() {
        return Err(ProxyError::Tls("No system root certificates found".into()));
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a host string to a ServerName for a TLS connection.
///
/// Accepts DNS names and IP literals (bracketed IPv6 included).
pub fn domain_to_server_name(domain: &str) -> ProxyResult<ServerName<'static>> {
    let trimmed = domain.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(trimmed.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CertificateAuthority, RootCa};
    use std::time::Duration;

    fn issue(host: &str) -> IssuedCertificate {
        let ca = RootCa::generate().unwrap();
        ca.issue(host, Duration::from_secs(3600), 2048).unwrap()
    }

    #[test]
    fn test_server_config_forces_http11() {
        let issued = issue("example.com");
        let config = server_config(&issued, false).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_server_config_with_client_verification() {
        let issued = issue("example.com");
        // The issuer alone is a usable anchor, so this never falls over
        // on hosts without a system trust store.
        assert!(server_config(&issued, true).is_ok());
        assert!(acceptor_for(&issued, true).is_ok());
    }

    #[test]
    fn test_empty_chain_rejected() {
        let mut issued = issue("example.com");
        issued.chain.clear();
        assert!(matches!(
            server_config(&issued, false),
            Err(ProxyError::Tls(_))
        ));
    }

    #[test]
    fn test_tls_connector_creation() {
        // May fail on minimal systems without root certificates.
        let _ = create_tls_connector();
    }

    #[test]
    fn test_domain_to_server_name() {
        assert!(domain_to_server_name("example.com").is_ok());
        assert!(domain_to_server_name("127.0.0.1").is_ok());
        assert!(domain_to_server_name("[::1]").is_ok());
        assert!(domain_to_server_name("").is_err());
    }
}
