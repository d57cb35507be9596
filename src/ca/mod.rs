//! Certificate authority boundary for TLS interception.
//!
//! The interception filter only ever consumes the [`CertificateAuthority`]
//! trait: given a hostname, a validity window and a key size it returns a
//! certificate chain plus private key, or fails without partial results.
//!
//! [`RootCa`] is the implementation shipped with the binary. It keeps a
//! self-signed ECDSA P-384 root in memory (optionally persisted to disk) and
//! signs RSA leaf certificates on demand.
//!
//! # Example
//!
//! ```ignore
//! use strip_proxy::ca::{CertificateAuthority, RootCa};
//! use std::time::Duration;
//!
//! let ca = RootCa::generate()?;
//! let issued = ca.issue("example.com", Duration::from_secs(3600), 2048)?;
//! assert_eq!(issued.chain.len(), 2);
//! ```

mod error;
mod root;

pub use error::CaError;
pub use root::{CA_CERT_FILE, CA_KEY_FILE, RootCa};

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::time::Duration;

/// Issues server certificates for intercepted hosts.
///
/// Implementations are shared read-only across all concurrent sessions and
/// must tolerate concurrent calls. `issue` is synchronous and may be
/// CPU-bound (key generation); async callers should move it off the reactor.
pub trait CertificateAuthority: Send + Sync {
    /// Issue a certificate covering `host`, valid for `validity`, with a
    /// freshly generated key of `key_bits` bits.
    fn issue(
        &self,
        host: &str,
        validity: Duration,
        key_bits: u32,
    ) -> Result<IssuedCertificate, CaError>;
}

/// A leaf certificate chain and its private key.
#[derive(Debug)]
pub struct IssuedCertificate {
    /// Host the certificate was issued for.
    pub host: String,
    /// DER chain, leaf first. When the issuer is included it is last.
    pub chain: Vec<CertificateDer<'static>>,
    /// Private key matching the leaf.
    pub key: PrivateKeyDer<'static>,
}

impl IssuedCertificate {
    /// Host named in the certificate subject.
    pub fn subject_host(&self) -> &str {
        &self.host
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }

    /// The issuing certificate, if the chain carries one.
    pub fn issuer(&self) -> Option<&CertificateDer<'static>> {
        if self.chain.len() > 1 {
            self.chain.last()
        } else {
            None
        }
    }
}
