//! Root CA that signs per-host leaf certificates.
//!
//! The root key never leaves the process unless a storage directory is
//! given, in which case it is written with 0600 permissions inside a 0700
//! directory and reloaded on the next start. Clients must trust the root
//! certificate (see [`RootCa::cert_pem`]) for interception to be silent.

use super::error::CaError;
use super::{CertificateAuthority, IssuedCertificate};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, RsaKeySize, SanType, SerialNumber,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Root certificate file name inside a storage directory.
pub const CA_CERT_FILE: &str = "ca.crt";

/// Root private key file name inside a storage directory.
pub const CA_KEY_FILE: &str = "ca.key";

/// Root validity (10 years).
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Backdate leaf certificates to tolerate client clock skew.
const NOT_BEFORE_SKEW_SECS: i64 = 60;

/// Root certificate authority backed by rcgen.
pub struct RootCa {
    /// Issuer name, key identifier and the root key used to sign leaves.
    issuer: Issuer<'static, KeyPair>,
    /// Root certificate, DER.
    cert_der: CertificateDer<'static>,
    /// Root certificate, PEM.
    cert_pem: String,
}

impl RootCa {
    /// Generate an in-memory root that disappears with the process.
    pub fn generate() -> Result<Self, CaError> {
        info!("Generating ephemeral root CA");
        let (issuer, cert_der, cert_pem) = Self::self_sign()?;
        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
        })
    }

    /// Load the root stored in `dir`, or generate and store a new one.
    ///
    /// Both `ca.crt` and `ca.key` must exist for the root to be reused; if
    /// either is missing a fresh root overwrites whatever is there.
    pub fn load_or_generate(dir: impl AsRef<Path>) -> Result<Self, CaError> {
        let dir = dir.as_ref();
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            return Self::load(&cert_path, &key_path);
        }

        info!("Generating root CA in {:?}", dir);
        fs::create_dir_all(dir).map_err(|e| CaError::WriteFile {
            path: dir.to_path_buf(),
            source: e,
        })?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(|e| {
            CaError::WriteFile {
                path: dir.to_path_buf(),
                source: e,
            }
        })?;

        let (issuer, cert_der, cert_pem) = Self::self_sign()?;
        fs::write(&cert_path, &cert_pem).map_err(|e| CaError::WriteFile {
            path: cert_path.clone(),
            source: e,
        })?;
        write_restricted_file(&key_path, &issuer.key().serialize_pem())?;

        debug!("Root CA written: cert={:?}, key={:?}", cert_path, key_path);

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
        })
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse {
            path: key_path.to_path_buf(),
            message: e.to_string(),
        })?;
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::Parse {
                path: cert_path.to_path_buf(),
                message: "no certificate found".to_string(),
            })?
            .map_err(|e| CaError::Parse {
                path: cert_path.to_path_buf(),
                message: e.to_string(),
            })?;

        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair).map_err(|e| CaError::Parse {
            path: cert_path.to_path_buf(),
            message: e.to_string(),
        })?;

        debug!("Loaded root CA from {:?}", cert_path);

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
        })
    }

    fn self_sign() -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String), CaError> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("strip-proxy Root CA".to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("strip-proxy".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
        params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::CertGeneration(e.to_string()))?;

        Ok((Issuer::new(params, key_pair), cert.der().clone(), cert.pem()))
    }

    /// Root certificate in PEM format, for client trust stores.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Root certificate in DER format.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

impl CertificateAuthority for RootCa {
    fn issue(
        &self,
        host: &str,
        validity: std::time::Duration,
        key_bits: u32,
    ) -> Result<IssuedCertificate, CaError> {
        let host = host.trim_end_matches('.');
        if host.is_empty() {
            return Err(CaError::InvalidHost(host.to_string()));
        }

        let key_size = match key_bits {
            2048 => RsaKeySize::_2048,
            3072 => RsaKeySize::_3072,
            4096 => RsaKeySize::_4096,
            other => return Err(CaError::UnsupportedKeySize(other)),
        };

        let validity = Duration::try_from(validity)
            .map_err(|e| CaError::InvalidValidity(e.to_string()))?;
        let now = OffsetDateTime::now_utc();
        let not_after = now
            .checked_add(validity)
            .ok_or_else(|| CaError::InvalidValidity(format!("{} overflows", validity)))?;

        debug!("Issuing certificate for {} ({} bit RSA)", host, key_bits);

        let leaf_key = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, key_size)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(host.to_string()));
        params.distinguished_name = dn;
        params.subject_alt_names = subject_alt_names(host)?;

        params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
        params.not_after = not_after;

        let leaf = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        Ok(IssuedCertificate {
            host: host.to_string(),
            chain: vec![leaf.der().clone(), self.cert_der.clone()],
            key,
        })
    }
}

/// SANs for a host: an IP SAN for literals (plus the textual form as a DNS
/// SAN when rcgen accepts it), otherwise a single DNS SAN.
fn subject_alt_names(host: &str) -> Result<Vec<SanType>, CaError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        let mut sans = vec![SanType::IpAddress(ip)];
        if let Ok(name) = bare.try_into() {
            sans.push(SanType::DnsName(name));
        }
        return Ok(sans);
    }

    let name = host
        .try_into()
        .map_err(|_| CaError::InvalidHost(host.to_string()))?;
    Ok(vec![SanType::DnsName(name)])
}

fn read_file(path: &Path) -> Result<String, CaError> {
    fs::read_to_string(path).map_err(|e| CaError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Write a file with restricted permissions (0600).
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    let to_err = |e| CaError::WriteFile {
        path: PathBuf::from(path),
        source: e,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(to_err)?;

    file.write_all(content.as_bytes()).map_err(to_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    const THREE_YEARS: StdDuration = StdDuration::from_secs(3 * 365 * 24 * 60 * 60);

    #[test]
    fn test_generate_root_pem() {
        let ca = RootCa::generate().unwrap();
        assert!(ca.cert_pem().contains("-----BEGIN CERTIFICATE-----"));
        assert!(!ca.cert_der().is_empty());
    }

    #[test]
    fn test_issue_chain_ends_with_root() {
        let ca = RootCa::generate().unwrap();
        let issued = ca.issue("example.com", THREE_YEARS, 2048).unwrap();

        assert_eq!(issued.host, "example.com");
        assert_eq!(issued.chain.len(), 2);
        assert_eq!(issued.issuer(), Some(ca.cert_der()));
        assert!(matches!(issued.key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_issued_chain_loads_into_server_config() {
        let ca = RootCa::generate().unwrap();
        let issued = ca.issue("api.example.com", THREE_YEARS, 2048).unwrap();

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(issued.chain, issued.key);
        assert!(config.is_ok());
    }

    #[test]
    fn test_issue_ip_literal() {
        let ca = RootCa::generate().unwrap();
        assert!(ca.issue("127.0.0.1", THREE_YEARS, 2048).is_ok());
        assert!(ca.issue("[::1]", THREE_YEARS, 2048).is_ok());
    }

    #[test]
    fn test_issue_strips_trailing_dot() {
        let ca = RootCa::generate().unwrap();
        let issued = ca.issue("example.com.", THREE_YEARS, 2048).unwrap();
        assert_eq!(issued.host, "example.com");
    }

    #[test]
    fn test_issue_rejects_empty_host() {
        let ca = RootCa::generate().unwrap();
        let result = ca.issue("", THREE_YEARS, 2048);
        assert!(matches!(result, Err(CaError::InvalidHost(_))));
    }

    #[test]
    fn test_issue_rejects_unsupported_key_size() {
        let ca = RootCa::generate().unwrap();
        let result = ca.issue("example.com", THREE_YEARS, 1024);
        assert!(matches!(result, Err(CaError::UnsupportedKeySize(1024))));
    }

    #[test]
    fn test_load_or_generate_persists_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("ca");

        let first = RootCa::load_or_generate(&dir).unwrap();
        assert!(dir.join(CA_CERT_FILE).exists());
        assert!(dir.join(CA_KEY_FILE).exists());

        let second = RootCa::load_or_generate(&dir).unwrap();
        assert_eq!(first.cert_pem(), second.cert_pem());

        // A reloaded root still signs leaves that chain to the stored cert.
        let issued = second.issue("example.com", THREE_YEARS, 2048).unwrap();
        assert_eq!(issued.issuer(), Some(first.cert_der()));
    }

    #[test]
    fn test_reloaded_root_signs_verifiable_leaves() {
        use rustls::client::WebPkiServerVerifier;
        use rustls::client::danger::ServerCertVerifier;
        use rustls_pki_types::{ServerName, UnixTime};

        let temp_dir = tempfile::tempdir().unwrap();
        let stored = RootCa::load_or_generate(temp_dir.path()).unwrap();
        let reloaded = RootCa::load_or_generate(temp_dir.path()).unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(stored.cert_der().clone()).unwrap();
        let verifier = WebPkiServerVerifier::builder(std::sync::Arc::new(roots))
            .build()
            .unwrap();

        let issued = reloaded.issue("a.example", THREE_YEARS, 2048).unwrap();
        let name = ServerName::try_from("a.example").unwrap();
        verifier
            .verify_server_cert(issued.leaf().unwrap(), &[], &name, &[], UnixTime::now())
            .unwrap();
    }

    #[test]
    fn test_load_rejects_corrupt_cert() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path();
        RootCa::load_or_generate(dir).unwrap();
        fs::write(dir.join(CA_CERT_FILE), "not a certificate").unwrap();

        let result = RootCa::load_or_generate(dir);
        assert!(matches!(result, Err(CaError::Parse { .. })));
    }

    #[test]
    fn test_restricted_permissions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("ca");
        RootCa::load_or_generate(&dir).unwrap();

        let key_mode = fs::metadata(dir.join(CA_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600, "Key file should have 0600 permissions");

        let dir_mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700, "CA directory should have 0700 permissions");
    }

    #[test]
    fn test_load_rejects_corrupt_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path();
        let ca = RootCa::generate().unwrap();
        fs::write(dir.join(CA_CERT_FILE), ca.cert_pem()).unwrap();
        fs::write(dir.join(CA_KEY_FILE), "not a key").unwrap();

        let result = RootCa::load_or_generate(dir);
        assert!(matches!(result, Err(CaError::Parse { .. })));
    }
}
