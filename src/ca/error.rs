//! Certificate authority error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading a root CA or issuing leaf certificates.
#[derive(Debug, Error)]
pub enum CaError {
    /// Key pair generation failed.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Self-signing the root certificate failed.
    #[error("Certificate generation failed: {0}")]
    CertGeneration(String),

    /// Signing a leaf certificate failed.
    #[error("Certificate signing failed: {0}")]
    Signing(String),

    /// The requested host cannot appear in a certificate.
    #[error("Invalid host for certificate: '{0}'")]
    InvalidHost(String),

    /// The requested RSA modulus size is not supported.
    #[error("Unsupported key size: {0} bits")]
    UnsupportedKeySize(u32),

    /// The requested validity window cannot be represented.
    #[error("Invalid validity period: {0}")]
    InvalidValidity(String),

    /// Stored CA material could not be parsed.
    #[error("Failed to parse CA material from {path}: {message}")]
    Parse {
        /// File that failed to parse.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// Failed to read CA material.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        /// File that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write CA material.
    #[error("Failed to write {path}: {source}")]
    WriteFile {
        /// File or directory that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
