// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error types shared by the DNSCrypt codec, server and client.

use hickory_proto::error::ProtoError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("message too short: need at least {min} bytes, got {got}")]
    TooShort { min: usize, got: usize },

    #[error("client magic does not match the resolver certificate")]
    ClientMagicMismatch,

    #[error("response does not start with the resolver magic")]
    ResolverMagicMismatch,

    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    #[error("unsupported crypto construction: {0:#06x}")]
    UnsupportedConstruction(u16),

    #[error("invalid padding")]
    InvalidPadding,

    #[error("key agreement failed: invalid or weak key")]
    KeyAgreement,

    #[error("decryption failed: authentication failure or data corruption")]
    Authentication,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("certificate signature verification failed")]
    CertificateSignature,

    #[error("certificate handshake failed: {0}")]
    Handshake(String),

    #[error("failed to fetch certificate from {address}: {source}")]
    CertificateFetch {
        address: String,
        #[source]
        source: Box<Error>,
    },

    #[error("response id {got} does not match query id {expected}")]
    IdMismatch { expected: u16, got: u16 },

    #[error("response nonce does not echo the query nonce")]
    NonceMismatch,

    #[error("exchange timed out")]
    Timeout,

    #[error("DNS message error: {0}")]
    Dns(#[from] ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this failure suggests the resolver rotated its certificate.
    ///
    /// Timeouts and a clean end-of-stream are both treated this way; the
    /// session is dropped and the exchange retried with a fresh handshake.
    pub fn is_rotation_hint(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
