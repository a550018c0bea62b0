// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNSCrypt v2 resolver certificate.
//
// Wire format (124 bytes, served inside a TXT record):
//   [4 bytes:  cert magic "DNSC"]
//   [2 bytes:  es-version, big-endian]
//   [2 bytes:  protocol minor version (0)]
//   [64 bytes: Ed25519 signature over the remaining fields]
//   [32 bytes: resolver X25519 public key]
//   [8 bytes:  client magic]
//   [4 bytes:  serial, big-endian]
//   [4 bytes:  ts-start, big-endian]
//   [4 bytes:  ts-end, big-endian]
//   [N bytes:  extensions, optional]
//
// The signature covers everything after itself, extensions included.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoConstruction, KEY_LEN};
use crate::error::{Error, Result};

/// Leading bytes of every serialized certificate.
pub const CERT_MAGIC: [u8; 4] = *b"DNSC";
/// Client magic size (bytes).
pub const CLIENT_MAGIC_LEN: usize = 8;
/// Ed25519 signature size (bytes).
pub const SIGNATURE_LEN: usize = 64;
/// Serialized certificate size without extensions (bytes).
pub const CERT_LEN: usize = 124;
/// Maximum length of one TXT character-string.
pub const TXT_CHUNK_LEN: usize = 255;

const SIGNATURE_OFFSET: usize = 8;
const SIGNED_OFFSET: usize = SIGNATURE_OFFSET + SIGNATURE_LEN;

/// Seconds since the Unix epoch, saturated to the certificate's u32 range.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

/// A resolver certificate. `resolver_sk` is only populated on the server;
/// parsed certificates carry zeros there.
#[derive(Clone)]
pub struct Certificate {
    pub serial: u32,
    pub construction: CryptoConstruction,
    pub signature: [u8; SIGNATURE_LEN],
    pub resolver_pk: [u8; KEY_LEN],
    pub resolver_sk: Zeroizing<[u8; KEY_LEN]>,
    pub client_magic: [u8; CLIENT_MAGIC_LEN],
    pub not_before: u32,
    pub not_after: u32,
    /// Signed bytes following ts-end.
    pub extensions: Vec<u8>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("serial", &self.serial)
            .field("construction", &self.construction)
            .field("client_magic", &self.client_magic)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("extensions_len", &self.extensions.len())
            .finish_non_exhaustive()
    }
}

impl Certificate {
    /// Create and sign a certificate for a freshly generated resolver keypair.
    ///
    /// The client magic is the first 8 bytes of the resolver public key.
    pub fn generate(
        provider_key: &SigningKey,
        construction: CryptoConstruction,
        serial: u32,
        not_before: u32,
        not_after: u32,
    ) -> Self {
        let (resolver_pk, resolver_sk) = crypto::generate_keypair();
        let mut client_magic = [0u8; CLIENT_MAGIC_LEN];
        client_magic.copy_from_slice(&resolver_pk[..CLIENT_MAGIC_LEN]);

        let mut cert = Self {
            serial,
            construction,
            signature: [0u8; SIGNATURE_LEN],
            resolver_pk,
            resolver_sk,
            client_magic,
            not_before,
            not_after,
            extensions: Vec::new(),
        };
        cert.sign(provider_key);
        cert
    }

    /// Sign the public portion with the provider's Ed25519 key.
    pub fn sign(&mut self, provider_key: &SigningKey) {
        self.signature = provider_key.sign(&self.signed_bytes()).to_bytes();
    }

    /// Check the signature against the provider's Ed25519 public key.
    pub fn verify_signature(&self, provider_pk: &VerifyingKey) -> Result<()> {
        let signature = Signature::from_bytes(&self.signature);
        provider_pk
            .verify_strict(&self.signed_bytes(), &signature)
            .map_err(|_| Error::CertificateSignature)
    }

    /// `true` iff `not_before <= now <= not_after`.
    pub fn verify_validity_window(&self, now: u32) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    pub fn is_valid_now(&self) -> bool {
        self.verify_validity_window(unix_now())
    }

    /// Serialize to the binary certificate record.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CERT_LEN + self.extensions.len());
        bytes.extend_from_slice(&CERT_MAGIC);
        bytes.extend_from_slice(&self.construction.es_version().to_be_bytes());
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.signature);
        bytes.extend_from_slice(&self.signed_bytes());
        bytes
    }

    /// Parse a binary certificate record. Bytes past the fixed fields are
    /// kept as extensions.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CERT_LEN {
            return Err(Error::MalformedCertificate(format!(
                "expected at least {CERT_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[..4] != CERT_MAGIC {
            return Err(Error::MalformedCertificate("bad cert magic".into()));
        }

        let es_version = u16::from_be_bytes([bytes[4], bytes[5]]);
        let construction = CryptoConstruction::from_es_version(es_version)
            .map_err(|e| Error::MalformedCertificate(e.to_string()))?;

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[SIGNATURE_OFFSET..SIGNED_OFFSET]);

        let signed = &bytes[SIGNED_OFFSET..];
        let mut resolver_pk = [0u8; KEY_LEN];
        resolver_pk.copy_from_slice(&signed[..32]);
        let mut client_magic = [0u8; CLIENT_MAGIC_LEN];
        client_magic.copy_from_slice(&signed[32..40]);
        let serial = read_u32(&signed[40..44]);
        let not_before = read_u32(&signed[44..48]);
        let not_after = read_u32(&signed[48..52]);

        if not_before > not_after {
            return Err(Error::MalformedCertificate(format!(
                "validity window is inverted: {not_before} > {not_after}"
            )));
        }

        Ok(Self {
            serial,
            construction,
            signature,
            resolver_pk,
            resolver_sk: Zeroizing::new([0u8; KEY_LEN]),
            client_magic,
            not_before,
            not_after,
            extensions: signed[52..].to_vec(),
        })
    }

    /// Split the serialized record into TXT character-strings.
    pub fn to_txt_chunks(&self) -> Vec<Vec<u8>> {
        self.serialize()
            .chunks(TXT_CHUNK_LEN)
            .map(<[u8]>::to_vec)
            .collect()
    }

    /// Reassemble TXT character-strings and parse the certificate.
    pub fn from_txt_chunks<I, T>(chunks: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let mut bytes = Vec::with_capacity(CERT_LEN);
        for chunk in chunks {
            bytes.extend_from_slice(chunk.as_ref());
        }
        Self::parse(&bytes)
    }

    /// `resolver-pk || client-magic || serial || ts-start || ts-end || extensions`
    fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CERT_LEN - SIGNED_OFFSET + self.extensions.len());
        bytes.extend_from_slice(&self.resolver_pk);
        bytes.extend_from_slice(&self.client_magic);
        bytes.extend_from_slice(&self.serial.to_be_bytes());
        bytes.extend_from_slice(&self.not_before.to_be_bytes());
        bytes.extend_from_slice(&self.not_after.to_be_bytes());
        bytes.extend_from_slice(&self.extensions);
        bytes
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
