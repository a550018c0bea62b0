// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Encrypted DNSCrypt query.
//
// Wire format (client → resolver):
//   [8 bytes:  client magic]
//   [32 bytes: client X25519 public key]
//   [12 bytes: client half-nonce]
//   [16 bytes: Poly1305 tag]
//   [N bytes:  encrypted padded DNS query]

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::cert::CLIENT_MAGIC_LEN;
use crate::crypto::{self, CryptoConstruction, HALF_NONCE_LEN, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::error::{Error, Result};

/// Unencrypted prefix of a query: magic, public key and half-nonce.
pub const QUERY_HEADER_LEN: usize = CLIENT_MAGIC_LEN + KEY_LEN + HALF_NONCE_LEN;
/// Smallest frame that can hold a sealed query.
pub const MIN_QUERY_LEN: usize = QUERY_HEADER_LEN + TAG_LEN;
/// Encrypted UDP queries are padded to at least this size.
pub const MIN_UDP_QUERY_LEN: usize = 256;

/// Metadata of one encrypted query, kept to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedQuery {
    pub construction: CryptoConstruction,
    pub client_magic: [u8; CLIENT_MAGIC_LEN],
    pub client_pk: [u8; KEY_LEN],
    pub half_nonce: [u8; HALF_NONCE_LEN],
}

impl EncryptedQuery {
    /// New query metadata with a fresh half-nonce: 8 bytes of big-endian
    /// nanosecond timestamp followed by 4 random bytes.
    pub fn new(
        construction: CryptoConstruction,
        client_magic: [u8; CLIENT_MAGIC_LEN],
        client_pk: [u8; KEY_LEN],
    ) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let mut half_nonce = [0u8; HALF_NONCE_LEN];
        half_nonce[..8].copy_from_slice(&nanos.to_be_bytes());
        OsRng.fill_bytes(&mut half_nonce[8..]);

        Self {
            construction,
            client_magic,
            client_pk,
            half_nonce,
        }
    }

    /// The 24-byte nonce used for the query: half-nonce then zeros.
    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..HALF_NONCE_LEN].copy_from_slice(&self.half_nonce);
        nonce
    }

    /// Pad and encrypt a packed DNS query.
    ///
    /// The whole frame is padded to at least `min_len` bytes (pass
    /// [`MIN_UDP_QUERY_LEN`] for datagrams, 0 for streams).
    pub fn encrypt(&self, packet: &[u8], shared_key: &[u8; KEY_LEN], min_len: usize) -> Result<Vec<u8>> {
        let padded = crypto::pad(packet, min_len.saturating_sub(MIN_QUERY_LEN));
        let sealed = crypto::seal(self.construction, shared_key, &self.nonce(), &padded)?;

        let mut wire = Vec::with_capacity(QUERY_HEADER_LEN + sealed.len());
        wire.extend_from_slice(&self.client_magic);
        wire.extend_from_slice(&self.client_pk);
        wire.extend_from_slice(&self.half_nonce);
        wire.extend_from_slice(&sealed);
        Ok(wire)
    }

    /// Decrypt a query addressed to the resolver holding `resolver_sk`.
    ///
    /// Returns the query metadata and the unpadded DNS message bytes.
    pub fn decrypt(
        packet: &[u8],
        construction: CryptoConstruction,
        client_magic: &[u8; CLIENT_MAGIC_LEN],
        resolver_sk: &[u8; KEY_LEN],
    ) -> Result<(Self, Vec<u8>)> {
        if packet.len() < MIN_QUERY_LEN {
            return Err(Error::TooShort {
                min: MIN_QUERY_LEN,
                got: packet.len(),
            });
        }
        if packet[..CLIENT_MAGIC_LEN] != client_magic[..] {
            return Err(Error::ClientMagicMismatch);
        }

        let mut client_pk = [0u8; KEY_LEN];
        client_pk.copy_from_slice(&packet[CLIENT_MAGIC_LEN..CLIENT_MAGIC_LEN + KEY_LEN]);
        let mut half_nonce = [0u8; HALF_NONCE_LEN];
        half_nonce.copy_from_slice(&packet[CLIENT_MAGIC_LEN + KEY_LEN..QUERY_HEADER_LEN]);

        let query = Self {
            construction,
            client_magic: *client_magic,
            client_pk,
            half_nonce,
        };

        let shared_key = crypto::compute_shared_key(construction, resolver_sk, &client_pk)?;
        let padded = crypto::open(construction, &shared_key, &query.nonce(), &packet[QUERY_HEADER_LEN..])?;
        let plaintext = crypto::unpad(&padded)?.to_vec();

        Ok((query, plaintext))
    }
}
