// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Encrypted DNSCrypt response.
//
// Wire format (resolver → client):
//   [8 bytes:  resolver magic "r6fnvWj8"]
//   [24 bytes: nonce = client half-nonce || 12 random resolver bytes]
//   [16 bytes: Poly1305 tag]
//   [N bytes:  encrypted padded DNS response]

use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{self, CryptoConstruction, HALF_NONCE_LEN, KEY_LEN, NONCE_LEN, PAD_BLOCK, TAG_LEN};
use crate::error::{Error, Result};

/// Leading bytes of every encrypted response.
pub const RESOLVER_MAGIC: [u8; 8] = *b"r6fnvWj8";
/// Unencrypted prefix of a response: magic and nonce.
pub const RESPONSE_HEADER_LEN: usize = RESOLVER_MAGIC.len() + NONCE_LEN;
/// Smallest frame that can hold a sealed response.
pub const MIN_RESPONSE_LEN: usize = RESPONSE_HEADER_LEN + TAG_LEN;

pub struct EncryptedResponse;

impl EncryptedResponse {
    /// Encrypt a packed DNS response for the client that sent `half_nonce`.
    ///
    /// The resolver half of the nonce is drawn fresh from the OS RNG for
    /// every call; it must never repeat under one shared key.
    pub fn encrypt(
        construction: CryptoConstruction,
        packet: &[u8],
        shared_key: &[u8; KEY_LEN],
        half_nonce: &[u8; HALF_NONCE_LEN],
    ) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..HALF_NONCE_LEN].copy_from_slice(half_nonce);
        OsRng.fill_bytes(&mut nonce[HALF_NONCE_LEN..]);

        let padded = crypto::pad(packet, 0);
        let sealed = crypto::seal(construction, shared_key, &nonce, &padded)?;

        let mut wire = Vec::with_capacity(RESPONSE_HEADER_LEN + sealed.len());
        wire.extend_from_slice(&RESOLVER_MAGIC);
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&sealed);
        Ok(wire)
    }

    /// Decrypt a response. Returns the full nonce and the unpadded packet.
    pub fn decrypt(
        construction: CryptoConstruction,
        packet: &[u8],
        shared_key: &[u8; KEY_LEN],
    ) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
        if packet.len() < MIN_RESPONSE_LEN {
            return Err(Error::TooShort {
                min: MIN_RESPONSE_LEN,
                got: packet.len(),
            });
        }
        if packet[..RESOLVER_MAGIC.len()] != RESOLVER_MAGIC {
            return Err(Error::ResolverMagicMismatch);
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&packet[RESOLVER_MAGIC.len()..RESPONSE_HEADER_LEN]);

        let padded = crypto::open(construction, shared_key, &nonce, &packet[RESPONSE_HEADER_LEN..])?;
        let plaintext = crypto::unpad(&padded)?.to_vec();

        Ok((nonce, plaintext))
    }

    /// Size of the frame [`encrypt`](Self::encrypt) produces for a packet of
    /// `packet_len` bytes.
    pub fn encrypted_len(packet_len: usize) -> usize {
        MIN_RESPONSE_LEN + (packet_len + 1).next_multiple_of(PAD_BLOCK)
    }
}
