// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNSCrypt crypto constructions.
//
// Both constructions share the same shape:
//   key agreement: X25519, then HSalsa20 (es-version 1) or HChaCha20 (es-version 2)
//                  over the raw shared secret with an all-zero 16-byte input
//   sealing:       NaCl secretbox, XSalsa20-Poly1305 or XChaCha20-Poly1305
//
// Sealed layout (both constructions):
//   [16 bytes: Poly1305 tag]
//   [N bytes:  ciphertext]

use std::fmt;

use chacha20::cipher::consts::U10;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::{XChaCha20Poly1305, XSalsa20Poly1305};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// X25519 key size and derived shared key size (bytes).
pub const KEY_LEN: usize = 32;
/// Full XSalsa20/XChaCha20 nonce size (bytes).
pub const NONCE_LEN: usize = 24;
/// Client-chosen half of the nonce (bytes).
pub const HALF_NONCE_LEN: usize = NONCE_LEN / 2;
/// Poly1305 authentication tag size (bytes).
pub const TAG_LEN: usize = 16;
/// Padded plaintexts are a multiple of this many bytes.
pub const PAD_BLOCK: usize = 64;

/// Symmetric key shared by client and resolver for one exchange.
pub type SharedKey = Zeroizing<[u8; KEY_LEN]>;

/// The AEAD / key-agreement pair named by a certificate's es-version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoConstruction {
    XSalsa20Poly1305,
    XChacha20Poly1305,
}

impl CryptoConstruction {
    /// Wire value of the construction (certificate es-version field).
    pub fn es_version(self) -> u16 {
        match self {
            CryptoConstruction::XSalsa20Poly1305 => 0x0001,
            CryptoConstruction::XChacha20Poly1305 => 0x0002,
        }
    }

    pub fn from_es_version(es_version: u16) -> Result<Self> {
        match es_version {
            0x0001 => Ok(CryptoConstruction::XSalsa20Poly1305),
            0x0002 => Ok(CryptoConstruction::XChacha20Poly1305),
            other => Err(Error::UnsupportedConstruction(other)),
        }
    }
}

impl fmt::Display for CryptoConstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoConstruction::XSalsa20Poly1305 => write!(f, "XSalsa20Poly1305"),
            CryptoConstruction::XChacha20Poly1305 => write!(f, "XChacha20Poly1305"),
        }
    }
}

/// Generate a new X25519 keypair.
///
/// Returns `(public_key, secret_key)`.
pub fn generate_keypair() -> ([u8; KEY_LEN], Zeroizing<[u8; KEY_LEN]>) {
    let mut secret = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut secret[..]);
    let public = PublicKey::from(&StaticSecret::from(*secret));
    (public.to_bytes(), secret)
}

/// Derive the shared key for `construction` from our secret key and the
/// peer's public key.
///
/// Deriving from either side of the two keypairs yields the same key.
pub fn compute_shared_key(
    construction: CryptoConstruction,
    secret_key: &[u8],
    public_key: &[u8],
) -> Result<SharedKey> {
    let secret: [u8; KEY_LEN] = secret_key.try_into().map_err(|_| Error::KeyAgreement)?;
    let public: [u8; KEY_LEN] = public_key.try_into().map_err(|_| Error::KeyAgreement)?;

    let dh = StaticSecret::from(secret).diffie_hellman(&PublicKey::from(public));
    if !dh.was_contributory() {
        return Err(Error::KeyAgreement);
    }

    let input = GenericArray::default();
    let derived = match construction {
        CryptoConstruction::XSalsa20Poly1305 => {
            salsa20::hsalsa::<U10>(GenericArray::from_slice(dh.as_bytes()), &input)
        }
        CryptoConstruction::XChacha20Poly1305 => {
            chacha20::hchacha::<U10>(GenericArray::from_slice(dh.as_bytes()), &input)
        }
    };

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&derived);
    Ok(key)
}

/// Encrypt `plaintext`, returning `tag || ciphertext`.
pub fn seal(
    construction: CryptoConstruction,
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut sealed = vec![0u8; TAG_LEN + plaintext.len()];
    sealed[TAG_LEN..].copy_from_slice(plaintext);

    let tag = match construction {
        CryptoConstruction::XSalsa20Poly1305 => {
            seal_in_place::<XSalsa20Poly1305>(key, nonce, &mut sealed[TAG_LEN..])?
        }
        CryptoConstruction::XChacha20Poly1305 => {
            seal_in_place::<XChaCha20Poly1305>(key, nonce, &mut sealed[TAG_LEN..])?
        }
    };
    sealed[..TAG_LEN].copy_from_slice(&tag);

    Ok(sealed)
}

/// Decrypt `tag || ciphertext`. The tag is checked in constant time before
/// any plaintext is returned.
pub fn open(
    construction: CryptoConstruction,
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    sealed: &[u8],
) -> Result<Vec<u8>> {
    if sealed.len() < TAG_LEN {
        return Err(Error::TooShort {
            min: TAG_LEN,
            got: sealed.len(),
        });
    }

    let (tag, ciphertext) = sealed.split_at(TAG_LEN);
    let mut plaintext = ciphertext.to_vec();
    match construction {
        CryptoConstruction::XSalsa20Poly1305 => {
            open_in_place::<XSalsa20Poly1305>(key, nonce, tag, &mut plaintext)?
        }
        CryptoConstruction::XChacha20Poly1305 => {
            open_in_place::<XChaCha20Poly1305>(key, nonce, tag, &mut plaintext)?
        }
    }

    Ok(plaintext)
}

fn seal_in_place<C: KeyInit + AeadInPlace>(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    buffer: &mut [u8],
) -> Result<Vec<u8>> {
    let cipher = C::new_from_slice(key).map_err(|_| Error::EncryptionFailed)?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), b"", buffer)
        .map_err(|_| Error::EncryptionFailed)?;
    Ok(tag.to_vec())
}

fn open_in_place<C: KeyInit + AeadInPlace>(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    tag: &[u8],
    buffer: &mut [u8],
) -> Result<()> {
    let cipher = C::new_from_slice(key).map_err(|_| Error::Authentication)?;
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| Error::Authentication)
}

/// ISO/IEC 7816-4 padding: `0x80` then zeros, up to a multiple of
/// [`PAD_BLOCK`] that is at least `min_len` bytes.
pub fn pad(packet: &[u8], min_len: usize) -> Vec<u8> {
    let len = (packet.len() + 1).max(min_len).next_multiple_of(PAD_BLOCK);
    let mut padded = Vec::with_capacity(len);
    padded.extend_from_slice(packet);
    padded.push(0x80);
    padded.resize(len, 0);
    padded
}

/// Strip padding added by [`pad`].
pub fn unpad(padded: &[u8]) -> Result<&[u8]> {
    let marker = padded
        .iter()
        .rposition(|&b| b != 0)
        .ok_or(Error::InvalidPadding)?;
    if padded[marker] != 0x80 {
        return Err(Error::InvalidPadding);
    }
    Ok(&padded[..marker])
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONSTRUCTIONS: [CryptoConstruction; 2] = [
        CryptoConstruction::XSalsa20Poly1305,
        CryptoConstruction::XChacha20Poly1305,
    ];

    fn random_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    #[test]
    fn shared_key_is_symmetric() {
        for construction in CONSTRUCTIONS {
            let (client_pk, client_sk) = generate_keypair();
            let (server_pk, server_sk) = generate_keypair();

            let client_key = compute_shared_key(construction, &client_sk[..], &server_pk).unwrap();
            let server_key = compute_shared_key(construction, &server_sk[..], &client_pk).unwrap();
            assert_eq!(*client_key, *server_key, "{construction}");
        }
    }

    #[test]
    fn constructions_derive_different_keys() {
        let (_, sk) = generate_keypair();
        let (pk, _) = generate_keypair();

        let salsa = compute_shared_key(CryptoConstruction::XSalsa20Poly1305, &sk[..], &pk).unwrap();
        let chacha = compute_shared_key(CryptoConstruction::XChacha20Poly1305, &sk[..], &pk).unwrap();
        assert_ne!(*salsa, *chacha);
    }

    #[test]
    fn rejects_bad_key_lengths() {
        let (pk, sk) = generate_keypair();
        let result = compute_shared_key(CryptoConstruction::XSalsa20Poly1305, &sk[..31], &pk);
        assert!(matches!(result, Err(Error::KeyAgreement)));

        let result = compute_shared_key(CryptoConstruction::XSalsa20Poly1305, &sk[..], &pk[..16]);
        assert!(matches!(result, Err(Error::KeyAgreement)));
    }

    #[test]
    fn rejects_low_order_public_key() {
        let (_, sk) = generate_keypair();
        let result = compute_shared_key(CryptoConstruction::XChacha20Poly1305, &sk[..], &[0u8; KEY_LEN]);
        assert!(matches!(result, Err(Error::KeyAgreement)));
    }

    #[test]
    fn seal_open_roundtrip() {
        for construction in CONSTRUCTIONS {
            let (_, key) = generate_keypair();
            let nonce = random_nonce();

            for len in [0usize, 1, 63, 64, 512, 4096] {
                let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
                let sealed = seal(construction, &key, &nonce, &plaintext).unwrap();
                assert_eq!(sealed.len(), TAG_LEN + len);

                let opened = open(construction, &key, &nonce, &sealed).unwrap();
                assert_eq!(opened, plaintext);
            }
        }
    }

    #[test]
    fn any_bit_flip_fails_authentication() {
        for construction in CONSTRUCTIONS {
            let (_, key) = generate_keypair();
            let nonce = random_nonce();
            let sealed = seal(construction, &key, &nonce, b"dnscrypt tamper test").unwrap();

            for bit in 0..sealed.len() * 8 {
                let mut tampered = sealed.clone();
                tampered[bit / 8] ^= 1 << (bit % 8);
                let result = open(construction, &key, &nonce, &tampered);
                assert!(matches!(result, Err(Error::Authentication)), "bit {bit}");
            }
        }
    }

    #[test]
    fn wrong_key_or_construction_fails() {
        let (_, key) = generate_keypair();
        let (_, other) = generate_keypair();
        let nonce = random_nonce();
        let sealed = seal(CryptoConstruction::XSalsa20Poly1305, &key, &nonce, b"query").unwrap();

        assert!(open(CryptoConstruction::XSalsa20Poly1305, &other, &nonce, &sealed).is_err());
        assert!(open(CryptoConstruction::XChacha20Poly1305, &key, &nonce, &sealed).is_err());
    }

    #[test]
    fn open_truncated_fails() {
        let (_, key) = generate_keypair();
        let result = open(CryptoConstruction::XChacha20Poly1305, &key, &random_nonce(), &[0u8; 10]);
        assert!(matches!(result, Err(Error::TooShort { .. })));
    }

    #[test]
    fn padding() {
        let padded = pad(b"", 0);
        assert_eq!(padded.len(), PAD_BLOCK);
        assert_eq!(padded[0], 0x80);
        assert_eq!(unpad(&padded).unwrap(), b"");

        let packet = [0u8; 63];
        let padded = pad(&packet, 0);
        assert_eq!(padded.len(), 64);
        assert_eq!(unpad(&padded).unwrap(), &packet[..]);

        let padded = pad(&[0u8; 64], 0);
        assert_eq!(padded.len(), 128);

        let padded = pad(b"short", 200);
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad(&padded).unwrap(), b"short");
    }

    #[test]
    fn unpad_rejects_missing_marker() {
        assert!(matches!(unpad(&[0u8; 64]), Err(Error::InvalidPadding)));
        assert!(matches!(unpad(&[1, 2, 3, 0, 0]), Err(Error::InvalidPadding)));
    }

    #[test]
    fn es_version_mapping() {
        for construction in CONSTRUCTIONS {
            let parsed = CryptoConstruction::from_es_version(construction.es_version()).unwrap();
            assert_eq!(parsed, construction);
        }
        assert!(matches!(
            CryptoConstruction::from_es_version(0x0003),
            Err(Error::UnsupportedConstruction(0x0003))
        ));
    }
}
