// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNSCrypt Common: certificates, encrypted message codec, server and client
//
// Cryptographic stack (DNSCrypt v2):
//   Signatures: Ed25519 over the certificate's public fields
//   Key exchange: X25519, then HSalsa20 / HChaCha20
//   Symmetric: XSalsa20-Poly1305 (es-version 1) or XChaCha20-Poly1305 (es-version 2)
//   RNG:       OsRng

pub mod cert;
pub mod client;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod query;
pub mod response;
pub mod server;
pub mod upstream;

pub use cert::Certificate;
pub use client::{Client, ResolverInfo, ServerStamp};
pub use crypto::{compute_shared_key, generate_keypair, CryptoConstruction};
pub use error::{Error, Result};
pub use protocol::Transport;
pub use query::EncryptedQuery;
pub use response::EncryptedResponse;
pub use server::{Dispatch, DropReason, ForwardHandler, Handler, ResponseWriter, Server};
pub use upstream::DnsCryptUpstream;
