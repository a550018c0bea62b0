// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNSCrypt server.
//
// Every inbound packet (UDP datagram or TCP frame) is classified by its first
// 8 bytes:
//   client magic  → encrypted query: decrypt, hand to the Handler, encrypt the answer
//   anything else → certificate handshake: answer a TXT query for the provider name
// Packets that fit neither path are dropped without a reply.

pub mod handler;
mod tcp;
mod udp;

use std::sync::Arc;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::sync::watch;
use tracing::debug;

use crate::cert::{Certificate, CLIENT_MAGIC_LEN};
use crate::crypto;
use crate::error::{Error, Result};
use crate::protocol::MIN_DNS_PACKET_LEN;
use crate::query::{EncryptedQuery, MIN_QUERY_LEN};
use crate::response::EncryptedResponse;

pub use handler::{ForwardHandler, Handler, ResponseWriter};

/// Default bound on concurrently running UDP handler tasks.
pub const DEFAULT_MAX_UDP_IN_FLIGHT: usize = 1024;
/// TTL of the certificate TXT answer.
pub const CERT_TXT_TTL: u32 = 60;

/// Why a packet was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Shorter than the smallest packet of its kind.
    TooShort,
    /// Not a TXT query for our provider name.
    NotHandshake,
    /// Failed key agreement, authentication or unpadding.
    Undecryptable,
    /// Decrypted, but not a DNS message.
    BadMessage,
}

/// Outcome of classifying one inbound packet.
#[derive(Debug)]
pub enum Dispatch {
    /// Packed handshake reply carrying the certificate.
    Certificate(Vec<u8>),
    /// Decrypted query and the metadata needed to answer it.
    Query(Message, EncryptedQuery),
    Drop(DropReason),
}

pub struct Server {
    provider_name: String,
    cert: Certificate,
    cert_txt: Vec<Vec<u8>>,
    handler: Arc<dyn Handler>,
    max_udp_in_flight: usize,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Create a server for `provider_name` answering with `cert`.
    ///
    /// The certificate's TXT form is computed here, once, and reused for
    /// every handshake answer.
    pub fn new(provider_name: impl Into<String>, cert: Certificate) -> Self {
        let cert_txt = cert.to_txt_chunks();
        let (shutdown, _) = watch::channel(false);
        Self {
            provider_name: provider_name.into(),
            cert,
            cert_txt,
            handler: Arc::new(ForwardHandler::default()),
            max_udp_in_flight: DEFAULT_MAX_UDP_IN_FLIGHT,
            shutdown,
        }
    }

    pub fn with_handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn with_max_udp_in_flight(mut self, max: usize) -> Self {
        self.max_udp_in_flight = max.max(1);
        self
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    /// Check that the server may start: the certificate must be valid now
    /// and the provider name set.
    pub fn validate(&self) -> Result<()> {
        if !self.cert.is_valid_now() {
            return Err(Error::Configuration(format!(
                "resolver certificate is not valid now (valid {}..={})",
                self.cert.not_before, self.cert.not_after
            )));
        }
        if self.provider_name.trim_end_matches('.').is_empty() {
            return Err(Error::Configuration("provider name must be set".into()));
        }
        Ok(())
    }

    /// Stop the UDP and TCP listeners. Queries already dispatched run to
    /// completion.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Classify one inbound packet.
    pub fn dispatch(&self, packet: &[u8]) -> Dispatch {
        if packet.len() < MIN_DNS_PACKET_LEN {
            return Dispatch::Drop(DropReason::TooShort);
        }

        if packet[..CLIENT_MAGIC_LEN] == self.cert.client_magic {
            if packet.len() < MIN_QUERY_LEN {
                return Dispatch::Drop(DropReason::TooShort);
            }
            return match self.decrypt(packet) {
                Ok((request, query)) => Dispatch::Query(request, query),
                Err(Error::Dns(e)) => {
                    debug!(error = %e, "decrypted query is not a DNS message");
                    Dispatch::Drop(DropReason::BadMessage)
                }
                Err(e) => {
                    debug!(error = %e, "dropping undecryptable query");
                    Dispatch::Drop(DropReason::Undecryptable)
                }
            };
        }

        match self.handle_handshake(packet) {
            Some(reply) => Dispatch::Certificate(reply),
            None => Dispatch::Drop(DropReason::NotHandshake),
        }
    }

    fn decrypt(&self, packet: &[u8]) -> Result<(Message, EncryptedQuery)> {
        let (query, plaintext) = EncryptedQuery::decrypt(
            packet,
            self.cert.construction,
            &self.cert.client_magic,
            &self.cert.resolver_sk,
        )?;
        let request = Message::from_vec(&plaintext)?;
        Ok((request, query))
    }

    /// Encrypt a packed response for the client that sent `query`.
    pub(crate) fn seal_response(&self, packet: &[u8], query: &EncryptedQuery) -> Result<Vec<u8>> {
        let shared_key =
            crypto::compute_shared_key(query.construction, &self.cert.resolver_sk[..], &query.client_pk)?;
        EncryptedResponse::encrypt(query.construction, packet, &shared_key, &query.half_nonce)
    }

    /// Answer a certificate request, or `None` if this is not one.
    fn handle_handshake(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let request = Message::from_vec(packet).ok()?;
        if request.message_type() != MessageType::Query || request.queries().len() != 1 {
            return None;
        }

        let question = &request.queries()[0];
        if question.query_type() != RecordType::TXT
            || !same_fqdn(&question.name().to_ascii(), &self.provider_name)
        {
            return None;
        }

        let mut reply = Message::new();
        reply
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired());
        reply.add_query(question.clone());

        let txt = TXT::from_bytes(self.cert_txt.iter().map(Vec::as_slice).collect());
        reply.add_answer(Record::from_rdata(
            question.name().clone(),
            CERT_TXT_TTL,
            RData::TXT(txt),
        ));

        match reply.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(error = %e, "failed to pack certificate reply");
                None
            }
        }
    }
}

/// Case-insensitive name comparison after FQDN normalization.
fn same_fqdn(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::unix_now;
    use crate::crypto::{compute_shared_key, generate_keypair, CryptoConstruction};
    use crate::query::MIN_UDP_QUERY_LEN;
    use ed25519_dalek::SigningKey;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::Name;
    use rand::rngs::OsRng;

    const PROVIDER: &str = "2.dnscrypt-cert.example.org";

    fn test_server(not_before: u32, not_after: u32) -> (Server, SigningKey) {
        let provider = SigningKey::generate(&mut OsRng);
        let cert = Certificate::generate(
            &provider,
            CryptoConstruction::XSalsa20Poly1305,
            1,
            not_before,
            not_after,
        );
        (Server::new(PROVIDER, cert), provider)
    }

    fn valid_server() -> Server {
        let now = unix_now();
        test_server(now - 60, now + 3600).0
    }

    fn query_for(name: &str, rtype: RecordType) -> Message {
        let mut m = Message::new();
        m.set_id(4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        m.add_query(Query::query(Name::from_ascii(name).unwrap(), rtype));
        m
    }

    #[test]
    fn validate_checks_window_and_provider_name() {
        let now = unix_now();
        let server = valid_server();
        assert!(server.validate().is_ok());
        assert_eq!(server.provider_name(), PROVIDER);

        let (expired, _) = test_server(now - 7200, now - 3600);
        assert!(matches!(expired.validate(), Err(Error::Configuration(_))));

        let (future, _) = test_server(now + 3600, now + 7200);
        assert!(matches!(future.validate(), Err(Error::Configuration(_))));

        let cert = valid_server().cert;
        assert!(matches!(Server::new("", cert).validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn handshake_returns_certificate() {
        let server = valid_server();
        let request = query_for("2.dnscrypt-cert.example.org.", RecordType::TXT);

        let reply = match server.dispatch(&request.to_vec().unwrap()) {
            Dispatch::Certificate(reply) => Message::from_vec(&reply).unwrap(),
            other => panic!("expected certificate, got {other:?}"),
        };

        assert_eq!(reply.id(), 4242);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.queries(), request.queries());
        assert_eq!(reply.answers().len(), 1);

        let answer = &reply.answers()[0];
        assert_eq!(answer.ttl(), CERT_TXT_TTL);
        let Some(RData::TXT(txt)) = answer.data() else {
            panic!("expected TXT answer");
        };
        let cert = Certificate::from_txt_chunks(txt.txt_data().iter()).unwrap();
        assert_eq!(cert.resolver_pk, server.certificate().resolver_pk);
        assert_eq!(cert.signature, server.certificate().signature);
    }

    #[test]
    fn handshake_name_match_ignores_case_and_trailing_dot() {
        let server = valid_server();
        let request = query_for("2.DNSCrypt-Cert.Example.ORG", RecordType::TXT);
        assert!(matches!(
            server.dispatch(&request.to_vec().unwrap()),
            Dispatch::Certificate(_)
        ));
    }

    #[test]
    fn handshake_filtering() {
        let server = valid_server();
        let classify = |m: &Message| server.dispatch(&m.to_vec().unwrap());

        let wrong_name = query_for("2.dnscrypt-cert.example.com.", RecordType::TXT);
        assert!(matches!(classify(&wrong_name), Dispatch::Drop(DropReason::NotHandshake)));

        let wrong_type = query_for(PROVIDER, RecordType::A);
        assert!(matches!(classify(&wrong_type), Dispatch::Drop(DropReason::NotHandshake)));

        let mut two_questions = query_for(PROVIDER, RecordType::TXT);
        two_questions.add_query(Query::query(Name::from_ascii(PROVIDER).unwrap(), RecordType::TXT));
        assert!(matches!(classify(&two_questions), Dispatch::Drop(DropReason::NotHandshake)));

        let mut response = query_for(PROVIDER, RecordType::TXT);
        response.set_message_type(MessageType::Response);
        assert!(matches!(classify(&response), Dispatch::Drop(DropReason::NotHandshake)));

        assert!(matches!(
            server.dispatch(&[0xFFu8; 40]),
            Dispatch::Drop(DropReason::NotHandshake)
        ));
        assert!(matches!(server.dispatch(&[0u8; 5]), Dispatch::Drop(DropReason::TooShort)));
    }

    #[test]
    fn short_encrypted_frames_are_dropped_before_decryption() {
        let server = valid_server();
        let mut frame = server.certificate().client_magic.to_vec();
        frame.resize(MIN_QUERY_LEN - 1, 0xAB);
        assert!(matches!(server.dispatch(&frame), Dispatch::Drop(DropReason::TooShort)));
    }

    #[test]
    fn encrypted_query_roundtrip_through_dispatch() {
        let server = valid_server();
        let cert = server.certificate().clone();

        let (client_pk, client_sk) = generate_keypair();
        let key = compute_shared_key(cert.construction, &client_sk[..], &cert.resolver_pk).unwrap();
        let request = query_for("example.org.", RecordType::A);
        let query = EncryptedQuery::new(cert.construction, cert.client_magic, client_pk);
        let wire = query.encrypt(&request.to_vec().unwrap(), &key, MIN_UDP_QUERY_LEN).unwrap();

        let (decoded, meta) = match server.dispatch(&wire) {
            Dispatch::Query(decoded, meta) => (decoded, meta),
            other => panic!("expected query, got {other:?}"),
        };
        assert_eq!(decoded.id(), request.id());
        assert_eq!(meta, query);

        let sealed = server.seal_response(&decoded.to_vec().unwrap(), &meta).unwrap();
        let (nonce, packet) = EncryptedResponse::decrypt(cert.construction, &sealed, &key).unwrap();
        assert_eq!(&nonce[..crypto::HALF_NONCE_LEN], &query.half_nonce);
        assert_eq!(Message::from_vec(&packet).unwrap().id(), request.id());
    }

    #[test]
    fn tampered_or_garbage_queries_are_dropped() {
        let server = valid_server();
        let cert = server.certificate().clone();

        let (client_pk, client_sk) = generate_keypair();
        let key = compute_shared_key(cert.construction, &client_sk[..], &cert.resolver_pk).unwrap();
        let query = EncryptedQuery::new(cert.construction, cert.client_magic, client_pk);

        let mut wire = query
            .encrypt(&query_for("example.org.", RecordType::A).to_vec().unwrap(), &key, 0)
            .unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x80;
        assert!(matches!(server.dispatch(&wire), Dispatch::Drop(DropReason::Undecryptable)));

        let not_dns = query.encrypt(b"\x01\x02", &key, 0).unwrap();
        assert!(matches!(server.dispatch(&not_dns), Dispatch::Drop(DropReason::BadMessage)));
    }
}
