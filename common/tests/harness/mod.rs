// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Loopback DNSCrypt resolver for integration tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dnscrypt_common::cert::unix_now;
use dnscrypt_common::server::DEFAULT_MAX_UDP_IN_FLIGHT;
use dnscrypt_common::{Certificate, CryptoConstruction, Error, Handler, ResponseWriter, Server, ServerStamp};
use ed25519_dalek::SigningKey;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::rngs::OsRng;
use tokio::net::{TcpListener, UdpSocket};

pub const PROVIDER_NAME: &str = "2.dnscrypt-cert.example.org";

/// Answers every query with `answers` A records, the first being 8.8.8.8.
#[derive(Clone)]
pub struct TestHandler {
    pub answers: u8,
    pub wrong_id: bool,
    /// When set, the next query is swallowed without an answer.
    pub stall_once: Arc<AtomicBool>,
    /// Fail every query the way an unreachable upstream would.
    pub fail: bool,
    /// Time spent on each query before answering.
    pub delay: Duration,
    pub in_flight: Arc<AtomicUsize>,
    /// Highest number of queries handled at once.
    pub peak: Arc<AtomicUsize>,
}

impl Default for TestHandler {
    fn default() -> Self {
        Self {
            answers: 1,
            wrong_id: false,
            stall_once: Arc::new(AtomicBool::new(false)),
            fail: false,
            delay: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Handler for TestHandler {
    async fn serve_dns(&self, rw: &mut dyn ResponseWriter, request: Message) -> dnscrypt_common::Result<()> {
        if self.stall_once.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return Ok(());
        }
        if self.fail {
            return Err(Error::Timeout);
        }

        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let id = if self.wrong_id {
            request.id().wrapping_add(1)
        } else {
            request.id()
        };

        let mut reply = Message::new();
        reply
            .set_id(id)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(true);
        reply.add_queries(request.queries().to_vec());

        let name = request.queries()[0].name().clone();
        for i in 0..self.answers {
            let addr = if i == 0 { A::new(8, 8, 8, 8) } else { A::new(10, 0, 0, i) };
            reply.add_answer(Record::from_rdata(name.clone(), 300, RData::A(addr)));
        }

        rw.write_msg(&reply).await
    }
}

pub struct TestResolver {
    pub addr: SocketAddr,
    pub server: Arc<Server>,
    pub stamp: ServerStamp,
    pub provider: SigningKey,
}

impl Drop for TestResolver {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

pub fn certificate(provider: &SigningKey, not_before: u32, not_after: u32) -> Certificate {
    Certificate::generate(provider, CryptoConstruction::XChacha20Poly1305, 1, not_before, not_after)
}

/// Start a resolver serving UDP and TCP on one loopback port.
pub async fn start_resolver(handler: TestHandler) -> TestResolver {
    start_resolver_with(handler, DEFAULT_MAX_UDP_IN_FLIGHT).await
}

pub async fn start_resolver_with(handler: TestHandler, max_udp_in_flight: usize) -> TestResolver {
    let provider = SigningKey::generate(&mut OsRng);
    let now = unix_now();
    let cert = certificate(&provider, now - 60, now + 3600);
    let server = Arc::new(
        Server::new(PROVIDER_NAME, cert)
            .with_handler(handler)
            .with_max_udp_in_flight(max_udp_in_flight),
    );

    let (udp, tcp) = bind_pair().await;
    let addr = tcp.local_addr().unwrap();
    tokio::spawn(server.clone().serve_udp(udp));
    tokio::spawn(server.clone().serve_tcp(tcp));

    TestResolver {
        addr,
        server,
        stamp: ServerStamp {
            server_addr: addr,
            server_pk: provider.verifying_key().to_bytes(),
            provider_name: PROVIDER_NAME.to_string(),
        },
        provider,
    }
}

/// UDP socket and TCP listener on the same loopback port.
pub async fn bind_pair() -> (Arc<UdpSocket>, Arc<TcpListener>) {
    for _ in 0..20 {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        if let Ok(udp) = UdpSocket::bind(tcp.local_addr().unwrap()).await {
            return (Arc::new(udp), Arc::new(tcp));
        }
    }
    panic!("no loopback port free for both UDP and TCP");
}

pub fn a_query(name: &str, id: u16) -> Message {
    let mut m = Message::new();
    m.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    m.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
    m
}
