// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNSCrypt client: certificate handshake and encrypted exchanges.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::cert::{unix_now, Certificate};
use crate::crypto::{self, SharedKey, HALF_NONCE_LEN, KEY_LEN};
use crate::error::{Error, Result};
use crate::protocol::{read_framed, unspecified_for, write_framed, Transport, MAX_PAYLOAD};
use crate::query::{EncryptedQuery, MIN_UDP_QUERY_LEN};
use crate::response::EncryptedResponse;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How to reach a resolver: address, provider signing key and provider name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStamp {
    pub server_addr: SocketAddr,
    /// Ed25519 public key the provider signs certificates with.
    pub server_pk: [u8; KEY_LEN],
    pub provider_name: String,
}

/// A resolver after a successful handshake.
#[derive(Debug, Clone)]
pub struct ResolverInfo {
    pub server_address: SocketAddr,
    pub provider_name: String,
    pub server_public_key: [u8; KEY_LEN],
    pub resolver_cert: Certificate,
}

#[derive(Debug, Clone)]
pub struct Client {
    transport: Transport,
    timeout: Duration,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(Transport::Udp, DEFAULT_TIMEOUT)
    }
}

impl Client {
    pub fn new(transport: Transport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch, verify and select the resolver certificate.
    ///
    /// Every TXT answer is tried; the valid certificate with the highest
    /// serial wins.
    pub async fn dial(&self, stamp: &ServerStamp) -> Result<ResolverInfo> {
        let provider_pk = VerifyingKey::from_bytes(&stamp.server_pk)
            .map_err(|e| Error::Configuration(format!("invalid provider public key: {e}")))?;

        let request = certificate_request(&stamp.provider_name)?;
        let reply = self
            .with_timeout(self.roundtrip_plain(stamp.server_addr, &request.to_vec()?))
            .await
            .map_err(|e| Error::CertificateFetch {
                address: stamp.server_addr.to_string(),
                source: Box::new(e),
            })?;

        let reply = Message::from_vec(&reply)?;
        if reply.id() != request.id() {
            return Err(Error::IdMismatch {
                expected: request.id(),
                got: reply.id(),
            });
        }

        let chunks = reply.answers().iter().filter_map(|record| match record.data() {
            Some(RData::TXT(txt)) => Some(txt.txt_data().to_vec()),
            _ => None,
        });
        let resolver_cert = select_certificate(chunks, &provider_pk, unix_now())?;
        debug!(
            server = %stamp.server_addr,
            serial = resolver_cert.serial,
            construction = %resolver_cert.construction,
            "certificate accepted"
        );

        Ok(ResolverInfo {
            server_address: stamp.server_addr,
            provider_name: stamp.provider_name.clone(),
            server_public_key: stamp.server_pk,
            resolver_cert,
        })
    }

    /// Encrypted exchange on a fresh socket of the client's transport.
    pub async fn exchange(&self, msg: &Message, info: &ResolverInfo) -> Result<Message> {
        self.with_timeout(async {
            match self.transport {
                Transport::Udp => {
                    let socket = UdpSocket::bind(unspecified_for(info.server_address)).await?;
                    socket.connect(info.server_address).await?;

                    let (wire, query, key) = encrypt_query(msg, info, MIN_UDP_QUERY_LEN)?;
                    socket.send(&wire).await?;

                    let mut buf = vec![0u8; MAX_PAYLOAD];
                    let len = socket.recv(&mut buf).await?;
                    decrypt_response(&buf[..len], info, &query, &key)
                }
                Transport::Tcp => {
                    let mut stream = TcpStream::connect(info.server_address).await?;
                    stream_roundtrip(&mut stream, msg, info).await
                }
            }
        })
        .await
    }

    /// Encrypted exchange over an existing stream. Requests on one stream
    /// must be issued one after another.
    pub async fn exchange_stream<S>(&self, stream: &mut S, msg: &Message, info: &ResolverInfo) -> Result<Message>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.with_timeout(stream_roundtrip(stream, msg, info)).await
    }

    async fn roundtrip_plain(&self, server: SocketAddr, packet: &[u8]) -> Result<Vec<u8>> {
        match self.transport {
            Transport::Udp => {
                let socket = UdpSocket::bind(unspecified_for(server)).await?;
                socket.connect(server).await?;
                socket.send(packet).await?;

                let mut buf = vec![0u8; MAX_PAYLOAD];
                let len = socket.recv(&mut buf).await?;
                buf.truncate(len);
                Ok(buf)
            }
            Transport::Tcp => {
                let mut stream = TcpStream::connect(server).await?;
                write_framed(&mut stream, packet).await?;
                Ok(read_framed(&mut stream).await?)
            }
        }
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

fn certificate_request(provider_name: &str) -> Result<Message> {
    let mut request = Message::new();
    request
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    request.add_query(Query::query(Name::from_ascii(provider_name)?, RecordType::TXT));
    Ok(request)
}

/// Pick the highest-serial certificate that parses, carries a valid provider
/// signature and is inside its validity window at `now`.
fn select_certificate<I, C>(answers: I, provider_pk: &VerifyingKey, now: u32) -> Result<Certificate>
where
    I: IntoIterator<Item = C>,
    C: IntoIterator,
    C::Item: AsRef<[u8]>,
{
    let mut best: Option<Certificate> = None;
    for chunks in answers {
        let cert = match Certificate::from_txt_chunks(chunks) {
            Ok(cert) => cert,
            Err(e) => {
                debug!(error = %e, "skipping unparsable certificate");
                continue;
            }
        };
        if let Err(e) = cert.verify_signature(provider_pk) {
            debug!(serial = cert.serial, error = %e, "skipping certificate");
            continue;
        }
        if !cert.verify_validity_window(now) {
            debug!(serial = cert.serial, "skipping certificate outside its validity window");
            continue;
        }
        if best.as_ref().map_or(true, |b| cert.serial > b.serial) {
            best = Some(cert);
        }
    }
    best.ok_or_else(|| Error::Handshake("no valid certificate in the reply".into()))
}

fn encrypt_query(msg: &Message, info: &ResolverInfo, min_len: usize) -> Result<(Vec<u8>, EncryptedQuery, SharedKey)> {
    let cert = &info.resolver_cert;
    let (client_pk, client_sk) = crypto::generate_keypair();
    let key = crypto::compute_shared_key(cert.construction, &client_sk[..], &cert.resolver_pk)?;

    let query = EncryptedQuery::new(cert.construction, cert.client_magic, client_pk);
    let wire = query.encrypt(&msg.to_vec()?, &key, min_len)?;
    Ok((wire, query, key))
}

fn decrypt_response(wire: &[u8], info: &ResolverInfo, query: &EncryptedQuery, key: &SharedKey) -> Result<Message> {
    let (nonce, packet) = EncryptedResponse::decrypt(info.resolver_cert.construction, wire, key)?;
    if nonce[..HALF_NONCE_LEN] != query.half_nonce {
        return Err(Error::NonceMismatch);
    }
    Ok(Message::from_vec(&packet)?)
}

async fn stream_roundtrip<S>(stream: &mut S, msg: &Message, info: &ResolverInfo) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (wire, query, key) = encrypt_query(msg, info, 0)?;
    write_framed(stream, &wire).await?;
    let reply = read_framed(stream).await?;
    decrypt_response(&reply, info, &query, &key)
}
