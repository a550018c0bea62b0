// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNSCrypt Proxy
//
// Accepts plaintext DNS over UDP and TCP on a local address and forwards each
// query to a DNSCrypt resolver. Failed exchanges are answered with SERVFAIL.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use clap::Parser;
use dnscrypt_common::protocol::{self, Transport, MAX_PAYLOAD};
use dnscrypt_common::{DnsCryptUpstream, ServerStamp};
use hickory_proto::op::{Message, ResponseCode};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "dnscrypt-proxy", about = "Plain DNS to DNSCrypt proxy")]
struct Args {
    /// Listen address for plaintext DNS (UDP and TCP)
    #[arg(long, default_value = "127.0.0.1:5353")]
    listen: SocketAddr,

    /// DNSCrypt resolver address
    #[arg(long)]
    server: SocketAddr,

    /// Resolver provider public key (Ed25519, base64-encoded, 32 bytes decoded)
    #[arg(long)]
    server_pk: String,

    /// Resolver provider name
    #[arg(long, default_value = "2.dnscrypt-cert.example.org")]
    provider_name: String,

    /// Per-exchange timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Use TCP as the primary transport to the resolver
    #[arg(long)]
    tcp: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let stamp = load_stamp(&args)?;
    let transport = if args.tcp { Transport::Tcp } else { Transport::Udp };

    let upstream = Arc::new(
        DnsCryptUpstream::new(stamp, Duration::from_secs(args.timeout)).with_transport(transport),
    );

    let udp = Arc::new(UdpSocket::bind(args.listen).await?);
    let tcp = TcpListener::bind(args.listen).await?;
    info!(
        listen = %args.listen,
        server = %upstream.stamp().server_addr,
        provider_name = %upstream.stamp().provider_name,
        %transport,
        "DNSCrypt proxy started"
    );

    tokio::select! {
        result = serve_udp(udp, upstream.clone()) => result?,
        result = serve_tcp(tcp, upstream) => result?,
        _ = tokio::signal::ctrl_c() => info!("DNSCrypt proxy stopped"),
    }
    Ok(())
}

async fn serve_udp(socket: Arc<UdpSocket>, upstream: Arc<DnsCryptUpstream>) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_PAYLOAD];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "UDP receive failed");
                continue;
            }
        };

        let query = buf[..len].to_vec();
        let socket = Arc::clone(&socket);
        let upstream = Arc::clone(&upstream);
        tokio::spawn(async move {
            if let Some(reply) = resolve(&upstream, &query).await {
                if let Err(e) = socket.send_to(&reply, peer).await {
                    warn!(%peer, error = %e, "failed to send reply");
                }
            }
        });
    }
}

async fn serve_tcp(listener: TcpListener, upstream: Arc<DnsCryptUpstream>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let upstream = Arc::clone(&upstream);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &upstream).await {
                debug!(%peer, error = %e, "connection closed");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, upstream: &DnsCryptUpstream) -> anyhow::Result<()> {
    loop {
        let query = match protocol::read_framed(&mut stream).await {
            Ok(query) => query,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match resolve(upstream, &query).await {
            Some(reply) => protocol::write_framed(&mut stream, &reply).await?,
            None => return Ok(()),
        }
    }
}

/// Forward one plaintext query. `None` when the query is not a DNS message.
async fn resolve(upstream: &DnsCryptUpstream, wire: &[u8]) -> Option<Vec<u8>> {
    let query = match Message::from_vec(wire) {
        Ok(query) => query,
        Err(e) => {
            debug!(error = %e, "dropping malformed query");
            return None;
        }
    };
    for q in query.queries() {
        debug!(name = %q.name(), qtype = ?q.query_type(), "query");
    }

    let reply = match upstream.exchange(&query).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "DNSCrypt exchange failed");
            servfail(&query)
        }
    };

    match reply.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "failed to pack reply");
            servfail(&query).to_vec().ok()
        }
    }
}

fn servfail(query: &Message) -> Message {
    let mut reply = Message::error_msg(query.id(), query.op_code(), ResponseCode::ServFail);
    reply.set_recursion_desired(query.recursion_desired());
    reply.add_queries(query.queries().to_vec());
    reply
}

fn load_stamp(args: &Args) -> anyhow::Result<ServerStamp> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(args.server_pk.trim())?;
    let server_pk: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("--server-pk must decode to 32 bytes, got {}", bytes.len()))?;

    Ok(ServerStamp {
        server_addr: args.server,
        server_pk,
        provider_name: args.provider_name.clone(),
    })
}
