// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNSCrypt Resolver
//
// Serves the DNSCrypt v2 certificate handshake and encrypted queries over UDP
// and TCP on one address, forwarding decrypted queries to a plain DNS
// upstream. A fresh resolver key pair and certificate are issued at startup
// and again every --cert-ttl. The listening sockets are bound once and handed
// to each new server, so a rotation never rebinds the address.

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use dnscrypt_common::cert::unix_now;
use dnscrypt_common::server::DEFAULT_MAX_UDP_IN_FLIGHT;
use dnscrypt_common::{Certificate, CryptoConstruction, ForwardHandler, Server};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::net::{TcpListener, UdpSocket};
use tracing::info;

#[derive(Parser)]
#[command(name = "dnscrypt-resolver", about = "DNSCrypt v2 resolver")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Listen address for UDP and TCP
    #[arg(long, default_value = "[::]:5443")]
    listen: SocketAddr,

    /// Plain DNS upstream (UDP)
    #[arg(long, default_value = "9.9.9.9:53")]
    upstream: SocketAddr,

    /// Provider name clients ask for the certificate
    #[arg(long, default_value = "2.dnscrypt-cert.example.org")]
    provider_name: String,

    /// Ed25519 provider secret key (base64, 32 bytes decoded)
    #[arg(long, conflicts_with = "provider_key_file")]
    provider_key: Option<String>,

    /// Path to file containing the Ed25519 provider secret key (raw 32 bytes)
    #[arg(long, conflicts_with = "provider_key")]
    provider_key_file: Option<String>,

    /// Encryption construction advertised in the certificate
    #[arg(long, value_enum, default_value_t = Construction::Xchacha20)]
    construction: Construction,

    /// Certificate lifetime and rotation interval (e.g. "24h", "90m")
    #[arg(long, default_value = "24h", value_parser = parse_duration)]
    cert_ttl: Duration,

    /// Upstream query timeout
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    upstream_timeout: Duration,

    /// Maximum concurrently handled UDP queries
    #[arg(long, default_value_t = DEFAULT_MAX_UDP_IN_FLIGHT)]
    max_udp_in_flight: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new Ed25519 provider key pair and print base64-encoded keys
    Keygen,
}

#[derive(Clone, Copy, ValueEnum)]
enum Construction {
    Xsalsa20,
    Xchacha20,
}

impl From<Construction> for CryptoConstruction {
    fn from(c: Construction) -> Self {
        match c {
            Construction::Xsalsa20 => CryptoConstruction::XSalsa20Poly1305,
            Construction::Xchacha20 => CryptoConstruction::XChacha20Poly1305,
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(hours) = s.strip_suffix('h') {
        let h: u64 = hours.parse().map_err(|e| format!("invalid hours: {e}"))?;
        Ok(Duration::from_secs(h * 3600))
    } else if let Some(mins) = s.strip_suffix('m') {
        let m: u64 = mins.parse().map_err(|e| format!("invalid minutes: {e}"))?;
        Ok(Duration::from_secs(m * 60))
    } else if let Some(secs) = s.strip_suffix('s') {
        let s: u64 = secs.parse().map_err(|e| format!("invalid seconds: {e}"))?;
        Ok(Duration::from_secs(s))
    } else {
        let s: u64 = s.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Ok(Duration::from_secs(s))
    }
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

    if matches!(args.command, Some(Command::Keygen)) {
        return keygen();
    }

    let provider_key = load_provider_key(&args)?;
    let b64 = base64::engine::general_purpose::STANDARD;
    info!(
        provider_name = %args.provider_name,
        provider_pk = b64.encode(provider_key.verifying_key().as_bytes()),
        "loaded provider key"
    );

    let ttl = u32::try_from(args.cert_ttl.as_secs())
        .ok()
        .filter(|ttl| *ttl > 0)
        .context("--cert-ttl must be between 1s and u32::MAX seconds")?;

    let udp = Arc::new(UdpSocket::bind(args.listen).await?);
    let tcp = Arc::new(TcpListener::bind(args.listen).await?);
    info!(listen = %args.listen, "DNSCrypt resolver listening");

    let mut serial = 0u32;
    loop {
        let now = unix_now();
        serial = serial.saturating_add(1).max(now);
        let cert = Certificate::generate(&provider_key, args.construction.into(), serial, now, now.saturating_add(ttl));
        info!(
            serial,
            construction = %cert.construction,
            valid_from = %rfc3339(cert.not_before),
            valid_until = %rfc3339(cert.not_after),
            "issued resolver certificate"
        );

        let handler = ForwardHandler::new(args.upstream).with_timeout(args.upstream_timeout);
        let handler_upstream = handler.upstream();
        let server = Arc::new(
            Server::new(args.provider_name.as_str(), cert)
                .with_handler(handler)
                .with_max_udp_in_flight(args.max_udp_in_flight),
        );
        server.validate()?;
        info!(upstream = %handler_upstream, serial, "DNSCrypt resolver started");

        let udp_task = tokio::spawn(server.clone().serve_udp(udp.clone()));
        let tcp_task = tokio::spawn(server.clone().serve_tcp(tcp.clone()));

        let stop = tokio::select! {
            _ = tokio::time::sleep(args.cert_ttl) => false,
            _ = tokio::signal::ctrl_c() => true,
        };

        server.shutdown();
        udp_task.await??;
        tcp_task.await??;

        if stop {
            info!("DNSCrypt resolver stopped");
            return Ok(());
        }
        info!(serial, "rotating resolver certificate");
    }
}

fn rfc3339(ts: u32) -> String {
    DateTime::<Utc>::from_timestamp(i64::from(ts), 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Generate and print a new Ed25519 provider key pair.
fn keygen() -> anyhow::Result<()> {
    let sk = SigningKey::generate(&mut OsRng);
    let b64 = base64::engine::general_purpose::STANDARD;

    println!("DNSCrypt Provider Key Pair (Ed25519)");
    println!("====================================");
    println!();
    println!("Public Key  (32 bytes, base64):");
    println!("{}", b64.encode(sk.verifying_key().as_bytes()));
    println!();
    println!("Secret Key  (32 bytes, base64):");
    println!("{}", b64.encode(sk.to_bytes()));
    println!();
    println!("Store the secret key securely on the resolver (--provider-key or --provider-key-file).");
    println!("Configure the proxy with the public key (--server-pk).");

    Ok(())
}

fn load_provider_key(args: &Args) -> anyhow::Result<SigningKey> {
    let bytes = if let Some(ref b64) = args.provider_key {
        base64::engine::general_purpose::STANDARD.decode(b64.trim())?
    } else if let Some(ref path) = args.provider_key_file {
        fs::read(path).with_context(|| format!("reading {path}"))?
    } else {
        anyhow::bail!(
            "provide --provider-key (base64) or --provider-key-file (raw bytes)\n\
             generate a key pair with: dnscrypt-resolver keygen"
        );
    };

    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("provider key must be 32 bytes, got {}", bytes.len()))?;
    Ok(SigningKey::from_bytes(&seed))
}
