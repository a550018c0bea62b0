// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Request handler seam of the DNSCrypt server.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{unspecified_for, Transport, MAX_PAYLOAD};

/// Delivers one answer back to the client that sent the query. The message
/// is re-encrypted for that client before it leaves the server.
#[async_trait]
pub trait ResponseWriter: Send {
    fn local_addr(&self) -> SocketAddr;
    fn remote_addr(&self) -> SocketAddr;
    fn transport(&self) -> Transport;
    async fn write_msg(&mut self, msg: &Message) -> Result<()>;
}

/// Answers decrypted DNS queries. On success an implementation calls
/// [`ResponseWriter::write_msg`] exactly once.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve_dns(&self, rw: &mut dyn ResponseWriter, request: Message) -> Result<()>;
}

/// Forwards queries in plaintext to a DNS server over UDP.
///
/// This is the server's fallback when no handler is configured.
#[derive(Debug, Clone)]
pub struct ForwardHandler {
    upstream: SocketAddr,
    timeout: Duration,
}

impl ForwardHandler {
    pub fn new(upstream: SocketAddr) -> Self {
        Self {
            upstream,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Resolve a packed query via the upstream server.
    async fn resolve(&self, query_wire: &[u8]) -> Result<Message> {
        let socket = UdpSocket::bind(unspecified_for(self.upstream)).await?;
        socket.connect(self.upstream).await?;
        socket.send(query_wire).await?;

        let mut buf = vec![0u8; MAX_PAYLOAD];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Timeout)??;

        Ok(Message::from_vec(&buf[..len])?)
    }
}

impl Default for ForwardHandler {
    fn default() -> Self {
        Self::new((Ipv4Addr::new(8, 8, 8, 8), 53).into())
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn serve_dns(&self, rw: &mut dyn ResponseWriter, request: Message) -> Result<()> {
        for q in request.queries() {
            debug!(name = %q.name(), qtype = ?q.query_type(), upstream = %self.upstream, "forwarding");
        }

        let response = self.resolve(&request.to_vec()?).await?;
        if response.id() != request.id() {
            return Err(Error::IdMismatch {
                expected: request.id(),
                got: response.id(),
            });
        }

        rw.write_msg(&response).await
    }
}
