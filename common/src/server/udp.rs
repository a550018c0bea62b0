// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// UDP listener of the DNSCrypt server.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{Dispatch, ResponseWriter, Server};
use crate::error::Result;
use crate::protocol::{Transport, MAX_PAYLOAD};
use crate::query::EncryptedQuery;
use crate::response::EncryptedResponse;

impl Server {
    /// Serve DNSCrypt over UDP until [`Server::shutdown`] is called.
    ///
    /// Each datagram is handled on its own task; at most
    /// `max_udp_in_flight` run at once and further datagrams wait in the
    /// socket buffer. The socket is shared so that a later `Server` can keep
    /// serving on it while tasks of this one are still answering.
    pub async fn serve_udp(self: Arc<Self>, socket: Arc<UdpSocket>) -> Result<()> {
        self.validate()?;

        let local_addr = socket.local_addr()?;
        let permits = Arc::new(Semaphore::new(self.max_udp_in_flight));
        let mut shutdown = self.shutdown.subscribe();
        info!(addr = %local_addr, provider = %self.provider_name(), "DNSCrypt UDP listener started");

        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (len, peer) = tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                },
            };

            let packet = buf[..len].to_vec();
            let server = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                server.handle_datagram(socket, local_addr, peer, packet).await;
                drop(permit);
            });
        }

        info!(addr = %local_addr, "DNSCrypt UDP listener stopped");
        Ok(())
    }

    async fn handle_datagram(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        local_addr: SocketAddr,
        peer: SocketAddr,
        packet: Vec<u8>,
    ) {
        match self.dispatch(&packet) {
            Dispatch::Certificate(reply) => {
                debug!(%peer, "answering certificate request");
                if let Err(e) = socket.send_to(&reply, peer).await {
                    warn!(%peer, error = %e, "failed to send certificate");
                }
            }
            Dispatch::Query(request, query) => {
                let mut rw = UdpResponseWriter {
                    server: &self,
                    socket: &socket,
                    local_addr,
                    peer,
                    query,
                    request_len: packet.len(),
                };
                if let Err(e) = self.handler.serve_dns(&mut rw, request).await {
                    warn!(%peer, error = %e, "handler failed");
                }
            }
            Dispatch::Drop(reason) => {
                debug!(%peer, ?reason, len = packet.len(), "dropping UDP packet");
            }
        }
    }
}

struct UdpResponseWriter<'a> {
    server: &'a Server,
    socket: &'a UdpSocket,
    local_addr: SocketAddr,
    peer: SocketAddr,
    query: EncryptedQuery,
    request_len: usize,
}

#[async_trait]
impl ResponseWriter for UdpResponseWriter<'_> {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn transport(&self) -> Transport {
        Transport::Udp
    }

    /// Encrypt and send `msg`. An answer that would be larger than the query
    /// is replaced with a truncated reply so the client retries over TCP.
    async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        let mut packet = msg.to_vec()?;
        if EncryptedResponse::encrypted_len(packet.len()) > self.request_len {
            debug!(peer = %self.peer, len = packet.len(), "answer too large for UDP, truncating");
            packet = truncate(msg).to_vec()?;
        }

        let wire = self.server.seal_response(&packet, &self.query)?;
        self.socket.send_to(&wire, self.peer).await?;
        Ok(())
    }
}

/// Header and question of `msg` with the TC flag set.
fn truncate(msg: &Message) -> Message {
    let mut truncated = Message::new();
    truncated
        .set_id(msg.id())
        .set_message_type(msg.message_type())
        .set_op_code(msg.op_code())
        .set_authoritative(msg.authoritative())
        .set_recursion_desired(msg.recursion_desired())
        .set_recursion_available(msg.recursion_available())
        .set_response_code(msg.response_code())
        .set_truncated(true);
    truncated.add_queries(msg.queries().to_vec());
    truncated
}
