// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// TCP listener of the DNSCrypt server. Frames on one connection are handled
// strictly in order. A bad frame or a failed handler closes the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::{Dispatch, ResponseWriter, Server};
use crate::error::Result;
use crate::protocol::{read_framed, write_framed, Transport};
use crate::query::EncryptedQuery;

impl Server {
    /// Serve DNSCrypt over TCP until [`Server::shutdown`] is called.
    pub async fn serve_tcp(self: Arc<Self>, listener: Arc<TcpListener>) -> Result<()> {
        self.validate()?;

        let local_addr = listener.local_addr()?;
        let mut shutdown = self.shutdown.subscribe();
        info!(addr = %local_addr, provider = %self.provider_name(), "DNSCrypt TCP listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (stream, peer) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        continue;
                    }
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, local_addr, peer).await;
            });
        }

        info!(addr = %local_addr, "DNSCrypt TCP listener stopped");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, local_addr: SocketAddr, peer: SocketAddr) {
        debug!(%peer, "TCP connection opened");

        loop {
            let frame = match read_framed(&mut stream).await {
                Ok(frame) => frame,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    debug!(%peer, error = %e, "TCP read failed");
                    break;
                }
            };

            match self.dispatch(&frame) {
                Dispatch::Certificate(reply) => {
                    debug!(%peer, "answering certificate request");
                    if let Err(e) = write_framed(&mut stream, &reply).await {
                        debug!(%peer, error = %e, "failed to send certificate");
                        break;
                    }
                }
                Dispatch::Query(request, query) => {
                    let mut rw = TcpResponseWriter {
                        server: &self,
                        stream: &mut stream,
                        local_addr,
                        peer,
                        query,
                    };
                    if let Err(e) = self.handler.serve_dns(&mut rw, request).await {
                        warn!(%peer, error = %e, "handler failed, closing TCP connection");
                        break;
                    }
                }
                Dispatch::Drop(reason) => {
                    debug!(%peer, ?reason, len = frame.len(), "closing TCP connection on bad frame");
                    break;
                }
            }
        }

        debug!(%peer, "TCP connection closed");
    }
}

struct TcpResponseWriter<'a> {
    server: &'a Server,
    stream: &'a mut TcpStream,
    local_addr: SocketAddr,
    peer: SocketAddr,
    query: EncryptedQuery,
}

#[async_trait]
impl ResponseWriter for TcpResponseWriter<'_> {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        let wire = self.server.seal_response(&msg.to_vec()?, &self.query)?;
        write_framed(&mut *self.stream, &wire).await?;
        Ok(())
    }
}
