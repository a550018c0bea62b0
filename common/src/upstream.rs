// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNSCrypt upstream: a client bound to one resolver that caches the
// handshake result and recovers from certificate rotation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::client::{Client, ResolverInfo, ServerStamp};
use crate::error::{Error, Result};
use crate::protocol::Transport;

pub struct DnsCryptUpstream {
    stamp: ServerStamp,
    client: Client,
    tcp_client: Client,
    session: RwLock<Option<Arc<ResolverInfo>>>,
    refresh: Mutex<()>,
    handshakes: AtomicU64,
}

impl DnsCryptUpstream {
    /// UDP upstream with a per-exchange `timeout`.
    pub fn new(stamp: ServerStamp, timeout: Duration) -> Self {
        Self {
            stamp,
            client: Client::new(Transport::Udp, timeout),
            tcp_client: Client::new(Transport::Tcp, timeout),
            session: RwLock::new(None),
            refresh: Mutex::new(()),
            handshakes: AtomicU64::new(0),
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.client = Client::new(transport, self.client.timeout());
        self
    }

    pub fn stamp(&self) -> &ServerStamp {
        &self.stamp
    }

    /// Number of completed certificate handshakes.
    pub fn handshakes(&self) -> u64 {
        self.handshakes.load(Ordering::Relaxed)
    }

    /// Forget the cached session; the next exchange handshakes again.
    pub async fn invalidate(&self) {
        *self.session.write().await = None;
    }

    /// Forget `failed` if it is still the cached session. A session that a
    /// concurrent caller already replaced is left alone.
    async fn discard(&self, failed: &Arc<ResolverInfo>) {
        let mut session = self.session.write().await;
        if session.as_ref().is_some_and(|current| Arc::ptr_eq(current, failed)) {
            *session = None;
        }
    }

    /// Resolve `query` through the resolver.
    ///
    /// A timeout or dropped connection is taken as a sign the resolver
    /// rotated its certificate: the session is discarded and the exchange
    /// retried once.
    pub async fn exchange(&self, query: &Message) -> Result<Message> {
        let info = self.session().await?;
        match self.exchange_with(query, &info).await {
            Err(e) if e.is_rotation_hint() => {
                warn!(server = %self.stamp.server_addr, error = %e, "exchange failed, refreshing certificate");
                self.discard(&info).await;
                let info = self.session().await?;
                self.exchange_with(query, &info).await
            }
            result => result,
        }
    }

    async fn exchange_with(&self, query: &Message, info: &ResolverInfo) -> Result<Message> {
        let mut reply = self.client.exchange(query, info).await?;
        if reply.truncated() && self.client.transport() == Transport::Udp {
            debug!(server = %self.stamp.server_addr, "truncated reply, retrying over TCP");
            reply = self.tcp_client.exchange(query, info).await?;
        }

        if reply.id() != query.id() {
            return Err(Error::IdMismatch {
                expected: query.id(),
                got: reply.id(),
            });
        }
        Ok(reply)
    }

    /// Current session, handshaking if none is cached or it has expired.
    /// Concurrent callers share one handshake.
    async fn session(&self) -> Result<Arc<ResolverInfo>> {
        if let Some(info) = self.cached().await {
            return Ok(info);
        }

        let _refresh = self.refresh.lock().await;
        if let Some(info) = self.cached().await {
            return Ok(info);
        }

        let info = Arc::new(self.client.dial(&self.stamp).await?);
        self.handshakes.fetch_add(1, Ordering::Relaxed);
        debug!(
            server = %self.stamp.server_addr,
            serial = info.resolver_cert.serial,
            "new DNSCrypt session"
        );
        *self.session.write().await = Some(info.clone());
        Ok(info)
    }

    async fn cached(&self) -> Option<Arc<ResolverInfo>> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|info| info.resolver_cert.is_valid_now())
            .cloned()
    }
}
