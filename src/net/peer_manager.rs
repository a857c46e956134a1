//! Pool of peer message connections keyed by username
//!
//! Concurrent requests for the same user collapse onto one shared connect
//! future. Outbound establishment races a direct dial against an indirect
//! solicitation through the server; the first to succeed wins and the loser
//! is cancelled. An unsolicited inbound connection supersedes whatever is
//! cached for that user, because the remote client sends traffic only on
//! its newest socket.

use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventBus};
use crate::net::conn::{Connection, ConnectionId};
use crate::net::message_conn::MessageConnection;
use crate::net::slots;
use crate::options::ConnectionOptions;
use crate::proto::peer::PeerInitMessage;
use crate::proto::server::ServerRequest;
use crate::proto::{ConnectionType, ServerCode};
use crate::token::TokenFactory;
use crate::waiter::{WaitKey, Waiter};
use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One decoded-frame delivery from a peer message connection.
#[derive(Debug)]
pub struct PeerFrame {
    pub username: String,
    pub conn_id: ConnectionId,
    pub body: Bytes,
}

type ConnectOutcome = std::result::Result<Arc<MessageConnection>, Arc<Error>>;
type SharedConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

struct PeerEntry {
    attempt: u64,
    future: SharedConnect,
}

struct Inner {
    connections: StdMutex<HashMap<String, PeerEntry>>,
    /// One-permit gates serialising reconnection logic per user.
    user_gates: StdMutex<HashMap<String, Arc<Semaphore>>>,
    /// Global bound on concurrent outbound peer connections.
    limit: StdMutex<Arc<Semaphore>>,
    waiter: Waiter,
    tokens: Arc<TokenFactory>,
    server_tx: mpsc::UnboundedSender<ServerRequest>,
    frame_tx: mpsc::UnboundedSender<PeerFrame>,
    events: Arc<EventBus>,
    peer_options: StdMutex<ConnectionOptions>,
    transfer_options: StdMutex<ConnectionOptions>,
    username: StdMutex<String>,
    message_timeout: StdMutex<Duration>,
    attempt_counter: AtomicU64,
    /// In-flight transfer dials, keyed by endpoint + token so duplicate
    /// attempts collapse instead of opening parallel sockets.
    transfer_dials: StdMutex<HashSet<(SocketAddr, u32)>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct PeerConnectionManager {
    inner: Arc<Inner>,
}

impl PeerConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        waiter: Waiter,
        tokens: Arc<TokenFactory>,
        server_tx: mpsc::UnboundedSender<ServerRequest>,
        frame_tx: mpsc::UnboundedSender<PeerFrame>,
        events: Arc<EventBus>,
        peer_options: ConnectionOptions,
        transfer_options: ConnectionOptions,
        max_concurrent: usize,
        message_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: StdMutex::new(HashMap::new()),
                user_gates: StdMutex::new(HashMap::new()),
                limit: StdMutex::new(Arc::new(Semaphore::new(max_concurrent))),
                waiter,
                tokens,
                server_tx,
                frame_tx,
                events,
                peer_options: StdMutex::new(peer_options),
                transfer_options: StdMutex::new(transfer_options),
                username: StdMutex::new(String::new()),
                message_timeout: StdMutex::new(message_timeout),
                attempt_counter: AtomicU64::new(0),
                transfer_dials: StdMutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Record the logged-in username used in outbound `PeerInit` frames.
    pub fn set_username(&self, username: &str) {
        *self.inner.username.lock().expect("username poisoned") = username.to_string();
    }

    /// Apply patched options. The concurrency bound applies to connections
    /// established after the patch; live connections are unaffected.
    pub fn reconfigure(
        &self,
        peer_options: ConnectionOptions,
        transfer_options: ConnectionOptions,
        max_concurrent: usize,
        message_timeout: Duration,
    ) {
        *self.inner.peer_options.lock().expect("options poisoned") = peer_options;
        *self
            .inner
            .transfer_options
            .lock()
            .expect("options poisoned") = transfer_options;
        *self.inner.limit.lock().expect("limit poisoned") =
            Arc::new(Semaphore::new(max_concurrent));
        *self.inner.message_timeout.lock().expect("timeout poisoned") = message_timeout;
    }

    /// Number of cached peer entries (connected or still connecting).
    pub fn len(&self) -> usize {
        self.inner
            .connections
            .lock()
            .expect("connections poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The established connection for `username`, if one is cached.
    pub fn get_connected(&self, username: &str) -> Option<Arc<MessageConnection>> {
        let map = self
            .inner
            .connections
            .lock()
            .expect("connections poisoned");
        let entry = map.get(username)?;
        match entry.future.peek() {
            Some(Ok(mc)) if mc.is_connected() => Some(Arc::clone(mc)),
            _ => None,
        }
    }

    /// Get the peer message connection for `username`, establishing one if
    /// none is cached. Two concurrent calls for the same user share one
    /// attempt.
    pub async fn get_or_connect(
        &self,
        username: &str,
        endpoint: Option<SocketAddr>,
    ) -> Result<Arc<MessageConnection>> {
        let future = {
            let mut map = self
                .inner
                .connections
                .lock()
                .expect("connections poisoned");
            match map.get(username) {
                Some(entry) => entry.future.clone(),
                None => {
                    let attempt = self.inner.attempt_counter.fetch_add(1, Ordering::Relaxed);
                    let future =
                        Inner::connect_future(&self.inner, username.to_string(), endpoint, attempt);
                    map.insert(
                        username.to_string(),
                        PeerEntry {
                            attempt,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        match future.await {
            Ok(mc) if mc.is_connected() => Ok(mc),
            Ok(mc) => {
                // cached connection died; drop the stale entry and retry once
                self.inner.remove_entry_for(username, mc.id());
                let future = {
                    let mut map = self
                        .inner
                        .connections
                        .lock()
                        .expect("connections poisoned");
                    match map.get(username) {
                        Some(entry) => entry.future.clone(),
                        None => {
                            let attempt =
                                self.inner.attempt_counter.fetch_add(1, Ordering::Relaxed);
                            let future = Inner::connect_future(
                                &self.inner,
                                username.to_string(),
                                endpoint,
                                attempt,
                            );
                            map.insert(
                                username.to_string(),
                                PeerEntry {
                                    attempt,
                                    future: future.clone(),
                                },
                            );
                            future
                        }
                    }
                };
                future.await.map_err(|e| e.duplicate())
            }
            Err(e) => Err(e.duplicate()),
        }
    }

    /// Adopt an unsolicited inbound peer message connection, superseding any
    /// cached one for the user. Refused when the global connection bound is
    /// already saturated.
    pub fn accept_inbound(
        &self,
        username: String,
        conn: Arc<Connection>,
    ) -> Option<Arc<MessageConnection>> {
        let limit = Arc::clone(&self.inner.limit.lock().expect("limit poisoned"));
        let permit = match limit.try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%username, "inbound peer connection refused, at capacity");
                tokio::spawn(async move {
                    conn.disconnect("too many peer connections").await;
                });
                return None;
            }
        };
        let mc = self.inner.attach(username.clone(), conn, Some(permit));
        let attempt = self.inner.attempt_counter.fetch_add(1, Ordering::Relaxed);
        let ready: SharedConnect = futures::future::ready(Ok(Arc::clone(&mc)))
            .boxed()
            .shared();

        let previous = {
            let mut map = self
                .inner
                .connections
                .lock()
                .expect("connections poisoned");
            map.insert(
                username.clone(),
                PeerEntry {
                    attempt,
                    future: ready,
                },
            )
        };

        if let Some(old) = previous {
            if let Some(Ok(old_mc)) = old.future.peek().cloned() {
                if old_mc.id() != mc.id() {
                    info!(%username, old = %old_mc.id(), new = %mc.id(), "superseding peer connection");
                    self.inner
                        .events
                        .publish(ClientEvent::PeerConnectionSuperseded {
                            username: username.clone(),
                        });
                    tokio::spawn(async move {
                        old_mc.disconnect("Superseded").await;
                    });
                }
            }
        }
        Some(mc)
    }

    /// Dial back a peer that solicited us through the server, opening the
    /// connection with `PierceFirewall(token)`.
    pub async fn dial_back(
        &self,
        addr: SocketAddr,
        token: u32,
        options: ConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        let conn = Connection::new(addr, options, None);
        conn.connect(cancel).await?;
        let pierce = PeerInitMessage::PierceFirewall { token };
        conn.write(&pierce.to_bytes(), cancel).await?;
        Ok(conn)
    }

    /// Open a dedicated transfer ("F") connection to a peer, racing direct
    /// against indirect. Duplicate attempts for the same endpoint and token
    /// are rejected.
    pub async fn connect_transfer(
        &self,
        username: &str,
        endpoint: Option<SocketAddr>,
        token: u32,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        let addr = match endpoint {
            Some(addr) => addr,
            None => self.inner.resolve_endpoint(username, cancel).await?,
        };

        {
            let mut dials = self
                .inner
                .transfer_dials
                .lock()
                .expect("transfer dials poisoned");
            if !dials.insert((addr, token)) {
                return Err(Error::InvalidState(format!(
                    "transfer connection to {addr} for token {token} already in progress"
                )));
            }
        }
        let options = self
            .inner
            .transfer_options
            .lock()
            .expect("options poisoned")
            .clone();
        let result = self
            .inner
            .dial_race(username, addr, ConnectionType::Transfer, options, cancel)
            .await;
        self.inner
            .transfer_dials
            .lock()
            .expect("transfer dials poisoned")
            .remove(&(addr, token));
        result
    }

    /// Establish a distributed ("D") connection to a candidate parent.
    pub async fn connect_distributed(
        &self,
        username: &str,
        endpoint: SocketAddr,
        options: ConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        self.inner
            .dial_race(
                username,
                endpoint,
                ConnectionType::Distributed,
                options,
                cancel,
            )
            .await
    }

    /// Resolve a user's listen endpoint through the server.
    pub async fn resolve_endpoint(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<SocketAddr> {
        self.inner.resolve_endpoint(username, cancel).await
    }

    /// Disconnect everything and refuse new work.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let entries: Vec<SharedConnect> = {
            let mut map = self
                .inner
                .connections
                .lock()
                .expect("connections poisoned");
            map.drain().map(|(_, e)| e.future).collect()
        };
        for future in entries {
            if let Some(Ok(mc)) = future.peek().cloned() {
                mc.disconnect("client shutting down").await;
            }
        }
    }
}

impl Inner {
    fn connect_future(
        inner: &Arc<Inner>,
        username: String,
        endpoint: Option<SocketAddr>,
        attempt: u64,
    ) -> SharedConnect {
        let inner = Arc::clone(inner);
        async move {
            match Inner::establish(&inner, &username, endpoint).await {
                Ok(mc) => Ok(mc),
                Err(e) => {
                    // remove the failed entry before surfacing the error, so
                    // the next caller starts a fresh attempt instead of
                    // awaiting this dead future
                    let mut map = inner.connections.lock().expect("connections poisoned");
                    if map.get(&username).is_some_and(|entry| entry.attempt == attempt) {
                        map.remove(&username);
                    }
                    Err(Arc::new(e))
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn establish(
        inner: &Arc<Inner>,
        username: &str,
        endpoint: Option<SocketAddr>,
    ) -> Result<Arc<MessageConnection>> {
        let gate = inner.user_gate(username);
        let _gate_permit = gate
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;

        let limit = Arc::clone(&inner.limit.lock().expect("limit poisoned"));
        let permit = limit.acquire_owned().await.map_err(|_| Error::Cancelled)?;

        let cancel = inner.shutdown.child_token();
        let addr = match endpoint {
            Some(addr) => addr,
            None => inner.resolve_endpoint(username, &cancel).await?,
        };

        let options = inner.peer_options.lock().expect("options poisoned").clone();
        let conn = inner
            .dial_race(username, addr, ConnectionType::Peer, options, &cancel)
            .await?;
        debug!(%username, id = %conn.id(), addr = %addr, "peer connection established");
        Ok(inner.attach(username.to_string(), conn, Some(permit)))
    }

    /// Race a direct dial against an indirect solicitation; first success
    /// wins, the loser is cancelled. Both failing means the peer is
    /// unreachable.
    async fn dial_race(
        self: &Arc<Self>,
        username: &str,
        addr: SocketAddr,
        kind: ConnectionType,
        options: ConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        let our_username = self.username.lock().expect("username poisoned").clone();
        let direct_cancel = cancel.child_token();
        let indirect_cancel = cancel.child_token();

        let direct = {
            let options = options.clone();
            let our_username = our_username.clone();
            let direct_cancel = direct_cancel.clone();
            async move {
                let conn = Connection::new(addr, options, None);
                conn.connect(&direct_cancel).await?;
                let init = PeerInitMessage::PeerInit {
                    username: our_username,
                    kind,
                    token: 0,
                };
                conn.write(&init.to_bytes(), &direct_cancel).await?;
                Ok::<_, Error>(conn)
            }
        };

        let indirect = {
            let inner = Arc::clone(self);
            let username = username.to_string();
            let options = options.clone();
            let indirect_cancel = indirect_cancel.clone();
            async move {
                let token = inner.tokens.next();
                let key = WaitKey::named(slots::SOLICITED_CONNECTION).with(token);
                let wait = inner.waiter.wait::<TcpStream>(
                    key,
                    Some(options.connect_timeout()),
                    Some(indirect_cancel.clone()),
                );
                inner
                    .server_tx
                    .send(ServerRequest::ConnectToPeer {
                        token,
                        username,
                        kind,
                    })
                    .map_err(|_| Error::InvalidState("server connection is gone".into()))?;
                let stream = wait.await?;
                Ok::<_, Error>(Connection::adopt(stream, options, None))
            }
        };

        tokio::pin!(direct);
        tokio::pin!(indirect);

        let winner = tokio::select! {
            d = &mut direct => match d {
                Ok(conn) => {
                    indirect_cancel.cancel();
                    Ok(conn)
                }
                Err(direct_err) => {
                    debug!(%username, error = %direct_err, "direct connect failed, awaiting indirect");
                    indirect.await
                }
            },
            i = &mut indirect => match i {
                Ok(conn) => {
                    direct_cancel.cancel();
                    Ok(conn)
                }
                Err(indirect_err) => {
                    debug!(%username, error = %indirect_err, "indirect connect failed, awaiting direct");
                    direct.await
                }
            },
        };

        match winner {
            Ok(conn) => Ok(conn),
            Err(e) => {
                warn!(%username, addr = %addr, error = %e, "peer unreachable");
                Err(e)
            }
        }
    }

    /// Start the read loop and the disconnect-cleanup task for a connection
    /// that has become the authoritative one for `username`.
    fn attach(
        self: &Arc<Self>,
        username: String,
        conn: Arc<Connection>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<MessageConnection> {
        let frame_tx = self.frame_tx.clone();
        let id = conn.id();
        let frame_user = username.clone();
        let mc = MessageConnection::start(conn, move |body| {
            let _ = frame_tx.send(PeerFrame {
                username: frame_user.clone(),
                conn_id: id,
                body,
            });
        });

        let weak = Arc::downgrade(self);
        let watcher = Arc::clone(&mc);
        tokio::spawn(async move {
            watcher.wait_for_disconnect().await;
            drop(permit);
            if let Some(inner) = weak.upgrade() {
                inner.remove_entry_for(&username, id);
            }
        });
        mc
    }

    /// Drop the cache entry for `username`, but only if it still refers to
    /// the connection identified by `id` — a superseding entry stays.
    fn remove_entry_for(&self, username: &str, id: ConnectionId) {
        let mut map = self.connections.lock().expect("connections poisoned");
        let matches = map
            .get(username)
            .and_then(|entry| entry.future.peek())
            .map(|outcome| match outcome {
                Ok(mc) => mc.id() == id,
                Err(_) => false,
            })
            .unwrap_or(false);
        if matches {
            map.remove(username);
            debug!(%username, %id, "peer connection entry removed");
        }
    }

    fn user_gate(&self, username: &str) -> Arc<Semaphore> {
        let mut gates = self.user_gates.lock().expect("user gates poisoned");
        Arc::clone(
            gates
                .entry(username.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    async fn resolve_endpoint(
        self: &Arc<Self>,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<SocketAddr> {
        let timeout = *self.message_timeout.lock().expect("timeout poisoned");
        let key = WaitKey::server(ServerCode::GetPeerAddress).with(username);
        let wait = self
            .waiter
            .wait::<(Ipv4Addr, u16)>(key, Some(timeout), Some(cancel.clone()));
        self.server_tx
            .send(ServerRequest::GetPeerAddress(username.to_string()))
            .map_err(|_| Error::InvalidState("server connection is gone".into()))?;
        let (ip, port) = wait.await?;
        if port == 0 || ip.is_unspecified() {
            return Err(Error::UserOffline(username.to_string()));
        }
        Ok(SocketAddr::from((ip, port)))
    }
}
