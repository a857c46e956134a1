//! Position in the server-rooted search-flooding tree
//!
//! The manager keeps at most one parent connection and a bounded set of
//! children. Searches arriving from the parent are answered locally and
//! rebroadcast verbatim to every child. Topology changes roll up into a
//! fixed-layout status payload written to the server, hashed to suppress
//! no-op updates and debounced to collapse bursts.

use crate::events::{ClientEvent, EventBus};
use crate::net::conn::{Connection, ConnectionId};
use crate::net::message_conn::MessageConnection;
use crate::net::peer_manager::PeerConnectionManager;
use crate::net::slots;
use crate::options::ConnectionOptions;
use crate::proto::distributed::{DistributedMessage, DistributedSearch};
use crate::proto::server::{ParentCandidate, ServerRequest};
use crate::waiter::{WaitKey, Waiter};
use bytes::{BufMut, Bytes, BytesMut};
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::Hasher;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How many candidates from one `NetInfo` are attempted concurrently.
const MAX_PARENT_CANDIDATES: usize = 5;

/// How long a candidate has to deliver its branch level.
const CANDIDATE_BRANCH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a candidate has to deliver its first search (the live signal).
const CANDIDATE_LIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Status update coalescing window.
const STATUS_DEBOUNCE: Duration = Duration::from_secs(5);

/// A burst forces an immediate send when the last update is older than this.
const STATUS_STALE_AFTER: Duration = Duration::from_secs(300);

/// Parentless watchdog period.
const PARENT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
struct DistConfig {
    enabled: bool,
    accept_children: bool,
    child_limit: usize,
    options: ConnectionOptions,
}

struct ParentLink {
    username: String,
    endpoint: SocketAddr,
    conn: Arc<MessageConnection>,
}

struct ChildLink {
    endpoint: SocketAddr,
    conn: Arc<MessageConnection>,
    /// Subtree depth the child last reported.
    depth: u32,
}

#[derive(Default)]
struct TreeState {
    parent: Option<ParentLink>,
    branch_level: u32,
    branch_root: String,
    children: HashMap<String, ChildLink>,
    parent_candidates: Vec<ParentCandidate>,
    searching_for_parent: bool,
}

struct DistFrame {
    username: String,
    conn_id: ConnectionId,
    body: Bytes,
}

struct Inner {
    state: StdMutex<TreeState>,
    config: StdMutex<DistConfig>,
    waiter: Waiter,
    peers: PeerConnectionManager,
    server_tx: mpsc::UnboundedSender<ServerRequest>,
    search_tx: mpsc::UnboundedSender<DistributedSearch>,
    events: Arc<EventBus>,
    frame_tx: mpsc::UnboundedSender<DistFrame>,
    username: StdMutex<String>,
    /// Connected-and-logged-in flag maintained by the client.
    active: AtomicBool,
    last_status: StdMutex<Option<(u64, Instant)>>,
    debounce_armed: AtomicBool,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct DistributedManager {
    inner: Arc<Inner>,
}

impl DistributedManager {
    pub fn new(
        waiter: Waiter,
        peers: PeerConnectionManager,
        server_tx: mpsc::UnboundedSender<ServerRequest>,
        search_tx: mpsc::UnboundedSender<DistributedSearch>,
        events: Arc<EventBus>,
        enabled: bool,
        accept_children: bool,
        child_limit: usize,
        options: ConnectionOptions,
    ) -> Self {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: StdMutex::new(TreeState::default()),
            config: StdMutex::new(DistConfig {
                enabled,
                accept_children,
                child_limit,
                options,
            }),
            waiter,
            peers,
            server_tx,
            search_tx,
            events,
            frame_tx,
            username: StdMutex::new(String::new()),
            active: AtomicBool::new(false),
            last_status: StdMutex::new(None),
            debounce_armed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        Inner::spawn_dispatch(&inner, frame_rx);
        Inner::spawn_parent_watchdog(&inner);
        Self { inner }
    }

    pub fn set_username(&self, username: &str) {
        *self.inner.username.lock().expect("username poisoned") = username.to_string();
        let mut state = self.inner.state.lock().expect("state poisoned");
        if state.parent.is_none() {
            state.branch_root = username.to_string();
        }
    }

    /// Mark the client as connected and logged in (or not); the parentless
    /// watchdog only fires while active.
    pub fn set_active(&self, active: bool) {
        self.inner.active.store(active, Ordering::Release);
    }

    pub fn reconfigure(
        &self,
        enabled: bool,
        accept_children: bool,
        child_limit: usize,
        options: ConnectionOptions,
    ) {
        *self.inner.config.lock().expect("config poisoned") = DistConfig {
            enabled,
            accept_children,
            child_limit,
            options,
        };
        self.inner.poke_status();
    }

    pub fn has_parent(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("state poisoned")
            .parent
            .is_some()
    }

    pub fn branch_level(&self) -> u32 {
        self.inner.state.lock().expect("state poisoned").branch_level
    }

    pub fn branch_root(&self) -> String {
        self.inner
            .state
            .lock()
            .expect("state poisoned")
            .branch_root
            .clone()
    }

    pub fn child_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("state poisoned")
            .children
            .len()
    }

    /// The fixed-layout status payload for the current topology. Pure
    /// function of the tree state; byte-identical across observers of the
    /// same state.
    pub fn status_payload(&self) -> Vec<ServerRequest> {
        self.inner.status_payload()
    }

    /// The server supplied fresh parent candidates.
    pub fn handle_net_info(&self, candidates: Vec<ParentCandidate>) {
        let config = self.inner.config.lock().expect("config poisoned").clone();
        {
            let mut state = self.inner.state.lock().expect("state poisoned");
            state.parent_candidates = candidates.clone();
            if !config.enabled || state.parent.is_some() || state.searching_for_parent {
                return;
            }
            state.searching_for_parent = true;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::search_for_parent(&inner, candidates).await;
        });
    }

    /// A distributed message the server wrapped for branch roots; unwrap and
    /// treat like a parent-originated frame.
    pub fn handle_embedded(&self, body: Bytes) {
        match DistributedMessage::parse(body) {
            Ok(
                DistributedMessage::SearchRequest(search)
                | DistributedMessage::ServerSearchRequest(search),
            ) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    inner.fan_out_search(search).await;
                });
            }
            Ok(other) => debug!(?other, "ignoring embedded distributed message"),
            Err(e) => debug!(error = %e, "malformed embedded distributed message"),
        }
    }

    /// The server told us to leave the distributed network.
    pub fn handle_reset(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.reset().await;
        });
    }

    /// An inbound child handshake from the listener. Supersedes any cached
    /// record for that user.
    pub fn accept_child(&self, username: String, conn: Arc<Connection>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.admit_child(username, conn, true).await;
        });
    }

    /// Dial back a prospective child that solicited a "D" connection through
    /// the server. Does not supersede: if a record exists the new attempt is
    /// abandoned.
    pub fn connect_child_out(&self, username: String, addr: SocketAddr, token: u32) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            {
                let state = inner.state.lock().expect("state poisoned");
                if state.children.contains_key(&username) {
                    debug!(%username, "child record exists, abandoning dial-back");
                    return;
                }
            }
            let config = inner.config.lock().expect("config poisoned").clone();
            let cancel = inner.shutdown.child_token();
            match inner
                .peers
                .dial_back(addr, token, config.options, &cancel)
                .await
            {
                Ok(conn) => inner.admit_child(username, conn, false).await,
                Err(e) => debug!(%username, error = %e, "child dial-back failed"),
            }
        });
    }

    /// Push the current status to the server, subject to hash and debounce
    /// suppression.
    pub fn poke_status(&self) {
        self.inner.poke_status();
    }

    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.reset().await;
    }
}

impl Inner {
    fn our_username(&self) -> String {
        self.username.lock().expect("username poisoned").clone()
    }

    // =========================================================================
    // FRAME DISPATCH
    // =========================================================================

    fn spawn_dispatch(inner: &Arc<Inner>, mut frame_rx: mpsc::UnboundedReceiver<DistFrame>) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_frame(frame).await;
            }
        });
    }

    async fn on_frame(self: &Arc<Self>, frame: DistFrame) {
        let message = match DistributedMessage::parse(frame.body.clone()) {
            Ok(message) => message,
            Err(e) => {
                debug!(conn = %frame.conn_id, error = %e, "bad distributed frame");
                return;
            }
        };

        let from_parent = {
            let state = self.state.lock().expect("state poisoned");
            state
                .parent
                .as_ref()
                .is_some_and(|p| p.conn.id() == frame.conn_id)
        };

        match message {
            DistributedMessage::Ping => {}
            DistributedMessage::BranchLevel(level) => {
                self.waiter.complete(
                    &WaitKey::named(slots::BRANCH_LEVEL).with(frame.conn_id),
                    level,
                );
                if from_parent {
                    {
                        let mut state = self.state.lock().expect("state poisoned");
                        state.branch_level = level + 1;
                    }
                    self.rebroadcast(frame.body.clone()).await;
                    self.poke_status();
                }
            }
            DistributedMessage::BranchRoot(root) => {
                self.waiter.complete(
                    &WaitKey::named(slots::BRANCH_ROOT).with(frame.conn_id),
                    root.clone(),
                );
                if from_parent {
                    {
                        let mut state = self.state.lock().expect("state poisoned");
                        state.branch_root = root;
                    }
                    self.rebroadcast(frame.body.clone()).await;
                    self.poke_status();
                }
            }
            DistributedMessage::SearchRequest(search)
            | DistributedMessage::ServerSearchRequest(search) => {
                // the first search is the de-facto "you are now live" signal
                self.waiter
                    .complete(&WaitKey::named(slots::FIRST_SEARCH).with(frame.conn_id), ());
                if from_parent {
                    self.rebroadcast(frame.body.clone()).await;
                }
                let _ = self.search_tx.send(search);
            }
            DistributedMessage::ChildDepth(depth) => {
                let changed = {
                    let mut state = self.state.lock().expect("state poisoned");
                    match state.children.get_mut(&frame.username) {
                        Some(child) if child.depth != depth => {
                            child.depth = depth;
                            true
                        }
                        _ => false,
                    }
                };
                if changed {
                    self.poke_status();
                }
            }
        }
    }

    /// Attach a read loop that routes frames into the dispatch task, plus a
    /// disconnect watcher that cleans up whatever role the connection ends
    /// up holding.
    fn attach(self: &Arc<Self>, username: String, conn: Arc<Connection>) -> Arc<MessageConnection> {
        let frame_tx = self.frame_tx.clone();
        let id = conn.id();
        let frame_user = username.clone();
        let mc = MessageConnection::start(conn, move |body| {
            let _ = frame_tx.send(DistFrame {
                username: frame_user.clone(),
                conn_id: id,
                body,
            });
        });

        let weak: Weak<Inner> = Arc::downgrade(self);
        let watcher = Arc::clone(&mc);
        tokio::spawn(async move {
            watcher.wait_for_disconnect().await;
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_lost(&username, id).await;
            }
        });
        mc
    }

    async fn on_connection_lost(self: &Arc<Self>, username: &str, id: ConnectionId) {
        let mut lost_parent = false;
        let mut lost_child = false;
        {
            let mut state = self.state.lock().expect("state poisoned");
            if state.parent.as_ref().is_some_and(|p| p.conn.id() == id) {
                state.parent = None;
                state.branch_level = 0;
                state.branch_root = self.our_username();
                lost_parent = true;
            } else if state
                .children
                .get(username)
                .is_some_and(|c| c.conn.id() == id)
            {
                state.children.remove(username);
                lost_child = true;
            }
        }
        if lost_parent {
            info!(%username, "distributed parent lost");
            self.events.publish(ClientEvent::ParentLost {
                username: username.to_string(),
            });
            self.poke_status();
            // try to re-attach from the cached candidate list
            let candidates = {
                let mut state = self.state.lock().expect("state poisoned");
                if state.searching_for_parent || state.parent_candidates.is_empty() {
                    Vec::new()
                } else {
                    state.searching_for_parent = true;
                    state.parent_candidates.clone()
                }
            };
            if !candidates.is_empty() {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    Inner::search_for_parent(&inner, candidates).await;
                });
            }
        } else if lost_child {
            debug!(%username, "distributed child removed");
            self.events.publish(ClientEvent::ChildRemoved {
                username: username.to_string(),
            });
            self.poke_status();
        }
    }

    // =========================================================================
    // PARENT SELECTION
    // =========================================================================

    async fn search_for_parent(inner: &Arc<Inner>, candidates: Vec<ParentCandidate>) {
        let config = inner.config.lock().expect("config poisoned").clone();
        let cancel = inner.shutdown.child_token();

        struct CandidateResult {
            username: String,
            endpoint: SocketAddr,
            conn: Arc<MessageConnection>,
            level: u32,
            root: String,
        }

        let attempts = candidates
            .into_iter()
            .take(MAX_PARENT_CANDIDATES)
            .map(|candidate| {
                let inner = Arc::clone(inner);
                let options = config.options.clone();
                let cancel = cancel.child_token();
                async move {
                    let endpoint = SocketAddr::from((candidate.ip, candidate.port));
                    let conn = inner
                        .peers
                        .connect_distributed(&candidate.username, endpoint, options, &cancel)
                        .await
                        .ok()?;
                    let conn_id = conn.id();

                    // register waits before the read loop can deliver frames
                    let waits_cancel = cancel.child_token();
                    let level_wait = inner.waiter.wait::<u32>(
                        WaitKey::named(slots::BRANCH_LEVEL).with(conn_id),
                        Some(CANDIDATE_BRANCH_TIMEOUT),
                        Some(waits_cancel.clone()),
                    );
                    let root_wait = inner.waiter.wait::<String>(
                        WaitKey::named(slots::BRANCH_ROOT).with(conn_id),
                        Some(CANDIDATE_BRANCH_TIMEOUT),
                        Some(waits_cancel.clone()),
                    );
                    let live_wait = inner.waiter.wait::<()>(
                        WaitKey::named(slots::FIRST_SEARCH).with(conn_id),
                        Some(CANDIDATE_LIVE_TIMEOUT),
                        Some(waits_cancel.clone()),
                    );

                    let mc = inner.attach(candidate.username.clone(), conn);

                    let level = match level_wait.await {
                        Ok(level) => level,
                        Err(e) => {
                            debug!(username = %candidate.username, error = %e, "no branch level");
                            waits_cancel.cancel();
                            mc.disconnect("no branch level").await;
                            return None;
                        }
                    };
                    // a level-0 candidate is itself the branch root
                    let root = if level == 0 {
                        candidate.username.clone()
                    } else {
                        match root_wait.await {
                            Ok(root) => root,
                            Err(e) => {
                                debug!(username = %candidate.username, error = %e, "no branch root");
                                waits_cancel.cancel();
                                mc.disconnect("no branch root").await;
                                return None;
                            }
                        }
                    };
                    if let Err(e) = live_wait.await {
                        debug!(username = %candidate.username, error = %e, "no first search");
                        waits_cancel.cancel();
                        mc.disconnect("no first search").await;
                        return None;
                    }
                    waits_cancel.cancel();
                    Some(CandidateResult {
                        username: candidate.username,
                        endpoint,
                        conn: mc,
                        level,
                        root,
                    })
                }
            });

        let mut successes: Vec<CandidateResult> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .collect();

        if successes.is_empty() {
            warn!("zero parent candidates succeeded");
            let mut state = inner.state.lock().expect("state poisoned");
            state.searching_for_parent = false;
            return;
        }

        successes.sort_by_key(|c| c.level);
        let chosen = successes.remove(0);
        for rejected in successes {
            rejected.conn.disconnect("Not selected").await;
        }

        let adopted = {
            let mut state = inner.state.lock().expect("state poisoned");
            state.searching_for_parent = false;
            if state.parent.is_some() {
                false
            } else {
                state.branch_level = chosen.level + 1;
                state.branch_root = chosen.root.clone();
                state.parent = Some(ParentLink {
                    username: chosen.username.clone(),
                    endpoint: chosen.endpoint,
                    conn: Arc::clone(&chosen.conn),
                });
                true
            }
        };

        if adopted {
            info!(
                username = %chosen.username,
                level = chosen.level + 1,
                root = %chosen.root,
                "distributed parent adopted"
            );
            inner.events.publish(ClientEvent::ParentAdopted {
                username: chosen.username,
                branch_level: chosen.level + 1,
                branch_root: chosen.root,
            });
            inner.announce_branch_to_children().await;
            inner.poke_status();
        } else {
            chosen.conn.disconnect("Not selected").await;
        }
    }

    // =========================================================================
    // CHILDREN
    // =========================================================================

    async fn admit_child(self: &Arc<Self>, username: String, conn: Arc<Connection>, supersede: bool) {
        let config = self.config.lock().expect("config poisoned").clone();
        let refused = {
            let state = self.state.lock().expect("state poisoned");
            if !config.enabled {
                Some("distributed network disabled")
            } else if !config.accept_children {
                Some("not accepting children")
            } else if state.parent.is_none() {
                Some("no parent")
            } else if state.children.len() >= config.child_limit
                && !(supersede && state.children.contains_key(&username))
            {
                Some("child limit reached")
            } else {
                None
            }
        };
        if let Some(reason) = refused {
            debug!(%username, reason, "child refused");
            conn.disconnect(reason).await;
            return;
        }
        if !supersede {
            let exists = self
                .state
                .lock()
                .expect("state poisoned")
                .children
                .contains_key(&username);
            if exists {
                debug!(%username, "child record exists, abandoning new connection");
                conn.disconnect("child record exists").await;
                return;
            }
        }

        let endpoint = conn.remote_addr();
        let mc = self.attach(username.clone(), conn);

        let (level, root) = {
            let state = self.state.lock().expect("state poisoned");
            (state.branch_level, state.branch_root.clone())
        };
        // children are told the effective values they will occupy
        let branch_info = [
            DistributedMessage::BranchLevel(level + 1).to_bytes(),
            DistributedMessage::BranchRoot(root).to_bytes(),
        ];
        for frame in branch_info {
            if mc.write(&frame).await.is_err() {
                mc.disconnect("branch info write failed").await;
                return;
            }
        }

        let superseded = {
            let mut state = self.state.lock().expect("state poisoned");
            state
                .children
                .insert(
                    username.clone(),
                    ChildLink {
                        endpoint,
                        conn: Arc::clone(&mc),
                        depth: 0,
                    },
                )
                .map(|old| old.conn)
        };
        if let Some(old) = superseded {
            if old.id() != mc.id() {
                old.disconnect("Superseded").await;
            }
        }

        info!(%username, "distributed child added");
        self.events.publish(ClientEvent::ChildAdded { username });
        self.poke_status();
    }

    /// Send the current branch values to every child (used after adoption).
    async fn announce_branch_to_children(&self) {
        let (level, root) = {
            let state = self.state.lock().expect("state poisoned");
            (state.branch_level, state.branch_root.clone())
        };
        for frame in [
            DistributedMessage::BranchLevel(level + 1).to_bytes(),
            DistributedMessage::BranchRoot(root).to_bytes(),
        ] {
            self.broadcast(frame).await;
        }
    }

    /// Re-frame a received body verbatim and fan it out to the children.
    async fn rebroadcast(&self, body: Bytes) {
        let mut framed = BytesMut::with_capacity(4 + body.len());
        framed.put_u32_le(body.len() as u32);
        framed.put_slice(&body);
        self.broadcast(framed.freeze()).await;
    }

    /// Write `frame` (a complete frame, length prefix included) to every
    /// child concurrently. A write failure disposes the failing child but
    /// never aborts the rest of the broadcast.
    async fn broadcast(&self, frame: Bytes) {
        let children: Vec<(String, Arc<MessageConnection>)> = {
            let state = self.state.lock().expect("state poisoned");
            state
                .children
                .iter()
                .map(|(name, child)| (name.clone(), Arc::clone(&child.conn)))
                .collect()
        };
        if children.is_empty() {
            return;
        }

        let writes = children.into_iter().map(|(name, conn)| {
            let frame = frame.clone();
            async move {
                if let Err(e) = conn.write(&frame).await {
                    debug!(username = %name, error = %e, "broadcast write failed");
                    conn.disconnect("broadcast write failed").await;
                }
            }
        });
        futures::future::join_all(writes).await;
    }

    async fn fan_out_search(&self, search: DistributedSearch) {
        let frame = DistributedMessage::SearchRequest(search.clone()).to_bytes();
        self.broadcast(frame).await;
        let _ = self.search_tx.send(search);
    }

    async fn reset(self: &Arc<Self>) {
        let (parent, children) = {
            let mut state = self.state.lock().expect("state poisoned");
            let parent = state.parent.take();
            let children: Vec<Arc<MessageConnection>> = state
                .children
                .drain()
                .map(|(_, child)| child.conn)
                .collect();
            state.branch_level = 0;
            state.branch_root = self.our_username();
            (parent, children)
        };
        if let Some(parent) = parent {
            parent.conn.disconnect("distributed reset").await;
        }
        for child in children {
            child.disconnect("distributed reset").await;
        }
        self.poke_status();
    }

    // =========================================================================
    // STATUS UPDATES
    // =========================================================================

    fn status_payload(&self) -> Vec<ServerRequest> {
        let state = self.state.lock().expect("state poisoned");
        let config = self.config.lock().expect("config poisoned");
        let have_no_parents = state.parent.is_none();
        let parent_ip = state
            .parent
            .as_ref()
            .and_then(|p| match p.endpoint {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let (level, root) = if have_no_parents {
            (0, self.our_username())
        } else {
            (state.branch_level, state.branch_root.clone())
        };
        let child_depth = state
            .children
            .values()
            .map(|c| c.depth + 1)
            .max()
            .unwrap_or(0);
        vec![
            ServerRequest::HaveNoParents(have_no_parents),
            ServerRequest::ParentIp(parent_ip),
            ServerRequest::BranchLevel(level),
            ServerRequest::BranchRoot(root),
            ServerRequest::ChildDepth(child_depth),
            ServerRequest::AcceptChildren(config.accept_children && config.enabled),
        ]
    }

    fn status_hash(payload: &[ServerRequest]) -> u64 {
        let mut hasher = SipHasher13::new();
        for request in payload {
            hasher.write(&request.to_bytes());
        }
        hasher.finish()
    }

    /// Debounced status trigger: an immediate send when the last update is
    /// stale, plus one trailing send after the coalescing window.
    fn poke_status(self: &Arc<Self>) {
        if !self.config.lock().expect("config poisoned").enabled {
            return;
        }
        let stale = {
            let last = self.last_status.lock().expect("status poisoned");
            match *last {
                Some((_, at)) => at.elapsed() >= STATUS_STALE_AFTER,
                None => true,
            }
        };
        if stale {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.send_status();
            });
        }
        if !self.debounce_armed.swap(true, Ordering::AcqRel) {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(STATUS_DEBOUNCE).await;
                inner.debounce_armed.store(false, Ordering::Release);
                inner.send_status();
            });
        }
    }

    fn send_status(&self) {
        let payload = self.status_payload();
        let hash = Self::status_hash(&payload);
        let have_no_parents = matches!(payload.first(), Some(ServerRequest::HaveNoParents(true)));

        {
            let mut last = self.last_status.lock().expect("status poisoned");
            if let Some((previous, _)) = *last {
                if previous == hash && !have_no_parents {
                    return;
                }
            }
            *last = Some((hash, Instant::now()));
        }

        debug!(have_no_parents, "sending distributed status");
        for request in payload {
            if self.server_tx.send(request).is_err() {
                break;
            }
        }
    }

    /// Every 15 minutes, a parentless-but-active client re-advertises
    /// `HaveNoParents` so the server offers a fresh candidate list.
    fn spawn_parent_watchdog(inner: &Arc<Inner>) {
        let weak = Arc::downgrade(inner);
        let shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PARENT_WATCHDOG_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let config = inner.config.lock().expect("config poisoned").clone();
                let parentless = inner
                    .state
                    .lock()
                    .expect("state poisoned")
                    .parent
                    .is_none();
                if config.enabled && inner.active.load(Ordering::Acquire) && parentless {
                    debug!("parentless watchdog requesting candidates");
                    inner.send_status();
                }
            }
        });
    }
}
