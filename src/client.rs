//! Client facade: server session, message routing, and transfer flows
//!
//! `SoulseekClient` wires the codec, connection layer, waiter, and the two
//! managers together. It owns the server session, routes every inbound frame
//! to the right handler, and exposes the thin orchestrators (browse, search,
//! download, upload) that compose the lower layers.

use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventBus};
use crate::limiter::{Governor, TokenBucket, Unlimited};
use crate::net::conn::{Connection, ProgressFn};
use crate::net::listener::{InboundEvent, Listener};
use crate::net::message_conn::MessageConnection;
use crate::net::peer_manager::{PeerConnectionManager, PeerFrame};
use crate::net::slots;
use crate::net::DistributedManager;
use crate::options::{ClientOptions, ClientOptionsPatch};
use crate::proto::distributed::DistributedSearch;
use crate::proto::peer::{BrowseResponse, PeerMessage, SearchResponse, UserInfo};
use crate::proto::server::{ServerRequest, ServerResponse};
use crate::proto::{ConnectionType, PeerCode, ServerCode};
use crate::token::TokenFactory;
use crate::transfer::{Transfer, TransferDirection, TransferObserver, TransferState};
use crate::waiter::{WaitKey, Waiter};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncSeekExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Share listings can be large; they get a more generous deadline than the
/// ordinary message timeout.
const BROWSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Server keepalive period while logged in.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(300);

/// Token bucket replenishment interval for transfer rate limiting.
const BUCKET_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on the recently-seen distributed search set.
const SEARCH_DEDUP_CAPACITY: usize = 10_000;

/// Host-supplied resolvers the core calls to serve remote requests. Every
/// method may be invoked concurrently from any task.
#[async_trait]
pub trait Host: Send + Sync {
    /// The full share listing served to browse requests.
    async fn browse_response(&self, username: &str) -> Result<BrowseResponse> {
        let _ = username;
        Ok(BrowseResponse::default())
    }

    /// Contents of one shared directory.
    async fn directory_contents(
        &self,
        username: &str,
        token: u32,
        directory: &str,
    ) -> Result<Vec<crate::proto::peer::Directory>> {
        let _ = (username, token, directory);
        Ok(Vec::new())
    }

    /// Self-description served to user-info requests.
    async fn user_info(&self, username: &str) -> Result<UserInfo> {
        let _ = username;
        Ok(UserInfo::default())
    }

    /// Matching files for a search, or `None` to stay silent.
    async fn search_response(
        &self,
        username: &str,
        token: u32,
        query: &str,
    ) -> Option<SearchResponse> {
        let _ = (username, token, query);
        None
    }

    /// Whether to accept a remote download request into the upload queue.
    async fn enqueue_download(&self, username: &str, filename: &str) -> Result<()> {
        let _ = (username, filename);
        Err(Error::TransferRejected("File not shared.".into()))
    }

    /// The remote user's place in our upload queue, if known.
    async fn place_in_queue(&self, username: &str, filename: &str) -> Option<u32> {
        let _ = (username, filename);
        None
    }
}

/// A host that shares nothing and rejects every download.
#[derive(Debug, Default)]
pub struct NoShareHost;

#[async_trait]
impl Host for NoShareHost {}

/// Cache of user listen endpoints learned from the server.
#[derive(Default)]
pub struct EndpointCache {
    map: StdMutex<HashMap<String, SocketAddr>>,
}

impl EndpointCache {
    pub fn try_get(&self, username: &str) -> Option<SocketAddr> {
        self.map.lock().expect("cache poisoned").get(username).copied()
    }

    pub fn add_or_update(&self, username: &str, endpoint: SocketAddr) {
        self.map
            .lock()
            .expect("cache poisoned")
            .insert(username.to_string(), endpoint);
    }

    pub fn try_remove(&self, username: &str) -> Option<SocketAddr> {
        self.map.lock().expect("cache poisoned").remove(username)
    }
}

/// Cache of search responses received for our outstanding search tokens.
#[derive(Default)]
pub struct SearchResponseCache {
    map: StdMutex<HashMap<u32, Vec<SearchResponse>>>,
}

impl SearchResponseCache {
    pub fn try_get(&self, token: u32) -> Option<Vec<SearchResponse>> {
        self.map.lock().expect("cache poisoned").get(&token).cloned()
    }

    pub fn add_or_update(&self, token: u32, response: SearchResponse) {
        self.map
            .lock()
            .expect("cache poisoned")
            .entry(token)
            .or_default()
            .push(response);
    }

    pub fn try_remove(&self, token: u32) -> Option<Vec<SearchResponse>> {
        self.map.lock().expect("cache poisoned").remove(&token)
    }
}

/// The decoded fields of a peer `TransferResponse`, carried through waits.
#[derive(Debug, Clone)]
struct TransferReply {
    allowed: bool,
    size: Option<i64>,
    reason: Option<String>,
}

struct ClientInner {
    options: StdMutex<ClientOptions>,
    waiter: Waiter,
    tokens: Arc<TokenFactory>,
    events: Arc<EventBus>,
    peers: PeerConnectionManager,
    distributed: DistributedManager,
    host: Arc<dyn Host>,
    endpoint_cache: EndpointCache,
    search_cache: SearchResponseCache,
    server: StdMutex<Option<Arc<MessageConnection>>>,
    listener: StdMutex<Option<Listener>>,
    username: StdMutex<Option<String>>,
    /// Cancelled when the current server session ends.
    session: StdMutex<CancellationToken>,
    download_slots: StdMutex<Arc<Semaphore>>,
    upload_slots: StdMutex<Arc<Semaphore>>,
    download_bucket: TokenBucket,
    upload_bucket: TokenBucket,
    recent_searches: StdMutex<(HashSet<(String, u32)>, VecDeque<(String, u32)>)>,
    server_tx: mpsc::UnboundedSender<ServerRequest>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    shutdown: CancellationToken,
}

/// A connected Soulseek client: one server session, a peer connection pool,
/// and a position in the distributed search tree.
#[derive(Clone)]
pub struct SoulseekClient {
    inner: Arc<ClientInner>,
}

impl SoulseekClient {
    pub fn new(options: ClientOptions, host: Arc<dyn Host>) -> Result<Self> {
        options.validate()?;

        let waiter = Waiter::new(options.message_timeout());
        let tokens = Arc::new(TokenFactory::new(options.starting_token));
        let events = Arc::new(EventBus::new());

        let (server_tx, server_rx) = mpsc::unbounded_channel::<ServerRequest>();
        let (peer_frame_tx, peer_frame_rx) = mpsc::unbounded_channel::<PeerFrame>();
        let (search_tx, search_rx) = mpsc::unbounded_channel::<DistributedSearch>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundEvent>();

        let peers = PeerConnectionManager::new(
            waiter.clone(),
            Arc::clone(&tokens),
            server_tx.clone(),
            peer_frame_tx,
            Arc::clone(&events),
            options.peer_connection.clone(),
            options.transfer_connection.clone(),
            options.maximum_concurrent_peer_connections,
            options.message_timeout(),
        );

        let distributed = DistributedManager::new(
            waiter.clone(),
            peers.clone(),
            server_tx.clone(),
            search_tx,
            Arc::clone(&events),
            options.enable_distributed_network,
            options.accept_distributed_children,
            options.distributed_child_limit,
            options.distributed_connection.clone(),
        );

        let download_bucket =
            TokenBucket::new(bucket_count(options.maximum_download_speed), BUCKET_INTERVAL);
        let upload_bucket =
            TokenBucket::new(bucket_count(options.maximum_upload_speed), BUCKET_INTERVAL);

        let inner = Arc::new(ClientInner {
            download_slots: StdMutex::new(Arc::new(Semaphore::new(
                options.maximum_concurrent_downloads,
            ))),
            upload_slots: StdMutex::new(Arc::new(Semaphore::new(
                options.maximum_concurrent_uploads,
            ))),
            options: StdMutex::new(options),
            waiter,
            tokens,
            events,
            peers,
            distributed,
            host,
            endpoint_cache: EndpointCache::default(),
            search_cache: SearchResponseCache::default(),
            server: StdMutex::new(None),
            listener: StdMutex::new(None),
            username: StdMutex::new(None),
            session: StdMutex::new(CancellationToken::new()),
            download_bucket,
            upload_bucket,
            recent_searches: StdMutex::new((HashSet::new(), VecDeque::new())),
            server_tx,
            inbound_tx,
            shutdown: CancellationToken::new(),
        });

        ClientInner::spawn_server_request_pump(&inner, server_rx);
        ClientInner::spawn_peer_frame_pump(&inner, peer_frame_rx);
        ClientInner::spawn_search_pump(&inner, search_rx);
        ClientInner::spawn_inbound_pump(&inner, inbound_rx);

        Ok(Self { inner })
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn next_token(&self) -> u32 {
        self.inner.tokens.next()
    }

    pub fn endpoint_cache(&self) -> &EndpointCache {
        &self.inner.endpoint_cache
    }

    pub fn search_cache(&self) -> &SearchResponseCache {
        &self.inner.search_cache
    }

    pub fn options(&self) -> ClientOptions {
        self.inner.options.lock().expect("options poisoned").clone()
    }

    /// Apply a partial options update at runtime.
    pub fn patch_options(&self, patch: ClientOptionsPatch) -> Result<()> {
        let next = {
            let options = self.inner.options.lock().expect("options poisoned");
            options.patched(patch)?
        };

        self.inner.peers.reconfigure(
            next.peer_connection.clone(),
            next.transfer_connection.clone(),
            next.maximum_concurrent_peer_connections,
            next.message_timeout(),
        );
        self.inner.distributed.reconfigure(
            next.enable_distributed_network,
            next.accept_distributed_children,
            next.distributed_child_limit,
            next.distributed_connection.clone(),
        );
        self.inner
            .download_bucket
            .set_count(bucket_count(next.maximum_download_speed));
        self.inner
            .upload_bucket
            .set_count(bucket_count(next.maximum_upload_speed));
        *self
            .inner
            .download_slots
            .lock()
            .expect("slots poisoned") = Arc::new(Semaphore::new(next.maximum_concurrent_downloads));
        *self.inner.upload_slots.lock().expect("slots poisoned") =
            Arc::new(Semaphore::new(next.maximum_concurrent_uploads));

        *self.inner.options.lock().expect("options poisoned") = next;
        Ok(())
    }

    /// Dial the central server.
    pub async fn connect(&self, address: &str) -> Result<()> {
        if self.inner.server.lock().expect("server poisoned").is_some() {
            return Err(Error::InvalidState("already connected to a server".into()));
        }

        let addr = tokio::net::lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| Error::InvalidState(format!("{address} resolved to nothing")))?;

        let options = self.options();
        let conn = Connection::new(addr, options.server_connection.clone(), None);
        conn.connect(&self.inner.shutdown.child_token()).await?;

        let session = CancellationToken::new();
        *self.inner.session.lock().expect("session poisoned") = session.clone();

        // frames are handled strictly in wire order by a single pump
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<bytes::Bytes>();
        let mc = MessageConnection::start(Arc::clone(&conn), move |body| {
            let _ = frame_tx.send(body);
        });
        let pump = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(body) = frame_rx.recv().await {
                let Some(inner) = pump.upgrade() else { break };
                inner.on_server_frame(body).await;
            }
        });
        *self.inner.server.lock().expect("server poisoned") = Some(Arc::clone(&mc));

        // session teardown when the server connection dies
        let inner = Arc::clone(&self.inner);
        let watcher = Arc::clone(&mc);
        tokio::spawn(async move {
            let reason = watcher.wait_for_disconnect().await;
            inner.on_server_lost(&reason).await;
        });

        self.inner
            .events
            .publish(ClientEvent::ServerConnected { address: addr });
        info!(%addr, "server connected");
        Ok(())
    }

    /// Log in, bind the listener, and join the distributed network.
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let server = self.inner.server_connection()?;
        let options = self.options();
        let session = self.inner.session.lock().expect("session poisoned").clone();

        let wait = self.inner.waiter.wait::<ServerResponse>(
            WaitKey::server(ServerCode::Login),
            Some(options.message_timeout()),
            Some(session.clone()),
        );
        server
            .write(
                &ServerRequest::Login {
                    username: username.to_string(),
                    password: password.to_string(),
                }
                .to_bytes(),
            )
            .await?;

        let greeting = match wait.await? {
            ServerResponse::LoginAccepted { greeting, .. } => greeting,
            ServerResponse::LoginRejected { reason } => {
                return Err(Error::LoginRejected(reason));
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "unexpected login reply: {other:?}"
                )))
            }
        };

        *self.inner.username.lock().expect("username poisoned") = Some(username.to_string());
        self.inner.peers.set_username(username);
        self.inner.distributed.set_username(username);

        if options.enable_listener {
            let listener = Listener::bind(
                options.listen_port,
                options.incoming_connection.clone(),
                self.inner.waiter.clone(),
                self.inner.inbound_tx.clone(),
            )
            .await?;
            server
                .write(&ServerRequest::SetListenPort(options.listen_port).to_bytes())
                .await?;
            *self.inner.listener.lock().expect("listener poisoned") = Some(listener);
        }

        self.inner.distributed.set_active(true);
        self.inner.distributed.poke_status();
        ClientInner::spawn_keepalive(&self.inner, session);

        self.inner.events.publish(ClientEvent::LoggedIn {
            username: username.to_string(),
            greeting: greeting.clone(),
        });
        info!(%username, "logged in");
        Ok(greeting)
    }

    /// Tear down the server session and every managed connection.
    pub async fn disconnect(&self, reason: &str) {
        self.inner.shutdown.cancel();
        self.inner
            .session
            .lock()
            .expect("session poisoned")
            .cancel();
        let server = self.inner.server.lock().expect("server poisoned").take();
        if let Some(server) = server {
            server.disconnect(reason).await;
        }
        if let Some(listener) = self.inner.listener.lock().expect("listener poisoned").take() {
            listener.stop();
        }
        self.inner.peers.stop().await;
        self.inner.distributed.stop().await;
        self.inner.waiter.cancel_all();
    }

    /// Issue a network-wide search; responses surface as
    /// [`ClientEvent::SearchResponse`] and in the search cache. Returns the
    /// search token.
    pub async fn search(&self, query: &str) -> Result<u32> {
        let server = self.inner.server_connection()?;
        let token = self.inner.tokens.next();
        server
            .write(
                &ServerRequest::FileSearch {
                    token,
                    query: query.to_string(),
                }
                .to_bytes(),
            )
            .await?;
        debug!(token, query, "search issued");
        Ok(token)
    }

    /// Fetch a peer's full share listing.
    pub async fn browse(&self, username: &str) -> Result<BrowseResponse> {
        let mc = self.peer_connection(username).await?;
        let wait = self.inner.waiter.wait::<BrowseResponse>(
            WaitKey::peer(PeerCode::SharesResponse).with(username),
            Some(BROWSE_TIMEOUT),
            Some(self.inner.shutdown.child_token()),
        );
        mc.write(&PeerMessage::SharesRequest.to_bytes()?).await?;
        wait.await
    }

    /// Fetch a peer's self-description.
    pub async fn user_info(&self, username: &str) -> Result<UserInfo> {
        let mc = self.peer_connection(username).await?;
        let wait = self.inner.waiter.wait::<UserInfo>(
            WaitKey::peer(PeerCode::UserInfoResponse).with(username),
            None,
            Some(self.inner.shutdown.child_token()),
        );
        mc.write(&PeerMessage::UserInfoRequest.to_bytes()?).await?;
        wait.await
    }

    /// Ask a peer where we sit in its upload queue.
    pub async fn place_in_queue(&self, username: &str, filename: &str) -> Result<u32> {
        let mc = self.peer_connection(username).await?;
        let wait = self.inner.waiter.wait::<u32>(
            WaitKey::peer(PeerCode::PlaceInQueueResponse)
                .with(username)
                .with(filename),
            None,
            Some(self.inner.shutdown.child_token()),
        );
        mc.write(
            &PeerMessage::PlaceInQueueRequest {
                filename: filename.to_string(),
            }
            .to_bytes()?,
        )
        .await?;
        wait.await
    }

    /// Download `remote_filename` from `username` into `local_path`,
    /// resuming from any partial file already on disk.
    pub async fn download(
        &self,
        username: &str,
        remote_filename: &str,
        local_path: &Path,
        observer: Option<TransferObserver>,
        cancel: Option<CancellationToken>,
    ) -> Result<Transfer> {
        let cancel = cancel.unwrap_or_else(|| self.inner.shutdown.child_token());
        let slots = Arc::clone(&self.inner.download_slots.lock().expect("slots poisoned"));
        let _slot = slots.acquire_owned().await.map_err(|_| Error::Cancelled)?;

        let token = self.inner.tokens.next();
        let mut transfer = Transfer::new(
            TransferDirection::Download,
            username,
            remote_filename,
            token,
        );
        self.inner.notify_transfer(&transfer, &observer);

        let result = self
            .run_download(&mut transfer, local_path, &observer, &cancel)
            .await;
        match result {
            Ok(()) => {
                transfer.advance(TransferState::Succeeded);
                self.inner.notify_transfer(&transfer, &observer);
                Ok(transfer)
            }
            Err(e) => {
                transfer.advance(failure_state(&e));
                self.inner.notify_transfer(&transfer, &observer);
                Err(e)
            }
        }
    }

    async fn run_download(
        &self,
        transfer: &mut Transfer,
        local_path: &Path,
        observer: &Option<TransferObserver>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let inner = &self.inner;
        let username = transfer.username.clone();
        let filename = transfer.remote_filename.clone();
        let options = self.options();

        let offset = match tokio::fs::metadata(local_path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        let mc = self.peer_connection(&username).await?;
        let reply_wait = inner.waiter.wait::<TransferReply>(
            WaitKey::peer(PeerCode::TransferResponse).with(transfer.token),
            Some(options.message_timeout()),
            Some(cancel.clone()),
        );
        mc.write(
            &PeerMessage::TransferRequest {
                direction: TransferDirection::Download,
                token: transfer.token,
                filename: filename.clone(),
                size: None,
            }
            .to_bytes()?,
        )
        .await?;
        let reply = reply_wait.await?;

        let (stream_token, size) = if reply.allowed {
            (transfer.token, reply.size.unwrap_or(-1))
        } else {
            let reason = reply.reason.unwrap_or_default();
            if !reason.eq_ignore_ascii_case("queued") {
                return Err(translate_rejection(reason));
            }

            // queued: wait indefinitely for the uploader's start offer
            transfer.advance(TransferState::Queued);
            inner.notify_transfer(transfer, observer);
            let (remote_token, size) = inner
                .waiter
                .wait_indefinitely::<(u32, i64)>(
                    WaitKey::named(slots::TRANSFER_QUEUED_START)
                        .with(&username)
                        .with(&filename),
                    Some(cancel.clone()),
                )
                .await?;
            transfer.remote_token = Some(remote_token);

            // accept the offer on the current message connection
            let mc = self.peer_connection(&username).await?;
            mc.write(
                &PeerMessage::TransferResponse {
                    token: remote_token,
                    allowed: true,
                    size: None,
                    reason: None,
                }
                .to_bytes()?,
            )
            .await?;
            (remote_token, size)
        };

        if size < 0 {
            return Err(Error::InvalidState("peer did not report a file size".into()));
        }
        transfer.size = size;
        transfer.advance(TransferState::Initializing);
        inner.notify_transfer(transfer, observer);

        // the downloader opens the transfer connection, announces the token,
        // then its resume offset
        let endpoint = inner.endpoint_cache.try_get(&username);
        let fconn = inner
            .peers
            .connect_transfer(&username, endpoint, stream_token, cancel)
            .await?;
        fconn.write(&stream_token.to_le_bytes(), cancel).await?;
        fconn.write(&(offset as i64).to_le_bytes(), cancel).await?;

        transfer.record_progress(offset);
        transfer.advance(TransferState::InProgress);
        inner.notify_transfer(transfer, observer);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(local_path)
            .await?;
        let remaining = (size as u64).saturating_sub(offset);

        let progress_transfer = StdMutex::new(transfer.clone());
        let progress_observer = observer.clone();
        let events = Arc::clone(&inner.events);
        let progress = move |done: u64, _total: u64| {
            let mut snapshot = progress_transfer.lock().expect("progress poisoned");
            snapshot.record_progress(offset + done);
            if let Some(observer) = &progress_observer {
                observer(&snapshot);
            }
            events.publish(ClientEvent::TransferChanged(snapshot.clone()));
        };

        let governor = inner.download_governor();
        fconn
            .read_stream(
                remaining,
                &mut file,
                governor.as_ref(),
                Some(&progress as &ProgressFn),
                cancel,
            )
            .await?;
        transfer.record_progress(size as u64);
        fconn.disconnect("transfer complete").await;
        Ok(())
    }

    /// Push `local_path` to `username` as `remote_filename`. The remote must
    /// accept the offer; it then opens the transfer connection back to us.
    pub async fn upload(
        &self,
        username: &str,
        remote_filename: &str,
        local_path: &Path,
        observer: Option<TransferObserver>,
        cancel: Option<CancellationToken>,
    ) -> Result<Transfer> {
        let cancel = cancel.unwrap_or_else(|| self.inner.shutdown.child_token());
        let slots = Arc::clone(&self.inner.upload_slots.lock().expect("slots poisoned"));
        let _slot = slots.acquire_owned().await.map_err(|_| Error::Cancelled)?;

        let token = self.inner.tokens.next();
        let mut transfer = Transfer::new(
            TransferDirection::Upload,
            username,
            remote_filename,
            token,
        );
        self.inner.notify_transfer(&transfer, &observer);

        let result = self
            .run_upload(&mut transfer, local_path, &observer, &cancel)
            .await;
        match result {
            Ok(()) => {
                transfer.advance(TransferState::Succeeded);
                self.inner.notify_transfer(&transfer, &observer);
                Ok(transfer)
            }
            Err(e) => {
                transfer.advance(failure_state(&e));
                self.inner.notify_transfer(&transfer, &observer);
                Err(e)
            }
        }
    }

    async fn run_upload(
        &self,
        transfer: &mut Transfer,
        local_path: &Path,
        observer: &Option<TransferObserver>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let inner = &self.inner;
        let username = transfer.username.clone();
        let filename = transfer.remote_filename.clone();
        let options = self.options();

        let size = tokio::fs::metadata(local_path).await?.len() as i64;
        transfer.size = size;

        let mc = self.peer_connection(&username).await?;
        let reply_wait = inner.waiter.wait::<TransferReply>(
            WaitKey::peer(PeerCode::TransferResponse).with(transfer.token),
            Some(options.message_timeout()),
            Some(cancel.clone()),
        );
        // register for the dial-back before the offer goes out
        let start_wait = inner.waiter.wait::<Arc<Connection>>(
            WaitKey::named(slots::TRANSFER_START).with(transfer.token),
            Some(BROWSE_TIMEOUT),
            Some(cancel.clone()),
        );
        mc.write(
            &PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                token: transfer.token,
                filename: filename.clone(),
                size: Some(size),
            }
            .to_bytes()?,
        )
        .await?;

        let reply = reply_wait.await?;
        if !reply.allowed {
            return Err(translate_rejection(reply.reason.unwrap_or_default()));
        }
        transfer.advance(TransferState::Initializing);
        inner.notify_transfer(transfer, observer);

        // the downloader opens the transfer connection and sends the token
        // (already consumed by the router) and its resume offset
        let fconn = start_wait.await?;
        let offset_bytes = fconn.read_raw(8, cancel).await?;
        let offset = i64::from_le_bytes(
            offset_bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::MessageFormat("bad transfer offset".into()))?,
        );
        if offset < 0 || offset > size {
            return Err(Error::MessageFormat(format!(
                "transfer offset {offset} out of range"
            )));
        }

        let mut file = tokio::fs::File::open(local_path).await?;
        file.seek(std::io::SeekFrom::Start(offset as u64)).await?;

        transfer.record_progress(offset as u64);
        transfer.advance(TransferState::InProgress);
        inner.notify_transfer(transfer, observer);

        let progress_transfer = StdMutex::new(transfer.clone());
        let progress_observer = observer.clone();
        let events = Arc::clone(&inner.events);
        let progress = move |done: u64, _total: u64| {
            let mut snapshot = progress_transfer.lock().expect("progress poisoned");
            snapshot.record_progress(offset as u64 + done);
            if let Some(observer) = &progress_observer {
                observer(&snapshot);
            }
            events.publish(ClientEvent::TransferChanged(snapshot.clone()));
        };

        let governor = inner.upload_governor();
        fconn
            .write_stream(
                (size - offset) as u64,
                &mut file,
                governor.as_ref(),
                Some(&progress as &ProgressFn),
                cancel,
            )
            .await?;
        transfer.record_progress(size as u64);
        fconn.disconnect("transfer complete").await;
        Ok(())
    }

    async fn peer_connection(&self, username: &str) -> Result<Arc<MessageConnection>> {
        let endpoint = self.inner.endpoint_cache.try_get(username);
        self.inner.peers.get_or_connect(username, endpoint).await
    }
}

fn bucket_count(bytes_per_second: usize) -> usize {
    if bytes_per_second == 0 {
        usize::MAX / 2
    } else {
        (bytes_per_second / 10).max(1)
    }
}

fn failure_state(error: &Error) -> TransferState {
    match error {
        Error::Timeout(_) => TransferState::TimedOut,
        Error::Cancelled => TransferState::Cancelled,
        Error::TransferRejected(_) | Error::QueueFull => TransferState::Rejected,
        _ => TransferState::Errored,
    }
}

fn translate_rejection(reason: String) -> Error {
    if reason.eq_ignore_ascii_case("queue full") {
        Error::QueueFull
    } else {
        Error::TransferRejected(reason)
    }
}

impl ClientInner {
    fn server_connection(&self) -> Result<Arc<MessageConnection>> {
        self.server
            .lock()
            .expect("server poisoned")
            .clone()
            .ok_or_else(|| Error::InvalidState("not connected to a server".into()))
    }

    fn our_username(&self) -> Option<String> {
        self.username.lock().expect("username poisoned").clone()
    }

    fn notify_transfer(&self, transfer: &Transfer, observer: &Option<TransferObserver>) {
        if let Some(observer) = observer {
            observer(transfer);
        }
        self.events
            .publish(ClientEvent::TransferChanged(transfer.clone()));
    }

    fn download_governor(&self) -> Arc<dyn Governor> {
        let unlimited = self
            .options
            .lock()
            .expect("options poisoned")
            .maximum_download_speed
            == 0;
        if unlimited {
            Arc::new(Unlimited)
        } else {
            Arc::new(self.download_bucket.clone())
        }
    }

    fn upload_governor(&self) -> Arc<dyn Governor> {
        let unlimited = self
            .options
            .lock()
            .expect("options poisoned")
            .maximum_upload_speed
            == 0;
        if unlimited {
            Arc::new(Unlimited)
        } else {
            Arc::new(self.upload_bucket.clone())
        }
    }

    // =========================================================================
    // PUMPS
    // =========================================================================

    /// Forward queued server requests onto the server connection.
    fn spawn_server_request_pump(
        inner: &Arc<ClientInner>,
        mut rx: mpsc::UnboundedReceiver<ServerRequest>,
    ) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let Ok(server) = inner.server_connection() else {
                    debug!("dropping server request, no session");
                    continue;
                };
                if let Err(e) = server.write(&request.to_bytes()).await {
                    debug!(error = %e, "server request write failed");
                }
            }
        });
    }

    fn spawn_peer_frame_pump(inner: &Arc<ClientInner>, mut rx: mpsc::UnboundedReceiver<PeerFrame>) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_peer_frame(frame).await;
            }
        });
    }

    fn spawn_search_pump(
        inner: &Arc<ClientInner>,
        mut rx: mpsc::UnboundedReceiver<DistributedSearch>,
    ) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(search) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_distributed_search(search).await;
            }
        });
    }

    fn spawn_inbound_pump(
        inner: &Arc<ClientInner>,
        mut rx: mpsc::UnboundedReceiver<InboundEvent>,
    ) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_inbound(event).await;
            }
        });
    }

    fn spawn_keepalive(inner: &Arc<ClientInner>, session: CancellationToken) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = session.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let _ = inner.server_tx.send(ServerRequest::Ping);
            }
        });
    }

    // =========================================================================
    // SERVER FRAME HANDLING
    // =========================================================================

    async fn on_server_frame(self: &Arc<Self>, body: bytes::Bytes) {
        let response = match ServerResponse::parse(body) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "bad server frame");
                return;
            }
        };

        match response {
            login @ (ServerResponse::LoginAccepted { .. } | ServerResponse::LoginRejected { .. }) => {
                self.waiter
                    .complete(&WaitKey::server(ServerCode::Login), login);
            }
            ServerResponse::GetPeerAddress { username, ip, port } => {
                if port != 0 {
                    self.endpoint_cache
                        .add_or_update(&username, SocketAddr::from((ip, port)));
                }
                self.waiter.complete(
                    &WaitKey::server(ServerCode::GetPeerAddress).with(&username),
                    (ip, port),
                );
            }
            ServerResponse::ConnectToPeer {
                username,
                kind,
                ip,
                port,
                token,
                ..
            } => {
                self.on_solicitation(username, kind, SocketAddr::from((ip, port)), token);
            }
            ServerResponse::MessageUser {
                id,
                timestamp,
                username,
                message,
                is_admin,
            } => {
                let auto = self
                    .options
                    .lock()
                    .expect("options poisoned")
                    .auto_acknowledge_private_messages;
                if auto {
                    let _ = self.server_tx.send(ServerRequest::AckMessageUser(id));
                }
                self.events.publish(ClientEvent::PrivateMessage {
                    id,
                    timestamp,
                    username,
                    message,
                    is_admin,
                    auto_acknowledged: auto,
                });
            }
            ServerResponse::NotifyPrivileges { token, username } => {
                let auto = self
                    .options
                    .lock()
                    .expect("options poisoned")
                    .auto_acknowledge_privilege_notifications;
                if auto {
                    let _ = self
                        .server_tx
                        .send(ServerRequest::AckNotifyPrivileges(token));
                }
                self.events.publish(ClientEvent::PrivilegeNotification {
                    token,
                    username,
                    auto_acknowledged: auto,
                });
            }
            ServerResponse::Relogged => {
                warn!("kicked: account logged in elsewhere");
                self.events.publish(ClientEvent::KickedFromServer);
                if let Ok(server) = self.server_connection() {
                    server.disconnect("logged in elsewhere").await;
                }
            }
            ServerResponse::CheckPrivileges { seconds_remaining } => {
                self.waiter.complete(
                    &WaitKey::server(ServerCode::CheckPrivileges),
                    seconds_remaining,
                );
            }
            ServerResponse::NetInfo(candidates) => {
                debug!(count = candidates.len(), "parent candidates received");
                self.distributed.handle_net_info(candidates);
            }
            ServerResponse::EmbeddedDistributed { body } => {
                self.distributed.handle_embedded(body);
            }
            ServerResponse::ResetDistributed => {
                self.distributed.handle_reset();
            }
            ServerResponse::CantConnectToPeer { token, username } => {
                debug!(token, %username, "solicitation failed server-side");
                self.waiter.throw(
                    &WaitKey::named(slots::SOLICITED_CONNECTION).with(token),
                    Error::UserOffline(username),
                );
            }
            ServerResponse::WishlistInterval(_) => {}
            ServerResponse::Unknown { code, length } => {
                debug!(code, length, "unhandled server opcode");
            }
        }
    }

    async fn on_server_lost(self: &Arc<Self>, reason: &str) {
        info!(reason, "server session ended");
        self.session.lock().expect("session poisoned").cancel();
        *self.server.lock().expect("server poisoned") = None;
        self.distributed.set_active(false);
        self.events.publish(ClientEvent::ServerDisconnected {
            reason: reason.to_string(),
        });
    }

    /// A peer asked the server to have us dial it back.
    fn on_solicitation(
        self: &Arc<Self>,
        username: String,
        kind: ConnectionType,
        addr: SocketAddr,
        token: u32,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let options = {
                let options = inner.options.lock().expect("options poisoned");
                match kind {
                    ConnectionType::Peer => options.peer_connection.clone(),
                    ConnectionType::Transfer => options.transfer_connection.clone(),
                    ConnectionType::Distributed => options.distributed_connection.clone(),
                }
            };
            match kind {
                ConnectionType::Peer => {
                    let cancel = inner.shutdown.child_token();
                    match inner.peers.dial_back(addr, token, options, &cancel).await {
                        Ok(conn) => {
                            inner.peers.accept_inbound(username, conn);
                        }
                        Err(e) => debug!(%username, error = %e, "peer dial-back failed"),
                    }
                }
                ConnectionType::Distributed => {
                    inner.distributed.connect_child_out(username, addr, token);
                }
                ConnectionType::Transfer => {
                    let cancel = inner.shutdown.child_token();
                    match inner.peers.dial_back(addr, token, options, &cancel).await {
                        Ok(conn) => inner.route_transfer_connection(username, conn).await,
                        Err(e) => debug!(%username, error = %e, "transfer dial-back failed"),
                    }
                }
            }
        });
    }

    // =========================================================================
    // PEER FRAME HANDLING
    // =========================================================================

    async fn on_peer_frame(self: &Arc<Self>, frame: PeerFrame) {
        let message = match PeerMessage::parse(frame.body) {
            Ok(message) => message,
            Err(e) => {
                debug!(username = %frame.username, error = %e, "bad peer frame");
                return;
            }
        };
        let username = frame.username;

        match message {
            PeerMessage::SharesRequest => {
                self.serve(username, |inner, username| async move {
                    let listing = inner.host.browse_response(&username).await?;
                    inner
                        .reply(&username, PeerMessage::SharesResponse(listing))
                        .await
                });
            }
            PeerMessage::SharesResponse(listing) => {
                self.waiter.complete(
                    &WaitKey::peer(PeerCode::SharesResponse).with(&username),
                    listing,
                );
            }
            PeerMessage::SearchResponse(response) => {
                self.search_cache
                    .add_or_update(response.token, response.clone());
                self.events.publish(ClientEvent::SearchResponse {
                    token: response.token,
                    response,
                });
            }
            PeerMessage::UserInfoRequest => {
                self.serve(username, |inner, username| async move {
                    let info = inner.host.user_info(&username).await?;
                    inner
                        .reply(&username, PeerMessage::UserInfoResponse(info))
                        .await
                });
            }
            PeerMessage::UserInfoResponse(info) => {
                self.waiter.complete(
                    &WaitKey::peer(PeerCode::UserInfoResponse).with(&username),
                    info,
                );
            }
            PeerMessage::FolderContentsRequest { token, directory } => {
                self.serve(username, move |inner, username| async move {
                    let directories = inner
                        .host
                        .directory_contents(&username, token, &directory)
                        .await?;
                    inner
                        .reply(
                            &username,
                            PeerMessage::FolderContentsResponse {
                                token,
                                directory,
                                directories,
                            },
                        )
                        .await
                });
            }
            PeerMessage::FolderContentsResponse {
                token, directories, ..
            } => {
                self.waiter.complete(
                    &WaitKey::peer(PeerCode::FolderContentsResponse)
                        .with(&username)
                        .with(token),
                    directories,
                );
            }
            PeerMessage::TransferRequest {
                direction,
                token,
                filename,
                size,
            } => match direction {
                // the peer offers an upload: either the start signal for a
                // download of ours that was queued, or unsolicited
                TransferDirection::Upload => {
                    let key = WaitKey::named(slots::TRANSFER_QUEUED_START)
                        .with(&username)
                        .with(&filename);
                    let accepted = self.waiter.complete(&key, (token, size.unwrap_or(-1)));
                    if !accepted {
                        debug!(%username, filename, "unsolicited upload offer declined");
                        let _ = self
                            .reply(
                                &username,
                                PeerMessage::TransferResponse {
                                    token,
                                    allowed: false,
                                    size: None,
                                    reason: Some("Cancelled".into()),
                                },
                            )
                            .await;
                    }
                }
                // the peer wants to download from us: queue through the host
                TransferDirection::Download => {
                    self.serve(username, move |inner, username| async move {
                        let reply = match inner.host.enqueue_download(&username, &filename).await {
                            Ok(()) => PeerMessage::TransferResponse {
                                token,
                                allowed: false,
                                size: None,
                                reason: Some("Queued".into()),
                            },
                            Err(e) => PeerMessage::TransferResponse {
                                token,
                                allowed: false,
                                size: None,
                                reason: Some(rejection_text(&e)),
                            },
                        };
                        inner.reply(&username, reply).await
                    });
                }
            },
            PeerMessage::TransferResponse {
                token,
                allowed,
                size,
                reason,
            } => {
                self.waiter.complete(
                    &WaitKey::peer(PeerCode::TransferResponse).with(token),
                    TransferReply {
                        allowed,
                        size,
                        reason,
                    },
                );
            }
            PeerMessage::QueueDownload { filename } => {
                self.serve(username, move |inner, username| async move {
                    match inner.host.enqueue_download(&username, &filename).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            inner
                                .reply(
                                    &username,
                                    PeerMessage::QueueFailed {
                                        filename,
                                        reason: rejection_text(&e),
                                    },
                                )
                                .await
                        }
                    }
                });
            }
            PeerMessage::PlaceInQueueRequest { filename } => {
                self.serve(username, move |inner, username| async move {
                    if let Some(place) = inner.host.place_in_queue(&username, &filename).await {
                        inner
                            .reply(
                                &username,
                                PeerMessage::PlaceInQueueResponse { filename, place },
                            )
                            .await?;
                    }
                    Ok(())
                });
            }
            PeerMessage::PlaceInQueueResponse { filename, place } => {
                self.waiter.complete(
                    &WaitKey::peer(PeerCode::PlaceInQueueResponse)
                        .with(&username)
                        .with(&filename),
                    place,
                );
            }
            PeerMessage::UploadFailed { filename } => {
                self.waiter.throw(
                    &WaitKey::named(slots::TRANSFER_QUEUED_START)
                        .with(&username)
                        .with(&filename),
                    Error::TransferRejected("remote upload failed".into()),
                );
            }
            PeerMessage::QueueFailed { filename, reason } => {
                self.waiter.throw(
                    &WaitKey::named(slots::TRANSFER_QUEUED_START)
                        .with(&username)
                        .with(&filename),
                    translate_rejection(reason),
                );
            }
        }
    }

    /// Spawn a task serving one remote request through a host callback.
    fn serve<F, Fut>(self: &Arc<Self>, username: String, handler: F)
    where
        F: FnOnce(Arc<ClientInner>, String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = handler(Arc::clone(&inner), username.clone()).await {
                debug!(%username, error = %e, "serving remote request failed");
            }
        });
    }

    /// Write a reply on the user's current peer message connection.
    async fn reply(&self, username: &str, message: PeerMessage) -> Result<()> {
        let mc = self
            .peers
            .get_connected(username)
            .ok_or_else(|| Error::InvalidState(format!("no connection to {username}")))?;
        mc.write(&message.to_bytes()?).await
    }

    // =========================================================================
    // DISTRIBUTED SEARCHES
    // =========================================================================

    async fn on_distributed_search(self: &Arc<Self>, search: DistributedSearch) {
        if let Some(us) = self.our_username() {
            if us == search.username {
                return;
            }
        }

        let deduplicate = self
            .options
            .lock()
            .expect("options poisoned")
            .deduplicate_search_requests;
        if deduplicate && !self.remember_search(&search) {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let Some(mut response) = inner
                .host
                .search_response(&search.username, search.token, &search.query)
                .await
            else {
                return;
            };
            if response.files.is_empty() {
                return;
            }
            response.token = search.token;
            if let Some(us) = inner.our_username() {
                response.username = us;
            }

            // dial the searcher and deliver the result set
            let endpoint = inner.endpoint_cache.try_get(&search.username);
            match inner
                .peers
                .get_or_connect(&search.username, endpoint)
                .await
            {
                Ok(mc) => {
                    let frame = match PeerMessage::SearchResponse(response).to_bytes() {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(error = %e, "search response encode failed");
                            return;
                        }
                    };
                    if let Err(e) = mc.write(&frame).await {
                        debug!(username = %search.username, error = %e, "search response write failed");
                    }
                }
                Err(e) => {
                    debug!(username = %search.username, error = %e, "searcher unreachable");
                }
            }
        });
    }

    /// Record a search in the bounded dedup set; false when already seen.
    fn remember_search(&self, search: &DistributedSearch) -> bool {
        let key = (search.username.clone(), search.token);
        let mut recent = self.recent_searches.lock().expect("dedup poisoned");
        let (set, order) = &mut *recent;
        if !set.insert(key.clone()) {
            return false;
        }
        order.push_back(key);
        while order.len() > SEARCH_DEDUP_CAPACITY {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
        true
    }

    // =========================================================================
    // INBOUND CONNECTIONS
    // =========================================================================

    async fn on_inbound(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::PeerMessage { username, conn, .. } => {
                self.peers.accept_inbound(username, conn);
            }
            InboundEvent::DistributedChild { username, conn } => {
                self.distributed.accept_child(username, conn);
            }
            InboundEvent::Transfer { username, conn, .. } => {
                // reading the opener token can stall; never block the pump
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.route_transfer_connection(username, conn).await;
                });
            }
        }
    }

    /// The opener of a transfer connection writes the transfer token first;
    /// read it and hand the socket to the waiting upload.
    async fn route_transfer_connection(self: &Arc<Self>, username: String, conn: Arc<Connection>) {
        let cancel = conn.shutdown_token();
        let token_bytes =
            match tokio::time::timeout(Duration::from_secs(5), conn.read_raw(4, &cancel)).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    debug!(%username, error = %e, "transfer token read failed");
                    conn.disconnect("transfer token read failed").await;
                    return;
                }
                Err(_) => {
                    conn.disconnect("transfer token timeout").await;
                    return;
                }
            };
        let token = match <[u8; 4]>::try_from(token_bytes.as_slice()) {
            Ok(bytes) => u32::from_le_bytes(bytes),
            Err(_) => {
                conn.disconnect("bad transfer token").await;
                return;
            }
        };
        let key = WaitKey::named(slots::TRANSFER_START).with(token);
        if !self.waiter.complete(&key, conn.clone()) {
            debug!(%username, token, "transfer connection with no waiting transfer");
            conn.disconnect("no matching transfer").await;
        }
    }
}

fn rejection_text(error: &Error) -> String {
    match error {
        Error::QueueFull => "Queue full.".into(),
        Error::TransferRejected(reason) => reason.clone(),
        other => other.to_string(),
    }
}
