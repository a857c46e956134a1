//! One framed TCP pipe with watchdog, inactivity timer, and queued writes
//!
//! A [`Connection`] exclusively owns its socket. State moves one way through
//! `Pending → Connecting → Connected → Disconnecting → Disconnected`; a
//! connection is never reused after disconnecting. All reads and writes
//! honour a cancellation token plus the connection's own shutdown token, and
//! reset the inactivity clock on every byte moved.

use crate::error::{Error, Result};
use crate::limiter::Governor;
use crate::options::{ConnectionOptions, WATCHDOG_INTERVAL};
use crate::proto::MAX_FRAME_SIZE;
use bytes::Bytes;
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque per-process connection identifier, used for diagnostics and for
/// keying waits tied to one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Lifecycle notifications delivered to the sink supplied at construction.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(ConnectionId),
    Disconnected { id: ConnectionId, reason: String },
}

pub type ConnectionEventSink = Box<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Progress callback for streamed reads/writes: (bytes so far, total).
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    stream: StdMutex<Option<Arc<TcpStream>>>,
    /// Bounds the number of writers queued behind the write mutex.
    write_slots: Arc<Semaphore>,
    /// Serialises writes so frames never interleave.
    write_lock: Mutex<()>,
    /// Serialises raw reads (one reader at a time: frame loop or stream).
    read_lock: Mutex<()>,
    /// Trips on disconnect; cancels every pending read and write.
    shutdown: CancellationToken,
    last_activity: StdMutex<Instant>,
    sink: StdMutex<Option<ConnectionEventSink>>,
    disconnect_reason: StdMutex<Option<String>>,
    handed_off: AtomicBool,
}

impl Connection {
    /// A connection that has not dialled yet.
    pub fn new(
        addr: SocketAddr,
        options: ConnectionOptions,
        sink: Option<ConnectionEventSink>,
    ) -> Arc<Self> {
        Self::build(addr, options, sink, ConnectionState::Pending, None)
    }

    /// Wrap an accepted socket; the connection starts out `Connected`.
    pub fn adopt(
        stream: TcpStream,
        options: ConnectionOptions,
        sink: Option<ConnectionEventSink>,
    ) -> Arc<Self> {
        let addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let conn = Self::build(
            addr,
            options,
            sink,
            ConnectionState::Connected,
            Some(Arc::new(stream)),
        );
        conn.spawn_watchdog();
        conn.emit(ConnectionEvent::Connected(conn.id));
        conn
    }

    fn build(
        addr: SocketAddr,
        options: ConnectionOptions,
        sink: Option<ConnectionEventSink>,
        state: ConnectionState,
        stream: Option<Arc<TcpStream>>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(state);
        Arc::new(Self {
            id: ConnectionId::next(),
            addr,
            write_slots: Arc::new(Semaphore::new(options.write_queue_size)),
            options,
            state: state_tx,
            stream: StdMutex::new(stream),
            write_lock: Mutex::new(()),
            read_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            last_activity: StdMutex::new(Instant::now()),
            sink: StdMutex::new(sink),
            disconnect_reason: StdMutex::new(None),
            handed_off: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A child token that trips when the connection shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    fn emit(&self, event: ConnectionEvent) {
        let sink = self.sink.lock().expect("sink poisoned");
        if let Some(sink) = sink.as_ref() {
            sink(event);
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity clock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_activity
            .lock()
            .expect("activity clock poisoned")
            .elapsed()
    }

    fn stream_handle(&self) -> Result<Arc<TcpStream>> {
        self.stream
            .lock()
            .expect("stream slot poisoned")
            .clone()
            .ok_or_else(|| Error::InvalidState("connection has no socket".into()))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "connection {} is not connected",
                self.id
            )))
        }
    }

    /// Dial the remote endpoint, racing the connect against the configured
    /// deadline and the caller's cancellation.
    pub async fn connect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let mut transitioned = false;
        self.state.send_modify(|s| {
            if matches!(*s, ConnectionState::Pending | ConnectionState::Disconnected) {
                *s = ConnectionState::Connecting;
                transitioned = true;
            }
        });
        if !transitioned {
            return Err(Error::InvalidState(format!(
                "connection {} cannot connect from state {:?}",
                self.id,
                self.state()
            )));
        }

        let timeout = self.options.connect_timeout();
        let dial = async {
            match &self.options.proxy {
                Some(proxy) => {
                    super::proxy::connect_through(proxy, self.addr, self.options.keep_alive).await
                }
                None => {
                    let socket = match self.addr {
                        SocketAddr::V4(_) => TcpSocket::new_v4()?,
                        SocketAddr::V6(_) => TcpSocket::new_v6()?,
                    };
                    if self.options.keep_alive {
                        socket.set_keepalive(true)?;
                    }
                    socket.connect(self.addr).await.map_err(|e| Error::Connect {
                        addr: self.addr,
                        source: e,
                    })
                }
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout(timeout)),
            result = dial => result,
        };

        match outcome {
            Ok(stream) => {
                *self.stream.lock().expect("stream slot poisoned") = Some(Arc::new(stream));
                self.touch();
                self.state
                    .send_modify(|s| *s = ConnectionState::Connected);
                self.spawn_watchdog();
                self.emit(ConnectionEvent::Connected(self.id));
                debug!(id = %self.id, addr = %self.addr, "connected");
                Ok(())
            }
            Err(e) => {
                self.state
                    .send_modify(|s| *s = ConnectionState::Disconnected);
                debug!(id = %self.id, addr = %self.addr, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Periodic check that the socket is still healthy: fires every 250 ms,
    /// independent of read/write activity, and also enforces the inactivity
    /// deadline.
    fn spawn_watchdog(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(conn) = weak.upgrade() else { break };

                let broken = {
                    let guard = conn.stream.lock().expect("stream slot poisoned");
                    match guard.as_ref() {
                        Some(stream) => match stream.ready(Interest::ERROR).now_or_never() {
                            Some(Ok(ready)) => ready.is_error() || ready.is_read_closed(),
                            Some(Err(_)) => true,
                            None => false,
                        },
                        None => break,
                    }
                };
                if broken {
                    conn.disconnect("socket closed unexpectedly").await;
                    break;
                }

                if let Some(limit) = conn.options.inactivity_timeout() {
                    if conn.idle_for() >= limit {
                        conn.disconnect("inactivity timeout").await;
                        break;
                    }
                }
            }
        });
    }

    async fn readable(&self, stream: &TcpStream, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.shutdown.cancelled() => Err(Error::ConnectionClosed),
            ready = stream.readable() => ready.map_err(Error::Io),
        }
    }

    async fn writable(&self, stream: &TcpStream, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.shutdown.cancelled() => Err(Error::ConnectionClosed),
            ready = stream.writable() => ready.map_err(Error::Io),
        }
    }

    /// Fill `buf` completely. A zero-length socket read means the remote
    /// closed the pipe.
    async fn read_exact_into(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<()> {
        let stream = self.stream_handle()?;
        let mut filled = 0;
        while filled < buf.len() {
            self.readable(&stream, cancel).await?;
            match stream.try_read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    filled += n;
                    self.touch();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// One socket read of up to `buf.len()` bytes; at least one byte.
    async fn read_some(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        let stream = self.stream_handle()?;
        loop {
            self.readable(&stream, cancel).await?;
            match stream.try_read(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    self.touch();
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn write_all_raw(&self, bytes: &[u8], cancel: &CancellationToken) -> Result<()> {
        let stream = self.stream_handle()?;
        let mut written = 0;
        while written < bytes.len() {
            self.writable(&stream, cancel).await?;
            match stream.try_write(&bytes[written..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    written += n;
                    self.touch();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn acquire_write_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        match Arc::clone(&self.write_slots).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(_) => Err(Error::WriteDropped("write buffer full".into())),
        }
    }

    /// Write one already-framed message.
    pub async fn write(&self, bytes: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.ensure_connected()?;
        if bytes.is_empty() {
            return Err(Error::InvalidState("refusing to write empty payload".into()));
        }
        let permit = match self.acquire_write_slot() {
            Ok(permit) => permit,
            Err(e) => {
                warn!(id = %self.id, "write queue full, dropping connection");
                self.disconnect("write buffer full").await;
                return Err(e);
            }
        };
        let guard = self.write_lock.lock().await;
        let result = self.write_all_raw(bytes, cancel).await;
        drop(guard);
        drop(permit);
        if let Err(e) = &result {
            if !matches!(e, Error::Cancelled) {
                self.disconnect("write failed").await;
            }
        }
        result
    }

    /// Read exactly `n` raw bytes (no framing). Used for the token/offset
    /// exchange that opens a transfer connection.
    pub async fn read_raw(&self, n: usize, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let _guard = self.read_lock.lock().await;
        let mut buf = vec![0u8; n];
        self.read_exact_into(&mut buf, cancel).await?;
        Ok(buf)
    }

    /// Read one length-prefixed frame and return its body.
    pub async fn read_frame(&self, cancel: &CancellationToken) -> Result<Bytes> {
        let _guard = self.read_lock.lock().await;
        let mut prefix = [0u8; 4];
        self.read_exact_into(&mut prefix, cancel).await?;
        let length = u32::from_le_bytes(prefix) as usize;
        if length == 0 || length > MAX_FRAME_SIZE {
            return Err(Error::MessageFormat(format!(
                "frame length {length} out of range"
            )));
        }
        let mut body = vec![0u8; length];
        self.read_exact_into(&mut body, cancel).await?;
        trace!(id = %self.id, length, "frame read");
        Ok(Bytes::from(body))
    }

    /// Stream exactly `length` bytes from `input` onto the socket, asking
    /// `governor` for an allowance before each chunk.
    pub async fn write_stream<R>(
        &self,
        length: u64,
        input: &mut R,
        governor: &dyn Governor,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.ensure_connected()?;
        let permit = match self.acquire_write_slot() {
            Ok(permit) => permit,
            Err(e) => {
                self.disconnect("write buffer full").await;
                return Err(e);
            }
        };
        let guard = self.write_lock.lock().await;

        let result = async {
            let mut chunk = vec![0u8; self.options.write_buffer_size];
            let mut sent: u64 = 0;
            while sent < length {
                let want = chunk.len().min((length - sent) as usize);
                let granted = tokio::select! {
                    granted = governor.grant(want, cancel) => granted?,
                    _ = self.shutdown.cancelled() => return Err(Error::ConnectionClosed),
                };
                let granted = granted.min(want).max(1);
                let n = input
                    .read(&mut chunk[..granted])
                    .await
                    .map_err(Error::Io)?;
                if n == 0 {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "input stream ended before declared length",
                    )));
                }
                self.write_all_raw(&chunk[..n], cancel).await?;
                sent += n as u64;
                if let Some(progress) = progress {
                    progress(sent, length);
                }
            }
            Ok(sent)
        }
        .await;

        drop(guard);
        drop(permit);
        if let Err(e) = &result {
            if !matches!(e, Error::Cancelled) {
                self.disconnect("stream write failed").await;
            }
        }
        result
    }

    /// Stream exactly `length` bytes from the socket into `output`.
    pub async fn read_stream<W>(
        &self,
        length: u64,
        output: &mut W,
        governor: &dyn Governor,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.ensure_connected()?;
        let _guard = self.read_lock.lock().await;

        let result = async {
            let mut chunk = vec![0u8; self.options.read_buffer_size];
            let mut received: u64 = 0;
            while received < length {
                let want = chunk.len().min((length - received) as usize);
                let granted = tokio::select! {
                    granted = governor.grant(want, cancel) => granted?,
                    _ = self.shutdown.cancelled() => return Err(Error::ConnectionClosed),
                };
                let granted = granted.min(want).max(1);
                let n = self.read_some(&mut chunk[..granted], cancel).await?;
                output.write_all(&chunk[..n]).await.map_err(Error::Io)?;
                received += n as u64;
                if let Some(progress) = progress {
                    progress(received, length);
                }
            }
            output.flush().await.map_err(Error::Io)?;
            Ok(received)
        }
        .await;

        if let Err(e) = &result {
            if !matches!(e, Error::Cancelled) {
                self.disconnect("stream read failed").await;
            }
        }
        result
    }

    /// Tear the connection down. Idempotent; the `Disconnected` event fires
    /// exactly once no matter how many callers race here.
    pub async fn disconnect(&self, reason: &str) {
        let mut proceed = false;
        self.state.send_modify(|s| {
            if !matches!(
                *s,
                ConnectionState::Disconnecting | ConnectionState::Disconnected
            ) {
                *s = ConnectionState::Disconnecting;
                proceed = true;
            }
        });
        if !proceed {
            return;
        }

        *self
            .disconnect_reason
            .lock()
            .expect("reason slot poisoned") = Some(reason.to_string());
        self.shutdown.cancel();
        // dropping the last Arc closes the socket
        let stream = self.stream.lock().expect("stream slot poisoned").take();
        drop(stream);
        self.state
            .send_modify(|s| *s = ConnectionState::Disconnected);

        if !self.handed_off.load(Ordering::Acquire) {
            debug!(id = %self.id, addr = %self.addr, reason, "disconnected");
            self.emit(ConnectionEvent::Disconnected {
                id: self.id,
                reason: reason.to_string(),
            });
        }
    }

    /// Resolves once the connection reaches `Disconnected`, with the reason.
    pub async fn wait_for_disconnect(&self) -> String {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow() == ConnectionState::Disconnected {
                return self
                    .disconnect_reason
                    .lock()
                    .expect("reason slot poisoned")
                    .clone()
                    .unwrap_or_default();
            }
            if rx.changed().await.is_err() {
                return String::new();
            }
        }
    }

    /// Give the owned socket to another object. The connection emits no
    /// further events and every later operation fails. The caller must not
    /// have reads or writes in flight.
    pub fn handoff(&self) -> Result<TcpStream> {
        self.handed_off.store(true, Ordering::Release);
        let stream = self
            .stream
            .lock()
            .expect("stream slot poisoned")
            .take()
            .ok_or_else(|| Error::InvalidState("connection has no socket to hand off".into()))?;
        self.shutdown.cancel();
        self.state
            .send_modify(|s| *s = ConnectionState::Disconnected);
        Arc::try_unwrap(stream)
            .map_err(|_| Error::InvalidState("socket still in use during handoff".into()))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }
}
