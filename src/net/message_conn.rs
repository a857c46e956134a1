//! Connection plus a continuous framed-read loop

use crate::error::{Error, Result};
use crate::net::conn::{Connection, ConnectionId, ConnectionState};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A [`Connection`] whose socket is exclusively read by a background task
/// that delivers decoded frame bodies, in wire order, to the handler given
/// at start.
pub struct MessageConnection {
    conn: Arc<Connection>,
}

impl MessageConnection {
    /// Attach a read loop to an established connection.
    ///
    /// `on_frame` is called with each frame body (length prefix stripped).
    /// The loop ends when the connection disconnects or the stream breaks;
    /// read failures disconnect the connection with the failure as reason.
    pub fn start<F>(conn: Arc<Connection>, mut on_frame: F) -> Arc<Self>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        let reader = Arc::clone(&conn);
        let cancel = conn.shutdown_token();
        tokio::spawn(async move {
            loop {
                match reader.read_frame(&cancel).await {
                    Ok(body) => {
                        trace!(id = %reader.id(), bytes = body.len(), "frame received");
                        on_frame(body);
                    }
                    Err(Error::Cancelled) => break,
                    Err(Error::ConnectionClosed) => {
                        reader.disconnect("remote closed connection").await;
                        break;
                    }
                    Err(e) => {
                        debug!(id = %reader.id(), error = %e, "read loop failed");
                        reader.disconnect(&format!("read failed: {e}")).await;
                        break;
                    }
                }
            }
        });
        Arc::new(Self { conn })
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Write one framed message, bounded by the connection's own lifetime.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let cancel = self.conn.shutdown_token();
        self.conn.write(bytes, &cancel).await
    }

    pub async fn write_cancellable(&self, bytes: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.conn.write(bytes, cancel).await
    }

    pub async fn disconnect(&self, reason: &str) {
        self.conn.disconnect(reason).await;
    }

    pub async fn wait_for_disconnect(&self) -> String {
        self.conn.wait_for_disconnect().await
    }
}

impl std::fmt::Debug for MessageConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConnection")
            .field("id", &self.id())
            .field("addr", &self.remote_addr())
            .finish()
    }
}
