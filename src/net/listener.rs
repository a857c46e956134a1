//! Inbound connection intake
//!
//! Accepts TCP connections, reads the one-frame handshake, and routes the
//! socket: firewall pierces resolve a pending solicitation wait, peer-init
//! frames are classified by declared connection type and handed to the
//! owning manager through the inbound channel.

use crate::error::{Error, Result};
use crate::net::conn::Connection;
use crate::net::slots;
use crate::options::ConnectionOptions;
use crate::proto::peer::PeerInitMessage;
use crate::proto::ConnectionType;
use crate::waiter::{WaitKey, Waiter};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long an accepted socket may take to present its handshake frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A classified inbound connection, forwarded to the client for routing.
#[derive(Debug)]
pub enum InboundEvent {
    /// Unsolicited `PeerInit` of type "P".
    PeerMessage {
        username: String,
        token: u32,
        conn: Arc<Connection>,
    },
    /// Unsolicited `PeerInit` of type "D": a prospective child.
    DistributedChild {
        username: String,
        conn: Arc<Connection>,
    },
    /// Unsolicited `PeerInit` of type "F": the remote wants to move a file.
    Transfer {
        username: String,
        token: u32,
        conn: Arc<Connection>,
    },
}

pub struct Listener {
    port: u16,
    shutdown: CancellationToken,
}

impl Listener {
    /// Bind the listen port and start accepting. A bind failure surfaces as
    /// an error instead of silently disabling inbound connections.
    pub async fn bind(
        port: u16,
        options: ConnectionOptions,
        waiter: Waiter,
        inbound: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| Error::Listener { port, source })?;
        info!(port, "listener bound");

        let shutdown = CancellationToken::new();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound connection accepted");
                        let conn = Connection::adopt(stream, options.clone(), None);
                        let waiter = waiter.clone();
                        let inbound = inbound.clone();
                        tokio::spawn(async move {
                            handle_handshake(conn, waiter, inbound).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        Ok(Self { port, shutdown })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_handshake(
    conn: Arc<Connection>,
    waiter: Waiter,
    inbound: mpsc::UnboundedSender<InboundEvent>,
) {
    let cancel = conn.shutdown_token();
    let body = match tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.read_frame(&cancel)).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            debug!(id = %conn.id(), error = %e, "handshake read failed");
            conn.disconnect("handshake read failed").await;
            return;
        }
        Err(_) => {
            conn.disconnect("handshake timeout").await;
            return;
        }
    };

    match PeerInitMessage::parse(body) {
        Ok(PeerInitMessage::PierceFirewall { token }) => {
            // hand the raw socket to whoever solicited this dial-back
            match conn.handoff() {
                Ok(stream) => {
                    let key = WaitKey::named(slots::SOLICITED_CONNECTION).with(token);
                    if !waiter.complete(&key, stream) {
                        // solicitation already abandoned; dropping the socket
                        // closes it
                        debug!(token, "pierce for unknown token dropped");
                    }
                }
                Err(e) => {
                    debug!(id = %conn.id(), error = %e, "handoff failed");
                    conn.disconnect("handoff failed").await;
                }
            }
        }
        Ok(PeerInitMessage::PeerInit {
            username,
            kind,
            token,
        }) => {
            debug!(id = %conn.id(), %username, %kind, "peer handshake");
            let event = match kind {
                ConnectionType::Peer => InboundEvent::PeerMessage {
                    username,
                    token,
                    conn,
                },
                ConnectionType::Distributed => InboundEvent::DistributedChild { username, conn },
                ConnectionType::Transfer => InboundEvent::Transfer {
                    username,
                    token,
                    conn,
                },
            };
            if inbound.send(event).is_err() {
                // client gone; nothing to route to
            }
        }
        Err(e) => {
            debug!(id = %conn.id(), error = %e, "malformed handshake");
            conn.disconnect("malformed handshake").await;
        }
    }
}
