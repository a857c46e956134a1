//! Client and connection option records
//!
//! Options are plain serde structs with `deny_unknown_fields`, so a config
//! file carrying a misspelled or unsupported key is rejected at construction
//! rather than silently ignored. A patch record (all fields optional) applies
//! partial updates at runtime; unspecified fields retain their prior value.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// Watchdog poll period for live sockets.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(250);

/// Diagnostic verbosity floor, mapped onto a tracing filter by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    None,
    Warning,
    #[default]
    Info,
    Debug,
}

impl DiagnosticLevel {
    /// The equivalent `tracing_subscriber` EnvFilter directive.
    pub fn as_filter(&self) -> &'static str {
        match self {
            DiagnosticLevel::None => "off",
            DiagnosticLevel::Warning => "warn",
            DiagnosticLevel::Info => "info",
            DiagnosticLevel::Debug => "debug",
        }
    }
}

/// SOCKS5 proxy descriptor.
///
/// Credentials and address are each capped at 255 bytes, the maximum a
/// RFC 1929 sub-negotiation can carry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyOptions {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyOptions {
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() || self.address.len() > 255 {
            return Err(Error::InvalidOption(
                "proxy address must be 1-255 bytes".into(),
            ));
        }
        for (name, value) in [("username", &self.username), ("password", &self.password)] {
            if let Some(v) = value {
                if v.len() > 255 {
                    return Err(Error::InvalidOption(format!(
                        "proxy {name} must be at most 255 bytes"
                    )));
                }
            }
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::InvalidOption(
                "proxy username and password must be supplied together".into(),
            ));
        }
        Ok(())
    }
}

/// Per-connection tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectionOptions {
    /// Socket read chunk size in bytes.
    pub read_buffer_size: usize,
    /// Socket write chunk size in bytes.
    pub write_buffer_size: usize,
    /// Maximum writes queued behind the write mutex before the connection is
    /// dropped with "write buffer full". Must be at least 1; 1 serialises
    /// writers with no queueing.
    pub write_queue_size: usize,
    /// TCP connect deadline in milliseconds.
    pub connect_timeout_ms: u64,
    /// Milliseconds without a single byte read or written before the
    /// connection is torn down. Negative disables the timer.
    pub inactivity_timeout_ms: i64,
    /// Enable TCP keepalive on the socket.
    pub keep_alive: bool,
    /// Optional SOCKS5 tunnel.
    pub proxy: Option<ProxyOptions>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 16 * 1024,
            write_buffer_size: 16 * 1024,
            write_queue_size: 250,
            connect_timeout_ms: 10_000,
            inactivity_timeout_ms: -1,
            keep_alive: false,
            proxy: None,
        }
    }
}

impl ConnectionOptions {
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(Error::InvalidOption("buffer sizes must be non-zero".into()));
        }
        if self.write_queue_size == 0 {
            return Err(Error::InvalidOption(
                "write_queue_size must be at least 1".into(),
            ));
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Inactivity deadline, or `None` when disabled.
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        if self.inactivity_timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(self.inactivity_timeout_ms as u64))
        }
    }
}

/// Top-level client options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClientOptions {
    pub enable_listener: bool,
    pub listen_port: u16,

    pub enable_distributed_network: bool,
    pub accept_distributed_children: bool,
    pub distributed_child_limit: usize,

    /// Upload throughput ceiling in bytes per second. 0 is unlimited.
    pub maximum_upload_speed: usize,
    /// Download throughput ceiling in bytes per second. 0 is unlimited.
    pub maximum_download_speed: usize,
    pub maximum_concurrent_uploads: usize,
    pub maximum_concurrent_downloads: usize,
    pub maximum_concurrent_peer_connections: usize,

    pub deduplicate_search_requests: bool,
    pub auto_acknowledge_private_messages: bool,
    pub auto_acknowledge_privilege_notifications: bool,
    pub accept_private_room_invitations: bool,

    pub starting_token: u32,
    pub minimum_diagnostic_level: DiagnosticLevel,
    /// Default deadline for request/response waits, in milliseconds.
    pub message_timeout_ms: u64,

    pub server_connection: ConnectionOptions,
    pub peer_connection: ConnectionOptions,
    pub transfer_connection: ConnectionOptions,
    pub distributed_connection: ConnectionOptions,
    pub incoming_connection: ConnectionOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            enable_listener: true,
            listen_port: 50_000,
            enable_distributed_network: true,
            accept_distributed_children: true,
            distributed_child_limit: 25,
            maximum_upload_speed: 0,
            maximum_download_speed: 0,
            maximum_concurrent_uploads: 10,
            maximum_concurrent_downloads: 10,
            maximum_concurrent_peer_connections: 500,
            deduplicate_search_requests: true,
            auto_acknowledge_private_messages: true,
            auto_acknowledge_privilege_notifications: true,
            accept_private_room_invitations: false,
            starting_token: 0,
            minimum_diagnostic_level: DiagnosticLevel::Info,
            message_timeout_ms: 5_000,
            server_connection: ConnectionOptions {
                inactivity_timeout_ms: -1,
                keep_alive: true,
                ..ConnectionOptions::default()
            },
            peer_connection: ConnectionOptions {
                inactivity_timeout_ms: 15_000,
                ..ConnectionOptions::default()
            },
            transfer_connection: ConnectionOptions {
                inactivity_timeout_ms: 15_000,
                ..ConnectionOptions::default()
            },
            distributed_connection: ConnectionOptions {
                inactivity_timeout_ms: 300_000,
                ..ConnectionOptions::default()
            },
            incoming_connection: ConnectionOptions {
                inactivity_timeout_ms: 15_000,
                ..ConnectionOptions::default()
            },
        }
    }
}

impl ClientOptions {
    pub fn validate(&self) -> Result<()> {
        if self.enable_listener && self.listen_port == 0 {
            return Err(Error::InvalidOption(
                "listen_port must be non-zero when the listener is enabled".into(),
            ));
        }
        if self.maximum_concurrent_peer_connections == 0 {
            return Err(Error::InvalidOption(
                "maximum_concurrent_peer_connections must be at least 1".into(),
            ));
        }
        if self.maximum_concurrent_uploads == 0 || self.maximum_concurrent_downloads == 0 {
            return Err(Error::InvalidOption(
                "concurrent transfer limits must be at least 1".into(),
            ));
        }
        if self.message_timeout_ms == 0 {
            return Err(Error::InvalidOption(
                "message_timeout_ms must be non-zero".into(),
            ));
        }
        for options in [
            &self.server_connection,
            &self.peer_connection,
            &self.transfer_connection,
            &self.distributed_connection,
            &self.incoming_connection,
        ] {
            options.validate()?;
        }
        Ok(())
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// Apply a partial update; unspecified fields keep their prior value.
    ///
    /// The patched record is re-validated as a whole, so a patch cannot move
    /// the options into an invalid state.
    pub fn patched(&self, patch: ClientOptionsPatch) -> Result<ClientOptions> {
        let mut next = self.clone();
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = patch.$field { next.$field = v; })*
            };
        }
        apply!(
            enable_listener,
            listen_port,
            enable_distributed_network,
            accept_distributed_children,
            distributed_child_limit,
            maximum_upload_speed,
            maximum_download_speed,
            maximum_concurrent_uploads,
            maximum_concurrent_downloads,
            maximum_concurrent_peer_connections,
            deduplicate_search_requests,
            auto_acknowledge_private_messages,
            auto_acknowledge_privilege_notifications,
            accept_private_room_invitations,
            starting_token,
            minimum_diagnostic_level,
            message_timeout_ms,
            server_connection,
            peer_connection,
            transfer_connection,
            distributed_connection,
            incoming_connection,
        );
        next.validate()?;
        Ok(next)
    }
}

/// All-optional mirror of [`ClientOptions`] for runtime patching.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClientOptionsPatch {
    pub enable_listener: Option<bool>,
    pub listen_port: Option<u16>,
    pub enable_distributed_network: Option<bool>,
    pub accept_distributed_children: Option<bool>,
    pub distributed_child_limit: Option<usize>,
    pub maximum_upload_speed: Option<usize>,
    pub maximum_download_speed: Option<usize>,
    pub maximum_concurrent_uploads: Option<usize>,
    pub maximum_concurrent_downloads: Option<usize>,
    pub maximum_concurrent_peer_connections: Option<usize>,
    pub deduplicate_search_requests: Option<bool>,
    pub auto_acknowledge_private_messages: Option<bool>,
    pub auto_acknowledge_privilege_notifications: Option<bool>,
    pub accept_private_room_invitations: Option<bool>,
    pub starting_token: Option<u32>,
    pub minimum_diagnostic_level: Option<DiagnosticLevel>,
    pub message_timeout_ms: Option<u64>,
    pub server_connection: Option<ConnectionOptions>,
    pub peer_connection: Option<ConnectionOptions>,
    pub transfer_connection: Option<ConnectionOptions>,
    pub distributed_connection: Option<ConnectionOptions>,
    pub incoming_connection: Option<ConnectionOptions>,
}
