//! Networking layer: connections, listener, and the two managers

pub mod conn;
pub mod distributed;
pub mod listener;
pub mod message_conn;
pub mod peer_manager;
pub mod proxy;

pub use conn::{Connection, ConnectionEvent, ConnectionId, ConnectionState, ProgressFn};
pub use distributed::DistributedManager;
pub use listener::{InboundEvent, Listener};
pub use message_conn::MessageConnection;
pub use peer_manager::PeerConnectionManager;

/// Symbolic waiter slot names shared across the listener and the managers.
pub mod slots {
    /// Completed with the raw socket when a solicited peer pierces back.
    pub const SOLICITED_CONNECTION: &str = "SolicitedConnection";
    /// Completed with the transfer connection once its opener token is read.
    pub const TRANSFER_START: &str = "TransferStart";
    /// Completed when a queued remote transfer finally starts.
    pub const TRANSFER_QUEUED_START: &str = "TransferQueuedStart";
    /// Branch level announced by a parent candidate.
    pub const BRANCH_LEVEL: &str = "BranchLevel";
    /// Branch root announced by a parent candidate.
    pub const BRANCH_ROOT: &str = "BranchRoot";
    /// First search delivered by a parent candidate (the "live" signal).
    pub const FIRST_SEARCH: &str = "FirstSearchRequest";
}
