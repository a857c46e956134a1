//! Transfer records and state machine

use std::sync::Arc;

/// Wire encoding: downloads are 0, uploads are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    pub fn to_u32(self) -> u32 {
        match self {
            TransferDirection::Download => 0,
            TransferDirection::Upload => 1,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(TransferDirection::Download),
            1 => Some(TransferDirection::Upload),
            _ => None,
        }
    }
}

/// Lifecycle of a single transfer. Progress through the non-terminal states
/// is strictly forward; every terminal state is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    Queued,
    Initializing,
    InProgress,
    Succeeded,
    Cancelled,
    TimedOut,
    Rejected,
    Errored,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Succeeded
                | TransferState::Cancelled
                | TransferState::TimedOut
                | TransferState::Rejected
                | TransferState::Errored
        )
    }

    fn rank(&self) -> u8 {
        match self {
            TransferState::Requested => 0,
            TransferState::Queued => 1,
            TransferState::Initializing => 2,
            TransferState::InProgress => 3,
            _ => 4,
        }
    }

    /// Forward-only; terminal states accept nothing further.
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        !self.is_terminal() && (next.is_terminal() || next.rank() > self.rank())
    }
}

/// One download or upload, as observed by callers.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub direction: TransferDirection,
    pub username: String,
    pub remote_filename: String,
    /// Token dispensed by this client.
    pub token: u32,
    /// Token chosen by the remote side, once known.
    pub remote_token: Option<u32>,
    pub size: i64,
    pub bytes_transferred: u64,
    pub state: TransferState,
}

impl Transfer {
    pub fn new(
        direction: TransferDirection,
        username: impl Into<String>,
        remote_filename: impl Into<String>,
        token: u32,
    ) -> Self {
        Self {
            direction,
            username: username.into(),
            remote_filename: remote_filename.into(),
            token,
            remote_token: None,
            size: -1,
            bytes_transferred: 0,
            state: TransferState::Requested,
        }
    }

    /// Advance the state machine; invalid transitions are ignored so a late
    /// failure cannot resurrect a finished transfer.
    pub fn advance(&mut self, next: TransferState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Record progress; byte counts never move backwards.
    pub fn record_progress(&mut self, total_bytes: u64) {
        if total_bytes > self.bytes_transferred {
            self.bytes_transferred = total_bytes;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.size >= 0 && self.bytes_transferred >= self.size as u64
    }
}

/// Observer invoked on every state change and progress update, with a
/// snapshot of the transfer. Failures in the observer never affect the
/// transfer itself.
pub type TransferObserver = Arc<dyn Fn(&Transfer) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_are_forward_only() {
        let mut t = Transfer::new(TransferDirection::Download, "u", "f", 1);
        assert!(t.advance(TransferState::Queued));
        assert!(t.advance(TransferState::Initializing));
        assert!(t.advance(TransferState::InProgress));
        assert!(!t.advance(TransferState::Queued));
        assert!(t.advance(TransferState::Succeeded));
        assert!(!t.advance(TransferState::Errored));
        assert_eq!(t.state, TransferState::Succeeded);
    }

    #[test]
    fn test_progress_is_monotone() {
        let mut t = Transfer::new(TransferDirection::Upload, "u", "f", 1);
        t.record_progress(100);
        t.record_progress(50);
        assert_eq!(t.bytes_transferred, 100);
    }

    #[test]
    fn test_any_state_can_fail() {
        let mut t = Transfer::new(TransferDirection::Download, "u", "f", 1);
        assert!(t.advance(TransferState::Errored));
        assert!(t.state.is_terminal());
    }
}
