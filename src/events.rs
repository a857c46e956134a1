//! Observable client events
//!
//! Each observable change is an immutable event value fanned out to every
//! registered sink. Dispatch is best-effort: a sink whose receiver has gone
//! away is dropped; sink failures never affect core state.

use crate::proto::peer::SearchResponse;
use crate::transfer::Transfer;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ServerConnected {
        address: SocketAddr,
    },
    LoggedIn {
        username: String,
        greeting: String,
    },
    /// The server terminated this session because the account logged in
    /// elsewhere.
    KickedFromServer,
    ServerDisconnected {
        reason: String,
    },
    PrivateMessage {
        id: u32,
        timestamp: u32,
        username: String,
        message: String,
        is_admin: bool,
        auto_acknowledged: bool,
    },
    SearchResponse {
        token: u32,
        response: SearchResponse,
    },
    ParentAdopted {
        username: String,
        branch_level: u32,
        branch_root: String,
    },
    ParentLost {
        username: String,
    },
    ChildAdded {
        username: String,
    },
    ChildRemoved {
        username: String,
    },
    PeerConnectionSuperseded {
        username: String,
    },
    TransferChanged(Transfer),
    PrivilegeNotification {
        token: u32,
        username: String,
        auto_acknowledged: bool,
    },
}

/// Fan-out registry of event sinks.
#[derive(Default)]
pub struct EventBus {
    sinks: Mutex<Vec<mpsc::UnboundedSender<ClientEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new sink and return its receiving end.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.lock().expect("event bus poisoned").push(tx);
        rx
    }

    /// Deliver `event` to every live sink, pruning dead ones.
    pub fn publish(&self, event: ClientEvent) {
        let mut sinks = self.sinks.lock().expect("event bus poisoned");
        sinks.retain(|sink| sink.send(event.clone()).is_ok());
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().expect("event bus poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_sinks() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(ClientEvent::KickedFromServer);
        assert!(matches!(a.recv().await, Some(ClientEvent::KickedFromServer)));
        assert!(matches!(b.recv().await, Some(ClientEvent::KickedFromServer)));
    }

    #[tokio::test]
    async fn test_dead_sinks_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(ClientEvent::KickedFromServer);
        assert_eq!(bus.sink_count(), 0);
    }
}
