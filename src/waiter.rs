//! Keyed registry of pending waits
//!
//! Turns asynchronous protocol responses into request/response pairs: a
//! caller registers a wait under a key derived from the opcode it expects
//! (plus disambiguators such as a token or username), writes its request,
//! and awaits the future. The read loop completes the wait when the matching
//! frame arrives. Waits under the same key form a FIFO queue.

use crate::error::{Error, Result};
use crate::proto::{PeerCode, ServerCode};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How often the monitor sweeps queues for expired and cancelled waits.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// A composite wait key: a slot (usually an opcode) plus disambiguators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    slot: String,
    parts: Vec<String>,
}

impl WaitKey {
    pub fn named(slot: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            parts: Vec::new(),
        }
    }

    pub fn server(code: ServerCode) -> Self {
        Self::named(format!("server:{}", code as u32))
    }

    pub fn peer(code: PeerCode) -> Self {
        Self::named(format!("peer:{}", code as u32))
    }

    /// Append a disambiguator (token, username, connection id, ...).
    pub fn with(mut self, part: impl Display) -> Self {
        self.parts.push(part.to_string());
        self
    }
}

impl Display for WaitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slot)?;
        for part in &self.parts {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}

type Payload = std::result::Result<Box<dyn Any + Send>, Error>;

struct PendingWait {
    id: u64,
    tx: oneshot::Sender<Payload>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

/// Per-key queue. Enqueueing holds the gate for reading; removal of the
/// whole queue from the map holds it for writing and re-checks emptiness,
/// which closes the race where a concurrent enqueue lands in a queue that
/// is being garbage-collected.
struct WaitQueue {
    gate: RwLock<()>,
    waits: Mutex<VecDeque<PendingWait>>,
}

impl WaitQueue {
    fn new() -> Self {
        Self {
            gate: RwLock::new(()),
            waits: Mutex::new(VecDeque::new()),
        }
    }
}

struct WaiterInner {
    queues: Mutex<HashMap<WaitKey, Arc<WaitQueue>>>,
    default_timeout: Duration,
    next_id: AtomicU64,
}

/// The process-wide wait registry. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Waiter {
    inner: Arc<WaiterInner>,
}

impl Waiter {
    pub fn new(default_timeout: Duration) -> Self {
        let inner = Arc::new(WaiterInner {
            queues: Mutex::new(HashMap::new()),
            default_timeout,
            next_id: AtomicU64::new(0),
        });

        let monitor: Weak<WaiterInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = monitor.upgrade() else {
                    break;
                };
                Waiter::sweep(&inner);
            }
        });

        Self { inner }
    }

    /// Register a wait and return the future that completes it.
    ///
    /// Registration happens synchronously in this call, so the caller can
    /// register, then write the request, then await — a response racing the
    /// write cannot slip past an unregistered wait. The wait resolves when a
    /// matching [`Waiter::complete`] or [`Waiter::throw`] fires, the timeout
    /// elapses, or `cancel` trips; the latter two dequeue the wait themselves
    /// so a later completion for the key goes to the next registrant (or is
    /// dropped).
    pub fn wait<T: Any + Send>(
        &self,
        key: WaitKey,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> BoxFuture<'static, Result<T>> {
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let deadline = Instant::now().checked_add(timeout);
        let cancel = cancel.unwrap_or_default();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let queue = self.queue(&key);
            let _gate = queue.gate.read().expect("waiter gate poisoned");
            queue
                .waits
                .lock()
                .expect("waiter queue poisoned")
                .push_back(PendingWait {
                    id,
                    tx,
                    deadline,
                    cancel: cancel.clone(),
                });
        }

        let waiter = self.clone();
        async move {
            let sleep_target = deadline.unwrap_or_else(|| {
                // unused; the timeout arm is disabled when there is no deadline
                Instant::now() + Duration::from_secs(86_400 * 365)
            });

            tokio::select! {
                outcome = rx => match outcome {
                    Ok(Ok(boxed)) => boxed.downcast::<T>().map(|b| *b).map_err(|_| {
                        Error::InvalidState(format!(
                            "wait {key} completed with unexpected payload type"
                        ))
                    }),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(Error::Cancelled),
                },
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    waiter.remove(&key, id);
                    Err(Error::Timeout(timeout))
                }
                _ = cancel.cancelled() => {
                    waiter.remove(&key, id);
                    Err(Error::Cancelled)
                }
            }
        }
        .boxed()
    }

    /// [`Waiter::wait`] without a deadline; it resolves only on completion
    /// or cancellation.
    pub fn wait_indefinitely<T: Any + Send>(
        &self,
        key: WaitKey,
        cancel: Option<CancellationToken>,
    ) -> BoxFuture<'static, Result<T>> {
        self.wait(key, Some(Duration::MAX), cancel)
    }

    /// Fulfil the oldest wait registered under `key`. Returns whether a
    /// wait existed; a completion with no wait is dropped silently, since
    /// responses routinely arrive for requests the caller abandoned.
    pub fn complete<T: Any + Send>(&self, key: &WaitKey, value: T) -> bool {
        self.fulfil(key, Ok(Box::new(value)))
    }

    /// Fail the oldest wait registered under `key`.
    pub fn throw(&self, key: &WaitKey, error: Error) -> bool {
        self.fulfil(key, Err(error))
    }

    fn fulfil(&self, key: &WaitKey, payload: Payload) -> bool {
        let queue = {
            let queues = self.inner.queues.lock().expect("waiter map poisoned");
            match queues.get(key) {
                Some(queue) => Arc::clone(queue),
                None => return false,
            }
        };
        let _gate = queue.gate.read().expect("waiter gate poisoned");
        let head = queue
            .waits
            .lock()
            .expect("waiter queue poisoned")
            .pop_front();
        match head {
            Some(wait) => {
                // a dead receiver means the wait was cancelled moments ago;
                // the payload is dropped, matching abandoned-request semantics
                let _ = wait.tx.send(payload);
                true
            }
            None => false,
        }
    }

    /// Fail every pending wait with `Cancelled`. Used at disposal.
    pub fn cancel_all(&self) {
        let queues: Vec<Arc<WaitQueue>> = {
            let map = self.inner.queues.lock().expect("waiter map poisoned");
            map.values().map(Arc::clone).collect()
        };
        for queue in queues {
            let drained: Vec<PendingWait> = {
                let _gate = queue.gate.read().expect("waiter gate poisoned");
                queue
                    .waits
                    .lock()
                    .expect("waiter queue poisoned")
                    .drain(..)
                    .collect()
            };
            for wait in drained {
                let _ = wait.tx.send(Err(Error::Cancelled));
            }
        }
    }

    /// Number of pending waits across all keys.
    pub fn pending(&self) -> usize {
        let map = self.inner.queues.lock().expect("waiter map poisoned");
        map.values()
            .map(|q| q.waits.lock().expect("waiter queue poisoned").len())
            .sum()
    }

    fn queue(&self, key: &WaitKey) -> Arc<WaitQueue> {
        let mut map = self.inner.queues.lock().expect("waiter map poisoned");
        Arc::clone(
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(WaitQueue::new())),
        )
    }

    fn remove(&self, key: &WaitKey, id: u64) {
        let queue = {
            let map = self.inner.queues.lock().expect("waiter map poisoned");
            match map.get(key) {
                Some(queue) => Arc::clone(queue),
                None => return,
            }
        };
        let _gate = queue.gate.read().expect("waiter gate poisoned");
        queue
            .waits
            .lock()
            .expect("waiter queue poisoned")
            .retain(|w| w.id != id);
    }

    /// One monitor pass: expire deadlines, reap cancellations, collect
    /// empty queues.
    fn sweep(inner: &Arc<WaiterInner>) {
        let snapshot: Vec<(WaitKey, Arc<WaitQueue>)> = {
            let map = inner.queues.lock().expect("waiter map poisoned");
            map.iter()
                .map(|(k, q)| (k.clone(), Arc::clone(q)))
                .collect()
        };

        let now = Instant::now();
        for (key, queue) in snapshot {
            loop {
                let expired = {
                    let _gate = queue.gate.read().expect("waiter gate poisoned");
                    let mut waits = queue.waits.lock().expect("waiter queue poisoned");
                    match waits.front() {
                        Some(head) if head.cancel.is_cancelled() => {
                            waits.pop_front().map(|w| (w, true))
                        }
                        Some(head) if head.deadline.is_some_and(|d| d <= now) => {
                            waits.pop_front().map(|w| (w, false))
                        }
                        _ => None,
                    }
                };
                match expired {
                    Some((wait, cancelled)) => {
                        let error = if cancelled {
                            Error::Cancelled
                        } else {
                            Error::Timeout(Duration::ZERO)
                        };
                        let _ = wait.tx.send(Err(error));
                    }
                    None => break,
                }
            }

            // garbage-collect: upgrade to the write gate and re-check, so an
            // enqueue racing this pass cannot land in a removed queue
            let empty = queue
                .waits
                .lock()
                .expect("waiter queue poisoned")
                .is_empty();
            if empty {
                let _write = queue.gate.write().expect("waiter gate poisoned");
                if queue
                    .waits
                    .lock()
                    .expect("waiter queue poisoned")
                    .is_empty()
                {
                    let mut map = inner.queues.lock().expect("waiter map poisoned");
                    if let Some(current) = map.get(&key) {
                        if Arc::ptr_eq(current, &queue) {
                            map.remove(&key);
                        }
                    }
                }
            }
        }
    }
}
