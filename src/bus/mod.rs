//! Session event bus
//!
//! The `SessionEventBus` carries [`AgentEvent`]s from a running loop to any
//! number of observers (CLI renderer, web socket, webhook). Each session has
//! its own broadcast channel, created on first subscription and dropped with
//! [`SessionEventBus::close_session`]. A second instance-wide channel feeds
//! handlers registered with [`SessionEventBus::on`].
//!
//! ```text
//! ┌──────────┐  emit   ┌─────────────────┐  session "cli:1"  ┌──────────┐
//! │ LLMService│───────>│ SessionEventBus │──────────────────>│ web UI   │
//! └──────────┘         │                 │──────────────────>│ CLI      │
//!                      │                 │  all sessions     ┌──────────┐
//!                      │                 │──────────────────>│ on(kind) │
//!                      └─────────────────┘                   └──────────┘
//! ```
//!
//! Every receiver sees events in the order they were emitted. There is no
//! ordering guarantee between two different receivers.
//!
//! # Example
//!
//! ```
//! use conduit::bus::{AgentEvent, SessionEventBus};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = SessionEventBus::new();
//!     let mut rx = bus.subscribe("cli:1");
//!
//!     bus.emit(AgentEvent::Thinking { session_id: "cli:1".into(), iteration: 1 });
//!
//!     let event = rx.recv().await.unwrap();
//!     assert_eq!(event.session_id(), "cli:1");
//! }
//! ```

pub mod event;

pub use event::{AgentEvent, EventKind};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default capacity of each broadcast channel
const DEFAULT_CAPACITY: usize = 1024;

struct BusInner {
    sessions: RwLock<HashMap<String, broadcast::Sender<AgentEvent>>>,
    all: broadcast::Sender<AgentEvent>,
    capacity: usize,
}

/// Per-session event fan-out. Cheap to clone; clones share channels.
#[derive(Clone)]
pub struct SessionEventBus {
    inner: Arc<BusInner>,
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus whose channels buffer up to `capacity` events for a slow
    /// receiver before it starts lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                sessions: RwLock::new(HashMap::new()),
                all,
                capacity,
            }),
        }
    }

    /// Publish an event to its session channel and to `on` handlers.
    ///
    /// Events with nobody listening are dropped, and a session channel whose
    /// receivers are all gone is removed.
    pub fn emit(&self, event: AgentEvent) {
        let abandoned = {
            let sessions = self
                .inner
                .sessions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match sessions.get(event.session_id()) {
                Some(tx) => tx.send(event.clone()).is_err(),
                None => false,
            }
        };
        if abandoned {
            self.prune_session(event.session_id());
        }
        let _ = self.inner.all.send(event);
    }

    fn prune_session(&self, session_id: &str) {
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // A subscriber may have arrived between the two locks.
        if sessions
            .get(session_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            sessions.remove(session_id);
            debug!(session = %session_id, "Pruned session event channel without receivers");
        }
    }

    /// Number of sessions with an open event channel.
    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Receive every event of one session from now on.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<AgentEvent> {
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe()
    }

    /// Receive every event of every session from now on.
    pub fn subscribe_all(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.all.subscribe()
    }

    /// Call `handler` for each event of `kind`, across all sessions.
    ///
    /// The handler runs on its own task, so this must be called inside a
    /// tokio runtime. Dropping the returned [`Subscription`] stops delivery.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(AgentEvent) + Send + Sync + 'static,
    {
        Subscription::spawn(self.subscribe_all(), Some(kind), handler)
    }

    /// Call `handler` for every event of one session.
    pub fn on_session<F>(&self, session_id: &str, handler: F) -> Subscription
    where
        F: Fn(AgentEvent) + Send + Sync + 'static,
    {
        Subscription::spawn(self.subscribe(session_id), None, handler)
    }

    /// Number of live receivers on a session channel.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a session's channel. Its receivers see `Closed` once they have
    /// drained buffered events.
    pub fn close_session(&self, session_id: &str) {
        let removed = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if removed.is_some() {
            debug!(session = %session_id, "Closed session event channel");
        }
    }
}

/// Handle for a handler registered with [`SessionEventBus::on`].
///
/// Delivery stops on [`unsubscribe`](Subscription::unsubscribe) or drop.
pub struct Subscription {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    fn spawn<F>(
        mut rx: broadcast::Receiver<AgentEvent>,
        kind: Option<EventKind>,
        handler: F,
    ) -> Self
    where
        F: Fn(AgentEvent) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if kind.map_or(true, |k| k == event.kind()) {
                                handler(event);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Event handler lagged, events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop delivery and wait for the forwarding task to exit.
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
