//! Approval coordination for gated tool calls.
//!
//! A tool call that needs a human decision becomes an [`ApprovalRequest`].
//! The request is pushed to every transport subscribed for the session (CLI
//! prompt, web UI, webhook) and the first one to answer wins. Identical calls
//! issued while a request is pending (same tool, same canonical arguments)
//! attach to that request instead of creating a new one, so parallel calls
//! produce a single prompt and all resolve together.
//!
//! Every way a request can end goes through the same compare-and-set:
//! an explicit decision, the timeout, or session cancellation. Once a request
//! is terminal, further resolutions are no-ops.
//!
//! # Example
//!
//! ```
//! use conduit::config::ApprovalConfig;
//! use conduit::tools::approval::{ApprovalCoordinator, ApprovalDecision, ApprovalStatus};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let coordinator = ApprovalCoordinator::new(&ApprovalConfig::default());
//!     let mut ui = coordinator.subscribe("cli:1", "cli");
//!
//!     let waiter = coordinator.clone();
//!     let pending = tokio::spawn(async move {
//!         waiter
//!             .request_approval("cli:1", "delete_file", &json!({"path": "x"}), Some("delete_file"))
//!             .await
//!     });
//!
//!     let request = ui.recv().await.unwrap();
//!     assert!(coordinator.resolve(&request.id, ApprovalDecision::Approve, "cli"));
//!     assert!(!coordinator.resolve(&request.id, ApprovalDecision::Deny, "web"));
//!
//!     let outcome = pending.await.unwrap();
//!     assert_eq!(outcome.status, ApprovalStatus::Approved);
//! }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bus::{AgentEvent, SessionEventBus};
use crate::config::ApprovalConfig;

/// Resolution source for decisions taken from an "approve always" rule.
pub const SOURCE_POLICY: &str = "policy";
/// Resolution source for expired requests.
pub const SOURCE_TIMEOUT: &str = "timeout";
/// Resolution source for requests the runtime refused on its own.
pub const SOURCE_SYSTEM: &str = "system";
/// Resolution source for requests ended by session cancellation.
pub const SOURCE_CANCELLED: &str = "cancelled";

/// Resolved requests kept per session for lookups and late resolves.
const RESOLVED_RETAINED: usize = 64;

/// Lifecycle state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
    SystemDenied,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalStatus::Approved)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Denied => write!(f, "denied"),
            ApprovalStatus::Timeout => write!(f, "timeout"),
            ApprovalStatus::SystemDenied => write!(f, "system_denied"),
        }
    }
}

/// An answer to an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Allow this call.
    Approve,
    /// Allow this call and every later call with the same policy key.
    ApproveAlways,
    /// Refuse this call.
    Deny,
    /// Refuse on behalf of the runtime (shutdown, policy).
    SystemDeny,
}

impl ApprovalDecision {
    fn status(&self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approve | ApprovalDecision::ApproveAlways => ApprovalStatus::Approved,
            ApprovalDecision::Deny => ApprovalStatus::Denied,
            ApprovalDecision::SystemDeny => ApprovalStatus::SystemDenied,
        }
    }
}

/// A request for a human decision on one tool call signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    /// Arguments in canonical form (object keys sorted)
    pub arguments: Value,
    /// `tool:canonical-json`, unique among a session's pending requests
    pub signature: String,
    /// Key an "approve always" decision is remembered under, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_key: Option<String>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_source: Option<String>,
}

/// What a waiter gets back.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    /// Request that was resolved; `None` when no request had to be created
    pub request_id: Option<String>,
    pub status: ApprovalStatus,
    pub source: String,
}

impl ApprovalOutcome {
    fn immediate(status: ApprovalStatus, source: &str) -> Self {
        Self {
            request_id: None,
            status,
            source: source.to_string(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status.is_approved()
    }
}

/// Copy of `value` with every object's keys in sorted order.
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonical_json(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Deduplication signature of a call: tool name plus canonical arguments.
pub fn approval_signature(tool_name: &str, args: &Value) -> String {
    format!("{}:{}", tool_name, canonical_json(args))
}

struct Entry {
    request: ApprovalRequest,
    outcome: watch::Sender<Option<ApprovalOutcome>>,
}

struct Transport {
    id: u64,
    name: String,
    tx: mpsc::UnboundedSender<ApprovalRequest>,
}

#[derive(Default)]
struct SessionApprovals {
    requests: HashMap<String, Entry>,
    /// signature -> id of the pending request carrying it
    pending: HashMap<String, String>,
    /// ids of resolved requests still in `requests`, oldest first
    resolved: VecDeque<String>,
    auto_approve: HashSet<String>,
    transports: Vec<Transport>,
}

#[derive(Default)]
struct Table {
    sessions: HashMap<String, SessionApprovals>,
    /// request id -> session id
    index: HashMap<String, String>,
    next_transport: u64,
}

/// Side effects of settling requests under the table lock.
#[derive(Default)]
struct Settled {
    events: Vec<AgentEvent>,
    /// Request ids that fell out of the retained window
    evicted: Vec<String>,
}

impl Settled {
    fn unindex(&mut self, table: &mut Table) {
        for id in self.evicted.drain(..) {
            table.index.remove(&id);
        }
    }
}

/// Marks one pending request terminal. Returns `false` if it already was.
fn settle_entry(
    session: &mut SessionApprovals,
    request_id: &str,
    status: ApprovalStatus,
    source: &str,
    out: &mut Settled,
) -> bool {
    let Some(entry) = session.requests.get_mut(request_id) else {
        return false;
    };
    if entry.request.status.is_terminal() {
        return false;
    }

    entry.request.status = status;
    entry.request.resolved_at = Some(Utc::now());
    entry.request.resolution_source = Some(source.to_string());
    session.pending.remove(&entry.request.signature);
    entry.outcome.send_replace(Some(ApprovalOutcome {
        request_id: Some(request_id.to_string()),
        status,
        source: source.to_string(),
    }));

    info!(
        session = %entry.request.session_id,
        tool = %entry.request.tool_name,
        request_id = %request_id,
        status = %status,
        source = %source,
        "Approval resolved"
    );
    out.events.push(AgentEvent::ApprovalResolved {
        session_id: entry.request.session_id.clone(),
        request_id: request_id.to_string(),
        tool_name: entry.request.tool_name.clone(),
        status,
        source: source.to_string(),
    });

    // Waiters hold their own receivers, so dropping the entry is safe.
    session.resolved.push_back(request_id.to_string());
    while session.resolved.len() > RESOLVED_RETAINED {
        if let Some(old) = session.resolved.pop_front() {
            session.requests.remove(&old);
            out.evicted.push(old);
        }
    }
    true
}

/// Per-session approval table shared by the tool manager and transports.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ApprovalCoordinator {
    table: Arc<Mutex<Table>>,
    timeout: Duration,
    deny_without_subscribers: bool,
    bus: Option<SessionEventBus>,
}

impl ApprovalCoordinator {
    pub fn new(config: &ApprovalConfig) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            timeout: Duration::from_secs(config.timeout_secs),
            deny_without_subscribers: config.deny_without_subscribers,
            bus: None,
        }
    }

    /// Publish `approvalRequested` / `approvalResolved` on `bus`.
    pub fn with_bus(mut self, bus: SessionEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: Vec<AgentEvent>) {
        if let Some(bus) = &self.bus {
            for event in events {
                bus.emit(event);
            }
        }
    }

    /// Ask for approval of a call and wait for the decision.
    ///
    /// Returns immediately when an "approve always" rule covers `policy_key`,
    /// or with `system_denied` when nobody is subscribed for the session and
    /// `deny_without_subscribers` is set. Otherwise waits until a transport
    /// answers, the timeout fires or the session is cancelled.
    pub async fn request_approval(
        &self,
        session_id: &str,
        tool_name: &str,
        args: &Value,
        policy_key: Option<&str>,
    ) -> ApprovalOutcome {
        let arguments = canonical_json(args);
        let signature = format!("{}:{}", tool_name, arguments);

        let (request_id, mut rx) = {
            let mut guard = self.lock();
            let table = &mut *guard;
            let session = table.sessions.entry(session_id.to_string()).or_default();

            if let Some(key) = policy_key {
                if session.auto_approve.contains(key) {
                    debug!(session = %session_id, tool = %tool_name, key = %key, "Auto-approved by policy");
                    return ApprovalOutcome::immediate(ApprovalStatus::Approved, SOURCE_POLICY);
                }
            }

            let existing = session
                .pending
                .get(&signature)
                .and_then(|id| session.requests.get(id))
                .map(|entry| (entry.request.id.clone(), entry.outcome.subscribe()));

            match existing {
                Some((id, rx)) => {
                    debug!(session = %session_id, tool = %tool_name, request_id = %id, "Attached to pending approval");
                    (id, rx)
                }
                None => {
                    session.transports.retain(|t| !t.tx.is_closed());
                    if session.transports.is_empty() && self.deny_without_subscribers {
                        warn!(
                            session = %session_id,
                            tool = %tool_name,
                            "No approval transport subscribed, denying"
                        );
                        return ApprovalOutcome::immediate(
                            ApprovalStatus::SystemDenied,
                            SOURCE_SYSTEM,
                        );
                    }

                    let request = ApprovalRequest {
                        id: uuid::Uuid::new_v4().to_string(),
                        session_id: session_id.to_string(),
                        tool_name: tool_name.to_string(),
                        arguments,
                        signature: signature.clone(),
                        policy_key: policy_key.map(str::to_string),
                        status: ApprovalStatus::Pending,
                        created_at: Utc::now(),
                        resolved_at: None,
                        resolution_source: None,
                    };
                    // Published under the table lock, so no resolution of this
                    // request can be announced before it.
                    self.publish(vec![AgentEvent::ApprovalRequested {
                        session_id: session_id.to_string(),
                        request: request.clone(),
                    }]);
                    for transport in &session.transports {
                        debug!(transport = %transport.name, request_id = %request.id, "Delivering approval request");
                        let _ = transport.tx.send(request.clone());
                    }

                    let (outcome, rx) = watch::channel(None);
                    let id = request.id.clone();
                    session.pending.insert(signature, id.clone());
                    session.requests.insert(id.clone(), Entry { request, outcome });
                    table.index.insert(id.clone(), session_id.to_string());
                    info!(session = %session_id, tool = %tool_name, request_id = %id, "Approval requested");
                    (id, rx)
                }
            }
        };

        let waited = tokio::time::timeout(self.timeout, async {
            rx.wait_for(Option::is_some).await.map(|outcome| outcome.clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(_) => ApprovalOutcome {
                request_id: Some(request_id),
                status: ApprovalStatus::SystemDenied,
                source: SOURCE_SYSTEM.to_string(),
            },
            Err(_) => {
                self.settle(&request_id, ApprovalStatus::Timeout, SOURCE_TIMEOUT, false);
                // Another resolver may have won the race with the timer.
                let current = rx.borrow().clone();
                current.unwrap_or(ApprovalOutcome {
                    request_id: Some(request_id),
                    status: ApprovalStatus::Timeout,
                    source: SOURCE_TIMEOUT.to_string(),
                })
            }
        }
    }

    /// Resolve a pending request. Returns `true` only for the first
    /// resolution; unknown or already-resolved requests return `false`.
    pub fn resolve(&self, request_id: &str, decision: ApprovalDecision, source: &str) -> bool {
        self.settle(
            request_id,
            decision.status(),
            source,
            decision == ApprovalDecision::ApproveAlways,
        )
    }

    fn settle(&self, request_id: &str, status: ApprovalStatus, source: &str, remember: bool) -> bool {
        let mut out = Settled::default();
        let mut guard = self.lock();
        let table = &mut *guard;
        let Some(session_id) = table.index.get(request_id) else {
            debug!(request_id = %request_id, "Resolve for unknown approval request");
            return false;
        };
        let Some(session) = table.sessions.get_mut(session_id) else {
            return false;
        };
        let policy_key = session
            .requests
            .get(request_id)
            .and_then(|e| e.request.policy_key.clone());
        if !settle_entry(session, request_id, status, source, &mut out) {
            debug!(request_id = %request_id, "Approval already resolved, ignoring");
            return false;
        }

        if let Some(key) = policy_key.filter(|_| remember) {
            let covered: Vec<String> = session
                .requests
                .values()
                .filter(|e| {
                    e.request.status == ApprovalStatus::Pending
                        && e.request.policy_key.as_deref() == Some(key.as_str())
                })
                .map(|e| e.request.id.clone())
                .collect();
            for id in covered {
                settle_entry(session, &id, ApprovalStatus::Approved, SOURCE_POLICY, &mut out);
            }
            session.auto_approve.insert(key);
        }

        out.unindex(table);
        self.publish(out.events);
        true
    }

    /// Resolve every pending request of a session as `system_denied`.
    /// Returns how many were pending.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let mut out = Settled::default();
        let mut guard = self.lock();
        let table = &mut *guard;
        if let Some(session) = table.sessions.get_mut(session_id) {
            let pending: Vec<String> = session.pending.values().cloned().collect();
            for id in pending {
                settle_entry(
                    session,
                    &id,
                    ApprovalStatus::SystemDenied,
                    SOURCE_CANCELLED,
                    &mut out,
                );
            }
        }
        out.unindex(table);
        let count = out.events.len();
        if count > 0 {
            info!(session = %session_id, count, "Cancelled pending approvals");
        }
        self.publish(out.events);
        count
    }

    /// Cancel pending requests, forget "approve always" rules and drop the
    /// session's request history. Subscribed transports stay connected.
    pub fn reset_session(&self, session_id: &str) {
        self.cancel_session(session_id);
        let mut guard = self.lock();
        let table = &mut *guard;
        if let Some(session) = table.sessions.get_mut(session_id) {
            for id in session.requests.keys() {
                table.index.remove(id);
            }
            session.requests.clear();
            session.resolved.clear();
            session.pending.clear();
            session.auto_approve.clear();
        }
        debug!(session = %session_id, "Reset approval state");
    }

    /// Register a transport for a session's approval requests.
    ///
    /// Requests already pending are delivered right away.
    pub fn subscribe(&self, session_id: &str, transport: &str) -> ApprovalSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.lock();
        let table = &mut *guard;
        table.next_transport += 1;
        let id = table.next_transport;
        let session = table.sessions.entry(session_id.to_string()).or_default();
        for entry in session.requests.values() {
            if entry.request.status == ApprovalStatus::Pending {
                let _ = tx.send(entry.request.clone());
            }
        }
        session.transports.push(Transport {
            id,
            name: transport.to_string(),
            tx,
        });
        debug!(session = %session_id, transport = %transport, "Approval transport subscribed");

        ApprovalSubscription {
            id,
            session_id: session_id.to_string(),
            transport: transport.to_string(),
            rx,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Pending requests of a session, oldest first.
    pub fn pending(&self, session_id: &str) -> Vec<ApprovalRequest> {
        let guard = self.lock();
        let mut out: Vec<ApprovalRequest> = guard
            .sessions
            .get(session_id)
            .map(|s| {
                s.requests
                    .values()
                    .filter(|e| e.request.status == ApprovalStatus::Pending)
                    .map(|e| e.request.clone())
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Snapshot of a request by id, pending or resolved.
    pub fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        let guard = self.lock();
        let session_id = guard.index.get(request_id)?;
        guard
            .sessions
            .get(session_id)?
            .requests
            .get(request_id)
            .map(|e| e.request.clone())
    }

    /// Number of callers currently waiting on a request.
    pub fn waiters(&self, request_id: &str) -> usize {
        let guard = self.lock();
        guard
            .index
            .get(request_id)
            .and_then(|sid| guard.sessions.get(sid))
            .and_then(|s| s.requests.get(request_id))
            .map(|e| e.outcome.receiver_count())
            .unwrap_or(0)
    }

    pub fn is_auto_approved(&self, session_id: &str, policy_key: &str) -> bool {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.auto_approve.contains(policy_key))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.transports.iter().filter(|t| !t.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// A transport's feed of approval requests for one session.
///
/// Dropping it (or calling [`unsubscribe`](Self::unsubscribe)) removes the
/// transport; requests created afterwards are no longer delivered to it.
pub struct ApprovalSubscription {
    id: u64,
    session_id: String,
    transport: String,
    rx: mpsc::UnboundedReceiver<ApprovalRequest>,
    table: Weak<Mutex<Table>>,
}

impl ApprovalSubscription {
    /// Next request for this session, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<ApprovalRequest> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ApprovalRequest> {
        self.rx.try_recv().ok()
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn unsubscribe(self) {}
}

impl Drop for ApprovalSubscription {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut guard = table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = guard.sessions.get_mut(&self.session_id) {
            session.transports.retain(|t| t.id != self.id);
        }
        debug!(session = %self.session_id, transport = %self.transport, "Approval transport unsubscribed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use serde_json::json;

    fn coordinator() -> ApprovalCoordinator {
        ApprovalCoordinator::new(&ApprovalConfig::default())
    }

    async fn wait_for_waiters(c: &ApprovalCoordinator, id: &str, n: usize) {
        while c.waiters(id) < n {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_signature_ignores_key_order() {
        let a = approval_signature("t", &json!({"b": 1, "a": {"y": 2, "x": 1}}));
        let b = approval_signature("t", &json!({"a": {"x": 1, "y": 2}, "b": 1}));
        assert_eq!(a, b);
        assert_ne!(a, approval_signature("u", &json!({"b": 1, "a": {"y": 2, "x": 1}})));
    }

    #[tokio::test]
    async fn test_identical_calls_share_one_request() {
        let c = coordinator();
        let mut ui = c.subscribe("s", "cli");

        let spawn_call = |c: ApprovalCoordinator| {
            tokio::spawn(async move {
                c.request_approval("s", "delete_file", &json!({"path": "x"}), Some("delete_file"))
                    .await
            })
        };
        let first = spawn_call(c.clone());
        let request = ui.recv().await.unwrap();
        let second = spawn_call(c.clone());
        wait_for_waiters(&c, &request.id, 2).await;

        assert_eq!(c.pending("s").len(), 1);
        assert!(c.resolve(&request.id, ApprovalDecision::Approve, "cli"));

        let a = first.await.unwrap();
        let b = second.await.unwrap();
        assert_eq!(a, b);
        assert!(a.is_approved());
        assert!(ui.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_double_resolve_is_noop() {
        let c = coordinator();
        let mut ui = c.subscribe("s", "web");
        let waiter = c.clone();
        let task = tokio::spawn(async move {
            waiter.request_approval("s", "shell", &json!({"cmd": "ls"}), None).await
        });
        let request = ui.recv().await.unwrap();

        assert!(c.resolve(&request.id, ApprovalDecision::Deny, "web"));
        assert!(!c.resolve(&request.id, ApprovalDecision::Approve, "cli"));

        let outcome = task.await.unwrap();
        assert_eq!(outcome.status, ApprovalStatus::Denied);
        assert_eq!(outcome.source, "web");
        let stored = c.get(&request.id).unwrap();
        assert_eq!(stored.status, ApprovalStatus::Denied);
        assert_eq!(stored.resolution_source.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn test_no_subscribers_is_system_denied() {
        let c = coordinator();
        let outcome = c.request_approval("s", "shell", &json!({}), None).await;
        assert_eq!(outcome.status, ApprovalStatus::SystemDenied);
        assert!(outcome.request_id.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_unregisters() {
        let c = coordinator();
        let ui = c.subscribe("s", "cli");
        assert_eq!(c.subscriber_count("s"), 1);
        ui.unsubscribe();
        assert_eq!(c.subscriber_count("s"), 0);
        let outcome = c.request_approval("s", "shell", &json!({}), None).await;
        assert_eq!(outcome.status, ApprovalStatus::SystemDenied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_request() {
        let c = coordinator().with_timeout(Duration::from_secs(5));
        let mut ui = c.subscribe("s", "cli");
        let waiter = c.clone();
        let task =
            tokio::spawn(async move { waiter.request_approval("s", "shell", &json!({}), None).await });
        let request = ui.recv().await.unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.status, ApprovalStatus::Timeout);
        assert_eq!(outcome.source, SOURCE_TIMEOUT);
        assert!(!c.resolve(&request.id, ApprovalDecision::Approve, "cli"));
        assert!(c.pending("s").is_empty());
    }

    #[tokio::test]
    async fn test_approve_always_covers_later_calls_until_reset() {
        let c = coordinator();
        let mut ui = c.subscribe("s", "cli");
        let waiter = c.clone();
        let task = tokio::spawn(async move {
            waiter
                .request_approval("s", "write_file", &json!({"path": "a"}), Some("write_file"))
                .await
        });
        let request = ui.recv().await.unwrap();
        assert!(c.resolve(&request.id, ApprovalDecision::ApproveAlways, "cli"));
        assert!(task.await.unwrap().is_approved());
        assert!(c.is_auto_approved("s", "write_file"));

        let again = c
            .request_approval("s", "write_file", &json!({"path": "b"}), Some("write_file"))
            .await;
        assert_eq!(again.status, ApprovalStatus::Approved);
        assert_eq!(again.source, SOURCE_POLICY);

        c.reset_session("s");
        assert!(!c.is_auto_approved("s", "write_file"));
        assert!(c.get(&request.id).is_none());
    }

    #[tokio::test]
    async fn test_approve_always_resolves_other_pending_with_same_key() {
        let c = coordinator();
        let mut ui = c.subscribe("s", "cli");
        let call = |c: ApprovalCoordinator, path: &'static str| {
            tokio::spawn(async move {
                c.request_approval("s", "write_file", &json!({"path": path}), Some("write_file"))
                    .await
            })
        };
        let a = call(c.clone(), "a");
        let first = ui.recv().await.unwrap();
        let b = call(c.clone(), "b");
        let second = ui.recv().await.unwrap();
        assert_ne!(first.id, second.id);

        assert!(c.resolve(&first.id, ApprovalDecision::ApproveAlways, "cli"));
        assert!(a.await.unwrap().is_approved());
        let other = b.await.unwrap();
        assert!(other.is_approved());
        assert_eq!(other.source, SOURCE_POLICY);
    }

    #[tokio::test]
    async fn test_cancel_session_denies_pending() {
        let c = coordinator();
        let mut ui = c.subscribe("s", "cli");
        let waiter = c.clone();
        let task =
            tokio::spawn(async move { waiter.request_approval("s", "shell", &json!({}), None).await });
        let request = ui.recv().await.unwrap();

        assert_eq!(c.cancel_session("s"), 1);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.status, ApprovalStatus::SystemDenied);
        assert_eq!(outcome.source, SOURCE_CANCELLED);
        assert!(!c.resolve(&request.id, ApprovalDecision::Approve, "cli"));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_pending_requests() {
        let c = coordinator();
        let _first = c.subscribe("s", "cli");
        let waiter = c.clone();
        let task =
            tokio::spawn(async move { waiter.request_approval("s", "shell", &json!({}), None).await });
        while c.pending("s").is_empty() {
            tokio::task::yield_now().await;
        }

        let mut web = c.subscribe("s", "web");
        let request = web.recv().await.unwrap();
        assert!(c.resolve(&request.id, ApprovalDecision::Approve, web.transport()));
        assert_eq!(task.await.unwrap().source, "web");
    }

    fn retained(c: &ApprovalCoordinator, session: &str) -> (usize, usize) {
        let guard = c.lock();
        let requests = guard.sessions.get(session).map_or(0, |s| s.requests.len());
        (requests, guard.index.len())
    }

    #[tokio::test]
    async fn test_resolved_requests_are_bounded() {
        let c = coordinator();
        let mut ui = c.subscribe("s", "cli");
        let mut first_id = None;
        for n in 0..200 {
            let waiter = c.clone();
            let task = tokio::spawn(async move {
                waiter
                    .request_approval("s", "shell", &json!({"cmd": n}), None)
                    .await
            });
            let request = ui.recv().await.unwrap();
            first_id.get_or_insert_with(|| request.id.clone());
            assert!(c.resolve(&request.id, ApprovalDecision::Approve, "cli"));
            assert!(task.await.unwrap().is_approved());
        }

        assert!(c.pending("s").is_empty());
        assert_eq!(retained(&c, "s"), (RESOLVED_RETAINED, RESOLVED_RETAINED));
        let oldest = first_id.unwrap();
        assert!(c.get(&oldest).is_none());
        assert!(!c.resolve(&oldest, ApprovalDecision::Deny, "cli"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_requested_always_precedes_resolved() {
        let bus = SessionEventBus::new();
        let mut events = bus.subscribe("s");
        let c = coordinator().with_bus(bus);
        let mut ui = c.subscribe("s", "cli");

        // Transport answers as soon as a request arrives, on another worker.
        let answering = c.clone();
        let transport = tokio::spawn(async move {
            while let Some(request) = ui.recv().await {
                answering.resolve(&request.id, ApprovalDecision::Approve, "cli");
            }
        });

        for n in 0..50 {
            let outcome = c
                .request_approval("s", "shell", &json!({"cmd": n}), None)
                .await;
            assert!(outcome.is_approved());
            let first = events.recv().await.unwrap();
            let second = events.recv().await.unwrap();
            assert_eq!(first.kind(), EventKind::ApprovalRequested);
            assert_eq!(second.kind(), EventKind::ApprovalResolved);
        }
        transport.abort();
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let bus = SessionEventBus::new();
        let mut events = bus.subscribe("s");
        let c = coordinator().with_bus(bus);
        let mut ui = c.subscribe("s", "cli");
        let waiter = c.clone();
        let task =
            tokio::spawn(async move { waiter.request_approval("s", "shell", &json!({}), None).await });
        let request = ui.recv().await.unwrap();
        c.resolve(&request.id, ApprovalDecision::Approve, "cli");
        task.await.unwrap();

        assert_eq!(events.recv().await.unwrap().kind(), EventKind::ApprovalRequested);
        match events.recv().await.unwrap() {
            AgentEvent::ApprovalResolved { request_id, status, .. } => {
                assert_eq!(request_id, request.id);
                assert_eq!(status, ApprovalStatus::Approved);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
