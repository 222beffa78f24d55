//! Request registry — maps a request id to the `PendingRequest` awaiting its
//! completion, and enforces per-request timeouts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// The outcome delivered to a command's sink exactly once.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Result(serde_json::Value),
    Error(String),
    Timeout,
    Stopped,
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandOutcome::Result(_))
    }
}

/// Completion sink as a sum type rather than a callback + opaque userdata
/// pair: the async facade uses a one-shot channel, the sync facade a
/// condition-variable-equivalent channel receive, and a pass-through caller
/// may register an arbitrary closure.
pub enum Sink {
    OneShot(oneshot::Sender<CommandOutcome>),
    Closure(Box<dyn FnOnce(CommandOutcome) + Send>),
}

impl Sink {
    pub fn complete(self, outcome: CommandOutcome) {
        match self {
            Sink::OneShot(tx) => {
                let _ = tx.send(outcome);
            }
            Sink::Closure(f) => f(outcome),
        }
    }
}

struct PendingRequest {
    submitted_at: Instant,
    timeout: Duration,
    sink: Sink,
}

/// Mapping request-id → `PendingRequest`, guarded by a single mutex.
///
/// Invariant: at most one pending record exists per id between dispatch and
/// completion; every exit path (response demux, timeout reap, cancel,
/// supervisor shutdown) removes the record before invoking its sink exactly
/// once.
pub struct RequestRegistry {
    next_id: AtomicU32,
    pending: Mutex<BTreeMap<u32, PendingRequest>>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            // Start at 1 — id 0 is reserved for the shutdown sentinel.
            next_id: AtomicU32::new(1),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Allocate the next envelope id. Never returns 0.
    pub fn next_id(&self) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    pub async fn add(&self, id: u32, timeout: Duration, sink: Sink) {
        self.pending.lock().await.insert(
            id,
            PendingRequest {
                submitted_at: Instant::now(),
                timeout,
                sink,
            },
        );
    }

    /// Remove a pending record without completing its sink. Used by
    /// `cancel`, where any late response must be silently dropped.
    pub async fn remove(&self, id: u32) -> bool {
        self.pending.lock().await.remove(&id).is_some()
    }

    /// Remove and complete the sink for `id`. Returns `false` if no record
    /// existed (e.g. a duplicate or late response for an id already
    /// completed by timeout or cancel) — the caller should drop such
    /// responses without side effects.
    pub async fn complete(&self, id: u32, outcome: CommandOutcome) -> bool {
        let entry = self.pending.lock().await.remove(&id);
        match entry {
            Some(p) => {
                p.sink.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Sweep once for records whose deadline has passed, completing each
    /// sink with `Timeout` outside the lock to avoid re-entrance.
    pub async fn reap_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(u32, Sink)> = {
            let mut guard = self.pending.lock().await;
            let expired_ids: Vec<u32> = guard
                .iter()
                .filter(|(_, p)| now.duration_since(p.submitted_at) >= p.timeout)
                .map(|(id, _)| *id)
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| guard.remove(&id).map(|p| (id, p.sink)))
                .collect()
        };
        for (id, sink) in expired {
            debug!(id, "request timed out");
            sink.complete(CommandOutcome::Timeout);
        }
    }

    /// Drain every pending record and complete each with `Stopped`. Called
    /// on transport-fatal conditions (child exit, pipe EOF) and on
    /// supervisor shutdown.
    pub async fn fail_all_stopped(&self) {
        let all: Vec<(u32, Sink)> = {
            let mut guard = self.pending.lock().await;
            std::mem::take(&mut *guard)
                .into_iter()
                .collect()
        };
        for (id, sink) in all {
            debug!(id, "request failed — browser stopped");
            sink.complete(CommandOutcome::Stopped);
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ids_are_never_zero_and_increase() {
        let reg = RequestRegistry::new();
        let a = reg.next_id();
        let b = reg.next_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert!(b > a);
    }

    #[tokio::test]
    async fn complete_invokes_sink_exactly_once() {
        let reg = RequestRegistry::new();
        let (tx, rx) = oneshot::channel();
        reg.add(1, Duration::from_secs(5), Sink::OneShot(tx)).await;
        assert!(reg.complete(1, CommandOutcome::Result(serde_json::json!("ok"))).await);
        // Second completion for the same id is a no-op (already removed).
        assert!(!reg.complete(1, CommandOutcome::Error("late".into())).await);
        let outcome = rx.await.unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn reap_expired_times_out_stale_requests() {
        let reg = RequestRegistry::new();
        let (tx, rx) = oneshot::channel();
        reg.add(1, Duration::from_millis(1), Sink::OneShot(tx)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        reg.reap_expired().await;
        assert_eq!(reg.len().await, 0);
        assert!(matches!(rx.await.unwrap(), CommandOutcome::Timeout));
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_dropped_without_side_effects() {
        let reg = RequestRegistry::new();
        let (tx, rx) = oneshot::channel();
        reg.add(1, Duration::from_millis(1), Sink::OneShot(tx)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        reg.reap_expired().await;
        // Child's late response for the same id now finds nothing to complete.
        assert!(!reg.complete(1, CommandOutcome::Result(serde_json::json!("late"))).await);
        assert!(matches!(rx.await.unwrap(), CommandOutcome::Timeout));
    }

    #[tokio::test]
    async fn fail_all_stopped_drains_every_pending_request() {
        let reg = RequestRegistry::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        reg.add(1, Duration::from_secs(5), Sink::OneShot(tx1)).await;
        reg.add(2, Duration::from_secs(5), Sink::OneShot(tx2)).await;
        reg.fail_all_stopped().await;
        assert_eq!(reg.len().await, 0);
        assert!(matches!(rx1.await.unwrap(), CommandOutcome::Stopped));
        assert!(matches!(rx2.await.unwrap(), CommandOutcome::Stopped));
    }
}
