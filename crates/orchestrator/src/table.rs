//! Operation table: live operations keyed by idempotency key plus a bounded
//! FIFO of completed results kept for late-duplicate suppression.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use phyto_core::{OpKey, OpKind, OpResult, OpState, OperationSnapshot};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) type ResultTx = watch::Sender<Option<Arc<OpResult>>>;

/// A Pending or InFlight operation. At most one per key.
pub(crate) struct LiveOp {
    pub op_id: Uuid,
    pub kind: OpKind,
    pub state: OpState,
    pub attempt: u32,
    pub submitted_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub tx: ResultTx,
    pub cancel: CancellationToken,
}

impl LiveOp {
    fn snapshot(&self, key: &OpKey) -> OperationSnapshot {
        OperationSnapshot {
            key: key.clone(),
            kind: self.kind,
            state: self.state,
            attempt: self.attempt,
            submitted_at: self.submitted_at,
            deadline: self.deadline_at,
            error: None,
        }
    }
}

struct Retained {
    op_id: Uuid,
    kind: OpKind,
    submitted_at: DateTime<Utc>,
    deadline_at: DateTime<Utc>,
    result: Arc<OpResult>,
    retained_at: Instant,
}

pub(crate) struct OperationTable {
    live: FxHashMap<OpKey, LiveOp>,
    done: FxHashMap<OpKey, Retained>,
    order: VecDeque<(OpKey, Uuid)>,
    cap: usize,
    retention: Duration,
    evicted: u64,
}

impl OperationTable {
    pub fn new(cap: usize, retention: Duration) -> Self {
        Self { live: FxHashMap::default(), done: FxHashMap::default(), order: VecDeque::new(), cap, retention, evicted: 0 }
    }

    pub fn live_len(&self) -> usize { self.live.len() }
    pub fn retained_len(&self) -> usize { self.done.len() }
    pub fn evicted(&self) -> u64 { self.evicted }

    pub fn live(&self, key: &OpKey) -> Option<&LiveOp> { self.live.get(key) }

    pub fn live_keys(&self) -> Vec<OpKey> { self.live.keys().cloned().collect() }

    /// Register a new operation. Callers check `live()` first; an existing entry is a bug upstream.
    pub fn insert_live(&mut self, key: OpKey, op: LiveOp) {
        debug_assert!(!self.live.contains_key(&key), "duplicate live operation for key");
        self.live.insert(key, op);
    }

    /// A retained successful result of the same kind that is still fresh. Failures
    /// are never reused so that a retry from the caller starts a new operation.
    pub fn fresh_success(&self, key: &OpKey, kind: OpKind, now: Instant) -> Option<Arc<OpResult>> {
        let r = self.done.get(key)?;
        if r.kind != kind || !r.result.is_ok() || now.saturating_duration_since(r.retained_at) >= self.retention {
            return None;
        }
        Some(Arc::clone(&r.result))
    }

    /// Move the operation into InFlight for the given attempt. Returns false when
    /// `op_id` no longer owns the key (cancelled or superseded).
    pub fn mark_in_flight(&mut self, key: &OpKey, op_id: Uuid, attempt: u32) -> bool {
        match self.live.get_mut(key) {
            Some(op) if op.op_id == op_id => {
                op.state = OpState::InFlight;
                op.attempt = attempt;
                true
            }
            _ => false,
        }
    }

    /// Resolve the live operation owned by `op_id` and retain its result.
    /// Returns the removed entry so the caller can notify waiters; `None` means
    /// the result is stale and must be discarded.
    pub fn complete(&mut self, key: &OpKey, op_id: Uuid, result: Arc<OpResult>, now: Instant) -> Option<LiveOp> {
        if self.live.get(key).map(|op| op.op_id) != Some(op_id) {
            return None;
        }
        let mut op = self.live.remove(key)?;
        op.state = result.state();
        self.done.insert(
            key.clone(),
            Retained {
                op_id,
                kind: op.kind,
                submitted_at: op.submitted_at,
                deadline_at: op.deadline_at,
                result,
                retained_at: now,
            },
        );
        self.order.push_back((key.clone(), op_id));
        self.prune(now);
        Some(op)
    }

    /// Drop retained results past the retention window or over capacity.
    pub fn prune(&mut self, now: Instant) {
        while let Some((key, op_id)) = self.order.front().cloned() {
            let current = self.done.get(&key).filter(|r| r.op_id == op_id);
            let Some(r) = current else {
                // superseded by a newer completion for the same key
                self.order.pop_front();
                continue;
            };
            let expired = now.saturating_duration_since(r.retained_at) >= self.retention;
            if !expired && self.done.len() <= self.cap {
                break;
            }
            self.order.pop_front();
            self.done.remove(&key);
            self.evicted += 1;
        }
    }

    pub fn snapshot(&self, key: &OpKey) -> Option<OperationSnapshot> {
        if let Some(op) = self.live.get(key) {
            return Some(op.snapshot(key));
        }
        self.done.get(key).map(|r| OperationSnapshot {
            key: key.clone(),
            kind: r.kind,
            state: r.result.state(),
            attempt: r.result.attempts,
            submitted_at: r.submitted_at,
            deadline: r.deadline_at,
            error: r.result.error_kind(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use phyto_core::OpError;

    fn live(op_id: Uuid) -> LiveOp {
        let (tx, _rx) = watch::channel(None);
        LiveOp {
            op_id,
            kind: OpKind::Analyze,
            state: OpState::Pending,
            attempt: 1,
            submitted_at: Utc::now(),
            deadline_at: Utc::now(),
            tx,
            cancel: CancellationToken::new(),
        }
    }

    fn result(key: &str, ok: bool) -> Arc<OpResult> {
        Arc::new(OpResult {
            key: OpKey::from(key),
            outcome: if ok { Ok(Bytes::from_static(b"{}")) } else { Err(OpError::Cancelled) },
            completed_at: Utc::now(),
            attempts: 1,
        })
    }

    #[test]
    fn stale_owner_cannot_complete() {
        let mut t = OperationTable::new(8, Duration::from_secs(60));
        let key = OpKey::from("img-1");
        let owner = Uuid::new_v4();
        t.insert_live(key.clone(), live(owner));
        let now = Instant::now();
        assert!(t.complete(&key, Uuid::new_v4(), result("img-1", true), now).is_none());
        assert_eq!(t.live_len(), 1);
        assert!(t.complete(&key, owner, result("img-1", true), now).is_some());
        assert_eq!(t.live_len(), 0);
        assert_eq!(t.snapshot(&key).map(|s| s.state), Some(OpState::Succeeded));
    }

    #[test]
    fn only_successes_are_reused() {
        let mut t = OperationTable::new(8, Duration::from_secs(60));
        let now = Instant::now();
        for (k, ok) in [("ok", true), ("bad", false)] {
            let id = Uuid::new_v4();
            t.insert_live(OpKey::from(k), live(id));
            t.complete(&OpKey::from(k), id, result(k, ok), now);
        }
        assert!(t.fresh_success(&OpKey::from("ok"), OpKind::Analyze, now).is_some());
        assert!(t.fresh_success(&OpKey::from("bad"), OpKind::Analyze, now).is_none());
        assert_eq!(t.snapshot(&OpKey::from("bad")).and_then(|s| s.error), Some(phyto_core::ErrorKind::Cancelled));
    }

    #[test]
    fn retained_success_is_not_served_to_another_kind() {
        let mut t = OperationTable::new(8, Duration::from_secs(60));
        let now = Instant::now();
        let key = OpKey::from("k");
        let id = Uuid::new_v4();
        t.insert_live(key.clone(), live(id));
        t.complete(&key, id, result("k", true), now);
        assert!(t.fresh_success(&key, OpKind::Analyze, now).is_some());
        assert!(t.fresh_success(&key, OpKind::Chat, now).is_none());
    }

    #[test]
    fn retention_is_bounded_by_capacity_and_age() {
        let mut t = OperationTable::new(2, Duration::from_secs(10));
        let now = Instant::now();
        for k in ["a", "b", "c"] {
            let id = Uuid::new_v4();
            t.insert_live(OpKey::from(k), live(id));
            t.complete(&OpKey::from(k), id, result(k, true), now);
        }
        assert_eq!(t.retained_len(), 2);
        assert_eq!(t.evicted(), 1);
        assert!(t.snapshot(&OpKey::from("a")).is_none());
        t.prune(now + Duration::from_secs(11));
        assert_eq!(t.retained_len(), 0);
    }

    #[test]
    fn recompletion_supersedes_older_order_entry() {
        let mut t = OperationTable::new(4, Duration::from_secs(10));
        let now = Instant::now();
        let key = OpKey::from("chat-1");
        for _ in 0..2 {
            let id = Uuid::new_v4();
            t.insert_live(key.clone(), live(id));
            t.complete(&key, id, result("chat-1", false), now);
        }
        assert_eq!(t.retained_len(), 1);
        t.prune(now);
        assert!(t.snapshot(&key).is_some());
    }
}
