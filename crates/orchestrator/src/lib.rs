//! Phyto request orchestrator: per-key deduplication, deadlines, retries with
//! exponential backoff and cooperative cancellation for outbound operations.
//!
//! One instance is shared across the application (`Clone` is cheap). Each
//! distinct key runs in its own task; waiters on the same key share one
//! `Arc<OpResult>`.

#![forbid(unsafe_code)]

use std::future::IntoFuture;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use phyto_core::{OpError, OpKey, OpKind, OpResult, OpState, OperationSnapshot, OrchestratorConfig, Payload, TransportAdapter};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod table;

use table::{LiveOp, OperationTable};

/// Submissions asking for more than this are clamped.
const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Reference to a submitted operation. Await it (or call [`OpHandle::wait`]) for the result.
#[derive(Debug, Clone)]
pub struct OpHandle {
    key: OpKey,
    op_id: Uuid,
    rx: watch::Receiver<Option<Arc<OpResult>>>,
}

impl OpHandle {
    fn resolved(key: OpKey, result: Arc<OpResult>) -> Self {
        let (_tx, rx) = watch::channel(Some(result));
        Self { key, op_id: Uuid::nil(), rx }
    }

    pub fn key(&self) -> &OpKey { &self.key }

    /// Identifier of the underlying operation; nil for handles served from the result cache.
    pub fn op_id(&self) -> Uuid { self.op_id }

    /// The result if the operation already resolved.
    pub fn try_result(&self) -> Option<Arc<OpResult>> { self.rx.borrow().clone() }

    /// Suspend until the operation reaches a terminal state.
    pub async fn wait(mut self) -> Arc<OpResult> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(r) = current {
                return r;
            }
            if self.rx.changed().await.is_err() {
                break;
            }
        }
        // Sender gone without publishing: the orchestrator was torn down.
        let last = self.rx.borrow().clone();
        last.unwrap_or_else(|| {
            Arc::new(OpResult { key: self.key.clone(), outcome: Err(OpError::Cancelled), completed_at: Utc::now(), attempts: 0 })
        })
    }
}

impl IntoFuture for OpHandle {
    type Output = Arc<OpResult>;
    type IntoFuture = BoxFuture<'static, Arc<OpResult>>;

    fn into_future(self) -> Self::IntoFuture { Box::pin(self.wait()) }
}

/// Counters exposed for status displays and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStats {
    pub live: usize,
    pub retained: usize,
    pub evicted: u64,
}

struct Inner {
    cfg: OrchestratorConfig,
    transport: Arc<dyn TransportAdapter>,
    table: Mutex<OperationTable>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, OperationTable> {
        // A panic while holding the lock leaves the table consistent (all mutations are single-step).
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_in_flight(&self, key: &OpKey, op_id: Uuid, attempt: u32) -> bool {
        self.lock().mark_in_flight(key, op_id, attempt)
    }

    /// Transport calls made so far by the operation `op_id` (0 while Pending or when superseded).
    fn attempts_made(&self, key: &OpKey, op_id: Uuid) -> u32 {
        self.lock()
            .live(key)
            .filter(|op| op.op_id == op_id && op.state == OpState::InFlight)
            .map(|op| op.attempt)
            .unwrap_or(0)
    }

    fn finish(&self, key: &OpKey, op_id: Uuid, kind: OpKind, result: Arc<OpResult>, started: Instant) {
        let mut table = self.lock();
        match table.complete(key, op_id, Arc::clone(&result), Instant::now()) {
            Some(op) => {
                let _ = op.tx.send_replace(Some(Arc::clone(&result)));
                gauge!("orchestrator_in_flight", table.live_len() as f64);
                drop(table);
                let took_ms = started.elapsed().as_millis() as u64;
                histogram!("orchestrator_op_ms", took_ms as f64, "kind" => kind.as_str());
                match &result.outcome {
                    Ok(v) => {
                        counter!("orchestrator_succeeded_total", 1u64, "kind" => kind.as_str());
                        info!(key = %key, kind = %kind, attempts = result.attempts, bytes = v.len(), took_ms, "orchestrator: op succeeded");
                    }
                    Err(e) => {
                        counter!("orchestrator_failed_total", 1u64, "kind" => kind.as_str(), "error" => e.kind().as_str());
                        warn!(key = %key, kind = %kind, attempts = result.attempts, error = %e, took_ms, "orchestrator: op failed");
                    }
                }
            }
            None => {
                counter!("orchestrator_late_discard_total", 1u64);
                debug!(key = %key, op_id = %op_id, "orchestrator: late result discarded");
            }
        }
    }
}

/// Shared request orchestrator.
#[derive(Clone)]
pub struct RequestOrchestrator {
    inner: Arc<Inner>,
}

impl RequestOrchestrator {
    pub fn new(cfg: OrchestratorConfig, transport: Arc<dyn TransportAdapter>) -> Self {
        let cfg = cfg.normalized();
        let table = OperationTable::new(cfg.retention_cap, cfg.retention);
        info!(
            transport = transport.name(),
            max_attempts = cfg.max_attempts,
            base_delay_ms = cfg.base_delay.as_millis() as u64,
            max_delay_ms = cfg.max_delay.as_millis() as u64,
            "orchestrator: ready"
        );
        Self { inner: Arc::new(Inner { cfg, transport, table: Mutex::new(table) }) }
    }

    pub fn config(&self) -> &OrchestratorConfig { &self.inner.cfg }

    /// Register an operation, or attach to the in-flight one with the same key.
    ///
    /// `timeout = None` uses the configured default. Invalid input fails here
    /// without touching the table. Must be called from within a Tokio runtime.
    pub fn submit(
        &self,
        key: impl Into<OpKey>,
        kind: OpKind,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<OpHandle, OpError> {
        let key = key.into();
        if key.is_blank() {
            return Err(OpError::InvalidInput("idempotency key is blank".into()));
        }
        let timeout = timeout.unwrap_or(self.inner.cfg.default_timeout);
        if timeout.is_zero() {
            return Err(OpError::InvalidInput("timeout must be positive".into()));
        }
        let timeout = timeout.min(MAX_TIMEOUT);
        payload.validate_for(kind, self.inner.cfg.max_payload_bytes)?;
        counter!("orchestrator_submit_total", 1u64, "kind" => kind.as_str());

        let started = Instant::now();
        let mut table = self.inner.lock();
        table.prune(started);
        if let Some(op) = table.live(&key) {
            if op.kind != kind {
                return Err(OpError::InvalidInput(format!("key {} is in flight as {}", key, op.kind)));
            }
            counter!("orchestrator_dedup_total", 1u64, "kind" => kind.as_str());
            debug!(key = %key, op_id = %op.op_id, state = ?op.state, "orchestrator: attached to in-flight op");
            return Ok(OpHandle { key, op_id: op.op_id, rx: op.tx.subscribe() });
        }
        if let Some(result) = table.fresh_success(&key, kind, started) {
            counter!("orchestrator_cache_hit_total", 1u64, "kind" => kind.as_str());
            debug!(key = %key, "orchestrator: served retained result");
            return Ok(OpHandle::resolved(key, result));
        }

        let op_id = Uuid::new_v4();
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let submitted_at = Utc::now();
        let deadline_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| submitted_at.checked_add_signed(d))
            .unwrap_or(submitted_at);
        table.insert_live(
            key.clone(),
            LiveOp { op_id, kind, state: OpState::Pending, attempt: 1, submitted_at, deadline_at, tx, cancel: cancel.clone() },
        );
        gauge!("orchestrator_in_flight", table.live_len() as f64);
        drop(table);

        info!(key = %key, kind = %kind, op_id = %op_id, timeout_ms = timeout.as_millis() as u64, "orchestrator: submit");
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(key = %task_key, op_id = %op_id, "orchestrator: dispatch aborted by cancel");
                    return;
                }
                r = AssertUnwindSafe(run_attempts(&inner, &task_key, op_id, kind, &payload, started, timeout)).catch_unwind() => match r {
                    Ok(r) => r,
                    Err(_) => {
                        // The waiters still get a result; the key is released for a fresh submit.
                        warn!(key = %task_key, op_id = %op_id, "orchestrator: transport panicked");
                        let attempts = inner.attempts_made(&task_key, op_id);
                        (Err(OpError::Permanent("transport panicked".into())), attempts)
                    }
                },
            };
            let (outcome, attempts) = outcome;
            let result = Arc::new(OpResult { key: task_key.clone(), outcome, completed_at: Utc::now(), attempts });
            inner.finish(&task_key, op_id, kind, result, started);
        });
        Ok(OpHandle { key, op_id, rx })
    }

    /// Submit and wait in one call.
    pub async fn submit_and_wait(
        &self,
        key: impl Into<OpKey>,
        kind: OpKind,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Arc<OpResult> {
        let key = key.into();
        match self.submit(key.clone(), kind, payload, timeout) {
            Ok(h) => h.await,
            Err(e) => Arc::new(OpResult { key, outcome: Err(e), completed_at: Utc::now(), attempts: 0 }),
        }
    }

    /// Fail a Pending/InFlight operation with `Cancelled` and wake its waiters.
    /// Returns false when nothing was in flight for the key.
    pub fn cancel(&self, key: &OpKey) -> bool {
        let mut table = self.inner.lock();
        let Some((op_id, attempts)) = table.live(key).map(|op| {
            let attempts = if op.state == OpState::InFlight { op.attempt } else { 0 };
            (op.op_id, attempts)
        }) else {
            return false;
        };
        let result = Arc::new(OpResult { key: key.clone(), outcome: Err(OpError::Cancelled), completed_at: Utc::now(), attempts });
        let Some(op) = table.complete(key, op_id, Arc::clone(&result), Instant::now()) else {
            return false;
        };
        op.cancel.cancel();
        let _ = op.tx.send_replace(Some(result));
        gauge!("orchestrator_in_flight", table.live_len() as f64);
        counter!("orchestrator_cancelled_total", 1u64, "kind" => op.kind.as_str());
        info!(key = %key, op_id = %op_id, attempts, "orchestrator: cancelled");
        true
    }

    /// Cancel everything in flight (shutdown path). Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let keys = self.inner.lock().live_keys();
        keys.iter().filter(|k| self.cancel(k)).count()
    }

    /// Live state, or the retained terminal state, of the operation for `key`.
    pub fn status(&self, key: &OpKey) -> Option<OperationSnapshot> {
        let mut table = self.inner.lock();
        table.prune(Instant::now());
        table.snapshot(key)
    }

    pub fn stats(&self) -> TableStats {
        let table = self.inner.lock();
        TableStats { live: table.live_len(), retained: table.retained_len(), evicted: table.evicted() }
    }
}

/// Attempt loop for one operation. Returns the outcome and the number of transport calls made.
async fn run_attempts(
    inner: &Inner,
    key: &OpKey,
    op_id: Uuid,
    kind: OpKind,
    payload: &Payload,
    started: Instant,
    timeout: Duration,
) -> (Result<Bytes, OpError>, u32) {
    let cfg = &inner.cfg;
    let deadline = started + timeout;
    let budget = cfg.attempt_budget(timeout);
    let mut attempt = 1u32;
    loop {
        if !inner.mark_in_flight(key, op_id, attempt) {
            return (Err(OpError::Cancelled), attempt - 1);
        }
        let now = Instant::now();
        if now >= deadline {
            return (Err(OpError::DeadlineExceeded { attempts: attempt - 1, last: None }), attempt - 1);
        }
        let attempt_deadline = (now + budget).min(deadline);
        debug!(key = %key, attempt, budget_ms = attempt_deadline.duration_since(now).as_millis() as u64, "orchestrator: dispatch");
        let res = match tokio::time::timeout_at(attempt_deadline, inner.transport.send(kind, payload, attempt_deadline)).await {
            Ok(outcome) => outcome.into_result(),
            Err(_) => Err(OpError::Transient(format!(
                "attempt {} timed out after {}ms",
                attempt,
                attempt_deadline.duration_since(now).as_millis()
            ))),
        };
        histogram!("orchestrator_attempt_ms", now.elapsed().as_secs_f64() * 1000.0, "kind" => kind.as_str());

        let err = match res {
            Ok(v) => return (Ok(v), attempt),
            Err(e) if !e.is_retryable() => return (Err(e), attempt),
            Err(e) => e,
        };
        let now = Instant::now();
        if now >= deadline {
            return (Err(OpError::DeadlineExceeded { attempts: attempt, last: Some(err.to_string()) }), attempt);
        }
        if attempt >= cfg.max_attempts {
            return (Err(OpError::Exhausted { attempts: attempt, last: err.to_string() }), attempt);
        }
        let delay = cfg.backoff_delay(attempt);
        if now + delay >= deadline {
            return (Err(OpError::DeadlineExceeded { attempts: attempt, last: Some(err.to_string()) }), attempt);
        }
        counter!("orchestrator_retry_total", 1u64, "kind" => kind.as_str());
        warn!(key = %key, attempt, delay_ms = delay.as_millis() as u64, error = %err, "orchestrator: transient failure, backing off");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
