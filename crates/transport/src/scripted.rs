//! Deterministic fake transport. Each call consumes the next scripted step;
//! once the script runs out the fallback outcome is returned.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use phyto_core::{OpKind, Outcome, Payload, TransportAdapter};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum Step {
    /// Answer immediately.
    Reply(Outcome),
    /// Answer after a delay.
    After(Duration, Outcome),
    /// Never answer; only a deadline or a cancel ends the attempt.
    Hang,
    /// Panic inside `send`, like a buggy adapter would.
    Panic(&'static str),
}

pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    fallback: Outcome,
    calls: AtomicU32,
}

impl Default for ScriptedTransport {
    fn default() -> Self { Self::new(Outcome::PermanentError("script exhausted".into())) }
}

impl ScriptedTransport {
    pub fn new(fallback: Outcome) -> Self {
        Self { steps: Mutex::new(VecDeque::new()), fallback, calls: AtomicU32::new(0) }
    }

    /// Append a step (builder style).
    pub fn then(self, step: Step) -> Self {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).push_back(step);
        self
    }

    /// `n` immediate transient failures.
    pub fn transient_times(mut self, n: usize, msg: &str) -> Self {
        for _ in 0..n {
            self = self.then(Step::Reply(Outcome::TransientError(msg.to_string())));
        }
        self
    }

    pub fn value(self, body: impl Into<bytes::Bytes>) -> Self { self.then(Step::Reply(Outcome::Value(body.into()))) }

    /// Number of `send` calls observed so far.
    pub fn calls(&self) -> u32 { self.calls.load(Ordering::SeqCst) }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Step::Reply(self.fallback.clone()))
    }
}

#[async_trait::async_trait]
impl TransportAdapter for ScriptedTransport {
    async fn send(&self, _kind: OpKind, _payload: &Payload, _deadline: Instant) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_step() {
            Step::Reply(o) => o,
            Step::After(d, o) => {
                tokio::time::sleep(d).await;
                o
            }
            Step::Hang => std::future::pending().await,
            Step::Panic(msg) => panic!("{}", msg),
        }
    }

    fn name(&self) -> &'static str { "scripted" }
}
