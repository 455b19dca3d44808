//! Phyto core types: operations, payloads, results and the transport contract.
//!
//! Everything the orchestrator, the transports and the typed API agree on lives
//! here. No I/O happens in this crate.

#![forbid(unsafe_code)]

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub mod config;

pub use config::OrchestratorConfig;

/// Caller-chosen idempotency key. Submissions sharing a key share one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpKey(String);

impl OpKey {
    pub fn new(key: impl Into<String>) -> Self { Self(key.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_blank(&self) -> bool { self.0.trim().is_empty() }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for OpKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for OpKey {
    fn from(s: String) -> Self { Self(s) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Analyze,
    Chat,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Analyze => "analyze",
            OpKind::Chat => "chat",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl OpState {
    pub fn is_terminal(&self) -> bool { matches!(self, OpState::Succeeded | OpState::Failed) }
}

/// Request body handed to the transport. Cloning is cheap (`Bytes` is refcounted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Leaf image to analyze; `assisted` asks the backend for guided segmentation.
    Image { bytes: Bytes, assisted: bool },
    /// One chat turn.
    Message { text: String },
}

impl Payload {
    pub fn image(bytes: impl Into<Bytes>, assisted: bool) -> Self {
        Payload::Image { bytes: bytes.into(), assisted }
    }

    pub fn message(text: impl Into<String>) -> Self { Payload::Message { text: text.into() } }

    pub fn len(&self) -> usize {
        match self {
            Payload::Image { bytes, .. } => bytes.len(),
            Payload::Message { text } => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Check the payload shape against the operation kind and the size limit.
    pub fn validate_for(&self, kind: OpKind, max_bytes: usize) -> Result<(), OpError> {
        match (kind, self) {
            (OpKind::Analyze, Payload::Image { bytes, .. }) => {
                if bytes.is_empty() {
                    return Err(OpError::InvalidInput("image payload is empty".into()));
                }
                if bytes.len() > max_bytes {
                    return Err(OpError::InvalidInput(format!(
                        "image payload is {} bytes (limit {})",
                        bytes.len(),
                        max_bytes
                    )));
                }
                Ok(())
            }
            (OpKind::Chat, Payload::Message { text }) => {
                if text.trim().is_empty() {
                    return Err(OpError::InvalidInput("chat message is blank".into()));
                }
                if text.len() > max_bytes {
                    return Err(OpError::InvalidInput(format!(
                        "chat message is {} bytes (limit {})",
                        text.len(),
                        max_bytes
                    )));
                }
                Ok(())
            }
            (kind, _) => Err(OpError::InvalidInput(format!("payload does not match operation kind {}", kind))),
        }
    }
}

/// Discriminant of [`OpError`], handy for matching and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Transient,
    Permanent,
    DeadlineExceeded,
    Exhausted,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Operation failures. Every failure reaches callers as a value of this type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum OpError {
    #[error("invalid_input: {0}")]
    InvalidInput(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
    #[error("deadline_exceeded after {attempts} attempt(s){}", suffix(.last))]
    DeadlineExceeded { attempts: u32, last: Option<String> },
    #[error("exhausted after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("cancelled")]
    Cancelled,
}

fn suffix(last: &Option<String>) -> String {
    last.as_deref().map(|l| format!(": {}", l)).unwrap_or_default()
}

impl OpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::InvalidInput(_) => ErrorKind::InvalidInput,
            OpError::Transient(_) => ErrorKind::Transient,
            OpError::Permanent(_) => ErrorKind::Permanent,
            OpError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            OpError::Exhausted { .. } => ErrorKind::Exhausted,
            OpError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool { matches!(self, OpError::Transient(_)) }
}

/// Terminal result of one operation, shared by every waiter on its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpResult {
    pub key: OpKey,
    pub outcome: Result<Bytes, OpError>,
    pub completed_at: DateTime<Utc>,
    /// Transport calls issued (0 when cancelled before the first one).
    pub attempts: u32,
}

impl OpResult {
    pub fn is_ok(&self) -> bool { self.outcome.is_ok() }

    pub fn error_kind(&self) -> Option<ErrorKind> { self.outcome.as_ref().err().map(|e| e.kind()) }

    pub fn state(&self) -> OpState {
        if self.outcome.is_ok() { OpState::Succeeded } else { OpState::Failed }
    }
}

/// Read-only view of an operation for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub key: OpKey,
    pub kind: OpKind,
    pub state: OpState,
    pub attempt: u32,
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub error: Option<ErrorKind>,
}

/// What a transport reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Value(Bytes),
    /// Retry-worthy: network error, 5xx-equivalent, timeout.
    TransientError(String),
    /// Retrying will not help: malformed input, 4xx-equivalent.
    PermanentError(String),
}

impl Outcome {
    pub fn into_result(self) -> Result<Bytes, OpError> {
        match self {
            Outcome::Value(b) => Ok(b),
            Outcome::TransientError(e) => Err(OpError::Transient(e)),
            Outcome::PermanentError(e) => Err(OpError::Permanent(e)),
        }
    }
}

/// The network call behind an operation, supplied by the host.
///
/// `kind` selects the remote target; the payload is passed through untouched.
/// Implementations should give up by `deadline`; the orchestrator also enforces it.
#[async_trait::async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn send(&self, kind: OpKind, payload: &Payload, deadline: Instant) -> Outcome;

    /// Short label for logs.
    fn name(&self) -> &'static str { "transport" }
}

pub mod prelude {
    pub use super::{
        ErrorKind, OpError, OpKey, OpKind, OpResult, OpState, OperationSnapshot, OrchestratorConfig, Outcome, Payload,
        TransportAdapter,
    };
}
