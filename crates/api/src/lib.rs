//! Phyto diagnosis API façade (in-process).
//!
//! Frontends (CLI, mobile bridge) depend on the [`DiagnosisApi`] trait and the
//! typed results here. The in-process implementation keys requests by content
//! and runs them through the shared [`RequestOrchestrator`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use phyto_core::{ErrorKind, OpError, OpKey, OpKind, OpResult, OrchestratorConfig, Payload};
use phyto_orchestrator::RequestOrchestrator;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

pub use phyto_orchestrator::{OpHandle, TableStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Diseased,
}

/// Diagnosis returned by the analysis endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub status: HealthStatus,
    /// Percent, 0..=100.
    pub confidence: u8,
    #[serde(default)]
    pub disease: Option<String>,
    #[serde(default)]
    pub segmented_image_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("{0}")]
    Operation(#[from] OpError),
    #[error("decode: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ApiError::Operation(e) => Some(e.kind()),
            ApiError::Decode(_) => None,
        }
    }

    /// Whether offering the user a "retry" action makes sense.
    pub fn user_retryable(&self) -> bool {
        matches!(
            self.kind(),
            Some(ErrorKind::Transient | ErrorKind::Exhausted | ErrorKind::DeadlineExceeded | ErrorKind::Cancelled)
        )
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

fn decode<T: for<'de> Deserialize<'de>>(result: &OpResult) -> ApiResult<T> {
    let body = result.outcome.as_ref().map_err(|e| ApiError::Operation(e.clone()))?;
    serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))
}

impl AnalysisReport {
    pub fn from_result(result: &OpResult) -> ApiResult<Self> {
        let report: Self = decode(result)?;
        if report.confidence > 100 {
            return Err(ApiError::Decode(format!("confidence out of range: {}", report.confidence)));
        }
        Ok(report)
    }
}

impl ChatReply {
    pub fn from_result(result: &OpResult) -> ApiResult<Self> { decode(result) }
}

/// Content key for an image: identical bytes and flag map to the same operation.
pub fn image_key(image: &[u8], assisted: bool) -> OpKey {
    let digest = Sha256::digest(image);
    let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    if assisted { OpKey::new(format!("img-{}-a", hex)) } else { OpKey::new(format!("img-{}", hex)) }
}

/// Chat conversation: keys are `chat-{session}-{turn}`. Retrying a turn reuses
/// [`ChatSession::current`]; a new message takes [`ChatSession::next_turn`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub turn: u64,
}

impl Default for ChatSession {
    fn default() -> Self { Self::new() }
}

impl ChatSession {
    pub fn new() -> Self { Self { id: Uuid::new_v4(), turn: 0 } }

    pub fn resume(id: Uuid, turn: u64) -> Self { Self { id, turn } }

    pub fn current(&self) -> OpKey { OpKey::new(format!("chat-{}-{}", self.id, self.turn)) }

    pub fn next_turn(&mut self) -> OpKey {
        self.turn += 1;
        self.current()
    }
}

/// Diagnosis API surface.
#[async_trait::async_trait]
pub trait DiagnosisApi: Send + Sync {
    /// Analyze a leaf image; identical concurrent requests share one backend call.
    async fn analyze_plant_image(&self, image: Bytes, assisted: bool) -> ApiResult<AnalysisReport>;

    /// Send one chat turn under the given key (see [`ChatSession`]).
    async fn chat_with_assistant(&self, key: OpKey, message: &str) -> ApiResult<ChatReply>;

    /// Abort the request for `key`; waiters see `Cancelled`.
    fn cancel(&self, key: &OpKey) -> bool;

    fn config(&self) -> OrchestratorConfig;
}

// ----------------- Mock implementation -----------------

/// Fixed answers for frontend tests.
#[derive(Debug, Clone, Default)]
pub struct MockApi {
    pub report: Option<AnalysisReport>,
    pub reply: Option<ChatReply>,
    pub error: Option<ApiError>,
    pub config: OrchestratorConfig,
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    fn answer<T: Clone>(&self, v: &Option<T>, what: &str) -> ApiResult<T> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        v.clone().ok_or_else(|| ApiError::Operation(OpError::Permanent(format!("mock: no {} configured", what))))
    }
}

#[async_trait::async_trait]
impl DiagnosisApi for MockApi {
    async fn analyze_plant_image(&self, _image: Bytes, _assisted: bool) -> ApiResult<AnalysisReport> {
        self.answer(&self.report, "report")
    }

    async fn chat_with_assistant(&self, _key: OpKey, _message: &str) -> ApiResult<ChatReply> {
        self.answer(&self.reply, "reply")
    }

    fn cancel(&self, _key: &OpKey) -> bool { false }

    fn config(&self) -> OrchestratorConfig { self.config.clone() }
}

// ----------------- In-process implementation -----------------

/// In-process implementation over a shared orchestrator.
#[derive(Clone)]
pub struct InProcApi {
    orch: RequestOrchestrator,
    timeout: Option<Duration>,
}

impl InProcApi {
    pub fn new(orch: RequestOrchestrator) -> Self { Self { orch, timeout: None } }

    /// Orchestrator configured from `PHYTO_*`, transport chosen by `backend_url` / `PHYTO_BACKEND_URL`.
    pub fn from_env(backend_url: Option<&str>) -> anyhow::Result<Self> {
        let transport = phyto_transport::from_env(backend_url)?;
        Ok(Self::new(RequestOrchestrator::new(OrchestratorConfig::from_env(), transport)))
    }

    /// Per-request timeout; the orchestrator default applies otherwise.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn orchestrator(&self) -> &RequestOrchestrator { &self.orch }

    async fn run(&self, key: OpKey, kind: OpKind, payload: Payload) -> Arc<OpResult> {
        let t0 = Instant::now();
        info!(key = %key, kind = %kind, "api: {} start", kind);
        let result = self.orch.submit_and_wait(key, kind, payload, self.timeout).await;
        info!(key = %result.key, ok = result.is_ok(), attempts = result.attempts, took_ms = %t0.elapsed().as_millis(), "api: {} done", kind);
        result
    }
}

#[async_trait::async_trait]
impl DiagnosisApi for InProcApi {
    async fn analyze_plant_image(&self, image: Bytes, assisted: bool) -> ApiResult<AnalysisReport> {
        let key = image_key(&image, assisted);
        let result = self.run(key, OpKind::Analyze, Payload::Image { bytes: image, assisted }).await;
        AnalysisReport::from_result(&result)
    }

    async fn chat_with_assistant(&self, key: OpKey, message: &str) -> ApiResult<ChatReply> {
        let result = self.run(key, OpKind::Chat, Payload::message(message)).await;
        ChatReply::from_result(&result)
    }

    fn cancel(&self, key: &OpKey) -> bool { self.orch.cancel(key) }

    fn config(&self) -> OrchestratorConfig { self.orch.config().clone() }
}
