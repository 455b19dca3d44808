//! HTTP client for the diagnosis backend.
//!
//! Analyze posts a multipart form (`image` file part plus an `assisted` text
//! field); chat posts `{"message": …}` as JSON. The response body is passed
//! through untouched.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use phyto_core::{OpKind, Outcome, Payload, TransportAdapter};
use reqwest::multipart::{Form, Part};
use tokio::time::Instant;
use tracing::debug;

/// How a response status is treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Transient,
    Permanent,
}

/// 2xx succeed; 408, 425, 429 and 5xx are worth retrying; everything else is final.
pub fn classify_status(code: u16) -> StatusClass {
    match code {
        200..=299 => StatusClass::Success,
        408 | 425 | 429 => StatusClass::Transient,
        500..=599 => StatusClass::Transient,
        _ => StatusClass::Permanent,
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    base: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = base_url.trim().trim_end_matches('/').to_string();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(anyhow!("backend url must start with http:// or https:// (got {})", base_url));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("phyto/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("building http client")?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &str { &self.base }

    pub fn endpoint(&self, kind: OpKind) -> String {
        match kind {
            OpKind::Analyze => format!("{}/api/analyze", self.base),
            OpKind::Chat => format!("{}/api/chat", self.base),
        }
    }

    fn request(&self, kind: OpKind, payload: &Payload) -> Result<reqwest::RequestBuilder, String> {
        let url = self.endpoint(kind);
        match (kind, payload) {
            (OpKind::Analyze, Payload::Image { bytes, assisted }) => {
                let part = Part::bytes(bytes.to_vec())
                    .file_name("plant.jpg")
                    .mime_str("image/jpeg")
                    .map_err(|e| e.to_string())?;
                let form = Form::new().part("image", part).text("assisted", assisted.to_string());
                Ok(self.client.post(url).multipart(form))
            }
            (OpKind::Chat, Payload::Message { text }) => {
                Ok(self.client.post(url).json(&serde_json::json!({ "message": text })))
            }
            (kind, _) => Err(format!("payload does not match operation kind {}", kind)),
        }
    }
}

fn classify_error(e: &reqwest::Error) -> Outcome {
    if e.is_builder() {
        Outcome::PermanentError(format!("request: {}", e))
    } else if e.is_timeout() {
        Outcome::TransientError(format!("timeout: {}", e))
    } else {
        // connect, request, body and decode failures are all network-side
        Outcome::TransientError(format!("network: {}", e))
    }
}

#[async_trait::async_trait]
impl TransportAdapter for HttpTransport {
    async fn send(&self, kind: OpKind, payload: &Payload, deadline: Instant) -> Outcome {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Outcome::TransientError("deadline elapsed before send".into());
        }
        let req = match self.request(kind, payload) {
            Ok(r) => r.timeout(remaining),
            Err(e) => return Outcome::PermanentError(e),
        };
        let t0 = Instant::now();
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                counter!("transport_http_errors_total", 1u64, "kind" => kind.as_str());
                return classify_error(&e);
            }
        };
        let status = resp.status();
        let body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => return classify_error(&e),
        };
        histogram!("transport_http_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.as_str());
        debug!(kind = %kind, status = status.as_u16(), bytes = body.len(), "transport: http response");
        match classify_status(status.as_u16()) {
            StatusClass::Success => Outcome::Value(body),
            StatusClass::Transient => Outcome::TransientError(format!("http {}", status.as_u16())),
            StatusClass::Permanent => {
                let detail = String::from_utf8_lossy(&body[..body.len().min(200)]).to_string();
                Outcome::PermanentError(format!("http {}: {}", status.as_u16(), detail.trim()))
            }
        }
    }

    fn name(&self) -> &'static str { "http" }
}
