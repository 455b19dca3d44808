//! Phyto transports – the network side of an operation.
//!
//! - [`HttpTransport`]: talks to the diagnosis backend (`/api/analyze`, `/api/chat`).
//! - [`SimulatedTransport`]: canned backend with fixed latency, for running without a server.
//! - [`ScriptedTransport`]: deterministic fake for tests.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use phyto_core::TransportAdapter;
use tracing::info;

mod http;
mod scripted;
mod simulated;

pub use http::{classify_status, HttpTransport, StatusClass};
pub use scripted::{ScriptedTransport, Step};
pub use simulated::{SimulatedTransport, CHAT_REPLIES};

/// Pick a transport from the environment: HTTP when `PHYTO_BACKEND_URL` is set
/// (or `backend_url` overrides it), the simulated backend otherwise.
pub fn from_env(backend_url: Option<&str>) -> Result<Arc<dyn TransportAdapter>> {
    let url = backend_url.map(|s| s.to_string()).or_else(|| std::env::var("PHYTO_BACKEND_URL").ok());
    match url.filter(|u| !u.trim().is_empty()) {
        Some(u) => {
            let t = HttpTransport::new(&u)?;
            info!(base = %t.base_url(), "transport: http");
            Ok(Arc::new(t))
        }
        None => {
            let t = SimulatedTransport::from_env();
            info!(analyze_ms = t.analyze_delay().as_millis() as u64, chat_ms = t.chat_delay().as_millis() as u64, "transport: simulated");
            Ok(Arc::new(t))
        }
    }
}
