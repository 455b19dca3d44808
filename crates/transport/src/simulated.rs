//! Canned backend: waits a fixed delay and returns a random plausible answer.

use std::time::Duration;

use phyto_core::{OpKind, Outcome, Payload, TransportAdapter};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;

pub const CHAT_REPLIES: [&str; 5] = [
    "Je comprends votre préoccupation. Pouvez-vous me donner plus de détails?",
    "Les symptômes que vous décrivez pourraient correspondre à plusieurs maladies. Une photo aiderait.",
    "Je recommande de vérifier l'humidité du sol et l'exposition à la lumière.",
    "Ce problème est souvent lié à un excès d'arrosage. Essayez de réduire la fréquence.",
    "Merci pour ces informations. Je vais consulter ma base de données pour des solutions.",
];

const DISEASES: [&str; 2] = ["Mildiou", "Rouille"];

pub struct SimulatedTransport {
    analyze_delay: Duration,
    chat_delay: Duration,
}

impl Default for SimulatedTransport {
    fn default() -> Self { Self::new(Duration::from_millis(2000), Duration::from_millis(1000)) }
}

impl SimulatedTransport {
    pub fn new(analyze_delay: Duration, chat_delay: Duration) -> Self { Self { analyze_delay, chat_delay } }

    /// Delays from `PHYTO_SIM_ANALYZE_MS` / `PHYTO_SIM_CHAT_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let ms = |k: &str| std::env::var(k).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis);
        Self::new(ms("PHYTO_SIM_ANALYZE_MS").unwrap_or(d.analyze_delay), ms("PHYTO_SIM_CHAT_MS").unwrap_or(d.chat_delay))
    }

    pub fn analyze_delay(&self) -> Duration { self.analyze_delay }
    pub fn chat_delay(&self) -> Duration { self.chat_delay }

    fn analysis_body(assisted: bool) -> serde_json::Value {
        let mut rng = rand::thread_rng();
        let diseased = rng.gen_bool(0.5);
        let confidence: u8 = rng.gen_range(70..100);
        let disease = if diseased { DISEASES.choose(&mut rng).copied() } else { None };
        serde_json::json!({
            "status": if diseased { "diseased" } else { "healthy" },
            "confidence": confidence,
            "disease": disease,
            "segmentedImageUri": if assisted { "sim://segmented/plant.jpg" } else { "sim://plant.jpg" },
        })
    }

    fn chat_body() -> serde_json::Value {
        let mut rng = rand::thread_rng();
        let reply = CHAT_REPLIES.choose(&mut rng).copied().unwrap_or(CHAT_REPLIES[0]);
        serde_json::json!({ "response": reply })
    }
}

#[async_trait::async_trait]
impl TransportAdapter for SimulatedTransport {
    async fn send(&self, kind: OpKind, payload: &Payload, _deadline: Instant) -> Outcome {
        let (delay, body) = match (kind, payload) {
            (OpKind::Analyze, Payload::Image { assisted, .. }) => (self.analyze_delay, Self::analysis_body(*assisted)),
            (OpKind::Chat, Payload::Message { .. }) => (self.chat_delay, Self::chat_body()),
            (kind, _) => return Outcome::PermanentError(format!("payload does not match operation kind {}", kind)),
        };
        tokio::time::sleep(delay).await;
        match serde_json::to_vec(&body) {
            Ok(v) => Outcome::Value(v.into()),
            Err(e) => Outcome::PermanentError(e.to_string()),
        }
    }

    fn name(&self) -> &'static str { "simulated" }
}
