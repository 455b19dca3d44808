#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use phyto_api::{image_key, ApiError, ChatSession, DiagnosisApi, HealthStatus, InProcApi};
use phyto_core::{ErrorKind, OpKind, OrchestratorConfig, Outcome};
use phyto_orchestrator::RequestOrchestrator;
use phyto_transport::{ScriptedTransport, SimulatedTransport, Step, CHAT_REPLIES};

fn api_with(t: &Arc<ScriptedTransport>) -> InProcApi {
    InProcApi::new(RequestOrchestrator::new(OrchestratorConfig::default(), t.clone()))
}

#[tokio::test(start_paused = true)]
async fn identical_images_share_one_analysis() {
    let t = Arc::new(ScriptedTransport::default().then(Step::After(
        Duration::from_millis(2000),
        Outcome::Value(r#"{"status":"diseased","confidence":82,"disease":"Mildiou"}"#.into()),
    )));
    let api = api_with(&t);
    let img = Bytes::from_static(b"\xFF\xD8\xFF\xE0leaf");

    let (a, b) = tokio::join!(api.analyze_plant_image(img.clone(), false), api.analyze_plant_image(img.clone(), false));
    let a = a.unwrap();
    assert_eq!(a, b.unwrap());
    assert_eq!(a.status, HealthStatus::Diseased);
    assert_eq!(a.disease.as_deref(), Some("Mildiou"));
    assert_eq!(t.calls(), 1);

    let status = api.orchestrator().status(&image_key(&img, false)).unwrap();
    assert_eq!(status.kind, OpKind::Analyze);
}

#[tokio::test(start_paused = true)]
async fn malformed_backend_body_is_a_decode_error() {
    let t = Arc::new(ScriptedTransport::default().value("<html>oops</html>"));
    let api = api_with(&t);
    let err = api.analyze_plant_image(Bytes::from_static(b"img"), true).await.unwrap_err();
    assert!(matches!(err, ApiError::Decode(_)));
    assert!(!err.user_retryable());
}

#[tokio::test(start_paused = true)]
async fn empty_image_is_invalid_input() {
    let t = Arc::new(ScriptedTransport::default());
    let api = api_with(&t);
    let err = api.analyze_plant_image(Bytes::new(), false).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::InvalidInput));
    assert_eq!(t.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn chat_turns_are_distinct_and_retry_reuses_the_turn_key() {
    let t = Arc::new(
        ScriptedTransport::default()
            .value(r#"{"response":"Pouvez-vous me donner plus de détails?"}"#)
            .then(Step::Reply(Outcome::PermanentError("http 400".into())))
            .value(r#"{"response":"Essayez de réduire la fréquence."}"#),
    );
    let api = api_with(&t);
    let mut session = ChatSession::new();

    let first = api.chat_with_assistant(session.next_turn(), "mes feuilles jaunissent").await.unwrap();
    assert!(first.response.contains("détails"));

    let key = session.next_turn();
    let err = api.chat_with_assistant(key.clone(), "j'arrose tous les jours").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Permanent));
    assert_eq!(session.current(), key);

    let retried = api.chat_with_assistant(session.current(), "j'arrose tous les jours").await.unwrap();
    assert!(retried.response.contains("fréquence"));
    assert_eq!(t.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancel_through_the_api() {
    let t = Arc::new(ScriptedTransport::default().then(Step::Hang));
    let api = api_with(&t);
    let mut session = ChatSession::new();
    let key = session.next_turn();

    let bg = {
        let api = api.clone();
        let key = key.clone();
        tokio::spawn(async move { api.chat_with_assistant(key, "allo?").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(api.cancel(&key));
    let err = bg.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Cancelled));
    assert!(err.user_retryable());
}

#[tokio::test(start_paused = true)]
async fn simulated_backend_round_trip() {
    let api = InProcApi::new(RequestOrchestrator::new(OrchestratorConfig::default(), Arc::new(SimulatedTransport::default())));
    let report = api.analyze_plant_image(Bytes::from_static(b"leaf"), true).await.unwrap();
    assert!((70..100).contains(&report.confidence));
    assert!(report.segmented_image_uri.is_some());
    let reply = api.chat_with_assistant(ChatSession::new().next_turn(), "bonjour").await.unwrap();
    assert!(CHAT_REPLIES.contains(&reply.response.as_str()));
}
