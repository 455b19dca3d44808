#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use phyto_core::{ErrorKind, OpKey, OpKind, OpState, OrchestratorConfig, Outcome, Payload};
use phyto_orchestrator::RequestOrchestrator;
use phyto_transport::{ScriptedTransport, Step};

fn orch(cfg: OrchestratorConfig, t: &Arc<ScriptedTransport>) -> RequestOrchestrator {
    RequestOrchestrator::new(cfg, t.clone())
}

fn leaf() -> Payload { Payload::image(vec![0xFFu8, 0xD8, 0xFF, 0xE0], false) }

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_submits_dispatch_once() {
    let t = Arc::new(
        ScriptedTransport::default().then(Step::After(Duration::from_millis(50), Outcome::Value(r#"{"status":"healthy"}"#.into()))),
    );
    let o = orch(OrchestratorConfig::default(), &t);

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let o = o.clone();
        tasks.push(tokio::spawn(async move { o.submit("img-same", OpKind::Analyze, leaf(), None).unwrap().await }));
    }
    let results: Vec<_> = futures::future::join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(t.calls(), 1);
    assert!(results[0].is_ok());
    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    assert_eq!(o.stats().live, 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_while_pending_shares_result_instance() {
    let t = Arc::new(ScriptedTransport::default().then(Step::After(Duration::from_millis(300), Outcome::Value("{}".into()))));
    let o = orch(OrchestratorConfig::default(), &t);

    let a = o.submit("img-abc123", OpKind::Analyze, leaf(), None).unwrap();
    let b = o.submit("img-abc123", OpKind::Analyze, leaf(), None).unwrap();
    assert_eq!(a.op_id(), b.op_id());

    let (ra, rb) = tokio::join!(a.wait(), b.wait());
    assert!(Arc::ptr_eq(&ra, &rb));
    assert_eq!(t.calls(), 1);
    assert_eq!(ra.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn late_duplicate_reuses_success_within_retention_only() {
    let t = Arc::new(ScriptedTransport::default().value("first").value("second"));
    let cfg = OrchestratorConfig { retention: Duration::from_secs(1), ..OrchestratorConfig::default() };
    let o = orch(cfg, &t);

    let first = o.submit("img-1", OpKind::Analyze, leaf(), None).unwrap().await;
    let again = o.submit("img-1", OpKind::Analyze, leaf(), None).unwrap();
    assert!(again.try_result().is_some(), "cached result should be ready immediately");
    assert!(Arc::ptr_eq(&first, &again.await));
    assert_eq!(t.calls(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let fresh = o.submit("img-1", OpKind::Analyze, leaf(), None).unwrap().await;
    assert_eq!(&fresh.outcome.as_ref().unwrap()[..], b"second");
    assert_eq!(t.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn resubmitting_after_failure_starts_fresh_operation() {
    let t = Arc::new(
        ScriptedTransport::default()
            .then(Step::Reply(Outcome::PermanentError("http 400".into())))
            .value(r#"{"response":"ok"}"#),
    );
    let o = orch(OrchestratorConfig::default(), &t);

    let failed = o.submit("chat-s1-1", OpKind::Chat, Payload::message("bonjour"), None).unwrap().await;
    assert_eq!(failed.error_kind(), Some(ErrorKind::Permanent));

    let retried = o.submit("chat-s1-1", OpKind::Chat, Payload::message("bonjour"), None).unwrap().await;
    assert!(retried.is_ok());
    assert_eq!(t.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn invalid_input_is_rejected_before_dispatch() {
    let t = Arc::new(ScriptedTransport::default());
    let o = orch(OrchestratorConfig::default(), &t);

    let empty = o.submit("img-x", OpKind::Analyze, Payload::image(Vec::<u8>::new(), false), None).unwrap_err();
    assert_eq!(empty.kind(), ErrorKind::InvalidInput);
    let zero = o.submit("img-x", OpKind::Analyze, leaf(), Some(Duration::ZERO)).unwrap_err();
    assert_eq!(zero.kind(), ErrorKind::InvalidInput);
    let blank = o.submit("  ", OpKind::Chat, Payload::message("hi"), None).unwrap_err();
    assert_eq!(blank.kind(), ErrorKind::InvalidInput);
    let mismatched = o.submit("img-x", OpKind::Chat, leaf(), None).unwrap_err();
    assert_eq!(mismatched.kind(), ErrorKind::InvalidInput);

    let via_wait = o.submit_and_wait("chat-x", OpKind::Chat, Payload::message(""), None).await;
    assert_eq!(via_wait.error_kind(), Some(ErrorKind::InvalidInput));
    assert_eq!(via_wait.attempts, 0);

    assert_eq!(t.calls(), 0);
    assert!(o.status(&OpKey::from("img-x")).is_none());
}

#[tokio::test(start_paused = true)]
async fn same_key_with_other_kind_is_refused_while_in_flight() {
    let t = Arc::new(ScriptedTransport::default().then(Step::Hang));
    let o = orch(OrchestratorConfig::default(), &t);

    let _h = o.submit("shared", OpKind::Analyze, leaf(), None).unwrap();
    let err = o.submit("shared", OpKind::Chat, Payload::message("hi"), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test(start_paused = true)]
async fn status_follows_state_machine() {
    let t = Arc::new(ScriptedTransport::default().then(Step::After(Duration::from_secs(1), Outcome::Value("{}".into()))));
    let o = orch(OrchestratorConfig::default(), &t);
    let key = OpKey::from("img-state");

    let h = o.submit(key.clone(), OpKind::Analyze, leaf(), Some(Duration::from_secs(10))).unwrap();
    assert_eq!(o.status(&key).map(|s| s.state), Some(OpState::Pending));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let s = o.status(&key).unwrap();
    assert_eq!(s.state, OpState::InFlight);
    assert_eq!(s.attempt, 1);
    assert!(s.deadline > s.submitted_at);

    h.await;
    let s = o.status(&key).unwrap();
    assert_eq!(s.state, OpState::Succeeded);
    assert_eq!(s.error, None);
}

#[tokio::test(start_paused = true)]
async fn retained_success_is_not_served_to_another_kind() {
    let t = Arc::new(ScriptedTransport::default().value(r#"{"status":"healthy","confidence":90}"#).value(r#"{"response":"bonjour"}"#));
    let o = orch(OrchestratorConfig::default(), &t);

    let analysis = o.submit("k", OpKind::Analyze, leaf(), None).unwrap().await;
    assert!(analysis.is_ok());
    let chat = o.submit("k", OpKind::Chat, Payload::message("salut"), None).unwrap().await;
    assert_eq!(&chat.outcome.as_ref().unwrap()[..], br#"{"response":"bonjour"}"#);
    assert_eq!(t.calls(), 2);
    assert_eq!(o.status(&OpKey::from("k")).map(|s| s.kind), Some(OpKind::Chat));
}

#[tokio::test(start_paused = true)]
async fn panicking_transport_fails_the_op_and_releases_the_key() {
    let t = Arc::new(ScriptedTransport::default().then(Step::Panic("adapter bug")).value("{}"));
    let o = orch(OrchestratorConfig::default(), &t);
    let key = OpKey::from("img-p");

    let first = o.submit(key.clone(), OpKind::Analyze, leaf(), Some(Duration::from_millis(300))).unwrap();
    let first_id = first.op_id();
    let r = tokio::time::timeout(Duration::from_secs(2), first.wait()).await.expect("waiters are woken");
    assert_eq!(r.error_kind(), Some(ErrorKind::Permanent));
    assert_eq!(r.attempts, 1);
    assert_eq!(o.stats().live, 0);
    assert_eq!(o.status(&key).map(|s| s.state), Some(OpState::Failed));

    let second = o.submit(key, OpKind::Analyze, leaf(), None).unwrap();
    assert_ne!(second.op_id(), first_id);
    assert!(second.await.is_ok());
    assert_eq!(t.calls(), 2);
}
