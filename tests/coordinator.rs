use chatbridge::coordinator::{CANCELLED, EMPTY_RESPONSE};
use chatbridge::provider::google::{GeminiApi, GenerateContentRequest, GenerateContentResponse, ModelInfo};
use chatbridge::provider::{BlockingIter, GoogleProvider, StubProvider};
use chatbridge::{
    BackendConfig, BackendError, ChatMessage, Coordinator, LoadingState, Options, Provider, StreamEvent, TokenUsage,
    Transcript,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

async fn events_for(rx: &mut broadcast::Receiver<StreamEvent>, request_id: &str) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    loop {
        let ev = tokio::time::timeout(WAIT, rx.recv()).await.expect("timed out").unwrap();
        if ev.request_id() != Some(request_id) {
            continue;
        }
        let terminal = matches!(ev, StreamEvent::Finished { .. } | StreamEvent::Error { .. });
        out.push(ev);
        if terminal {
            return out;
        }
    }
}

fn chunks(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

async fn setup(backends: Vec<(&str, Arc<dyn Provider>)>) -> Coordinator {
    let c = Coordinator::new(Arc::new(Transcript::new()));
    for (id, p) in backends {
        c.register(id, p);
        c.configure_backend(id, BackendConfig::new("test-model")).await.unwrap();
    }
    c
}

fn shared(p: StubProvider) -> Arc<dyn Provider> {
    Arc::new(p)
}

fn start(c: &Coordinator, backend: &str, request_id: &str, prompt: &str) -> bool {
    c.transcript().push(ChatMessage::user(prompt));
    c.transcript().push(ChatMessage::placeholder(request_id));
    let history = c.transcript().history_before(request_id);
    c.request_response(backend, request_id, history, Options::default())
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_stream_walks_idle_loading_completed() {
    let stub = StubProvider::new()
        .with_chunks(["a", "b", "c"])
        .with_delay(Duration::from_millis(30))
        .with_usage(TokenUsage::new(5, 3));
    let c = setup(vec![("stub", shared(stub))]).await;
    let mut rx = c.subscribe();

    c.transcript().push(ChatMessage::placeholder("r1"));
    assert_eq!(c.transcript().message("r1").unwrap().loading_state, LoadingState::Idle);
    assert!(c.request_response("stub", "r1", vec![ChatMessage::user("go")], Options::default()));

    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, StreamEvent::Busy(true));
    let started = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(started, StreamEvent::Started { .. }));
    assert_eq!(c.correlator().state("r1"), Some(LoadingState::Loading));
    assert!(c.transcript().message("r1").unwrap().is_streaming());

    let events = events_for(&mut rx, "r1").await;
    assert_eq!(chunks(&events), vec!["a", "b", "c"]);
    match events.last().unwrap() {
        StreamEvent::Finished { message, usage, .. } => {
            assert_eq!(message.text(), "abc");
            assert_eq!(*usage, Some(TokenUsage::new(5, 3)));
        }
        other => panic!("unexpected terminal event {other:?}"),
    }

    let msg = c.transcript().message("r1").unwrap();
    assert_eq!(msg.text(), "abc");
    assert_eq!(msg.loading_state, LoadingState::Completed);
    assert!(!msg.is_streaming());
    assert_eq!(c.correlator().find_message_row("r1"), Some(0));

    c.wait_idle().await;
    assert!(!c.is_busy());
}

#[tokio::test(flavor = "multi_thread")]
async fn chunk_order_matches_provider_order() {
    let script: Vec<String> = (0..200).map(|i| format!("{i},")).collect();
    let c = setup(vec![("stub", shared(StubProvider::new().with_chunks(script.clone())))]).await;
    let mut rx = c.subscribe();
    assert!(start(&c, "stub", "r1", "count"));
    let events = events_for(&mut rx, "r1").await;
    assert_eq!(chunks(&events), script);
    assert_eq!(c.transcript().message("r1").unwrap().text(), script.concat());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_do_not_interleave_or_share_diagnostics() {
    let fast = Arc::new(
        StubProvider::new()
            .with_chunks(["x1", "x2", "x3", "x4"])
            .with_delay(Duration::from_millis(5))
            .failing_after(3, BackendError::RateLimited("quota exhausted".into())),
    );
    let slow = Arc::new(
        StubProvider::new()
            .with_chunks(["y1", "y2", "y3"])
            .with_delay(Duration::from_millis(15))
            .with_usage(TokenUsage::new(7, 3)),
    );
    let c = setup(vec![("fast", fast.clone() as Arc<dyn Provider>), ("slow", slow.clone() as Arc<dyn Provider>)]).await;
    let mut rx_a = c.subscribe();
    let mut rx_b = c.subscribe();

    assert!(start(&c, "fast", "a", "first"));
    assert!(start(&c, "slow", "b", "second"));
    let (a, b) = tokio::join!(events_for(&mut rx_a, "a"), events_for(&mut rx_b, "b"));

    assert_eq!(chunks(&a), vec!["x1", "x2", "x3"]);
    assert!(matches!(a.last(), Some(StreamEvent::Error { message, .. }) if message == "quota exhausted"));
    assert_eq!(chunks(&b), vec!["y1", "y2", "y3"]);
    assert!(matches!(b.last(), Some(StreamEvent::Finished { .. })));

    assert_eq!(c.correlator().state("a"), Some(LoadingState::Error));
    assert_eq!(c.correlator().error("a").as_deref(), Some("quota exhausted"));
    assert_eq!(c.transcript().message("a").unwrap().text(), "x1x2x3");
    assert_eq!(c.correlator().state("b"), Some(LoadingState::Completed));

    assert_eq!(fast.last_error().as_deref(), Some("quota exhausted"));
    assert_eq!(slow.last_error(), None);
    assert_eq!(slow.last_token_usage(), Some(TokenUsage::new(7, 3)));
    assert_eq!(fast.last_token_usage(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_ends_request_with_cancel_text() {
    let stub = StubProvider::new()
        .with_chunks((0..50).map(|i| i.to_string()))
        .with_delay(Duration::from_millis(50));
    let c = setup(vec![("stub", shared(stub))]).await;
    let mut rx = c.subscribe();
    assert!(start(&c, "stub", "r1", "long"));

    loop {
        let ev = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        if matches!(ev, StreamEvent::Chunk { .. }) {
            break;
        }
    }
    assert!(c.cancel("stub", "r1"));
    let rest = events_for(&mut rx, "r1").await;
    assert!(matches!(rest.last(), Some(StreamEvent::Error { message, .. }) if message == CANCELLED));

    c.wait_idle().await;
    assert!(!c.is_busy());
    assert!(!c.cancel("stub", "r1"));
    assert_eq!(c.correlator().state("r1"), Some(LoadingState::Error));
    assert_eq!(LoadingState::Error.display(), LoadingState::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_all_and_cancel_backend_reach_every_request() {
    let slow = || StubProvider::new().with_chunks(["."; 40]).with_delay(Duration::from_millis(50));
    let c = setup(vec![("one", shared(slow())), ("two", shared(slow()))]).await;
    let mut rx = c.subscribe();

    assert!(start(&c, "one", "a", "p"));
    assert!(start(&c, "one", "b", "p"));
    assert!(start(&c, "two", "c", "p"));
    assert!(c.is_busy());

    assert_eq!(c.cancel_backend("one"), 2);
    assert_eq!(c.cancel_all(), 3);
    c.wait_idle().await;

    let mut errors = 0;
    while let Ok(ev) = rx.try_recv() {
        if let StreamEvent::Error { message, .. } = ev {
            assert_eq!(message, CANCELLED);
            errors += 1;
        }
    }
    assert_eq!(errors, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_request_is_rejected_without_disturbing_the_live_one() {
    let stub = StubProvider::new()
        .with_chunks(["p", "q"])
        .with_delay(Duration::from_millis(100));
    let c = setup(vec![("stub", shared(stub))]).await;
    let mut rx = c.subscribe();
    assert!(start(&c, "stub", "r1", "once"));
    assert!(!c.request_response("stub", "r1", vec![ChatMessage::user("twice")], Options::default()));

    let events = events_for(&mut rx, "r1").await;
    // The rejection is reported first, then the live request runs to completion.
    let rejection = events.iter().position(|e| matches!(e, StreamEvent::Error { .. }));
    assert!(rejection.is_some());
    let rest = events_for(&mut rx, "r1").await;
    assert_eq!(chunks(&rest), vec!["p", "q"]);
    assert!(matches!(rest.last(), Some(StreamEvent::Finished { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_backend_and_empty_reply() {
    let c = setup(vec![("stub", shared(StubProvider::new().with_chunks([""])))]).await;
    let mut rx = c.subscribe();

    assert!(!start(&c, "missing", "r0", "hello"));
    let events = events_for(&mut rx, "r0").await;
    assert!(matches!(&events[0], StreamEvent::Error { message, .. } if message.contains("unknown backend")));
    assert_eq!(c.transcript().message("r0").unwrap().loading_state, LoadingState::Error);

    assert!(start(&c, "stub", "r1", "hello"));
    let events = events_for(&mut rx, "r1").await;
    match events.last().unwrap() {
        StreamEvent::Finished { message, .. } => assert_eq!(message.text(), EMPTY_RESPONSE),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(c.transcript().message("r1").unwrap().text(), EMPTY_RESPONSE);
}

#[tokio::test(flavor = "multi_thread")]
async fn models_are_listed_off_the_runtime_threads() {
    let stub = StubProvider::new().with_catalog(["b-model", "a-model"]);
    let c = setup(vec![("stub", shared(stub))]).await;
    assert_eq!(c.available_models("stub").await.unwrap(), vec!["a-model", "b-model", "test-model"]);
    assert!(c.available_models("nope").await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn lagging_subscriber_recovers_full_reply_from_transcript() {
    let parts: Vec<String> = (0..400).map(|i| format!("{i},")).collect();
    let expected = parts.concat();
    let c = setup(vec![("stub", shared(StubProvider::new().with_chunks(parts)))]).await;
    let mut rx = c.subscribe();
    assert!(start(&c, "stub", "r1", "count"));
    c.wait_idle().await;

    let mut skipped = 0;
    let mut seen = String::new();
    let finished = loop {
        match rx.try_recv() {
            Ok(StreamEvent::Chunk { text, .. }) => seen.push_str(&text),
            Ok(StreamEvent::Finished { message, .. }) => break message,
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(n)) => skipped += n,
            Err(e) => panic!("no finished event: {e:?}"),
        }
    };

    assert!(skipped > 0);
    assert!(seen.len() < expected.len());
    assert_eq!(finished.text(), expected);
    assert_eq!(c.transcript().message("r1").unwrap().text(), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn configure_announces_model_and_catalog() {
    let c = Coordinator::new(Arc::new(Transcript::new()));
    c.register("stub", shared(StubProvider::new().with_catalog(["stub-b", "stub-a"])));
    let mut rx = c.subscribe();

    c.configure_backend("stub", BackendConfig::new("custom").with_system_prompt("terse"))
        .await
        .unwrap();
    assert_eq!(
        rx.try_recv().unwrap(),
        StreamEvent::Configured {
            backend: "stub".into(),
            model: "custom".into(),
            ok: true,
            models: vec!["custom".into(), "stub-a".into(), "stub-b".into()],
        }
    );
    assert_eq!(c.configured_model("stub").as_deref(), Some("custom"));
    assert_eq!(c.system_prompt("stub").as_deref(), Some("terse"));

    assert!(c.configure_backend("stub", BackendConfig::new("  ")).await.is_err());
    assert_eq!(
        rx.try_recv().unwrap(),
        StreamEvent::Configured {
            backend: "stub".into(),
            model: String::new(),
            ok: false,
            models: Vec::new(),
        }
    );
    assert_eq!(c.configured_model("stub"), None);
    assert!(c.last_error("stub").unwrap().contains("model ID"));

    assert!(c.configure_backend("missing", BackendConfig::new("m")).await.is_err());
    assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Configured { ok: false, .. }));
}

struct BlockedGemini;

impl GeminiApi for BlockedGemini {
    fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
        Ok(Vec::new())
    }

    fn stream_generate_content(
        &self,
        _: &str,
        _: &GenerateContentRequest,
    ) -> Result<BlockingIter<GenerateContentResponse>, BackendError> {
        let chunk: GenerateContentResponse =
            serde_json::from_value(serde_json::json!({"promptFeedback": {"blockReason": "SAFETY"}}))?;
        Ok(Box::new(std::iter::once(Ok(chunk))))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn content_block_through_coordinator_finishes_with_notice() {
    let gemini = GoogleProvider::with_connector(Box::new(|_| Ok(Arc::new(BlockedGemini) as Arc<dyn GeminiApi>)))
        .with_key_vars(&[]);
    let c = Coordinator::new(Arc::new(Transcript::new()));
    c.register("gemini", Arc::new(gemini));
    c.configure_backend("gemini", BackendConfig::new("gemini-1.5-flash").with_credential("k"))
        .await
        .unwrap();

    let mut rx = c.subscribe();
    assert!(start(&c, "gemini", "r1", "risky"));
    let events = events_for(&mut rx, "r1").await;
    assert_eq!(chunks(&events).len(), 1);
    match events.last().unwrap() {
        StreamEvent::Finished { message, .. } => assert!(message.text().starts_with("[SYSTEM ERROR:")),
        other => panic!("unexpected {other:?}"),
    }
}
