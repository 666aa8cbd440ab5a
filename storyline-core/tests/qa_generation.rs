//! QA tests for summary generation.
//!
//! These tests verify single-flight runs, cancellation, retries of
//! background runs, prompt contents and the status messages sent to the
//! presentation surface.
//! Run with: `cargo test -p storyline-core --test qa_generation`

use std::sync::Arc;
use std::time::Duration;
use storyline_core::testing::{
    assert_consistent, assert_event_titles, assert_message, assert_summarized_through,
    summary_json, MockGenerator, MockReply, SummaryReply, TestHarness,
};
use storyline_core::{
    Engine, EngineConfig, EngineError, Entry, Section, StatusMessage, SummarizeError,
    SummarizeOutcome, SummaryError, Transcript, Trigger, UiRequest,
};

fn position_of(messages: &[StatusMessage], predicate: impl Fn(&StatusMessage) -> bool) -> usize {
    messages
        .iter()
        .position(predicate)
        .unwrap_or_else(|| panic!("message missing from {messages:?}"))
}

// =============================================================================
// TEST 1: Only one run per transcript
// =============================================================================

#[tokio::test]
async fn test_single_flight_generation() {
    let (mock, gate) = MockGenerator::gated();
    let mock = Arc::new(mock.with_reply(MockReply::text(summary_json(&["Arrival"]))));
    let (engine, _rx) = Engine::new(EngineConfig::default(), mock.clone());
    engine.mark_ready();

    let mut transcript = Transcript::new("chat");
    let id = transcript.id();
    for i in 0..6 {
        let signal = transcript.append(Entry::user(format!("line {i}")));
        engine.handle_signal(&id, signal).await.expect("signal");
    }

    let first = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.generate(&id, Trigger::User).await })
    };
    while mock.calls() < 1 {
        tokio::task::yield_now().await;
    }

    let second = engine.generate(&id, Trigger::User).await.expect("second");
    assert_eq!(second, SummarizeOutcome::Rejected);
    assert!(engine.is_generating(&id));

    gate.notify_one();
    let first = first.await.expect("task").expect("first run");
    assert!(matches!(first, SummarizeOutcome::Merged(_)));
    assert_eq!(mock.calls(), 1);
    assert!(!engine.is_generating(&id));
}

#[tokio::test]
async fn test_rejection_is_reported() {
    let (mock, gate) = MockGenerator::gated();
    let mock = Arc::new(mock.with_reply(MockReply::text(summary_json(&["Arrival"]))));
    let (engine, mut rx) = Engine::new(EngineConfig::default(), mock.clone());
    engine.mark_ready();

    let mut transcript = Transcript::new("chat");
    let id = transcript.id();
    let signal = transcript.append(Entry::user("hello"));
    engine.handle_signal(&id, signal).await.expect("signal");

    let run = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.generate(&id, Trigger::User).await })
    };
    while mock.calls() < 1 {
        tokio::task::yield_now().await;
    }
    engine
        .handle_request(UiRequest::Generate {
            transcript: id.clone(),
        })
        .await
        .expect("request");
    gate.notify_one();
    run.await.expect("task").expect("run");

    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    assert_message(&messages, "rejection", |m| {
        matches!(m, StatusMessage::GenerationRejected { .. })
    });
}

// =============================================================================
// TEST 2: Status messages arrive in order
// =============================================================================

#[tokio::test]
async fn test_status_message_sequence() {
    let mut harness = TestHarness::new();
    harness.expect_summary(&["Arrival"]);
    harness.append_turns(10).await;
    harness.drain_messages();

    harness.summarize().await;
    let messages = harness.drain_messages();

    let running = position_of(&messages, |m| {
        matches!(m, StatusMessage::GenerationStateChanged { running: true, .. })
    });
    let started = position_of(&messages, |m| {
        matches!(m, StatusMessage::GenerationStarted { start: 0, end: 9, .. })
    });
    let visibility = position_of(&messages, |m| {
        matches!(m, StatusMessage::VisibilityChanged { .. })
    });
    let data = position_of(&messages, |m| {
        matches!(
            m,
            StatusMessage::SummaryDataChanged {
                last_summarized: Some(9),
                ..
            }
        )
    });
    let completed = position_of(&messages, |m| {
        matches!(
            m,
            StatusMessage::GenerationCompleted {
                events_added: 1,
                ..
            }
        )
    });
    let idle = position_of(&messages, |m| {
        matches!(m, StatusMessage::GenerationStateChanged { running: false, .. })
    });

    assert!(running < started);
    assert!(started < visibility);
    assert!(visibility < data);
    assert!(data < completed);
    assert!(completed < idle);
}

#[tokio::test]
async fn test_messages_wait_for_ready() {
    let mock = Arc::new(MockGenerator::new().with_reply(MockReply::text(summary_json(&["A"]))));
    let (engine, mut rx) = Engine::new(EngineConfig::default(), mock);

    let mut transcript = Transcript::new("chat");
    let signal = transcript.append(Entry::user("hello"));
    engine
        .handle_signal(&transcript.id(), signal)
        .await
        .expect("signal");
    engine
        .generate(&transcript.id(), Trigger::User)
        .await
        .expect("generate");
    assert!(rx.try_recv().is_err());

    engine
        .handle_request(UiRequest::Ready)
        .await
        .expect("ready");
    let first = rx.try_recv().expect("flushed");
    assert!(matches!(
        first,
        StatusMessage::GenerationStateChanged { running: true, .. }
    ));
}

#[tokio::test]
async fn test_streaming_progress_messages() {
    let long_title = "A very long account of the night the harbor lights went dark";
    let titles: Vec<&str> = std::iter::repeat(long_title).take(6).collect();
    let mock = Arc::new(
        MockGenerator::new()
            .streaming()
            .with_reply(MockReply::text(summary_json(&titles))),
    );
    let (engine, mut rx) = Engine::new(EngineConfig::default(), mock);
    engine.mark_ready();

    let mut transcript = Transcript::new("chat");
    let signal = transcript.append(Entry::user("hello"));
    engine
        .handle_signal(&transcript.id(), signal)
        .await
        .expect("signal");
    engine
        .generate(&transcript.id(), Trigger::User)
        .await
        .expect("generate");

    let mut progress = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let StatusMessage::GenerationProgress { received_chars, .. } = message {
            progress.push(received_chars);
        }
    }
    assert!(progress.len() > 1);
    assert!(progress.windows(2).all(|w| w[1] >= w[0] + 256));
}

// =============================================================================
// TEST 3: Cancellation commits nothing
// =============================================================================

#[tokio::test]
async fn test_cancel_commits_nothing() {
    let (mock, _gate) = MockGenerator::gated();
    let mock = Arc::new(mock.with_reply(MockReply::text(summary_json(&["Never"]))));
    let (engine, mut rx) = Engine::new(EngineConfig::default(), mock.clone());
    engine.mark_ready();

    let mut transcript = Transcript::new("chat");
    let id = transcript.id();
    let signal = transcript.append(Entry::user("hello"));
    engine.handle_signal(&id, signal).await.expect("signal");

    let run = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.generate(&id, Trigger::User).await })
    };
    while mock.calls() < 1 {
        tokio::task::yield_now().await;
    }

    engine
        .handle_request(UiRequest::Cancel {
            transcript: id.clone(),
        })
        .await
        .expect("cancel");
    let err = run.await.expect("task").expect_err("cancelled");
    assert!(matches!(
        err,
        EngineError::Summarize(SummarizeError::Cancelled)
    ));

    let state = engine.summary(&id).await.expect("state");
    assert_summarized_through(&state, None);
    assert!(!engine.is_generating(&id));
    assert!(!engine.cancel(&id));

    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    assert_message(&messages, "error", |m| {
        matches!(m, StatusMessage::GenerationError { run_id: Some(_), .. })
    });
}

// =============================================================================
// TEST 4: Failures leave the summary untouched
// =============================================================================

#[tokio::test]
async fn test_parse_failure_leaves_state_unchanged() {
    let mut harness = TestHarness::new();
    harness
        .expect_summary(&["Arrival"])
        .expect_reply(MockReply::text("I could not find anything worth noting."));
    harness.append_turns(3).await;
    harness.summarize().await;
    harness.append_turns(3).await;

    let err = harness.try_summarize().await.expect_err("parse failure");
    assert!(matches!(err, EngineError::Summarize(SummarizeError::Parse(_))));
    assert_eq!(harness.generator.calls(), 2);

    let state = harness.state().await;
    assert_summarized_through(&state, Some(2));
    assert_event_titles(&state, &["Arrival"]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_reported() {
    let mut harness =
        TestHarness::with_config(EngineConfig::default().with_generation_timeout(Duration::from_secs(5)));
    harness.expect_reply(MockReply::text(summary_json(&["Late"])).after(Duration::from_secs(60)));
    harness.append_turns(2).await;

    let err = harness.try_summarize().await.expect_err("timeout");
    assert!(err.to_string().contains("timed out"));
    assert_summarized_through(&harness.state().await, None);
}

// =============================================================================
// TEST 5: Background runs
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_auto_summarize_retries_in_background() {
    let mut harness =
        TestHarness::with_config(EngineConfig::default().with_auto_summarize_after(4));
    harness
        .expect_reply(MockReply::fail(storyline_llm::Error::Network(
            "connection reset".into(),
        )))
        .expect_summary(&["Harbor Talk"]);

    for _ in 0..3 {
        let report = harness.append(Entry::user("Mira waits.")).await;
        assert!(report.background.is_none());
    }
    let report = harness.append(Entry::user("The keeper answers.")).await;
    let outcome = report
        .background
        .expect("background run")
        .await
        .expect("task")
        .expect("run");

    assert!(matches!(outcome, SummarizeOutcome::Merged(_)));
    assert_eq!(harness.generator.calls(), 2);
    assert_summarized_through(&harness.state().await, Some(3));
}

// =============================================================================
// TEST 6: Prompt contents
// =============================================================================

#[tokio::test]
async fn test_prompt_carries_summary_slice_and_next_id() {
    let mut harness = TestHarness::new();
    harness
        .expect_summary(&["Arrival"])
        .expect_summary(&["Departure"]);
    harness.append_turns(3).await;
    harness.summarize().await;
    harness.append_turns(2).await;
    harness.summarize().await;

    let request = harness.generator.last_request().expect("request");
    let prompt = request.last_user_text().expect("user text");
    assert!(prompt.contains("Arrival"));
    assert!(prompt.contains("[#3]"));
    assert!(prompt.contains("[#4]"));
    assert!(!prompt.contains("[#2]"));
    assert!(prompt.contains("evt-2"));
    assert!(request.system.is_some());
}

// =============================================================================
// TEST 7: Presentation requests
// =============================================================================

#[tokio::test]
async fn test_requests_edit_summary() {
    let mut harness = TestHarness::new();
    let id = harness.id();

    let err = harness
        .engine
        .update_section(&id, Section::Keywords, serde_json::json!(["early"]))
        .await
        .expect_err("nothing summarized");
    assert!(matches!(
        err,
        EngineError::Summary(SummaryError::NothingSummarized)
    ));

    harness.expect_reply(
        SummaryReply::new()
            .keyword("harbor")
            .event("Arrival", &["Mira"])
            .into_reply(),
    );
    harness.append_turns(6).await;
    harness.summarize().await;

    harness
        .engine
        .handle_request(UiRequest::UpdateSection {
            transcript: id.clone(),
            section: Section::Keywords,
            value: serde_json::json!(["lighthouse", {"text": "reef", "weight": 0.9}]),
        })
        .await
        .expect("update");
    let state = harness.state().await;
    let keywords: Vec<_> = state.facts().keywords.iter().map(|k| k.text.as_str()).collect();
    assert_eq!(keywords, vec!["lighthouse", "reef"]);
    assert_consistent(&state);

    harness
        .engine
        .handle_request(UiRequest::UpdateKeepVisibleCount {
            transcript: id.clone(),
            count: 2,
        })
        .await
        .expect("keep");
    assert!(harness.engine.is_hidden(&id, 3).await);

    harness
        .engine
        .handle_request(UiRequest::ToggleHide {
            transcript: id.clone(),
            enabled: false,
        })
        .await
        .expect("toggle");
    assert_eq!(harness.hidden().await, None);

    harness
        .engine
        .handle_request(UiRequest::Clear {
            transcript: id.clone(),
        })
        .await
        .expect("clear");
    assert_summarized_through(&harness.state().await, None);
}
