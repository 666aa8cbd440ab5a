//! End-to-end QA tests.
//!
//! These tests run a transcript through its whole life: growth, summaries,
//! search, deletion and recovery.
//! Run with: `cargo test -p storyline-core --test qa_end_to_end -- --nocapture`

use std::collections::BTreeSet;
use storyline_core::telemetry::init_tracing;
use storyline_core::testing::{
    assert_consistent, assert_event_titles, assert_message, assert_summarized_through,
    SummaryReply, TestHarness,
};
use storyline_core::{Entry, HideRange, StatusMessage, SummarizeOutcome, SummaryState};

// =============================================================================
// TEST 1: Twelve entries, one summary, four deletions
// =============================================================================

#[tokio::test]
async fn test_summarize_then_delete_resets() {
    init_tracing();
    println!("\n=== TEST: Summarize then delete ===\n");

    let mut harness = TestHarness::new();
    harness.expect_reply(
        SummaryReply::new()
            .keyword("harbor")
            .event("Arrival", &["Mira", "Keeper"])
            .event("Lights Fail", &["Keeper"])
            .character("Mira")
            .into_reply(),
    );
    harness.append_turns(12).await;
    let id = harness.id();

    let outcome = harness.summarize().await;
    let SummarizeOutcome::Merged(report) = outcome else {
        panic!("expected a merge, got {outcome:?}");
    };
    assert_eq!(report.end_position, 11);
    assert_eq!(report.events_added, vec!["evt-1", "evt-2"]);
    assert_eq!(harness.hidden().await, Some(HideRange::new(0, 7)));

    let hits = harness
        .engine
        .search(&id, &["keeper".to_string(), "lights".to_string()])
        .await;
    assert!(!hits.chunk_positions.is_empty());
    assert_eq!(hits.event_ids.len(), 2);
    println!("Hits before deletion: {:?}", hits.chunk_positions);
    harness.drain_messages();

    let report = harness.truncate(8).await;
    let rollback = report.rollback.expect("rollback");
    assert!(rollback.reset);
    assert_eq!(report.visibility.unhide, Some(HideRange::new(0, 7)));
    let rebuild = report.warmup.expect("a warm index is rebuilt");
    rebuild.wait().await.expect("rebuild");

    let state = harness.state().await;
    assert_summarized_through(&state, None);
    assert!(state.facts().is_empty());
    assert_eq!(harness.hidden().await, None);

    let hits = harness
        .engine
        .search(&id, &["keeper".to_string(), "lights".to_string()])
        .await;
    assert!(hits.event_ids.is_empty());
    assert!(hits.chunk_positions.iter().all(|p| *p < 8));

    let messages = harness.drain_messages();
    assert_message(&messages, "reset", |m| {
        matches!(
            m,
            StatusMessage::SummaryDataChanged {
                last_summarized: None,
                ..
            }
        )
    });
}

// =============================================================================
// TEST 2: A long session with growth and recovery
// =============================================================================

#[tokio::test]
async fn test_long_session() {
    let mut harness = TestHarness::new();
    harness
        .expect_summary(&["Arrival"])
        .expect_summary(&["Storm"])
        .expect_summary(&["Wreck"])
        .expect_summary(&["Rescue"]);

    for _ in 0..3 {
        harness.append_turns(6).await;
        harness.summarize().await;
        assert_consistent(&harness.state().await);
    }
    assert_summarized_through(&harness.state().await, Some(17));

    // Regenerate the last reply, then lose a whole exchange.
    harness.delete(17, 1).await;
    harness
        .append(Entry::assistant("The keeper lowers the rope."))
        .await;
    assert_summarized_through(&harness.state().await, Some(17));

    harness.truncate(14).await;
    let state = harness.state().await;
    assert_summarized_through(&state, Some(11));
    assert_event_titles(&state, &["Arrival", "Storm"]);

    harness.append_turns(4).await;
    harness.summarize().await;
    let state = harness.state().await;
    assert_summarized_through(&state, Some(17));
    assert_event_titles(&state, &["Arrival", "Storm", "Rescue"]);
    assert_consistent(&state);

    let hits = harness
        .engine
        .search(&harness.id(), &["rescue".to_string()])
        .await;
    assert_eq!(hits.event_ids, vec!["evt-3"]);
}

// =============================================================================
// TEST 3: A saved summary is restored into a fresh engine
// =============================================================================

#[tokio::test]
async fn test_restore_saved_summary() {
    let mut original = TestHarness::new();
    original.expect_summary(&["Arrival", "Storm"]);
    original.append_turns(10).await;
    original.summarize().await;

    let saved = serde_json::to_string(&original.state().await).expect("serialize");
    assert!(saved.contains("lastSummarized"));

    let mut restored = TestHarness::new();
    restored.append_turns(10).await;
    let state: SummaryState = serde_json::from_str(&saved).expect("deserialize");
    let delta = restored.engine.restore_summary(&restored.id(), state).await;

    assert_eq!(delta.hide, Some(HideRange::new(0, 5)));
    let state = restored.state().await;
    assert_summarized_through(&state, Some(9));
    assert_event_titles(&state, &["Arrival", "Storm"]);

    let hits = restored
        .engine
        .search(&restored.id(), &["storm".to_string()])
        .await;
    assert_eq!(hits.event_ids, vec!["evt-2"]);
    assert_eq!(
        hits.chunk_positions,
        BTreeSet::new(),
        "no entry mentions a storm"
    );
}
