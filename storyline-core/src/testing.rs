//! Testing utilities for the storyline engine.
//!
//! This module provides tools for integration testing:
//! - `MockGenerator` for deterministic generation without a backend
//! - `SummaryReply` and `summary_json` for building generator output
//! - `TestHarness` for scripted transcript scenarios
//! - Assertion helpers for verifying summary state

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineError, SignalReport};
use crate::messages::{StatusMessage, Trigger};
use crate::summarizer::SummarizeOutcome;
use crate::summary::SummaryState;
use crate::transcript::{Entry, Position, Transcript, TranscriptId, TranscriptSignal};
use crate::visibility::HideRange;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use storyline_llm::{
    Error, EventStream, GenerationRequest, Response, StreamEvent, TextGenerator,
};
use tokio::sync::{mpsc, Notify};

/// Characters per delta when a mock streams.
const STREAM_PIECE_CHARS: usize = 16;

// ============================================================================
// Mock generator
// ============================================================================

/// A scripted reply from the mock generator.
#[derive(Debug, Clone)]
pub struct MockReply {
    /// Text to return, or the error to fail with.
    pub result: Result<String, Error>,
    /// Simulated generation time.
    pub delay: Option<Duration>,
}

impl MockReply {
    /// Reply with text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            result: Ok(text.into()),
            delay: None,
        }
    }

    /// Fail with an error.
    pub fn fail(error: Error) -> Self {
        Self {
            result: Err(error),
            delay: None,
        }
    }

    /// Take `delay` before replying.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A text generator that returns scripted replies in order.
///
/// Use this for deterministic tests without a backend. When the script runs
/// out, calls fail with a configuration error.
#[derive(Default)]
pub struct MockGenerator {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<GenerationRequest>>,
    calls: AtomicUsize,
    /// Each call waits for one notification before replying.
    gate: Option<Arc<Notify>>,
    streaming: bool,
}

impl MockGenerator {
    /// Create a mock with no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock whose calls block until the returned `Notify` fires.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let mock = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (mock, gate)
    }

    /// Add a reply to the script.
    pub fn with_reply(self, reply: MockReply) -> Self {
        self.push_reply(reply);
        self
    }

    /// Add a reply to the script of a shared mock.
    pub fn push_reply(&self, reply: MockReply) {
        lock(&self.replies).push_back(reply);
    }

    /// Deliver replies as a stream of small deltas.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Replies not yet consumed.
    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }

    /// Every request received, oldest first.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        lock(&self.requests).last().cloned()
    }

    fn next_reply(&self, request: GenerationRequest) -> Option<MockReply> {
        lock(&self.requests).push(request);
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.replies).pop_front()
    }

    async fn respond(&self, request: GenerationRequest) -> Result<String, Error> {
        let reply = self.next_reply(request);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let reply = reply.ok_or_else(|| Error::Config("no scripted reply left".to_string()))?;
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        reply.result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn complete(&self, request: GenerationRequest) -> Result<Response, Error> {
        self.respond(request).await.map(Response::from_text)
    }

    async fn stream(&self, request: GenerationRequest) -> Result<EventStream, Error> {
        let text = self.respond(request).await?;
        let chars: Vec<char> = text.chars().collect();
        let mut events: Vec<Result<StreamEvent, Error>> = chars
            .chunks(STREAM_PIECE_CHARS)
            .map(|piece| {
                Ok(StreamEvent::TextDelta {
                    text: piece.iter().collect(),
                })
            })
            .collect();
        events.push(Ok(StreamEvent::MessageStop));
        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }
}

// ============================================================================
// Generator output
// ============================================================================

/// Builder for the JSON a generator returns for one slice.
#[derive(Debug, Clone, Default)]
pub struct SummaryReply {
    keywords: Vec<Value>,
    events: Vec<Value>,
    characters: Vec<Value>,
    relationships: Vec<Value>,
    arcs: Vec<Value>,
}

impl SummaryReply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyword(mut self, text: &str) -> Self {
        self.keywords.push(json!(text));
        self
    }

    /// Add an event with the given participants.
    pub fn event(mut self, title: &str, participants: &[&str]) -> Self {
        self.events.push(json!({
            "title": title,
            "timeLabel": "Day 1",
            "summary": format!("{title} happens."),
            "participants": participants,
            "type": "scene",
        }));
        self
    }

    pub fn character(mut self, name: &str) -> Self {
        self.characters.push(json!(name));
        self
    }

    pub fn relationship(mut self, from: &str, to: &str, label: &str, trend: &str) -> Self {
        self.relationships.push(json!({
            "from": from,
            "to": to,
            "label": label,
            "trend": trend,
        }));
        self
    }

    pub fn arc(mut self, name: &str, trajectory: &str, progress: f32, moment: &str) -> Self {
        self.arcs.push(json!({
            "name": name,
            "trajectory": trajectory,
            "progress": progress,
            "moment": moment,
        }));
        self
    }

    /// Render the reply, wrapped in a code block the way models often do.
    pub fn to_json(&self) -> String {
        let body = json!({
            "keywords": self.keywords,
            "events": self.events,
            "newCharacters": self.characters,
            "newRelationships": self.relationships,
            "arcUpdates": self.arcs,
        });
        format!("```json\n{body}\n```")
    }

    pub fn into_reply(self) -> MockReply {
        MockReply::text(self.to_json())
    }
}

/// Generator output adding one event per title, with the titles as keywords.
pub fn summary_json(titles: &[&str]) -> String {
    titles
        .iter()
        .fold(SummaryReply::new(), |reply, title| {
            reply
                .keyword(&title.to_lowercase())
                .event(title, &["Mira"])
        })
        .to_json()
}

// ============================================================================
// Test harness
// ============================================================================

/// A test harness for scripted transcript scenarios.
///
/// Owns a transcript, an engine fed by a [`MockGenerator`], and the status
/// channel. The surface is marked ready so messages arrive immediately.
pub struct TestHarness {
    pub engine: Engine,
    pub transcript: Transcript,
    pub generator: Arc<MockGenerator>,
    messages: mpsc::UnboundedReceiver<StatusMessage>,
}

impl TestHarness {
    /// Create a harness with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let generator = Arc::new(MockGenerator::new());
        let (engine, messages) = Engine::new(config, generator.clone());
        engine.mark_ready();
        Self {
            engine,
            transcript: Transcript::new("test-transcript"),
            generator,
            messages,
        }
    }

    pub fn id(&self) -> TranscriptId {
        self.transcript.id()
    }

    /// Script a summary adding one event per title.
    pub fn expect_summary(&mut self, titles: &[&str]) -> &mut Self {
        self.generator
            .push_reply(MockReply::text(summary_json(titles)));
        self
    }

    /// Script an arbitrary reply.
    pub fn expect_reply(&mut self, reply: MockReply) -> &mut Self {
        self.generator.push_reply(reply);
        self
    }

    /// Feed a signal to the engine.
    pub async fn signal(&mut self, signal: TranscriptSignal) -> SignalReport {
        let id = self.id();
        match self.engine.handle_signal(&id, signal).await {
            Ok(report) => report,
            Err(e) => panic!("signal rejected: {e}"),
        }
    }

    pub async fn append(&mut self, entry: Entry) -> SignalReport {
        let signal = self.transcript.append(entry);
        self.signal(signal).await
    }

    /// Append `count` alternating user and assistant turns.
    pub async fn append_turns(&mut self, count: usize) {
        for _ in 0..count {
            let n = self.transcript.len();
            let entry = if n % 2 == 0 {
                Entry::user(format!("Turn {n}: Mira asks about the harbor lights."))
                    .with_name("Mira")
            } else {
                Entry::assistant(format!("Turn {n}: The keeper points toward the reef."))
                    .with_name("Keeper")
            };
            self.append(entry).await;
        }
    }

    pub async fn edit(&mut self, position: Position, text: &str) -> SignalReport {
        let Some(signal) = self.transcript.edit(position, text) else {
            panic!("no entry at position {position} to edit");
        };
        self.signal(signal).await
    }

    pub async fn swipe(&mut self, position: Position, text: &str) -> SignalReport {
        let Some(signal) = self.transcript.swipe(position, text) else {
            panic!("no entry at position {position} to swipe");
        };
        self.signal(signal).await
    }

    pub async fn delete(&mut self, position: Position, count: usize) -> SignalReport {
        let Some(signal) = self.transcript.delete(position, count) else {
            panic!("nothing to delete at position {position}");
        };
        self.signal(signal).await
    }

    /// Delete everything from `len` onwards.
    pub async fn truncate(&mut self, len: usize) -> SignalReport {
        let Some(signal) = self.transcript.truncate(len) else {
            panic!("transcript is already {} entries long", self.transcript.len());
        };
        self.signal(signal).await
    }

    /// Run a user-triggered summary.
    pub async fn try_summarize(&mut self) -> Result<SummarizeOutcome, EngineError> {
        let id = self.id();
        self.engine.generate(&id, Trigger::User).await
    }

    /// Run a user-triggered summary that must succeed.
    pub async fn summarize(&mut self) -> SummarizeOutcome {
        match self.try_summarize().await {
            Ok(outcome) => outcome,
            Err(e) => panic!("summary failed: {e}"),
        }
    }

    /// The current summary, or an empty one.
    pub async fn state(&self) -> SummaryState {
        self.engine
            .summary(&self.id())
            .await
            .unwrap_or_default()
    }

    pub async fn hidden(&self) -> Option<HideRange> {
        self.engine.hidden_range(&self.id()).await
    }

    /// Take every status message received so far.
    pub fn drain_messages(&mut self) -> Vec<StatusMessage> {
        let mut drained = Vec::new();
        while let Ok(message) = self.messages.try_recv() {
            drained.push(message);
        }
        drained
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the summary's high-water mark.
#[track_caller]
pub fn assert_summarized_through(state: &SummaryState, expected: Option<Position>) {
    assert_eq!(
        state.last_summarized(),
        expected,
        "Expected summary through {:?}, found {:?}",
        expected,
        state.last_summarized()
    );
}

/// Assert that the summary's internal invariants hold.
#[track_caller]
pub fn assert_consistent(state: &SummaryState) {
    let violations = state.invariant_violations();
    assert!(
        violations.is_empty(),
        "Summary invariants violated: {violations:?}"
    );
}

/// Assert the event titles, in order.
#[track_caller]
pub fn assert_event_titles(state: &SummaryState, expected: &[&str]) {
    let titles: Vec<&str> = state
        .facts()
        .events
        .iter()
        .map(|e| e.title.as_str())
        .collect();
    assert_eq!(titles, expected, "Unexpected event titles");
}

/// Assert that no fact was stamped past `position`.
#[track_caller]
pub fn assert_no_facts_after(state: &SummaryState, position: Position) {
    if let Some(stamp) = state.facts().max_stamp() {
        assert!(
            stamp <= position,
            "Found a fact stamped {stamp}, after {position}"
        );
    }
}

/// Assert that some message matches `predicate`.
#[track_caller]
pub fn assert_message<F>(messages: &[StatusMessage], description: &str, predicate: F)
where
    F: Fn(&StatusMessage) -> bool,
{
    assert!(
        messages.iter().any(predicate),
        "Expected a {description} message, got {messages:?}"
    );
}
