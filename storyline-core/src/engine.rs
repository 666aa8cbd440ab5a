//! Engine - the primary public API for hosts.
//!
//! The engine mirrors every transcript it is told about and keeps three
//! derived views in step with it: the incremental summary, the visibility
//! window over summarized entries, and the search index. Status goes out
//! through the channel returned by [`Engine::new`].

use crate::config::EngineConfig;
use crate::messages::{Outbox, StatusMessage, Trigger, UiRequest};
use crate::search::{
    event_document, event_documents, extract_query_terms, BuildRequest, Document, Fingerprint,
    IndexError, IndexStats, SearchHits, SearchIndexCache, TantivyIndex, WarmupHandle,
};
use crate::summarizer::{RunGuard, SummarizeError, SummarizeOutcome, Summarizer};
use crate::summary::{
    build_summary_request, MergeReport, PendingFacts, RollbackOutcome, Section, SummaryError,
    SummaryState, SummaryStore,
};
use crate::transcript::{render_slice, Entry, Position, TranscriptId, TranscriptSignal};
use crate::visibility::{HideRange, VisibilityDelta, VisibilityWindow};
use crate::watcher::{Mutation, MutationWatcher, SignalError, TranscriptMirror};
use std::collections::HashMap;
use std::sync::Arc;
use storyline_llm::TextGenerator;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Characters between two progress messages.
const PROGRESS_STEP: usize = 256;

/// Query terms taken from free text by [`Engine::search_text`].
const MAX_QUERY_TERMS: usize = 24;

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Summarizer error: {0}")]
    Summarize(#[from] SummarizeError),

    #[error("Summary error: {0}")]
    Summary(#[from] SummaryError),

    #[error("Search index error: {0}")]
    Index(#[from] IndexError),

    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),

    #[error("Unknown transcript: {0}")]
    UnknownTranscript(TranscriptId),
}

/// What handling one transcript signal did.
#[derive(Debug)]
pub struct SignalReport {
    pub mutation: Mutation,
    /// Set when the signal rolled the summary back.
    pub rollback: Option<RollbackOutcome>,
    pub visibility: VisibilityDelta,
    /// Background summary started by the signal.
    pub background: Option<JoinHandle<Result<SummarizeOutcome, EngineError>>>,
    /// Index rebuild started by the signal.
    pub warmup: Option<WarmupHandle>,
}

// ============================================================================
// Per-transcript state
// ============================================================================

struct TranscriptSlot {
    mirror: TranscriptMirror,
    window: VisibilityWindow,
    index: Arc<SearchIndexCache>,
}

impl TranscriptSlot {
    fn new(config: &EngineConfig) -> Self {
        Self {
            mirror: TranscriptMirror::new(config.chunk_max_chars),
            window: VisibilityWindow::new(),
            index: Arc::new(SearchIndexCache::from_config(config)),
        }
    }

    fn fingerprint(&self, state: &SummaryState) -> Fingerprint {
        Fingerprint::new(
            self.mirror.chunks().chunk_count(),
            state.facts().events.len(),
        )
    }

    fn build_request(&self, id: &TranscriptId, state: &SummaryState) -> BuildRequest {
        let mut documents = self.mirror.chunks().documents();
        documents.extend(event_documents(&state.facts().events));
        BuildRequest {
            scope: id.clone(),
            fingerprint: self.fingerprint(state),
            documents,
            epoch: self.index.epoch(),
        }
    }

    /// Drop the index, rebuilding in the background if it was loaded.
    fn reset_index(&self, id: &TranscriptId, state: &SummaryState) -> Option<WarmupHandle> {
        let was_warm = self.index.is_warm();
        self.index.invalidate();
        was_warm.then(|| self.index.warm_up(self.build_request(id, state)))
    }

    /// Follow a mutation with per-position index updates.
    fn sync_positions(&self, state: &SummaryState, mutation: &Mutation) -> Result<(), IndexError> {
        let fingerprint = self.fingerprint(state);
        if !mutation.removed.is_empty() {
            self.index
                .remove_documents_for_positions(&mutation.removed, fingerprint)?;
        }
        for &position in &mutation.touched {
            let docs = self.mirror.chunks().documents_at(position);
            self.index
                .add_chunks_for_position(position, &docs, fingerprint)?;
        }
        Ok(())
    }

    fn index_events(&self, state: &SummaryState, event_ids: &[String]) -> Result<(), IndexError> {
        let docs: Vec<Document> = event_ids
            .iter()
            .filter_map(|id| state.facts().find_event(id))
            .map(event_document)
            .collect();
        self.index.add_event_documents(&docs, self.fingerprint(state))
    }
}

struct Workspace {
    store: SummaryStore,
    transcripts: HashMap<TranscriptId, TranscriptSlot>,
}

impl Workspace {
    fn parts(&mut self, id: &TranscriptId) -> Option<(&mut TranscriptSlot, &mut SummaryState)> {
        let slot = self.transcripts.get_mut(id)?;
        Some((slot, self.store.state_mut(id)))
    }

    fn parts_or_insert(
        &mut self,
        id: &TranscriptId,
        config: &EngineConfig,
    ) -> (&mut TranscriptSlot, &mut SummaryState) {
        let slot = self
            .transcripts
            .entry(id.clone())
            .or_insert_with(|| TranscriptSlot::new(config));
        (slot, self.store.state_mut(id))
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    config: EngineConfig,
    workspace: Mutex<Workspace>,
    summarizer: Summarizer,
    watcher: MutationWatcher,
    outbox: Outbox,
}

/// Keeps summaries, visibility and search indexes in step with transcripts.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine and the receiver for its status messages.
    ///
    /// Messages are held back until the surface reports ready.
    pub fn new(
        config: EngineConfig,
        generator: Arc<dyn TextGenerator>,
    ) -> (Self, mpsc::UnboundedReceiver<StatusMessage>) {
        let (outbox, rx) = Outbox::channel();
        let inner = EngineInner {
            workspace: Mutex::new(Workspace {
                store: SummaryStore::from_config(&config),
                transcripts: HashMap::new(),
            }),
            summarizer: Summarizer::new(generator, &config),
            watcher: MutationWatcher::from_config(&config),
            outbox,
            config,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn send(&self, message: StatusMessage) {
        self.inner.outbox.send(message);
    }

    fn announce_visibility(
        &self,
        id: &TranscriptId,
        window: &VisibilityWindow,
        delta: &VisibilityDelta,
    ) {
        if delta.is_empty() {
            return;
        }
        debug!(transcript = %id, ?delta, "Visibility changed");
        self.send(StatusMessage::VisibilityChanged {
            transcript: id.clone(),
            hidden: window.applied(),
            delta: *delta,
        });
    }

    fn announce_summary(&self, id: &TranscriptId, state: &SummaryState) {
        self.send(StatusMessage::SummaryDataChanged {
            transcript: id.clone(),
            last_summarized: state.last_summarized(),
            stats: state.stats(),
        });
    }

    // ========================================================================
    // Transcript signals
    // ========================================================================

    /// Apply a transcript signal.
    ///
    /// Rollback runs first, then the visibility window and the index follow,
    /// then a background summary starts if enough entries are pending.
    pub async fn handle_signal(
        &self,
        id: &TranscriptId,
        signal: TranscriptSignal,
    ) -> Result<SignalReport, EngineError> {
        let inner = &*self.inner;
        let mut workspace = inner.workspace.lock().await;
        let (slot, state) = workspace.parts_or_insert(id, &inner.config);

        let mutation = slot.mirror.apply(&signal)?;
        debug!(
            transcript = %id,
            signal = signal.name(),
            previous_len = mutation.previous_len,
            len = mutation.len,
            "Transcript signal"
        );

        let rollback = inner.watcher.check_rollback(state, &mutation);
        let rolled_back = rollback.as_ref().is_some_and(RollbackOutcome::changed);

        let visibility = slot.window.update(state.hide_range());
        self.announce_visibility(id, &slot.window, &visibility);

        let warmup = if rolled_back || mutation.reindex {
            slot.reset_index(id, state)
        } else {
            if let Err(e) = slot.sync_positions(state, &mutation) {
                warn!(transcript = %id, error = %e, "Incremental index update failed");
                slot.index.invalidate();
            }
            None
        };

        if rolled_back {
            self.announce_summary(id, state);
        }

        let wants_summary =
            inner.watcher.wants_summary(state, &mutation) && !inner.summarizer.is_running(id);
        drop(workspace);

        let background = wants_summary.then(|| {
            let engine = self.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.generate(&id, Trigger::Background).await })
        });

        Ok(SignalReport {
            mutation,
            rollback,
            visibility,
            background,
            warmup,
        })
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Summarize the entries after the high-water mark.
    ///
    /// The merge is discarded if the transcript or the summary changed in a
    /// way that invalidates the slice while the generator was running.
    pub async fn generate(
        &self,
        id: &TranscriptId,
        trigger: Trigger,
    ) -> Result<SummarizeOutcome, EngineError> {
        let inner = &*self.inner;
        let Some(mut guard) = inner.summarizer.begin(id) else {
            info!(transcript = %id, ?trigger, "Generation rejected, a run is in flight");
            self.send(StatusMessage::GenerationRejected {
                transcript: id.clone(),
                message: "A summary is already being generated".to_string(),
            });
            return Ok(SummarizeOutcome::Rejected);
        };

        let (request, start, end, mark) = {
            let mut workspace = inner.workspace.lock().await;
            let Some((slot, state)) = workspace.parts(id) else {
                let err = EngineError::UnknownTranscript(id.clone());
                warn!(transcript = %id, ?trigger, "Generation requested for an unknown transcript");
                self.send(StatusMessage::GenerationError {
                    transcript: id.clone(),
                    run_id: None,
                    message: err.to_string(),
                });
                return Err(err);
            };
            let Some(range) = state.pending_range(slot.mirror.len()) else {
                debug!(transcript = %id, "Nothing to summarize");
                return Ok(SummarizeOutcome::NothingPending);
            };
            let (start, end) = (*range.start(), *range.end());
            let slice = render_slice(&slot.mirror.entries()[range], start);
            let request = build_summary_request(
                &state.render_text(),
                &slice,
                &state.next_event_id(),
                &inner.config.generation,
            );
            (request, start, end, state.last_summarized())
        };

        let run_id = guard.run_id();
        info!(transcript = %id, %run_id, start, end, ?trigger, "Generating summary");
        self.send(StatusMessage::GenerationStateChanged {
            transcript: id.clone(),
            running: true,
        });
        self.send(StatusMessage::GenerationStarted {
            transcript: id.clone(),
            run_id,
            start,
            end,
            trigger,
        });

        let progress = self.progress_reporter(id, run_id);
        let result = match inner.summarizer.run(&mut guard, request, trigger, progress).await {
            Ok(pending) => self.commit(id, &mut guard, pending, end, mark).await,
            Err(e) => Err(e.into()),
        };
        drop(guard);

        match result {
            Ok(report) => {
                info!(
                    transcript = %id,
                    %run_id,
                    end,
                    events = report.events_added.len(),
                    "Summary merged"
                );
                self.send(StatusMessage::GenerationCompleted {
                    transcript: id.clone(),
                    run_id,
                    end,
                    events_added: report.events_added.len(),
                });
                self.send(StatusMessage::GenerationStateChanged {
                    transcript: id.clone(),
                    running: false,
                });
                Ok(SummarizeOutcome::Merged(report))
            }
            Err(e) => {
                warn!(transcript = %id, %run_id, error = %e, "Summary generation failed");
                self.send(StatusMessage::GenerationError {
                    transcript: id.clone(),
                    run_id: Some(run_id),
                    message: e.to_string(),
                });
                self.send(StatusMessage::GenerationStateChanged {
                    transcript: id.clone(),
                    running: false,
                });
                Err(e)
            }
        }
    }

    fn progress_reporter(&self, id: &TranscriptId, run_id: Uuid) -> impl FnMut(usize) + Send {
        let inner = Arc::clone(&self.inner);
        let transcript = id.clone();
        let mut reported: Option<usize> = None;
        move |received_chars| {
            let due = reported.map_or(true, |last| received_chars >= last + PROGRESS_STEP);
            if due {
                reported = Some(received_chars);
                inner.outbox.send(StatusMessage::GenerationProgress {
                    transcript: transcript.clone(),
                    run_id,
                    received_chars,
                });
            }
        }
    }

    async fn commit(
        &self,
        id: &TranscriptId,
        guard: &mut RunGuard<'_>,
        pending: PendingFacts,
        end: Position,
        mark: Option<Position>,
    ) -> Result<MergeReport, EngineError> {
        let mut workspace = self.inner.workspace.lock().await;
        let (slot, state) = workspace
            .parts(id)
            .ok_or_else(|| EngineError::UnknownTranscript(id.clone()))?;

        if state.last_summarized() != mark || slot.mirror.len() <= end {
            info!(
                transcript = %id,
                end,
                ?mark,
                current = ?state.last_summarized(),
                len = slot.mirror.len(),
                "Discarding summary of a changed transcript"
            );
            return Err(SummaryError::Superseded { end }.into());
        }

        let report = guard.commit(|| state.merge_incremental(pending, end))??;

        let delta = slot.window.update(state.hide_range());
        self.announce_visibility(id, &slot.window, &delta);

        if let Err(e) = slot.index_events(state, &report.events_added) {
            warn!(transcript = %id, error = %e, "Failed to index new events");
        }

        self.announce_summary(id, state);
        Ok(report)
    }

    /// Cancel the run in flight. Returns `false` if there was none.
    pub fn cancel(&self, id: &TranscriptId) -> bool {
        self.inner.summarizer.cancel(id)
    }

    pub fn is_generating(&self, id: &TranscriptId) -> bool {
        self.inner.summarizer.is_running(id)
    }

    // ========================================================================
    // Summary edits
    // ========================================================================

    /// Discard the summary and unhide everything.
    pub async fn clear(&self, id: &TranscriptId) -> VisibilityDelta {
        let mut workspace = self.inner.workspace.lock().await;
        let (slot, state) = workspace.parts_or_insert(id, &self.inner.config);

        state.clear();
        let delta = slot.window.update(state.hide_range());
        self.announce_visibility(id, &slot.window, &delta);
        slot.reset_index(id, state);
        self.announce_summary(id, state);

        info!(transcript = %id, "Summary cleared");
        delta
    }

    /// Replace one section of the summary with edited JSON.
    pub async fn update_section(
        &self,
        id: &TranscriptId,
        section: Section,
        value: serde_json::Value,
    ) -> Result<(), EngineError> {
        let mut workspace = self.inner.workspace.lock().await;
        let (slot, state) = workspace.parts_or_insert(id, &self.inner.config);

        state.update_section(section, value)?;
        if section == Section::Events {
            slot.reset_index(id, state);
        }
        self.announce_summary(id, state);
        Ok(())
    }

    /// Switch hiding of summarized entries on or off.
    pub async fn set_hide_summarized(&self, id: &TranscriptId, enabled: bool) -> VisibilityDelta {
        self.update_window(id, |state| state.set_hide_summarized(enabled))
            .await
    }

    /// Change how many summarized entries stay visible.
    pub async fn set_keep_visible_count(&self, id: &TranscriptId, count: usize) -> VisibilityDelta {
        self.update_window(id, |state| state.set_keep_visible_count(count))
            .await
    }

    async fn update_window(
        &self,
        id: &TranscriptId,
        change: impl FnOnce(&mut SummaryState),
    ) -> VisibilityDelta {
        let mut workspace = self.inner.workspace.lock().await;
        let (slot, state) = workspace.parts_or_insert(id, &self.inner.config);

        change(state);
        let delta = slot.window.update(state.hide_range());
        self.announce_visibility(id, &slot.window, &delta);
        delta
    }

    /// Install a previously saved summary for a transcript.
    pub async fn restore_summary(&self, id: &TranscriptId, restored: SummaryState) -> VisibilityDelta {
        let mut workspace = self.inner.workspace.lock().await;
        workspace.store.insert(id.clone(), restored);
        let (slot, state) = workspace.parts_or_insert(id, &self.inner.config);

        let delta = slot.window.update(state.hide_range());
        self.announce_visibility(id, &slot.window, &delta);
        slot.reset_index(id, state);
        self.announce_summary(id, state);
        delta
    }

    // ========================================================================
    // Presentation requests
    // ========================================================================

    /// Handle a request from the presentation surface.
    pub async fn handle_request(&self, request: UiRequest) -> Result<(), EngineError> {
        match request {
            UiRequest::Ready => {
                let flushed = self.mark_ready();
                debug!(flushed, "Presentation surface ready");
            }
            UiRequest::Generate { transcript } => {
                self.generate(&transcript, Trigger::User).await?;
            }
            UiRequest::Cancel { transcript } => {
                self.cancel(&transcript);
            }
            UiRequest::Clear { transcript } => {
                self.clear(&transcript).await;
            }
            UiRequest::UpdateSection {
                transcript,
                section,
                value,
            } => {
                self.update_section(&transcript, section, value).await?;
            }
            UiRequest::ToggleHide {
                transcript,
                enabled,
            } => {
                self.set_hide_summarized(&transcript, enabled).await;
            }
            UiRequest::UpdateKeepVisibleCount { transcript, count } => {
                self.set_keep_visible_count(&transcript, count).await;
            }
        }
        Ok(())
    }

    /// Flush queued status messages. Returns how many were flushed.
    pub fn mark_ready(&self) -> usize {
        self.inner.outbox.mark_ready()
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Make sure the transcript's index is loaded and current.
    async fn ready_index(
        &self,
        id: &TranscriptId,
    ) -> Result<(Arc<SearchIndexCache>, Arc<TantivyIndex>), EngineError> {
        let (cache, request) = {
            let mut workspace = self.inner.workspace.lock().await;
            let (slot, state) = workspace
                .parts(id)
                .ok_or_else(|| EngineError::UnknownTranscript(id.clone()))?;
            if let Some(index) = slot.index.cached(id, slot.fingerprint(state)) {
                return Ok((Arc::clone(&slot.index), index));
            }
            (Arc::clone(&slot.index), slot.build_request(id, state))
        };
        let index = cache.get_index(request).await?;
        Ok((cache, index))
    }

    /// The search index for a transcript, built if missing or out of date.
    pub async fn get_index(&self, id: &TranscriptId) -> Result<Arc<TantivyIndex>, EngineError> {
        let (_, index) = self.ready_index(id).await?;
        Ok(index)
    }

    /// Build the index in the background.
    pub async fn warm_up(&self, id: &TranscriptId) -> Option<WarmupHandle> {
        let mut workspace = self.inner.workspace.lock().await;
        let (slot, state) = workspace.parts(id)?;
        Some(slot.index.warm_up(slot.build_request(id, state)))
    }

    /// Search chunks and events. Index failures yield no hits.
    pub async fn search(&self, id: &TranscriptId, terms: &[String]) -> SearchHits {
        if terms.is_empty() {
            return SearchHits::default();
        }
        match self.ready_index(id).await {
            Ok((cache, _)) => cache.search(terms),
            Err(e) => {
                warn!(transcript = %id, error = %e, "Search index unavailable");
                SearchHits::default()
            }
        }
    }

    /// Search with terms taken from free text.
    pub async fn search_text(&self, id: &TranscriptId, text: &str) -> SearchHits {
        let terms = extract_query_terms(text, MAX_QUERY_TERMS);
        self.search(id, &terms).await
    }

    pub async fn index_stats(&self, id: &TranscriptId) -> Option<IndexStats> {
        let workspace = self.inner.workspace.lock().await;
        workspace.transcripts.get(id).map(|slot| slot.index.stats())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// A copy of the summary for a transcript.
    pub async fn summary(&self, id: &TranscriptId) -> Option<SummaryState> {
        self.inner.workspace.lock().await.store.get(id).cloned()
    }

    /// The mirrored entries of a transcript.
    pub async fn entries(&self, id: &TranscriptId) -> Vec<Entry> {
        let workspace = self.inner.workspace.lock().await;
        workspace
            .transcripts
            .get(id)
            .map(|slot| slot.mirror.entries().to_vec())
            .unwrap_or_default()
    }

    /// The range currently hidden from the host.
    pub async fn hidden_range(&self, id: &TranscriptId) -> Option<HideRange> {
        let workspace = self.inner.workspace.lock().await;
        workspace
            .transcripts
            .get(id)
            .and_then(|slot| slot.window.applied())
    }

    pub async fn is_hidden(&self, id: &TranscriptId, position: Position) -> bool {
        self.hidden_range(id)
            .await
            .is_some_and(|range| range.contains(position))
    }
}
