//! Summary states keyed by transcript.

use super::state::SummaryState;
use crate::config::EngineConfig;
use crate::transcript::TranscriptId;
use std::collections::HashMap;

/// All summary states, created lazily per transcript.
#[derive(Debug, Clone)]
pub struct SummaryStore {
    states: HashMap<TranscriptId, SummaryState>,
    keep_visible_count: usize,
    hide_summarized: bool,
}

impl Default for SummaryStore {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl SummaryStore {
    /// Create an empty store; new states take their window settings from
    /// `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            states: HashMap::new(),
            keep_visible_count: config.keep_visible_count,
            hide_summarized: config.hide_summarized,
        }
    }

    /// Get the state for a transcript, if one exists.
    pub fn get(&self, id: &TranscriptId) -> Option<&SummaryState> {
        self.states.get(id)
    }

    /// Get the state for a transcript, creating it on first access.
    pub fn state_mut(&mut self, id: &TranscriptId) -> &mut SummaryState {
        self.states
            .entry(id.clone())
            .or_insert_with(|| SummaryState::new(self.keep_visible_count, self.hide_summarized))
    }

    /// Install a previously persisted state.
    pub fn insert(&mut self, id: TranscriptId, state: SummaryState) -> Option<SummaryState> {
        self.states.insert(id, state)
    }

    /// Drop the state for a transcript.
    pub fn remove(&mut self, id: &TranscriptId) -> Option<SummaryState> {
        self.states.remove(id)
    }

    /// Transcripts with a state.
    pub fn transcripts(&self) -> impl Iterator<Item = &TranscriptId> {
        self.states.keys()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
