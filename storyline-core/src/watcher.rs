//! Observes transcript mutations.
//!
//! A [`TranscriptMirror`] follows the host transcript through signals and
//! reports what each one changed. The [`MutationWatcher`] decides whether
//! the change calls for a rollback or a background summary.

use crate::config::{EngineConfig, DEFAULT_ROLLBACK_MIN_DELETED};
use crate::search::ChunkLedger;
use crate::summary::{RollbackOutcome, SummaryState};
use crate::transcript::{Entry, Position, TranscriptSignal};
use thiserror::Error;
use tracing::debug;

/// Errors from applying a signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("Position {position} is outside a transcript of {len} entries")]
    OutOfRange { position: Position, len: usize },
}

/// Kind of change a signal made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Appended,
    Edited,
    Deleted,
    Swiped,
    Switched,
}

/// What a signal changed in the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub previous_len: usize,
    pub len: usize,
    /// Positions whose documents no longer exist.
    pub removed: Vec<Position>,
    /// Positions whose documents must be (re)indexed.
    pub touched: Vec<Position>,
    /// Positions shifted or were all replaced; per-position index updates
    /// cannot follow.
    pub reindex: bool,
}

/// Local copy of a host transcript with its chunks.
#[derive(Debug, Clone, Default)]
pub struct TranscriptMirror {
    entries: Vec<Entry>,
    chunks: ChunkLedger,
}

impl TranscriptMirror {
    /// Create an empty mirror.
    pub fn new(chunk_max_chars: usize) -> Self {
        Self {
            entries: Vec::new(),
            chunks: ChunkLedger::new(chunk_max_chars),
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn chunks(&self) -> &ChunkLedger {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check(&self, position: Position) -> Result<(), SignalError> {
        if position < self.entries.len() {
            Ok(())
        } else {
            Err(SignalError::OutOfRange {
                position,
                len: self.entries.len(),
            })
        }
    }

    /// Apply a signal. The mirror is unchanged on error.
    pub fn apply(&mut self, signal: &TranscriptSignal) -> Result<Mutation, SignalError> {
        let previous_len = self.entries.len();
        let mut mutation = Mutation {
            kind: MutationKind::Appended,
            previous_len,
            len: previous_len,
            removed: Vec::new(),
            touched: Vec::new(),
            reindex: false,
        };

        match signal {
            TranscriptSignal::Appended { entry } => {
                self.entries.push(entry.clone());
                self.chunks.push(entry);
                mutation.touched.push(previous_len);
            }
            TranscriptSignal::Edited { position, entry }
            | TranscriptSignal::Swiped { position, entry } => {
                self.check(*position)?;
                self.entries[*position] = entry.clone();
                self.chunks.replace(*position, entry);
                mutation.kind = if matches!(signal, TranscriptSignal::Edited { .. }) {
                    MutationKind::Edited
                } else {
                    MutationKind::Swiped
                };
                mutation.touched.push(*position);
            }
            TranscriptSignal::Deleted { position, count } => {
                self.check(*position)?;
                let end = position.saturating_add(*count).min(previous_len);
                mutation.kind = MutationKind::Deleted;
                if end == *position {
                    return Ok(mutation);
                }
                self.entries.drain(*position..end);
                self.chunks.remove(*position, end - position);
                if end == previous_len {
                    mutation.removed = (*position..end).collect();
                } else {
                    mutation.reindex = true;
                }
            }
            TranscriptSignal::Switched { entries } => {
                self.entries = entries.clone();
                self.chunks.rebuild(entries);
                mutation.kind = MutationKind::Switched;
                mutation.reindex = true;
            }
        }

        mutation.len = self.entries.len();
        Ok(mutation)
    }
}

/// When deletions roll the summary back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackPolicy {
    /// Summarized entries that must be lost before a rollback runs.
    pub min_deleted: usize,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            min_deleted: DEFAULT_ROLLBACK_MIN_DELETED,
        }
    }
}

/// Decides what a mutation means for the summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutationWatcher {
    policy: RollbackPolicy,
    auto_summarize_after: usize,
}

impl MutationWatcher {
    pub fn new(policy: RollbackPolicy, auto_summarize_after: usize) -> Self {
        Self {
            policy,
            auto_summarize_after,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            RollbackPolicy {
                min_deleted: config.rollback_min_deleted.max(1),
            },
            config.auto_summarize_after,
        )
    }

    pub fn policy(&self) -> RollbackPolicy {
        self.policy
    }

    /// Roll the summary back if the mutation removed enough summarized
    /// entries.
    ///
    /// Smaller removals across the mark are left alone: regenerating the
    /// latest reply deletes one entry and appends another. A switch to
    /// another transcript discards the summary whatever its length.
    pub fn check_rollback(
        &self,
        state: &mut SummaryState,
        mutation: &Mutation,
    ) -> Option<RollbackOutcome> {
        if mutation.kind == MutationKind::Switched {
            return state
                .last_summarized()
                .is_some()
                .then(|| state.rollback(0));
        }
        if !state.needs_rollback(mutation.len, self.policy.min_deleted) {
            if state.last_summarized().is_some_and(|last| mutation.len <= last) {
                debug!(
                    len = mutation.len,
                    last = ?state.last_summarized(),
                    "Deletion below rollback threshold, summary kept"
                );
            }
            return None;
        }
        Some(state.rollback(mutation.len))
    }

    /// Whether the mutation should start a background summary.
    pub fn wants_summary(&self, state: &SummaryState, mutation: &Mutation) -> bool {
        self.auto_summarize_after > 0
            && matches!(mutation.kind, MutationKind::Appended | MutationKind::Edited)
            && state.pending_count(mutation.len) >= self.auto_summarize_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::{EventInput, PendingFacts};
    use crate::transcript::Transcript;

    fn mirror_with(n: usize) -> (TranscriptMirror, Transcript) {
        let mut mirror = TranscriptMirror::new(400);
        let mut transcript = Transcript::new("chat");
        for i in 0..n {
            let signal = transcript.append(Entry::user(format!("line {i}")));
            mirror.apply(&signal).unwrap();
        }
        (mirror, transcript)
    }

    fn summarized_to(end: Position) -> SummaryState {
        let mut state = SummaryState::default();
        let pending = PendingFacts {
            events: vec![EventInput {
                title: "Something".to_string(),
                ..EventInput::default()
            }],
            ..PendingFacts::default()
        };
        state.merge_incremental(pending, end).unwrap();
        state
    }

    #[test]
    fn test_append_touches_new_position() {
        let (mut mirror, mut transcript) = mirror_with(2);
        let mutation = mirror.apply(&transcript.append(Entry::assistant("hi"))).unwrap();
        assert_eq!(mutation.kind, MutationKind::Appended);
        assert_eq!(mutation.touched, vec![2]);
        assert_eq!((mutation.previous_len, mutation.len), (2, 3));
        assert_eq!(mirror.chunks().chunk_count(), 3);
    }

    #[test]
    fn test_tail_delete_lists_removed_positions() {
        let (mut mirror, mut transcript) = mirror_with(6);
        let mutation = mirror.apply(&transcript.delete(4, 2).unwrap()).unwrap();
        assert_eq!(mutation.removed, vec![4, 5]);
        assert!(!mutation.reindex);
        assert_eq!(mirror.len(), 4);
    }

    #[test]
    fn test_middle_delete_requires_reindex() {
        let (mut mirror, mut transcript) = mirror_with(6);
        let mutation = mirror.apply(&transcript.delete(1, 1).unwrap()).unwrap();
        assert!(mutation.reindex);
        assert_eq!(mirror.entries()[1].text, "line 2");
    }

    #[test]
    fn test_out_of_range_signal_is_rejected() {
        let (mut mirror, _) = mirror_with(2);
        let err = mirror
            .apply(&TranscriptSignal::Edited {
                position: 5,
                entry: Entry::user("x"),
            })
            .unwrap_err();
        assert_eq!(err, SignalError::OutOfRange { position: 5, len: 2 });
        assert_eq!(mirror.len(), 2);
    }

    #[test]
    fn test_swipe_and_switch() {
        let (mut mirror, mut transcript) = mirror_with(3);
        let mutation = mirror.apply(&transcript.swipe(2, "alt").unwrap()).unwrap();
        assert_eq!(mutation.kind, MutationKind::Swiped);
        assert_eq!(mirror.entries()[2].text, "alt");

        let mutation = mirror
            .apply(&TranscriptSignal::Switched {
                entries: vec![Entry::user("fresh")],
            })
            .unwrap();
        assert_eq!(mutation.kind, MutationKind::Switched);
        assert!(mutation.reindex);
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn test_rollback_respects_threshold() {
        let watcher = MutationWatcher::default();
        let (mut mirror, mut transcript) = mirror_with(12);
        let mut state = summarized_to(11);

        let mutation = mirror.apply(&transcript.delete(11, 1).unwrap()).unwrap();
        assert!(watcher.check_rollback(&mut state, &mutation).is_none());
        assert_eq!(state.last_summarized(), Some(11));

        let mutation = mirror.apply(&transcript.delete(10, 1).unwrap()).unwrap();
        let outcome = watcher.check_rollback(&mut state, &mutation).unwrap();
        assert!(outcome.reset);
        assert_eq!(state.last_summarized(), None);
    }

    #[test]
    fn test_configurable_threshold() {
        let watcher = MutationWatcher::new(RollbackPolicy { min_deleted: 1 }, 0);
        let (mut mirror, mut transcript) = mirror_with(12);
        let mut state = summarized_to(11);

        let mutation = mirror.apply(&transcript.delete(11, 1).unwrap()).unwrap();
        assert!(watcher.check_rollback(&mut state, &mutation).is_some());
    }

    #[test]
    fn test_delete_to_end_with_huge_count() {
        let (mut mirror, _) = mirror_with(3);
        let mutation = mirror
            .apply(&TranscriptSignal::Deleted {
                position: 1,
                count: usize::MAX,
            })
            .unwrap();
        assert_eq!(mutation.removed, vec![1, 2]);
        assert!(!mutation.reindex);
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror.chunks().chunk_count(), 1);
    }

    #[test]
    fn test_empty_delete_changes_nothing() {
        let (mut mirror, _) = mirror_with(4);
        let mutation = mirror
            .apply(&TranscriptSignal::Deleted {
                position: 1,
                count: 0,
            })
            .unwrap();
        assert_eq!(mutation.kind, MutationKind::Deleted);
        assert!(!mutation.reindex);
        assert!(mutation.removed.is_empty());
        assert_eq!((mutation.previous_len, mutation.len), (4, 4));
        assert_eq!(mirror.entries()[1].text, "line 1");
    }

    #[test]
    fn test_switch_discards_summary_of_any_length() {
        let watcher = MutationWatcher::default();
        let (mut mirror, _) = mirror_with(10);
        let mut state = summarized_to(9);

        let entries: Vec<_> = (0..12).map(|i| Entry::user(format!("other {i}"))).collect();
        let mutation = mirror.apply(&TranscriptSignal::Switched { entries }).unwrap();
        let outcome = watcher.check_rollback(&mut state, &mutation).unwrap();
        assert!(outcome.reset);
        assert_eq!(state.last_summarized(), None);
        assert!(state.facts().is_empty());

        let mutation = mirror
            .apply(&TranscriptSignal::Switched { entries: Vec::new() })
            .unwrap();
        assert!(watcher.check_rollback(&mut state, &mutation).is_none());
    }

    #[test]
    fn test_wants_summary() {
        let watcher = MutationWatcher::new(RollbackPolicy::default(), 3);
        let (mut mirror, mut transcript) = mirror_with(2);
        let state = SummaryState::default();

        let mutation = mirror.apply(&transcript.append(Entry::user("x"))).unwrap();
        assert!(watcher.wants_summary(&state, &mutation));

        let mutation = mirror.apply(&transcript.delete(0, 1).unwrap()).unwrap();
        assert!(!watcher.wants_summary(&state, &mutation));

        let disabled = MutationWatcher::default();
        let mutation = mirror.apply(&transcript.append(Entry::user("y"))).unwrap();
        assert!(!disabled.wants_summary(&state, &mutation));
    }
}
