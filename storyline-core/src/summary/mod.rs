//! Incremental narrative summary.
//!
//! A [`SummaryState`] per transcript holds structured facts, the position of
//! the last summarized entry, and a snapshot for every merge so that the
//! summary can be rolled back when the transcript shrinks.

mod facts;
mod parse;
mod prompt;
mod state;
mod store;

pub use facts::{
    event_sequence, pair_key, ArcMoment, CharacterArc, Characters, EventFact, FactKind, Facts,
    Keyword, MainCharacter, Relationship, Stamped, Trend,
};
pub use parse::{
    parse_pending, ArcUpdate, CharacterInput, EventInput, FactUpdate, KeywordInput,
    PendingFacts, RelationshipInput,
};
pub use prompt::build_summary_request;
pub use state::{
    MergeReport, RollbackOutcome, Section, Snapshot, SummaryState, SummaryStats,
};
pub use store::SummaryStore;

use crate::transcript::Position;
use thiserror::Error;

/// Errors from summary state operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SummaryError {
    #[error("Slice ending at {end} does not extend past the summarized mark {last}")]
    StaleSlice { end: Position, last: Position },

    /// The transcript or the summary changed while the slice was generated.
    #[error("Summary of entries up to {end} was superseded by transcript changes")]
    Superseded { end: Position },

    #[error("Failed to parse summary: {0}")]
    Parse(String),

    #[error("Invalid {section} section: {message}")]
    InvalidSection { section: Section, message: String },

    #[error("Nothing has been summarized yet")]
    NothingSummarized,
}
