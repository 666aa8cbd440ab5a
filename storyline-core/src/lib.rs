//! Incremental narrative summary and search index for long, editable
//! transcripts.
//!
//! This crate provides:
//! - A structured summary that grows slice by slice and rolls back when the
//!   transcript shrinks
//! - A visibility window that hides summarized entries from live context
//! - A lexical search index over transcript chunks and summarized events,
//!   built lazily and kept current per position
//! - Single-flight summary generation with cancellation and retries
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use storyline_core::{Engine, EngineConfig, Entry, Transcript, Trigger};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let generator = Arc::new(MyBackend::new());
//!     let (engine, mut status) = Engine::new(EngineConfig::default(), generator);
//!     engine.mark_ready();
//!
//!     let mut transcript = Transcript::new("chat-1");
//!     let signal = transcript.append(Entry::user("We reach the harbor at dusk."));
//!     engine.handle_signal(&transcript.id(), signal).await?;
//!
//!     engine.generate(&transcript.id(), Trigger::User).await?;
//!     let hits = engine.search_text(&transcript.id(), "harbor").await;
//!     println!("{:?}", hits.chunk_positions);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod messages;
pub mod search;
pub mod summarizer;
pub mod summary;
pub mod telemetry;
pub mod testing;
pub mod transcript;
pub mod visibility;
pub mod watcher;

// Primary public API
pub use config::{EngineConfig, GenerationSettings};
pub use engine::{Engine, EngineError, SignalReport};
pub use messages::{StatusMessage, Trigger, UiRequest};
pub use search::{Fingerprint, IndexError, IndexStats, SearchHits, SearchIndexCache};
pub use summarizer::{SummarizeError, SummarizeOutcome, Summarizer};
pub use summary::{
    MergeReport, PendingFacts, RollbackOutcome, Section, SummaryError, SummaryState,
    SummaryStore,
};
pub use testing::{MockGenerator, MockReply, SummaryReply, TestHarness};
pub use transcript::{Entry, Position, Role, Transcript, TranscriptId, TranscriptSignal};
pub use visibility::{HideRange, VisibilityDelta, VisibilityWindow};
pub use watcher::{MutationWatcher, RollbackPolicy, TranscriptMirror};

pub use storyline_llm::TextGenerator;
