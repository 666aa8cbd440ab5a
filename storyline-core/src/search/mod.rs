//! Lexical search over transcript chunks and summarized events.
//!
//! The index is pure cache: it is built lazily from a [`ChunkLedger`] and
//! the current events, reused while its [`Fingerprint`] matches, and kept
//! current with per-position updates where possible.

mod cache;
mod chunks;
mod collector;
mod index;

pub use cache::{BuildRequest, Fingerprint, IndexStats, SearchHits, SearchIndexCache, WarmupHandle};
pub use chunks::ChunkLedger;
pub use collector::{
    chunk_doc_id, chunk_entry, chunk_text, clean_summary, event_doc_id, event_document,
    event_documents, event_id_from_doc, extract_query_terms, Chunk, DocId, DocKind, Document,
};
pub use index::{LexicalIndex, RawHit, TantivyIndex};

use thiserror::Error;

/// Errors from building or updating a search index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index backend error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("Index writer lock poisoned")]
    Poisoned,

    #[error("Index build task failed: {0}")]
    Task(String),
}
