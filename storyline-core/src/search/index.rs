//! In-memory lexical index.

use super::collector::{DocId, DocKind, Document};
use super::IndexError;
use crate::transcript::Position;
use std::sync::{Mutex, MutexGuard};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

/// Smallest heap tantivy accepts for a single indexing thread.
const WRITER_MEMORY_BUDGET: usize = 15_000_000;

/// A scored hit straight from the index.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    pub doc_id: DocId,
    pub position: Option<Position>,
    pub is_event: bool,
    pub score: f32,
}

/// Operations the search cache needs from an index.
///
/// Writes are staged until `commit`.
pub trait LexicalIndex: Send + Sync {
    /// Stage documents for addition.
    fn add_documents(&self, docs: &[Document]) -> Result<(), IndexError>;

    /// Stage removal of documents by id.
    fn discard(&self, ids: &[DocId]) -> Result<(), IndexError>;

    /// Make staged changes visible to searches.
    fn commit(&self) -> Result<(), IndexError>;

    /// Run an OR query over the terms.
    fn search(&self, terms: &[String], limit: usize) -> Result<Vec<RawHit>, IndexError>;

    /// Whether `discard` removes documents. Indexes that cannot discard are
    /// rebuilt instead.
    fn supports_discard(&self) -> bool;

    /// Number of live documents.
    fn num_docs(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
struct Fields {
    doc_id: Field,
    kind: Field,
    position: Field,
    text: Field,
}

/// A tantivy index held entirely in RAM.
pub struct TantivyIndex {
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    fields: Fields,
}

impl std::fmt::Debug for TantivyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TantivyIndex")
            .field("num_docs", &self.num_docs())
            .finish()
    }
}

impl TantivyIndex {
    /// Create an empty index.
    pub fn new() -> Result<Self, IndexError> {
        let mut builder = Schema::builder();
        let fields = Fields {
            doc_id: builder.add_text_field("doc_id", STRING | STORED),
            kind: builder.add_text_field("kind", STRING | STORED),
            position: builder.add_u64_field("position", STORED),
            text: builder.add_text_field("text", TEXT),
        };
        let index = Index::create_in_ram(builder.build());
        let writer: IndexWriter = index.writer_with_num_threads(1, WRITER_MEMORY_BUDGET)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            writer: Mutex::new(writer),
            reader,
            fields,
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, IndexWriter>, IndexError> {
        self.writer.lock().map_err(|_| IndexError::Poisoned)
    }

    fn to_tantivy(&self, doc: &Document) -> TantivyDocument {
        let mut document = TantivyDocument::default();
        document.add_text(self.fields.doc_id, &doc.id);
        document.add_text(self.fields.kind, doc.kind.tag());
        if let Some(position) = doc.kind.position() {
            document.add_u64(self.fields.position, position as u64);
        }
        document.add_text(self.fields.text, &doc.text);
        document
    }
}

/// Quote multi-word terms and strip query syntax.
fn query_text(terms: &[String]) -> String {
    terms
        .iter()
        .map(|term| {
            term.chars()
                .map(|c| if c.is_alphanumeric() { c } else { ' ' })
                .collect::<String>()
        })
        .map(|term| term.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|term| !term.is_empty())
        .map(|term| {
            if term.contains(' ') {
                format!("\"{term}\"")
            } else {
                term
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl LexicalIndex for TantivyIndex {
    fn add_documents(&self, docs: &[Document]) -> Result<(), IndexError> {
        let writer = self.writer()?;
        for doc in docs {
            writer.add_document(self.to_tantivy(doc))?;
        }
        Ok(())
    }

    fn discard(&self, ids: &[DocId]) -> Result<(), IndexError> {
        let writer = self.writer()?;
        for id in ids {
            writer.delete_term(Term::from_field_text(self.fields.doc_id, id));
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), IndexError> {
        self.writer()?.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    fn search(&self, terms: &[String], limit: usize) -> Result<Vec<RawHit>, IndexError> {
        let query = query_text(terms);
        let searcher = self.reader.searcher();
        if query.is_empty() || searcher.num_docs() == 0 {
            return Ok(Vec::new());
        }

        let parser = QueryParser::for_index(&self.index, vec![self.fields.text]);
        let (query, _errors) = parser.parse_query_lenient(&query);
        let top = searcher.search(&query, &TopDocs::with_limit(limit.max(1)))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let doc: TantivyDocument = searcher.doc(address)?;
            let Some(doc_id) = doc
                .get_first(self.fields.doc_id)
                .and_then(|v| v.as_str())
                .map(str::to_string)
            else {
                continue;
            };
            let is_event = doc
                .get_first(self.fields.kind)
                .and_then(|v| v.as_str())
                .is_some_and(|kind| kind == DocKind::Event.tag());
            let position = doc
                .get_first(self.fields.position)
                .and_then(|v| v.as_u64())
                .map(|p| p as Position);
            hits.push(RawHit {
                doc_id,
                position,
                is_event,
                score,
            });
        }
        Ok(hits)
    }

    fn supports_discard(&self) -> bool {
        true
    }

    fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}
