//! Turns transcript entries and event facts into searchable documents.

use crate::summary::EventFact;
use crate::transcript::{Entry, Position, Role};
use lazy_static::lazy_static;
use std::collections::HashSet;

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her",
        "was", "one", "our", "out", "has", "him", "his", "how", "its", "may", "she", "who",
        "did", "get", "got", "let", "say", "too", "use", "that", "with", "have", "this",
        "will", "your", "from", "they", "them", "then", "than", "been", "were", "what",
        "when", "where", "which", "while", "would", "there", "their", "about", "could",
        "should", "into", "just", "like", "some", "more", "very", "also", "only", "over",
        "here", "does", "done", "each", "much", "such", "what's", "it's", "i'm",
    ]
    .into_iter()
    .collect();
}

/// Identifier of an indexed document.
pub type DocId = String;

/// What a document was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocKind {
    /// A slice of a transcript entry.
    Chunk { position: Position },
    /// A summarized event.
    Event,
}

impl DocKind {
    /// Stored tag for this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            DocKind::Chunk { .. } => "chunk",
            DocKind::Event => "event",
        }
    }

    /// Position the document came from, for chunks.
    pub fn position(&self) -> Option<Position> {
        match self {
            DocKind::Chunk { position } => Some(*position),
            DocKind::Event => None,
        }
    }
}

/// A document ready for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocId,
    pub kind: DocKind,
    pub text: String,
}

/// A slice of one transcript entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub position: Position,
    /// Order within the entry.
    pub index: usize,
    pub text: String,
}

impl Chunk {
    /// Document id for this chunk.
    pub fn doc_id(&self) -> DocId {
        chunk_doc_id(self.position, self.index)
    }

    /// Convert into an indexable document.
    pub fn to_document(&self) -> Document {
        Document {
            id: self.doc_id(),
            kind: DocKind::Chunk {
                position: self.position,
            },
            text: self.text.clone(),
        }
    }
}

/// Document id of the `index`th chunk at `position`.
pub fn chunk_doc_id(position: Position, index: usize) -> DocId {
    format!("chunk:{position}:{index}")
}

/// Document id of an event.
pub fn event_doc_id(event_id: &str) -> DocId {
    format!("event:{event_id}")
}

/// Event id behind an event document id.
pub fn event_id_from_doc(doc_id: &str) -> Option<&str> {
    doc_id.strip_prefix("event:")
}

// ============================================================================
// Chunking
// ============================================================================

/// Chunk a transcript entry. System entries produce nothing.
pub fn chunk_entry(position: Position, entry: &Entry, max_chars: usize) -> Vec<Chunk> {
    if entry.role == Role::System {
        return Vec::new();
    }
    chunk_text(&entry.text, max_chars)
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            position,
            index,
            text,
        })
        .collect()
}

/// Split text into chunks of at most `max_chars` characters.
///
/// Paragraphs are kept whole when they fit, otherwise split on sentences,
/// then on words. Small neighbouring pieces are packed together.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if char_len(paragraph) <= max_chars {
            pieces.push(paragraph.to_string());
            continue;
        }
        for sentence in split_sentences(paragraph) {
            if char_len(sentence) <= max_chars {
                pieces.push(sentence.to_string());
            } else {
                pieces.extend(split_words(sentence, max_chars));
            }
        }
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for piece in pieces {
        if !current.is_empty() && char_len(&current) + 1 + char_len(&piece) > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&piece);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split on sentence-ending punctuation, keeping closing quotes attached.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if !matches!(next, '.' | '!' | '?' | '"' | '\'' | ')' | ']') {
                break;
            }
            end = j + next.len_utf8();
            chars.next();
        }
        let sentence = text[start..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = end;
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

fn split_words(text: &str, max_chars: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if char_len(word) > max_chars {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = word.chars().collect();
            parts.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
            continue;
        }
        if !current.is_empty() && char_len(&current) + 1 + char_len(word) > max_chars {
            parts.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

// ============================================================================
// Events
// ============================================================================

/// Strip position references and collapse whitespace.
pub fn clean_summary(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(idx) = rest.find(['[', '(']) {
        let (before, tail) = rest.split_at(idx);
        cleaned.push_str(before);
        match position_ref_len(tail) {
            Some(len) => {
                cleaned.push(' ');
                rest = &tail[len..];
            }
            None => {
                cleaned.push_str(&tail[..1]);
                rest = &tail[1..];
            }
        }
    }
    cleaned.push_str(rest);

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Byte length of a `[#N]` or `(#N)` reference at the start of `text`.
fn position_ref_len(text: &str) -> Option<usize> {
    let close = match text.as_bytes().first()? {
        b'[' => ']',
        b'(' => ')',
        _ => return None,
    };
    let inner = text[1..].strip_prefix('#')?;
    let digits = inner.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    inner[digits..].starts_with(close).then_some(digits + 3)
}

/// Build the document for an event: title, participants and summary.
pub fn event_document(event: &EventFact) -> Document {
    let mut text = event.title.clone();
    if !event.participants.is_empty() {
        text.push(' ');
        text.push_str(&event.participants.join(" "));
    }
    let summary = clean_summary(&event.summary);
    if !summary.is_empty() {
        text.push(' ');
        text.push_str(&summary);
    }
    Document {
        id: event_doc_id(&event.id),
        kind: DocKind::Event,
        text,
    }
}

/// Documents for every event.
pub fn event_documents(events: &[EventFact]) -> Vec<Document> {
    events.iter().map(event_document).collect()
}

// ============================================================================
// Query terms
// ============================================================================

/// Pull search terms out of free text.
///
/// Lowercased words of three or more characters, stop words removed,
/// de-duplicated in order of first appearance and capped at `max_terms`.
pub fn extract_query_terms(text: &str, max_terms: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut terms = Vec::new();

    for word in text
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\'').to_lowercase())
    {
        if terms.len() >= max_terms {
            break;
        }
        if word.chars().count() < 3 || STOP_WORDS.contains(word.as_str()) {
            continue;
        }
        if seen.insert(word.clone()) {
            terms.push(word);
        }
    }
    terms
}
