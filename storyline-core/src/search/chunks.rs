//! Per-position chunk bookkeeping.

use super::collector::{chunk_entry, Chunk, Document};
use crate::config::DEFAULT_CHUNK_MAX_CHARS;
use crate::transcript::{Entry, Position};

/// Chunks for every transcript position, kept in step with the entries.
///
/// Tracks the total chunk count so the index fingerprint is O(1).
#[derive(Debug, Clone)]
pub struct ChunkLedger {
    by_position: Vec<Vec<Chunk>>,
    total: usize,
    max_chars: usize,
}

impl Default for ChunkLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_MAX_CHARS)
    }
}

impl ChunkLedger {
    /// Create an empty ledger.
    pub fn new(max_chars: usize) -> Self {
        Self {
            by_position: Vec::new(),
            total: 0,
            max_chars,
        }
    }

    /// Rechunk every entry.
    pub fn rebuild(&mut self, entries: &[Entry]) {
        self.by_position = entries
            .iter()
            .enumerate()
            .map(|(position, entry)| chunk_entry(position, entry, self.max_chars))
            .collect();
        self.total = self.by_position.iter().map(Vec::len).sum();
    }

    /// Chunk a new entry at the end.
    pub fn push(&mut self, entry: &Entry) -> &[Chunk] {
        let position = self.by_position.len();
        let chunks = chunk_entry(position, entry, self.max_chars);
        self.total += chunks.len();
        self.by_position.push(chunks);
        &self.by_position[position]
    }

    /// Rechunk the entry at `position`. Returns `None` if out of range.
    pub fn replace(&mut self, position: Position, entry: &Entry) -> Option<&[Chunk]> {
        let chunks = chunk_entry(position, entry, self.max_chars);
        let slot = self.by_position.get_mut(position)?;
        self.total = self.total - slot.len() + chunks.len();
        *slot = chunks;
        Some(slot.as_slice())
    }

    /// Remove `count` positions starting at `position`, shifting later
    /// chunks down.
    pub fn remove(&mut self, position: Position, count: usize) {
        if position >= self.by_position.len() {
            return;
        }
        let end = (position + count).min(self.by_position.len());
        let removed: usize = self
            .by_position
            .drain(position..end)
            .map(|chunks| chunks.len())
            .sum();
        self.total -= removed;

        for (offset, chunks) in self.by_position[position..].iter_mut().enumerate() {
            for chunk in chunks.iter_mut() {
                chunk.position = position + offset;
            }
        }
    }

    /// Chunks at a position.
    pub fn chunks_at(&self, position: Position) -> &[Chunk] {
        self.by_position
            .get(position)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Documents for the chunks at a position.
    pub fn documents_at(&self, position: Position) -> Vec<Document> {
        self.chunks_at(position)
            .iter()
            .map(Chunk::to_document)
            .collect()
    }

    /// Documents for every chunk.
    pub fn documents(&self) -> Vec<Document> {
        self.by_position
            .iter()
            .flatten()
            .map(Chunk::to_document)
            .collect()
    }

    /// Total number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.total
    }

    /// Number of positions tracked.
    pub fn len(&self) -> usize {
        self.by_position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_position.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize) -> Vec<Entry> {
        (0..n)
            .map(|i| Entry::user(format!("Entry number {i} mentions the lighthouse.")))
            .collect()
    }

    #[test]
    fn test_rebuild_counts_chunks() {
        let mut ledger = ChunkLedger::new(400);
        let mut list = entries(3);
        list.push(Entry::system("hidden"));
        ledger.rebuild(&list);
        assert_eq!(ledger.len(), 4);
        assert_eq!(ledger.chunk_count(), 3);
        assert!(ledger.chunks_at(3).is_empty());
    }

    #[test]
    fn test_push_and_replace() {
        let mut ledger = ChunkLedger::new(20);
        ledger.push(&Entry::user("short"));
        assert_eq!(ledger.chunk_count(), 1);

        let chunks = ledger
            .replace(0, &Entry::user("a much longer entry. that needs two chunks."))
            .unwrap()
            .to_vec();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.position == 0));
        assert_eq!(ledger.chunk_count(), chunks.len());
        assert!(ledger.replace(5, &Entry::user("x")).is_none());
    }

    #[test]
    fn test_remove_shifts_positions() {
        let mut ledger = ChunkLedger::new(400);
        ledger.rebuild(&entries(6));
        ledger.remove(1, 2);

        assert_eq!(ledger.len(), 4);
        assert_eq!(ledger.chunk_count(), 4);
        assert_eq!(ledger.chunks_at(1)[0].position, 1);
        assert!(ledger.chunks_at(1)[0].text.contains("number 3"));
        assert_eq!(ledger.documents_at(3)[0].id, "chunk:3:0");

        ledger.remove(10, 1);
        assert_eq!(ledger.len(), 4);
    }
}
