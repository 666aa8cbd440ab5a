//! Lazily built, fingerprinted search index for one transcript.

use super::collector::{event_id_from_doc, DocId, Document};
use super::index::{LexicalIndex, TantivyIndex};
use super::IndexError;
use crate::config::EngineConfig;
use crate::transcript::{Position, TranscriptId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cheap digest of the indexed source data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub chunk_count: usize,
    pub event_count: usize,
}

impl Fingerprint {
    pub fn new(chunk_count: usize, event_count: usize) -> Self {
        Self {
            chunk_count,
            event_count,
        }
    }
}

/// Everything needed to build an index from scratch.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub scope: TranscriptId,
    pub fingerprint: Fingerprint,
    pub documents: Vec<Document>,
    /// Cache epoch observed when the documents were collected.
    pub epoch: u64,
}

/// Result of a search, split by document kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHits {
    pub chunk_ids: Vec<DocId>,
    pub chunk_positions: BTreeSet<Position>,
    /// Ids of matching event facts.
    pub event_ids: Vec<String>,
    /// Scores aligned with `chunk_ids`.
    pub chunk_scores: Vec<f32>,
    pub search_time_ms: f64,
}

impl SearchHits {
    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty() && self.event_ids.is_empty()
    }
}

/// Diagnostics for a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub scope: Option<TranscriptId>,
    pub fingerprint: Option<Fingerprint>,
    pub warm: bool,
    pub documents: u64,
    pub builds: usize,
}

/// Handle to a background index build.
#[derive(Debug)]
pub struct WarmupHandle {
    task: JoinHandle<Result<(), IndexError>>,
}

impl WarmupHandle {
    /// Wait for the build to finish.
    pub async fn wait(self) -> Result<(), IndexError> {
        self.task
            .await
            .map_err(|e| IndexError::Task(e.to_string()))?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct Slot {
    index: Option<Arc<TantivyIndex>>,
    scope: Option<TranscriptId>,
    /// `None` when the index may no longer match its source.
    fingerprint: Option<Fingerprint>,
    floor_doc_ids: HashMap<Position, Vec<DocId>>,
    /// Bumped by every change, so builds started earlier know they are stale.
    epoch: u64,
}

/// Per-transcript search index cache.
pub struct SearchIndexCache {
    slot: RwLock<Slot>,
    build_lock: tokio::sync::Mutex<()>,
    builds: AtomicUsize,
    batch_size: usize,
    search_limit: usize,
}

impl Default for SearchIndexCache {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl SearchIndexCache {
    /// Create an empty cache.
    pub fn new(batch_size: usize, search_limit: usize) -> Self {
        Self {
            slot: RwLock::new(Slot::default()),
            build_lock: tokio::sync::Mutex::new(()),
            builds: AtomicUsize::new(0),
            batch_size: batch_size.max(1),
            search_limit: search_limit.max(1),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.index_batch_size, config.search_limit)
    }

    fn read(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current change epoch.
    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Number of full builds completed.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Whether an index is loaded.
    pub fn is_warm(&self) -> bool {
        self.read().index.is_some()
    }

    /// The cached index, if it was built for `scope` from matching data.
    pub fn cached(&self, scope: &TranscriptId, fingerprint: Fingerprint) -> Option<Arc<TantivyIndex>> {
        let slot = self.read();
        match (&slot.index, &slot.scope, slot.fingerprint) {
            (Some(index), Some(cached_scope), Some(cached))
                if cached_scope == scope && cached == fingerprint =>
            {
                Some(Arc::clone(index))
            }
            _ => None,
        }
    }

    /// Return the cached index or build a fresh one.
    ///
    /// Concurrent callers share a single build.
    pub async fn get_index(&self, request: BuildRequest) -> Result<Arc<TantivyIndex>, IndexError> {
        if let Some(index) = self.cached(&request.scope, request.fingerprint) {
            return Ok(index);
        }

        let _build = self.build_lock.lock().await;
        if let Some(index) = self.cached(&request.scope, request.fingerprint) {
            debug!(scope = %request.scope, "Reusing index built by a concurrent caller");
            return Ok(index);
        }

        let started = Instant::now();
        info!(
            scope = %request.scope,
            documents = request.documents.len(),
            "Building search index"
        );

        let index = Arc::new(TantivyIndex::new()?);
        let mut floor_doc_ids: HashMap<Position, Vec<DocId>> = HashMap::new();
        for batch in request.documents.chunks(self.batch_size) {
            index.add_documents(batch)?;
            for doc in batch {
                if let Some(position) = doc.kind.position() {
                    floor_doc_ids
                        .entry(position)
                        .or_default()
                        .push(doc.id.clone());
                }
            }
            tokio::task::yield_now().await;
        }
        index.commit()?;
        self.builds.fetch_add(1, Ordering::SeqCst);

        let mut slot = self.write();
        let stale = slot.epoch != request.epoch;
        slot.index = Some(Arc::clone(&index));
        slot.scope = Some(request.scope.clone());
        slot.fingerprint = (!stale).then_some(request.fingerprint);
        slot.floor_doc_ids = floor_doc_ids;

        info!(
            scope = %request.scope,
            elapsed_ms = started.elapsed().as_millis() as u64,
            stale,
            "Search index ready"
        );
        Ok(index)
    }

    /// Build in the background.
    pub fn warm_up(self: &Arc<Self>, request: BuildRequest) -> WarmupHandle {
        let cache = Arc::clone(self);
        let task = tokio::spawn(async move {
            let scope = request.scope.clone();
            let result = cache.get_index(request).await.map(|_| ());
            if let Err(e) = &result {
                warn!(%scope, error = %e, "Background index build failed");
            }
            result
        });
        WarmupHandle { task }
    }

    // ========================================================================
    // Incremental updates
    // ========================================================================

    /// Replace the documents indexed for `position`.
    ///
    /// `fingerprint` describes the source after the change. A cold cache is
    /// left cold.
    pub fn add_chunks_for_position(
        &self,
        position: Position,
        docs: &[Document],
        fingerprint: Fingerprint,
    ) -> Result<(), IndexError> {
        self.update_positions(&[position], docs, fingerprint)
    }

    /// Remove every document indexed for `position`.
    pub fn remove_documents_for_position(
        &self,
        position: Position,
        fingerprint: Fingerprint,
    ) -> Result<(), IndexError> {
        self.update_positions(&[position], &[], fingerprint)
    }

    /// Remove the documents of several positions with a single commit.
    pub fn remove_documents_for_positions(
        &self,
        positions: &[Position],
        fingerprint: Fingerprint,
    ) -> Result<(), IndexError> {
        self.update_positions(positions, &[], fingerprint)
    }

    fn update_positions(
        &self,
        positions: &[Position],
        docs: &[Document],
        fingerprint: Fingerprint,
    ) -> Result<(), IndexError> {
        let mut slot = self.write();
        slot.epoch += 1;
        let Some(index) = slot.index.clone() else {
            return Ok(());
        };
        if !index.supports_discard() {
            Self::drop_index(&mut slot);
            return Ok(());
        }

        let stale: Vec<DocId> = positions
            .iter()
            .filter_map(|p| slot.floor_doc_ids.remove(p))
            .flatten()
            .collect();
        let result = index
            .discard(&stale)
            .and_then(|_| index.add_documents(docs))
            .and_then(|_| index.commit());
        if let Err(e) = result {
            Self::drop_index(&mut slot);
            return Err(e);
        }

        for doc in docs {
            if let Some(position) = doc.kind.position() {
                slot.floor_doc_ids
                    .entry(position)
                    .or_default()
                    .push(doc.id.clone());
            }
        }
        if slot.fingerprint.is_some() {
            slot.fingerprint = Some(fingerprint);
        }

        debug!(
            ?positions,
            removed = stale.len(),
            added = docs.len(),
            "Updated indexed positions"
        );
        Ok(())
    }

    /// Add or overwrite event documents.
    pub fn add_event_documents(
        &self,
        docs: &[Document],
        fingerprint: Fingerprint,
    ) -> Result<(), IndexError> {
        let mut slot = self.write();
        slot.epoch += 1;
        let Some(index) = slot.index.clone() else {
            return Ok(());
        };

        let ids: Vec<DocId> = docs.iter().map(|d| d.id.clone()).collect();
        let result = index
            .discard(&ids)
            .and_then(|_| index.add_documents(docs))
            .and_then(|_| index.commit());
        if let Err(e) = result {
            Self::drop_index(&mut slot);
            return Err(e);
        }

        if slot.fingerprint.is_some() {
            slot.fingerprint = Some(fingerprint);
        }
        debug!(events = docs.len(), "Indexed event documents");
        Ok(())
    }

    /// Drop the index. The next `get_index` rebuilds it.
    pub fn invalidate(&self) {
        let mut slot = self.write();
        slot.epoch += 1;
        if slot.index.is_some() {
            debug!(scope = ?slot.scope, "Search index invalidated");
        }
        Self::drop_index(&mut slot);
    }

    fn drop_index(slot: &mut Slot) {
        slot.index = None;
        slot.fingerprint = None;
        slot.floor_doc_ids.clear();
    }

    /// Document ids indexed for a position.
    pub fn doc_ids_for_position(&self, position: Position) -> Vec<DocId> {
        self.read()
            .floor_doc_ids
            .get(&position)
            .cloned()
            .unwrap_or_default()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Search the loaded index. A cold cache yields nothing.
    pub fn search(&self, terms: &[String]) -> SearchHits {
        if terms.is_empty() {
            return SearchHits::default();
        }
        let Some(index) = self.read().index.clone() else {
            return SearchHits::default();
        };

        let started = Instant::now();
        let raw = match index.search(terms, self.search_limit) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Search failed");
                return SearchHits::default();
            }
        };
        if raw.is_empty() {
            return SearchHits::default();
        }

        let mut hits = SearchHits::default();
        let mut seen = HashSet::new();
        for hit in raw {
            if !seen.insert(hit.doc_id.clone()) {
                continue;
            }
            if hit.is_event {
                if let Some(event_id) = event_id_from_doc(&hit.doc_id) {
                    hits.event_ids.push(event_id.to_string());
                }
            } else {
                if let Some(position) = hit.position {
                    hits.chunk_positions.insert(position);
                }
                hits.chunk_ids.push(hit.doc_id);
                hits.chunk_scores.push(hit.score);
            }
        }
        hits.search_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        hits
    }

    pub fn stats(&self) -> IndexStats {
        let slot = self.read();
        IndexStats {
            scope: slot.scope.clone(),
            fingerprint: slot.fingerprint,
            warm: slot.index.is_some(),
            documents: slot.index.as_ref().map_or(0, |index| index.num_docs()),
            builds: self.builds(),
        }
    }
}
