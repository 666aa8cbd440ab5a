//! Single-flight summary generation.
//!
//! At most one run per transcript is in flight. Runs can be cancelled,
//! are bounded by a timeout, and background runs retry with a fixed
//! backoff.

use crate::config::EngineConfig;
use crate::messages::Trigger;
use crate::summary::{parse_pending, MergeReport, PendingFacts};
use crate::transcript::TranscriptId;
use futures::future::{AbortHandle, AbortRegistration, Abortable};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use storyline_llm::{generate_text, GenerationRequest, TextGenerator};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors from a generation run.
#[derive(Debug, Clone, Error)]
pub enum SummarizeError {
    #[error("Generation failed: {0}")]
    Generation(#[from] storyline_llm::Error),

    #[error("Could not read the generated summary: {0}")]
    Parse(String),

    #[error("Generation cancelled")]
    Cancelled,
}

/// How a generation request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SummarizeOutcome {
    /// New facts were merged.
    Merged(MergeReport),
    /// Another run was already in flight.
    Rejected,
    /// No unsummarized entries.
    NothingPending,
}

/// Marks a transcript as busy until dropped.
pub struct RunGuard<'a> {
    summarizer: &'a Summarizer,
    transcript: TranscriptId,
    run_id: Uuid,
    handle: AbortHandle,
    registration: Option<AbortRegistration>,
    released: bool,
}

impl RunGuard<'_> {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn transcript(&self) -> &TranscriptId {
        &self.transcript
    }

    /// Whether [`Summarizer::cancel`] reached this run.
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_aborted()
    }

    /// Run `commit` unless the run was cancelled, then release the
    /// transcript.
    ///
    /// The in-flight table stays locked throughout, so a cancel either
    /// lands before the commit and prevents it, or finds no run.
    pub fn commit<T>(&mut self, commit: impl FnOnce() -> T) -> Result<T, SummarizeError> {
        let summarizer = self.summarizer;
        let mut in_flight = summarizer.in_flight();
        if self.handle.is_aborted() {
            debug!(transcript = %self.transcript, run_id = %self.run_id, "Cancelled before commit");
            return Err(SummarizeError::Cancelled);
        }
        let value = commit();
        in_flight.remove(&self.transcript);
        self.released = true;
        Ok(value)
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.summarizer.in_flight().remove(&self.transcript);
        }
        debug!(transcript = %self.transcript, run_id = %self.run_id, "Run finished");
    }
}

/// Runs the text generator and parses its output.
pub struct Summarizer {
    generator: Arc<dyn TextGenerator>,
    in_flight: Mutex<HashMap<TranscriptId, AbortHandle>>,
    retry_attempts: u32,
    retry_backoff: Duration,
    timeout: Duration,
}

impl Summarizer {
    /// Create a summarizer around a generator.
    pub fn new(generator: Arc<dyn TextGenerator>, config: &EngineConfig) -> Self {
        Self {
            generator,
            in_flight: Mutex::new(HashMap::new()),
            retry_attempts: config.retry_attempts.max(1),
            retry_backoff: config.retry_backoff,
            timeout: config.generation_timeout,
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<TranscriptId, AbortHandle>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the transcript for a run. `None` if a run is already in flight.
    pub fn begin(&self, transcript: &TranscriptId) -> Option<RunGuard<'_>> {
        let mut in_flight = self.in_flight();
        if in_flight.contains_key(transcript) {
            return None;
        }
        let (handle, registration) = AbortHandle::new_pair();
        in_flight.insert(transcript.clone(), handle.clone());

        Some(RunGuard {
            summarizer: self,
            transcript: transcript.clone(),
            run_id: Uuid::new_v4(),
            handle,
            registration: Some(registration),
            released: false,
        })
    }

    /// Whether a run is in flight for the transcript.
    pub fn is_running(&self, transcript: &TranscriptId) -> bool {
        self.in_flight().contains_key(transcript)
    }

    /// Abort the run in flight. Returns `false` if there was none.
    pub fn cancel(&self, transcript: &TranscriptId) -> bool {
        match self.in_flight().get(transcript) {
            Some(handle) => {
                handle.abort();
                info!(%transcript, "Generation cancelled");
                true
            }
            None => false,
        }
    }

    /// Generate and parse facts for a claimed run.
    ///
    /// `on_progress` receives the number of characters received so far.
    pub async fn run<F>(
        &self,
        guard: &mut RunGuard<'_>,
        request: GenerationRequest,
        trigger: Trigger,
        on_progress: F,
    ) -> Result<PendingFacts, SummarizeError>
    where
        F: FnMut(usize) + Send,
    {
        let registration = guard
            .registration
            .take()
            .ok_or(SummarizeError::Cancelled)?;
        let attempts = match trigger {
            Trigger::User => 1,
            Trigger::Background => self.retry_attempts,
        };

        let work = self.attempt_all(request, attempts, on_progress);
        match Abortable::new(work, registration).await {
            Ok(result) => result,
            Err(_aborted) => Err(SummarizeError::Cancelled),
        }
    }

    async fn attempt_all<F>(
        &self,
        request: GenerationRequest,
        attempts: u32,
        mut on_progress: F,
    ) -> Result<PendingFacts, SummarizeError>
    where
        F: FnMut(usize) + Send,
    {
        let mut attempt = 1;
        loop {
            match self.attempt(request.clone(), &mut on_progress).await {
                Ok(pending) => return Ok(pending),
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "Summary attempt failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt<F>(
        &self,
        request: GenerationRequest,
        on_progress: &mut F,
    ) -> Result<PendingFacts, SummarizeError>
    where
        F: FnMut(usize) + Send,
    {
        let generation = generate_text(self.generator.as_ref(), request, |chars| {
            on_progress(chars)
        });
        let response = tokio::time::timeout(self.timeout, generation)
            .await
            .map_err(|_| storyline_llm::Error::Timeout(self.timeout))??;

        parse_pending(&response.text).map_err(|e| SummarizeError::Parse(e.to_string()))
    }
}
