//! Transcript model and mutation signals.
//!
//! The host owns the transcript. The core only observes it through
//! [`TranscriptSignal`]s and keeps a mirror for slicing and chunking.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Zero-based index of an entry within the current transcript.
///
/// Positions of later entries shift when earlier entries are deleted.
pub type Position = usize;

/// Identity of a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TranscriptId(String);

impl TranscriptId {
    /// Create a transcript id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TranscriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TranscriptId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TranscriptId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Who authored an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Get the display name.
    pub fn name(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

/// A single transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub role: Role,
    /// Speaker name, when the host knows one.
    #[serde(default)]
    pub name: Option<String>,
    pub text: String,
}

impl Entry {
    /// Create an entry.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            name: None,
            text: text.into(),
        }
    }

    /// Create a user entry.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Create an assistant entry.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Create a system entry.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    /// Set the speaker name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The speaker label used when rendering.
    pub fn speaker(&self) -> &str {
        self.name.as_deref().unwrap_or(self.role.name())
    }
}

/// Render a run of entries for a prompt, numbering them from `start`.
pub fn render_slice(entries: &[Entry], start: Position) -> String {
    let mut text = String::new();
    for (offset, entry) in entries.iter().enumerate() {
        text.push_str(&format!(
            "[#{}] {}: {}\n",
            start + offset,
            entry.speaker(),
            entry.text.trim()
        ));
    }
    text
}

/// A lifecycle signal from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptSignal {
    /// An entry was added at the end.
    Appended { entry: Entry },
    /// An entry was edited in place.
    Edited { position: Position, entry: Entry },
    /// `count` entries starting at `position` were removed.
    Deleted { position: Position, count: usize },
    /// The entry at `position` was replaced by an alternative.
    Swiped { position: Position, entry: Entry },
    /// The host switched to a different transcript. Any summary is discarded.
    Switched { entries: Vec<Entry> },
}

impl TranscriptSignal {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            TranscriptSignal::Appended { .. } => "appended",
            TranscriptSignal::Edited { .. } => "edited",
            TranscriptSignal::Deleted { .. } => "deleted",
            TranscriptSignal::Swiped { .. } => "swiped",
            TranscriptSignal::Switched { .. } => "switched",
        }
    }
}

/// A simple owned transcript.
///
/// Hosts that keep their own storage only need [`TranscriptSignal`]; this
/// type is for hosts without one and for tests. Every mutation returns the
/// signal describing it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    id: Option<TranscriptId>,
    entries: Vec<Entry>,
}

impl Transcript {
    /// Create an empty transcript.
    pub fn new(id: impl Into<TranscriptId>) -> Self {
        Self {
            id: Some(id.into()),
            entries: Vec::new(),
        }
    }

    /// The transcript id.
    pub fn id(&self) -> TranscriptId {
        self.id.clone().unwrap_or_else(|| TranscriptId::new("default"))
    }

    /// All entries.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the transcript is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry.
    pub fn append(&mut self, entry: Entry) -> TranscriptSignal {
        self.entries.push(entry.clone());
        TranscriptSignal::Appended { entry }
    }

    /// Replace the text of an entry. Returns `None` if out of range.
    pub fn edit(&mut self, position: Position, text: impl Into<String>) -> Option<TranscriptSignal> {
        let entry = self.entries.get_mut(position)?;
        entry.text = text.into();
        Some(TranscriptSignal::Edited {
            position,
            entry: entry.clone(),
        })
    }

    /// Replace an entry with an alternative. Returns `None` if out of range.
    pub fn swipe(&mut self, position: Position, text: impl Into<String>) -> Option<TranscriptSignal> {
        let current = self.entries.get(position)?;
        let entry = Entry {
            role: current.role,
            name: current.name.clone(),
            text: text.into(),
        };
        self.entries[position] = entry.clone();
        Some(TranscriptSignal::Swiped { position, entry })
    }

    /// Delete `count` entries starting at `position`.
    pub fn delete(&mut self, position: Position, count: usize) -> Option<TranscriptSignal> {
        if position >= self.entries.len() || count == 0 {
            return None;
        }
        let end = position.saturating_add(count).min(self.entries.len());
        self.entries.drain(position..end);
        Some(TranscriptSignal::Deleted {
            position,
            count: end - position,
        })
    }

    /// Keep only the first `len` entries.
    pub fn truncate(&mut self, len: usize) -> Option<TranscriptSignal> {
        let count = self.entries.len().checked_sub(len)?;
        self.delete(len, count)
    }

    /// Signal announcing this whole transcript to the core.
    pub fn switched(&self) -> TranscriptSignal {
        TranscriptSignal::Switched {
            entries: self.entries.clone(),
        }
    }
}
