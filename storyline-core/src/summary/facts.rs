//! Structured narrative facts.
//!
//! Every fact added by a merge carries `added_at`, the transcript position
//! of the slice end that produced it. Rollback filters on that stamp.

use crate::transcript::Position;
use serde::{Deserialize, Serialize};

// ============================================================================
// Fact Types
// ============================================================================

/// A keyword describing what is currently salient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keyword {
    pub text: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
    pub added_at: Position,
}

/// A significant story event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFact {
    /// Sequential id, `evt-N`.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub time_label: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub participants: Vec<String>,
    /// Free-form category such as "combat" or "revelation".
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Importance from 0.0 to 1.0.
    #[serde(default = "default_weight")]
    pub weight: f32,
    pub added_at: Position,
}

impl EventFact {
    /// Numeric suffix of the id, if it follows the `evt-N` pattern.
    pub fn sequence(&self) -> Option<u64> {
        event_sequence(&self.id)
    }
}

/// Parse the numeric suffix of an `evt-N` id.
pub fn event_sequence(id: &str) -> Option<u64> {
    id.strip_prefix("evt-")?.parse().ok()
}

/// A character the story revolves around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainCharacter {
    pub name: String,
    pub added_at: Position,
}

/// Direction a relationship is moving in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Warming,
    Cooling,
    #[default]
    Stable,
    Volatile,
    #[serde(other)]
    Unknown,
}

impl Trend {
    /// Get the display name.
    pub fn name(&self) -> &'static str {
        match self {
            Trend::Warming => "warming",
            Trend::Cooling => "cooling",
            Trend::Stable => "stable",
            Trend::Volatile => "volatile",
            Trend::Unknown => "unknown",
        }
    }
}

/// A relationship between two characters.
///
/// Relationships are undirected for identity: `(a, b)` and `(b, a)` are the
/// same relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub from: String,
    pub to: String,
    pub label: String,
    #[serde(default)]
    pub trend: Trend,
    pub added_at: Position,
}

impl Relationship {
    /// Case-insensitive, order-insensitive identity of the pair.
    pub fn pair_key(&self) -> (String, String) {
        pair_key(&self.from, &self.to)
    }
}

/// Build the unordered pair key for two names.
pub fn pair_key(a: &str, b: &str) -> (String, String) {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A milestone along a character arc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArcMoment {
    pub text: String,
    pub added_at: Position,
}

/// A character's development over the story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterArc {
    pub name: String,
    #[serde(default)]
    pub trajectory: String,
    /// Progress from 0.0 to 1.0.
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub moments: Vec<ArcMoment>,
    pub added_at: Position,
}

/// Main characters and the relationships between them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Characters {
    #[serde(default)]
    pub main: Vec<MainCharacter>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

fn default_weight() -> f32 {
    0.5
}

// ============================================================================
// Fact Collection
// ============================================================================

/// Every kind of stamped fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactKind {
    Keyword,
    Event,
    MainCharacter,
    Relationship,
    Arc,
    ArcMoment,
}

impl FactKind {
    /// All kinds, parents before children.
    pub const ALL: [FactKind; 6] = [
        FactKind::Keyword,
        FactKind::Event,
        FactKind::MainCharacter,
        FactKind::Relationship,
        FactKind::Arc,
        FactKind::ArcMoment,
    ];
}

/// A fact carrying the position at which it was added.
pub trait Stamped {
    fn added_at(&self) -> Position;
}

macro_rules! impl_stamped {
    ($($ty:ty),*) => {
        $(impl Stamped for $ty {
            fn added_at(&self) -> Position {
                self.added_at
            }
        })*
    };
}

impl_stamped!(Keyword, EventFact, MainCharacter, Relationship, ArcMoment, CharacterArc);

/// All facts tracked for a transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Facts {
    #[serde(default)]
    pub keywords: Vec<Keyword>,
    #[serde(default)]
    pub events: Vec<EventFact>,
    #[serde(default)]
    pub characters: Characters,
    #[serde(default)]
    pub arcs: Vec<CharacterArc>,
}

impl Facts {
    /// Create an empty fact collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
            && self.events.is_empty()
            && self.characters.main.is_empty()
            && self.characters.relationships.is_empty()
            && self.arcs.is_empty()
    }

    /// Drop every fact added after `target`. Returns the number removed.
    pub fn retain_through(&mut self, target: Position) -> usize {
        let mut removed = 0;
        for kind in FactKind::ALL {
            removed += match kind {
                FactKind::Keyword => retain_stamped(&mut self.keywords, target),
                FactKind::Event => retain_stamped(&mut self.events, target),
                FactKind::MainCharacter => retain_stamped(&mut self.characters.main, target),
                FactKind::Relationship => {
                    retain_stamped(&mut self.characters.relationships, target)
                }
                FactKind::Arc => retain_stamped(&mut self.arcs, target),
                FactKind::ArcMoment => self
                    .arcs
                    .iter_mut()
                    .map(|arc| retain_stamped(&mut arc.moments, target))
                    .sum(),
            };
        }
        removed
    }

    /// Latest stamp across every fact kind.
    pub fn max_stamp(&self) -> Option<Position> {
        let keywords = self.keywords.iter().map(Stamped::added_at);
        let events = self.events.iter().map(Stamped::added_at);
        let main = self.characters.main.iter().map(Stamped::added_at);
        let relationships = self.characters.relationships.iter().map(Stamped::added_at);
        let arcs = self.arcs.iter().map(Stamped::added_at);
        let moments = self
            .arcs
            .iter()
            .flat_map(|arc| arc.moments.iter().map(Stamped::added_at));

        keywords
            .chain(events)
            .chain(main)
            .chain(relationships)
            .chain(arcs)
            .chain(moments)
            .max()
    }

    /// Highest `evt-N` suffix in use.
    pub fn max_event_sequence(&self) -> Option<u64> {
        self.events.iter().filter_map(EventFact::sequence).max()
    }

    /// Find a main character by name (case-insensitive).
    pub fn find_character(&self, name: &str) -> Option<&MainCharacter> {
        let name = name.trim().to_lowercase();
        self.characters
            .main
            .iter()
            .find(|c| c.name.to_lowercase() == name)
    }

    /// Find a relationship between two characters, in either direction.
    pub fn find_relationship(&self, a: &str, b: &str) -> Option<&Relationship> {
        let key = pair_key(a, b);
        self.characters
            .relationships
            .iter()
            .find(|r| r.pair_key() == key)
    }

    /// Find an arc by character name (case-insensitive).
    pub fn find_arc(&self, name: &str) -> Option<&CharacterArc> {
        let name = name.trim().to_lowercase();
        self.arcs.iter().find(|a| a.name.to_lowercase() == name)
    }

    /// Find an event by id.
    pub fn find_event(&self, id: &str) -> Option<&EventFact> {
        self.events.iter().find(|e| e.id == id)
    }
}

fn retain_stamped<T: Stamped>(items: &mut Vec<T>, target: Position) -> usize {
    let before = items.len();
    items.retain(|item| item.added_at() <= target);
    before - items.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, added_at: Position) -> EventFact {
        EventFact {
            id: id.to_string(),
            title: format!("Event {id}"),
            time_label: String::new(),
            summary: String::new(),
            participants: vec![],
            kind: String::new(),
            weight: 0.5,
            added_at,
        }
    }

    #[test]
    fn test_pair_key_is_unordered() {
        assert_eq!(pair_key("Alice", "bob"), pair_key("Bob ", "alice"));
    }

    #[test]
    fn test_event_sequence() {
        assert_eq!(event_sequence("evt-12"), Some(12));
        assert_eq!(event_sequence("event-12"), None);
        assert_eq!(event_sequence("evt-x"), None);
    }

    #[test]
    fn test_retain_through_filters_every_kind() {
        let mut facts = Facts::new();
        facts.keywords.push(Keyword {
            text: "tavern".to_string(),
            weight: 0.5,
            added_at: 4,
        });
        facts.events.push(event("evt-1", 4));
        facts.events.push(event("evt-2", 9));
        facts.characters.main.push(MainCharacter {
            name: "Mira".to_string(),
            added_at: 9,
        });
        facts.arcs.push(CharacterArc {
            name: "Mira".to_string(),
            trajectory: "doubt".to_string(),
            progress: 0.2,
            moments: vec![
                ArcMoment {
                    text: "first doubt".to_string(),
                    added_at: 4,
                },
                ArcMoment {
                    text: "crisis".to_string(),
                    added_at: 9,
                },
            ],
            added_at: 4,
        });

        let removed = facts.retain_through(4);
        assert_eq!(removed, 3);
        assert_eq!(facts.events.len(), 1);
        assert!(facts.characters.main.is_empty());
        assert_eq!(facts.arcs[0].moments.len(), 1);
        assert_eq!(facts.max_stamp(), Some(4));
    }

    #[test]
    fn test_trend_unknown_value() {
        let trend: Trend = serde_json::from_str("\"simmering\"").unwrap();
        assert_eq!(trend, Trend::Unknown);
        let trend: Trend = serde_json::from_str("\"warming\"").unwrap();
        assert_eq!(trend, Trend::Warming);
    }

    #[test]
    fn test_find_helpers() {
        let mut facts = Facts::new();
        facts.characters.relationships.push(Relationship {
            from: "Alice".to_string(),
            to: "Bob".to_string(),
            label: "allies".to_string(),
            trend: Trend::Warming,
            added_at: 2,
        });
        facts.events.push(event("evt-3", 2));
        assert!(facts.find_relationship("bob", "ALICE").is_some());
        assert!(facts.find_event("evt-3").is_some());
        assert_eq!(facts.max_event_sequence(), Some(3));
        assert!(facts.find_character("alice").is_none());
    }
}
