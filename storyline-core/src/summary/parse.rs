//! Parsing of generator output into pending facts.

use super::SummaryError;
use serde::{Deserialize, Serialize};
use storyline_llm::extract_json;

/// Top-level keys a summary response may carry.
const RESPONSE_KEYS: [&str; 5] = [
    "keywords",
    "events",
    "newCharacters",
    "newRelationships",
    "arcUpdates",
];

/// Facts produced by one generation run, not yet stamped or merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFacts {
    /// Replacement keyword set.
    #[serde(default)]
    pub keywords: Vec<KeywordInput>,
    #[serde(default)]
    pub events: Vec<EventInput>,
    #[serde(default)]
    pub new_characters: Vec<CharacterInput>,
    #[serde(default)]
    pub new_relationships: Vec<RelationshipInput>,
    #[serde(default)]
    pub arc_updates: Vec<ArcUpdate>,
}

impl PendingFacts {
    /// Check if the batch carries nothing.
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
            && self.events.is_empty()
            && self.new_characters.is_empty()
            && self.new_relationships.is_empty()
            && self.arc_updates.is_empty()
    }

    /// Flatten the batch into individual updates, in merge order.
    pub fn into_updates(self) -> Vec<FactUpdate> {
        let mut updates = Vec::new();
        if !self.keywords.is_empty() {
            updates.push(FactUpdate::Keywords(self.keywords));
        }
        updates.extend(self.events.into_iter().map(FactUpdate::Event));
        updates.extend(self.new_characters.into_iter().map(FactUpdate::Character));
        updates.extend(
            self.new_relationships
                .into_iter()
                .map(FactUpdate::Relationship),
        );
        updates.extend(self.arc_updates.into_iter().map(FactUpdate::Arc));
        updates
    }
}

/// A single change to apply during a merge.
#[derive(Debug, Clone, PartialEq)]
pub enum FactUpdate {
    /// Replaces the whole keyword set.
    Keywords(Vec<KeywordInput>),
    Event(EventInput),
    Character(CharacterInput),
    Relationship(RelationshipInput),
    Arc(ArcUpdate),
}

/// A keyword, either bare or weighted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeywordInput {
    Plain(String),
    Weighted {
        text: String,
        #[serde(default)]
        weight: Option<f32>,
    },
}

impl KeywordInput {
    pub fn text(&self) -> &str {
        match self {
            KeywordInput::Plain(text) => text,
            KeywordInput::Weighted { text, .. } => text,
        }
    }

    pub fn weight(&self) -> Option<f32> {
        match self {
            KeywordInput::Plain(_) => None,
            KeywordInput::Weighted { weight, .. } => *weight,
        }
    }
}

/// An event as the generator reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    /// Ignored on merge; ids are always issued by the store.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub time_label: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub weight: Option<f32>,
}

/// A new main character, either a bare name or an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CharacterInput {
    Name(String),
    Named { name: String },
}

impl CharacterInput {
    pub fn name(&self) -> &str {
        match self {
            CharacterInput::Name(name) => name,
            CharacterInput::Named { name } => name,
        }
    }
}

/// A relationship to upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipInput {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub trend: super::facts::Trend,
}

/// An update to a character arc.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArcUpdate {
    pub name: String,
    #[serde(default)]
    pub trajectory: Option<String>,
    #[serde(default)]
    pub progress: Option<f32>,
    /// New milestone, appended to the arc.
    #[serde(default)]
    pub moment: Option<String>,
}

/// Parse generator output into pending facts.
///
/// Accepts raw JSON or JSON wrapped in a markdown fence. The top level must
/// be an object carrying at least one of the known sections.
pub fn parse_pending(text: &str) -> Result<PendingFacts, SummaryError> {
    let json = extract_json(text);
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| SummaryError::Parse(format!("invalid JSON: {e}")))?;

    let object = value
        .as_object()
        .ok_or_else(|| SummaryError::Parse("expected a JSON object".to_string()))?;
    if !RESPONSE_KEYS.iter().any(|key| object.contains_key(*key)) {
        return Err(SummaryError::Parse(
            "response has none of the expected sections".to_string(),
        ));
    }

    serde_json::from_value(value).map_err(|e| SummaryError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::facts::Trend;

    #[test]
    fn test_parse_full_response() {
        let text = r#"```json
{
  "keywords": ["harbor", {"text": "storm", "weight": 0.9}],
  "events": [{"id": "evt-1", "title": "Arrival", "timeLabel": "Dawn", "summary": "They land.", "participants": ["Mira"], "type": "travel", "weight": 0.4}],
  "newCharacters": ["Mira", {"name": "Tom"}],
  "newRelationships": [{"from": "Mira", "to": "Tom", "label": "rivals", "trend": "cooling"}],
  "arcUpdates": [{"name": "Mira", "trajectory": "hope", "progress": 0.3, "moment": "sees the sea"}]
}
```"#;
        let pending = parse_pending(text).unwrap();
        assert_eq!(pending.keywords.len(), 2);
        assert_eq!(pending.keywords[1].text(), "storm");
        assert_eq!(pending.keywords[1].weight(), Some(0.9));
        assert_eq!(pending.events[0].time_label, "Dawn");
        assert_eq!(pending.events[0].kind, "travel");
        assert_eq!(pending.new_characters[1].name(), "Tom");
        assert_eq!(pending.new_relationships[0].trend, Trend::Cooling);
        assert_eq!(pending.arc_updates[0].moment.as_deref(), Some("sees the sea"));
    }

    #[test]
    fn test_into_updates_order() {
        let pending = parse_pending(
            r#"{"arcUpdates": [{"name": "Mira"}], "keywords": ["a"], "events": [{"title": "x"}]}"#,
        )
        .unwrap();
        let updates = pending.into_updates();
        assert_eq!(updates.len(), 3);
        assert!(matches!(updates[0], FactUpdate::Keywords(_)));
        assert!(matches!(updates[1], FactUpdate::Event(_)));
        assert!(matches!(updates[2], FactUpdate::Arc(_)));
    }

    #[test]
    fn test_parse_partial_response() {
        let pending = parse_pending(r#"{"events": []}"#).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            parse_pending("I could not summarize this."),
            Err(SummaryError::Parse(_))
        ));
        assert!(matches!(parse_pending("[1, 2]"), Err(SummaryError::Parse(_))));
        assert!(matches!(
            parse_pending(r#"{"answer": 42}"#),
            Err(SummaryError::Parse(_))
        ));
        assert!(matches!(
            parse_pending(r#"{"events": "none"}"#),
            Err(SummaryError::Parse(_))
        ));
    }
}
