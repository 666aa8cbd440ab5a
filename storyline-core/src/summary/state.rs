//! Per-transcript summary state: forward merges and snapshot rollback.

use super::facts::{
    pair_key, ArcMoment, CharacterArc, EventFact, Facts, Keyword, MainCharacter, Relationship,
};
use super::parse::{FactUpdate, PendingFacts};
use super::SummaryError;
use crate::config::DEFAULT_KEEP_VISIBLE_COUNT;
use crate::transcript::Position;
use crate::visibility::{self, HideRange, VisibilityDelta};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::ops::RangeInclusive;
use tracing::{debug, info};

/// Weight given to facts the generator did not weigh.
const DEFAULT_FACT_WEIGHT: f32 = 0.5;

/// A recorded summary high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub end_position: Position,
}

/// A fact section that can be edited as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Keywords,
    Events,
    Characters,
    Relationships,
    Arcs,
}

impl Section {
    /// Get the display name.
    pub fn name(&self) -> &'static str {
        match self {
            Section::Keywords => "keywords",
            Section::Events => "events",
            Section::Characters => "characters",
            Section::Relationships => "relationships",
            Section::Arcs => "arcs",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counts per fact kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub keywords: usize,
    pub events: usize,
    pub main_characters: usize,
    pub relationships: usize,
    pub arcs: usize,
    pub arc_moments: usize,
    pub snapshots: usize,
}

impl SummaryStats {
    /// Total number of stamped facts.
    pub fn total_facts(&self) -> usize {
        self.keywords
            + self.events
            + self.main_characters
            + self.relationships
            + self.arcs
            + self.arc_moments
    }
}

/// What a forward merge changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub end_position: Position,
    pub keywords_replaced: bool,
    /// Ids issued to the new events.
    pub events_added: Vec<String>,
    pub characters_added: usize,
    pub relationships_added: usize,
    pub relationships_updated: usize,
    pub arcs_added: usize,
    pub arcs_updated: usize,
}

/// What a rollback changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub previous: Option<Position>,
    pub target: Option<Position>,
    /// Everything was discarded.
    pub reset: bool,
    pub facts_removed: usize,
    pub snapshots_removed: usize,
    pub old_hidden: Option<HideRange>,
    pub new_hidden: Option<HideRange>,
    pub delta: VisibilityDelta,
}

impl RollbackOutcome {
    /// Whether the high-water mark moved.
    pub fn changed(&self) -> bool {
        self.previous != self.target
    }
}

/// Derived summary of one transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryState {
    /// Highest position folded into the summary.
    last_summarized: Option<Position>,
    facts: Facts,
    /// Every high-water mark reached, strictly increasing.
    snapshots: Vec<Snapshot>,
    keep_visible_count: usize,
    hide_summarized: bool,
}

impl Default for SummaryState {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_VISIBLE_COUNT, true)
    }
}

impl SummaryState {
    /// Create an empty state.
    pub fn new(keep_visible_count: usize, hide_summarized: bool) -> Self {
        Self {
            last_summarized: None,
            facts: Facts::default(),
            snapshots: Vec::new(),
            keep_visible_count,
            hide_summarized,
        }
    }

    pub fn last_summarized(&self) -> Option<Position> {
        self.last_summarized
    }

    pub fn facts(&self) -> &Facts {
        &self.facts
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn keep_visible_count(&self) -> usize {
        self.keep_visible_count
    }

    pub fn hide_summarized(&self) -> bool {
        self.hide_summarized
    }

    pub fn set_keep_visible_count(&mut self, count: usize) {
        self.keep_visible_count = count;
    }

    pub fn set_hide_summarized(&mut self, hide: bool) {
        self.hide_summarized = hide;
    }

    /// Range currently hidden, honouring the hide toggle.
    pub fn hide_range(&self) -> Option<HideRange> {
        visibility::effective_hide_range(
            self.last_summarized,
            self.keep_visible_count,
            self.hide_summarized,
        )
    }

    /// Entries not yet summarized in a transcript of `len` entries.
    pub fn pending_range(&self, len: usize) -> Option<RangeInclusive<Position>> {
        let start = self.last_summarized.map_or(0, |last| last + 1);
        let end = len.checked_sub(1)?;
        (start <= end).then_some(start..=end)
    }

    /// Number of entries not yet summarized.
    pub fn pending_count(&self, len: usize) -> usize {
        self.pending_range(len)
            .map_or(0, |range| range.end() - range.start() + 1)
    }

    /// Id the next new event will receive.
    pub fn next_event_id(&self) -> String {
        format!("evt-{}", self.facts.max_event_sequence().unwrap_or(0) + 1)
    }

    /// Counts per fact kind.
    pub fn stats(&self) -> SummaryStats {
        SummaryStats {
            keywords: self.facts.keywords.len(),
            events: self.facts.events.len(),
            main_characters: self.facts.characters.main.len(),
            relationships: self.facts.characters.relationships.len(),
            arcs: self.facts.arcs.len(),
            arc_moments: self.facts.arcs.iter().map(|a| a.moments.len()).sum(),
            snapshots: self.snapshots.len(),
        }
    }

    // ========================================================================
    // Forward merge
    // ========================================================================

    /// Fold a batch of facts derived from the slice ending at `end_position`.
    ///
    /// Not idempotent: the slice must start after `last_summarized`. The
    /// state is left untouched on error.
    pub fn merge_incremental(
        &mut self,
        pending: PendingFacts,
        end_position: Position,
    ) -> Result<MergeReport, SummaryError> {
        if let Some(last) = self.last_summarized {
            if end_position <= last {
                return Err(SummaryError::StaleSlice {
                    end: end_position,
                    last,
                });
            }
        }

        let mut facts = self.facts.clone();
        let mut report = MergeReport {
            end_position,
            ..MergeReport::default()
        };
        let mut next_sequence = facts.max_event_sequence().unwrap_or(0) + 1;

        for update in pending.into_updates() {
            match update {
                FactUpdate::Keywords(keywords) => {
                    facts.keywords = keywords
                        .iter()
                        .filter(|k| !k.text().trim().is_empty())
                        .map(|k| Keyword {
                            text: k.text().trim().to_string(),
                            weight: k.weight().unwrap_or(DEFAULT_FACT_WEIGHT).clamp(0.0, 1.0),
                            added_at: end_position,
                        })
                        .collect();
                    report.keywords_replaced = true;
                }
                FactUpdate::Event(event) => {
                    if event.title.trim().is_empty() && event.summary.trim().is_empty() {
                        continue;
                    }
                    let id = format!("evt-{next_sequence}");
                    next_sequence += 1;
                    facts.events.push(EventFact {
                        id: id.clone(),
                        title: event.title.trim().to_string(),
                        time_label: event.time_label,
                        summary: event.summary,
                        participants: event.participants,
                        kind: event.kind,
                        weight: event.weight.unwrap_or(DEFAULT_FACT_WEIGHT).clamp(0.0, 1.0),
                        added_at: end_position,
                    });
                    report.events_added.push(id);
                }
                FactUpdate::Character(character) => {
                    let name = character.name().trim();
                    if name.is_empty() || facts.find_character(name).is_some() {
                        continue;
                    }
                    facts.characters.main.push(MainCharacter {
                        name: name.to_string(),
                        added_at: end_position,
                    });
                    report.characters_added += 1;
                }
                FactUpdate::Relationship(relationship) => {
                    let from = relationship.from.trim();
                    let to = relationship.to.trim();
                    if from.is_empty() || to.is_empty() {
                        continue;
                    }
                    let key = pair_key(from, to);
                    match facts
                        .characters
                        .relationships
                        .iter_mut()
                        .find(|r| r.pair_key() == key)
                    {
                        Some(existing) => {
                            if !relationship.label.trim().is_empty() {
                                existing.label = relationship.label.trim().to_string();
                            }
                            existing.trend = relationship.trend;
                            report.relationships_updated += 1;
                        }
                        None => {
                            facts.characters.relationships.push(Relationship {
                                from: from.to_string(),
                                to: to.to_string(),
                                label: relationship.label.trim().to_string(),
                                trend: relationship.trend,
                                added_at: end_position,
                            });
                            report.relationships_added += 1;
                        }
                    }
                }
                FactUpdate::Arc(update) => {
                    let name = update.name.trim();
                    if name.is_empty() {
                        continue;
                    }
                    let lowered = name.to_lowercase();
                    let moment = update
                        .moment
                        .as_deref()
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(|text| ArcMoment {
                            text: text.to_string(),
                            added_at: end_position,
                        });
                    match facts
                        .arcs
                        .iter_mut()
                        .find(|a| a.name.to_lowercase() == lowered)
                    {
                        Some(arc) => {
                            if let Some(trajectory) = update.trajectory {
                                arc.trajectory = trajectory;
                            }
                            if let Some(progress) = update.progress {
                                arc.progress = progress.clamp(0.0, 1.0);
                            }
                            arc.moments.extend(moment);
                            report.arcs_updated += 1;
                        }
                        None => {
                            facts.arcs.push(CharacterArc {
                                name: name.to_string(),
                                trajectory: update.trajectory.unwrap_or_default(),
                                progress: update.progress.unwrap_or(0.0).clamp(0.0, 1.0),
                                moments: moment.into_iter().collect(),
                                added_at: end_position,
                            });
                            report.arcs_added += 1;
                        }
                    }
                }
            }
        }

        self.facts = facts;
        self.last_summarized = Some(end_position);
        self.snapshots.push(Snapshot { end_position });

        info!(
            end_position,
            events = report.events_added.len(),
            characters = report.characters_added,
            "Merged summary slice"
        );
        Ok(report)
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    /// Whether a transcript shrunk to `length` entries calls for a rollback.
    ///
    /// At least `min_deleted` summarized entries must have disappeared.
    pub fn needs_rollback(&self, length: usize, min_deleted: usize) -> bool {
        match self.last_summarized {
            Some(last) => length <= last && last + 1 - length >= min_deleted.max(1),
            None => false,
        }
    }

    /// Roll back to the newest snapshot that still fits in `length` entries.
    ///
    /// With no such snapshot everything is discarded.
    pub fn rollback(&mut self, length: usize) -> RollbackOutcome {
        let previous = self.last_summarized;
        let old_hidden = self.hide_range();
        let before = self.stats();

        let target = self
            .snapshots
            .iter()
            .rev()
            .map(|s| s.end_position)
            .find(|&end| end < length);

        match target {
            Some(target) => {
                let mut facts = self.facts.clone();
                facts.retain_through(target);
                self.facts = facts;
                self.snapshots.retain(|s| s.end_position <= target);
                self.last_summarized = Some(target);
            }
            None => {
                self.facts = Facts::default();
                self.snapshots.clear();
                self.last_summarized = None;
            }
        }

        let after = self.stats();
        let new_hidden = self.hide_range();
        let outcome = RollbackOutcome {
            previous,
            target,
            reset: target.is_none() && previous.is_some(),
            facts_removed: before.total_facts() - after.total_facts(),
            snapshots_removed: before.snapshots - after.snapshots,
            old_hidden,
            new_hidden,
            delta: visibility::diff(old_hidden, new_hidden),
        };

        if outcome.reset {
            info!(length, "Summary reset, no snapshot fits the transcript");
        } else if outcome.changed() {
            info!(
                length,
                ?previous,
                ?target,
                facts_removed = outcome.facts_removed,
                "Summary rolled back"
            );
        }
        outcome
    }

    /// Discard the whole summary.
    pub fn clear(&mut self) {
        self.facts = Facts::default();
        self.snapshots.clear();
        self.last_summarized = None;
        debug!("Summary cleared");
    }

    // ========================================================================
    // Section edits
    // ========================================================================

    /// Replace one fact section with user-edited JSON.
    ///
    /// Entries without a valid `addedAt` are stamped with the current
    /// high-water mark. Events without an id receive fresh ones.
    pub fn update_section(&mut self, section: Section, value: Value) -> Result<(), SummaryError> {
        let stamp = self.last_summarized.ok_or(SummaryError::NothingSummarized)?;
        let mut facts = self.facts.clone();

        match section {
            Section::Keywords => {
                facts.keywords = stamped_items(section, value, stamp, Some("text"))?;
            }
            Section::Events => {
                let mut value = value;
                issue_missing_event_ids(&mut value);
                facts.events = stamped_items(section, value, stamp, None)?;
            }
            Section::Characters => {
                facts.characters.main = stamped_items(section, value, stamp, Some("name"))?;
            }
            Section::Relationships => {
                facts.characters.relationships = stamped_items(section, value, stamp, None)?;
            }
            Section::Arcs => {
                let mut value = value;
                if let Value::Array(arcs) = &mut value {
                    for arc in arcs.iter_mut() {
                        if let Some(moments) = arc.get_mut("moments") {
                            stamp_array(moments, stamp, Some("text"));
                        }
                    }
                }
                facts.arcs = stamped_items(section, value, stamp, None)?;
            }
        }

        self.facts = facts;
        debug!(%section, "Summary section replaced");
        Ok(())
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    /// Render the summary as prompt text. Empty when nothing is tracked.
    pub fn render_text(&self) -> String {
        let facts = &self.facts;
        let mut sections = Vec::new();

        if !facts.keywords.is_empty() {
            let keywords: Vec<_> = facts.keywords.iter().map(|k| k.text.as_str()).collect();
            sections.push(format!("## Keywords\n{}", keywords.join(", ")));
        }

        if !facts.events.is_empty() {
            let mut text = String::from("## Events");
            for event in &facts.events {
                text.push_str(&format!("\n- {} ", event.id));
                if !event.time_label.is_empty() {
                    text.push_str(&format!("[{}] ", event.time_label));
                }
                text.push_str(&event.title);
                if !event.summary.is_empty() {
                    text.push_str(&format!(": {}", event.summary));
                }
                if !event.participants.is_empty() {
                    text.push_str(&format!(" ({})", event.participants.join(", ")));
                }
            }
            sections.push(text);
        }

        if !facts.characters.main.is_empty() {
            let names: Vec<_> = facts
                .characters
                .main
                .iter()
                .map(|c| c.name.as_str())
                .collect();
            sections.push(format!("## Main Characters\n{}", names.join(", ")));
        }

        if !facts.characters.relationships.is_empty() {
            let mut text = String::from("## Relationships");
            for r in &facts.characters.relationships {
                text.push_str(&format!(
                    "\n- {} & {}: {} ({})",
                    r.from,
                    r.to,
                    r.label,
                    r.trend.name()
                ));
            }
            sections.push(text);
        }

        if !facts.arcs.is_empty() {
            let mut text = String::from("## Character Arcs");
            for arc in &facts.arcs {
                text.push_str(&format!(
                    "\n- {}: {} ({:.0}%)",
                    arc.name,
                    arc.trajectory,
                    arc.progress * 100.0
                ));
                if !arc.moments.is_empty() {
                    let moments: Vec<_> = arc.moments.iter().map(|m| m.text.as_str()).collect();
                    text.push_str(&format!(". Moments: {}", moments.join("; ")));
                }
            }
            sections.push(text);
        }

        sections.join("\n\n")
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    /// Describe every broken invariant. Empty when the state is consistent.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        let newest = self.snapshots.last().map(|s| s.end_position);
        if newest != self.last_summarized {
            violations.push(format!(
                "high-water mark {:?} does not match newest snapshot {:?}",
                self.last_summarized, newest
            ));
        }

        if self
            .snapshots
            .windows(2)
            .any(|pair| pair[0].end_position >= pair[1].end_position)
        {
            violations.push("snapshots are not strictly increasing".to_string());
        }

        match (self.facts.max_stamp(), self.last_summarized) {
            (Some(stamp), None) => {
                violations.push(format!("fact stamped {stamp} with nothing summarized"));
            }
            (Some(stamp), Some(last)) if stamp > last => {
                violations.push(format!("fact stamped {stamp} beyond mark {last}"));
            }
            _ => {}
        }

        violations
    }
}

/// Stamp every object in a JSON array, wrapping bare strings under `wrap_key`.
fn stamp_array(value: &mut Value, stamp: Position, wrap_key: Option<&str>) {
    let Value::Array(items) = value else {
        return;
    };
    for item in items.iter_mut() {
        if let (Value::String(text), Some(key)) = (&*item, wrap_key) {
            let mut object = serde_json::Map::new();
            object.insert(key.to_string(), Value::String(text.clone()));
            *item = Value::Object(object);
        }
        if let Value::Object(object) = item {
            let valid = object
                .get("addedAt")
                .and_then(Value::as_u64)
                .is_some_and(|at| at as usize <= stamp);
            if !valid {
                object.insert("addedAt".to_string(), Value::from(stamp as u64));
            }
        }
    }
}

fn stamped_items<T: DeserializeOwned>(
    section: Section,
    mut value: Value,
    stamp: Position,
    wrap_key: Option<&str>,
) -> Result<Vec<T>, SummaryError> {
    if !value.is_array() {
        return Err(SummaryError::InvalidSection {
            section,
            message: "expected an array".to_string(),
        });
    }
    stamp_array(&mut value, stamp, wrap_key);
    serde_json::from_value(value).map_err(|e| SummaryError::InvalidSection {
        section,
        message: e.to_string(),
    })
}

fn issue_missing_event_ids(value: &mut Value) {
    let Value::Array(events) = value else {
        return;
    };
    let mut next = events
        .iter()
        .filter_map(|e| e.get("id").and_then(Value::as_str))
        .filter_map(super::facts::event_sequence)
        .max()
        .unwrap_or(0)
        + 1;
    for event in events.iter_mut() {
        if let Value::Object(object) = event {
            let has_id = object
                .get("id")
                .and_then(Value::as_str)
                .is_some_and(|id| !id.is_empty());
            if !has_id {
                object.insert("id".to_string(), Value::String(format!("evt-{next}")));
                next += 1;
            }
        }
    }
}
