//! Visibility window over summarized entries.
//!
//! Once entries are folded into the summary, all but the most recent
//! `keep_visible` of them are hidden from the live context. The host only
//! ever receives the delta between the old and new hidden ranges.

use crate::transcript::Position;
use serde::{Deserialize, Serialize};

/// An inclusive range of hidden positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HideRange {
    pub start: Position,
    pub end: Position,
}

impl HideRange {
    /// Create a range covering `start..=end`.
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Number of positions covered.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) + 1
    }

    /// Ranges always cover at least one position.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check if a position falls inside the range.
    pub fn contains(&self, position: Position) -> bool {
        position >= self.start && position <= self.end
    }
}

/// Compute the hidden range for a summary high-water mark.
///
/// Returns `None` when nothing is summarized or when fewer than
/// `keep_visible + 1` entries are summarized.
pub fn hide_range(last_summarized: Option<Position>, keep_visible: usize) -> Option<HideRange> {
    let last = last_summarized?;
    let end = last.checked_sub(keep_visible)?;
    Some(HideRange::new(0, end))
}

/// Like [`hide_range`], but `None` whenever hiding is switched off.
pub fn effective_hide_range(
    last_summarized: Option<Position>,
    keep_visible: usize,
    enabled: bool,
) -> Option<HideRange> {
    if enabled {
        hide_range(last_summarized, keep_visible)
    } else {
        None
    }
}

/// Positions to hide and unhide to move from one window to another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityDelta {
    pub hide: Option<HideRange>,
    pub unhide: Option<HideRange>,
}

impl VisibilityDelta {
    /// Whether applying this delta changes nothing.
    pub fn is_empty(&self) -> bool {
        self.hide.is_none() && self.unhide.is_none()
    }
}

/// Compute the delta between two hidden ranges.
///
/// Ranges produced by [`hide_range`] always start at 0, so the delta is a
/// single contiguous run on one side. Ranges with different starts are
/// swapped wholesale.
pub fn diff(old: Option<HideRange>, new: Option<HideRange>) -> VisibilityDelta {
    match (old, new) {
        (None, None) => VisibilityDelta::default(),
        (None, Some(new)) => VisibilityDelta {
            hide: Some(new),
            unhide: None,
        },
        (Some(old), None) => VisibilityDelta {
            hide: None,
            unhide: Some(old),
        },
        (Some(old), Some(new)) if old.start != new.start => VisibilityDelta {
            hide: Some(new),
            unhide: Some(old),
        },
        (Some(old), Some(new)) => {
            if new.end > old.end {
                VisibilityDelta {
                    hide: Some(HideRange::new(old.end + 1, new.end)),
                    unhide: None,
                }
            } else if new.end < old.end {
                VisibilityDelta {
                    hide: None,
                    unhide: Some(HideRange::new(new.end + 1, old.end)),
                }
            } else {
                VisibilityDelta::default()
            }
        }
    }
}

/// Tracks the range currently applied on the presentation surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityWindow {
    applied: Option<HideRange>,
}

impl VisibilityWindow {
    /// Create a window with nothing hidden.
    pub fn new() -> Self {
        Self::default()
    }

    /// The range currently hidden.
    pub fn applied(&self) -> Option<HideRange> {
        self.applied
    }

    /// Check if a position is currently hidden.
    pub fn is_hidden(&self, position: Position) -> bool {
        self.applied.is_some_and(|range| range.contains(position))
    }

    /// Move to a new range, returning what must change.
    pub fn update(&mut self, new: Option<HideRange>) -> VisibilityDelta {
        let delta = diff(self.applied, new);
        self.applied = new;
        delta
    }
}
