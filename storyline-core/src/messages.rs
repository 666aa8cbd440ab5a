//! Messages exchanged with the presentation surface.

use crate::summary::{Section, SummaryStats};
use crate::transcript::{Position, TranscriptId};
use crate::visibility::{HideRange, VisibilityDelta};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

/// What started a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Requested by the user. Never retried.
    User,
    /// Started automatically. Retried with backoff.
    Background,
}

/// Status sent to the presentation surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    GenerationStarted {
        transcript: TranscriptId,
        run_id: Uuid,
        start: Position,
        end: Position,
        trigger: Trigger,
    },
    GenerationProgress {
        transcript: TranscriptId,
        run_id: Uuid,
        received_chars: usize,
    },
    GenerationCompleted {
        transcript: TranscriptId,
        run_id: Uuid,
        end: Position,
        events_added: usize,
    },
    GenerationError {
        transcript: TranscriptId,
        run_id: Option<Uuid>,
        message: String,
    },
    /// A run was requested while another was in flight.
    GenerationRejected {
        transcript: TranscriptId,
        message: String,
    },
    GenerationStateChanged {
        transcript: TranscriptId,
        running: bool,
    },
    SummaryDataChanged {
        transcript: TranscriptId,
        last_summarized: Option<Position>,
        stats: SummaryStats,
    },
    VisibilityChanged {
        transcript: TranscriptId,
        hidden: Option<HideRange>,
        delta: VisibilityDelta,
    },
}

impl StatusMessage {
    /// The transcript the message concerns.
    pub fn transcript(&self) -> &TranscriptId {
        match self {
            StatusMessage::GenerationStarted { transcript, .. }
            | StatusMessage::GenerationProgress { transcript, .. }
            | StatusMessage::GenerationCompleted { transcript, .. }
            | StatusMessage::GenerationError { transcript, .. }
            | StatusMessage::GenerationRejected { transcript, .. }
            | StatusMessage::GenerationStateChanged { transcript, .. }
            | StatusMessage::SummaryDataChanged { transcript, .. }
            | StatusMessage::VisibilityChanged { transcript, .. } => transcript,
        }
    }
}

/// Request from the presentation surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiRequest {
    /// The surface is ready to receive messages.
    Ready,
    Generate {
        transcript: TranscriptId,
    },
    Cancel {
        transcript: TranscriptId,
    },
    Clear {
        transcript: TranscriptId,
    },
    UpdateSection {
        transcript: TranscriptId,
        section: Section,
        value: serde_json::Value,
    },
    ToggleHide {
        transcript: TranscriptId,
        enabled: bool,
    },
    UpdateKeepVisibleCount {
        transcript: TranscriptId,
        count: usize,
    },
}

struct OutboxState {
    ready: bool,
    queued: VecDeque<StatusMessage>,
}

/// Outgoing message channel that holds messages until the surface is ready.
pub struct Outbox {
    state: Mutex<OutboxState>,
    tx: mpsc::UnboundedSender<StatusMessage>,
}

impl Outbox {
    /// Create an outbox and the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = Self {
            state: Mutex::new(OutboxState {
                ready: false,
                queued: VecDeque::new(),
            }),
            tx,
        };
        (outbox, rx)
    }

    /// Send a message, or queue it until the surface is ready.
    pub fn send(&self, message: StatusMessage) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.ready {
            // A dropped receiver means nobody is listening.
            let _ = self.tx.send(message);
        } else {
            state.queued.push_back(message);
        }
    }

    /// Mark the surface ready and flush queued messages in order.
    ///
    /// Returns the number of messages flushed.
    pub fn mark_ready(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.ready = true;
        let flushed = state.queued.len();
        for message in state.queued.drain(..) {
            let _ = self.tx.send(message);
        }
        flushed
    }

    pub fn is_ready(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ready
    }

    /// Messages waiting for the surface.
    pub fn queued(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queued
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(n: usize) -> StatusMessage {
        StatusMessage::GenerationRejected {
            transcript: TranscriptId::new("chat"),
            message: format!("busy {n}"),
        }
    }

    #[test]
    fn test_messages_queue_until_ready() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.send(rejected(1));
        outbox.send(rejected(2));
        assert!(rx.try_recv().is_err());
        assert_eq!(outbox.queued(), 2);

        assert_eq!(outbox.mark_ready(), 2);
        assert_eq!(rx.try_recv().unwrap(), rejected(1));
        assert_eq!(rx.try_recv().unwrap(), rejected(2));

        outbox.send(rejected(3));
        assert_eq!(rx.try_recv().unwrap(), rejected(3));
        assert!(outbox.is_ready());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (outbox, rx) = Outbox::channel();
        outbox.mark_ready();
        drop(rx);
        outbox.send(rejected(1));
    }

    #[test]
    fn test_status_message_json_is_tagged() {
        let message = StatusMessage::GenerationStateChanged {
            transcript: TranscriptId::new("chat"),
            running: true,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "generation_state_changed");
        assert_eq!(json["transcript"], "chat");
        assert_eq!(message.transcript().as_str(), "chat");
    }

    #[test]
    fn test_ui_request_from_json() {
        let request: UiRequest = serde_json::from_str(
            r#"{"type": "update_section", "transcript": "chat", "section": "keywords", "value": ["a"]}"#,
        )
        .unwrap();
        match request {
            UiRequest::UpdateSection { section, .. } => assert_eq!(section, Section::Keywords),
            other => panic!("unexpected request {other:?}"),
        }

        let ready: UiRequest = serde_json::from_str(r#"{"type": "ready"}"#).unwrap();
        assert_eq!(ready, UiRequest::Ready);
    }
}
