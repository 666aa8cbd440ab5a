//! Provider-agnostic text generation interface.
//!
//! This crate is the seam between the narrative summarizer and whatever
//! backend turns a prompt into text. It provides:
//! - A `GenerationRequest` builder
//! - The `TextGenerator` trait with single-shot and streaming completion
//! - Stream collection, so streamed output can be awaited to completion
//! - JSON extraction for model output wrapped in markdown or prose

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

const DEFAULT_MAX_TOKENS: usize = 4096;

/// Errors that can occur while generating text.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Backend not configured: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generation cancelled")]
    Cancelled,
}

/// A stream of generation events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>;

/// A backend that turns a prompt into text.
///
/// Implementors only need `complete`. Backends that deliver output
/// incrementally override `stream` and report `supports_streaming`.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Send a request and return the full response.
    async fn complete(&self, request: GenerationRequest) -> Result<Response, Error>;

    /// Send a request and stream the response.
    ///
    /// The default implementation wraps `complete` in a single-delta stream.
    async fn stream(&self, request: GenerationRequest) -> Result<EventStream, Error> {
        let response = self.complete(request).await?;
        let events = vec![
            Ok(StreamEvent::TextDelta {
                text: response.text,
            }),
            Ok(StreamEvent::MessageDelta {
                stop_reason: Some(response.stop_reason),
            }),
            Ok(StreamEvent::MessageStop),
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }

    /// Whether `stream` delivers real incremental output.
    fn supports_streaming(&self) -> bool {
        false
    }
}

/// Run a request against a generator, streaming when the backend supports it.
///
/// `on_progress` receives the number of characters received so far.
pub async fn generate_text<F>(
    generator: &dyn TextGenerator,
    request: GenerationRequest,
    on_progress: F,
) -> Result<Response, Error>
where
    F: FnMut(usize) + Send,
{
    if generator.supports_streaming() {
        let stream = generator.stream(request).await?;
        collect_text_with(stream, on_progress).await
    } else {
        generator.complete(request).await
    }
}

/// Await a stream to completion and return the concatenated text.
pub async fn collect_text(stream: EventStream) -> Result<Response, Error> {
    collect_text_with(stream, |_| {}).await
}

/// Await a stream to completion, reporting accumulated length after each delta.
pub async fn collect_text_with<F>(mut stream: EventStream, mut on_delta: F) -> Result<Response, Error>
where
    F: FnMut(usize) + Send,
{
    let mut text = String::new();
    let mut stop_reason = StopReason::EndTurn;

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta { text: delta } => {
                text.push_str(&delta);
                on_delta(text.chars().count());
            }
            StreamEvent::MessageDelta {
                stop_reason: Some(reason),
            } => stop_reason = reason,
            StreamEvent::MessageDelta { stop_reason: None } | StreamEvent::Ping => {}
            StreamEvent::MessageStop => break,
            StreamEvent::Error { message } => return Err(Error::Stream(message)),
        }
    }

    Ok(Response {
        text,
        stop_reason,
        usage: Usage::default(),
    })
}

/// Create a stream fed by a channel.
///
/// Backends that receive output on a separate task push events into the
/// returned sender; dropping the sender ends the stream.
pub fn channel_stream(buffer: usize) -> (mpsc::Sender<Result<StreamEvent, Error>>, EventStream) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (tx, Box::pin(ReceiverStream::new(rx)))
}

/// Extract JSON from a response that might have markdown code blocks or prose.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // Handle ```json ... ``` blocks
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Handle ``` ... ``` blocks (without json specifier)
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // A bare object surrounded by commentary
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return &text[start..=end];
        }
    }

    text
}

// ============================================================================
// Public types
// ============================================================================

/// A generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: Option<String>,
    pub max_tokens: usize,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    /// Create a new request with the given messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            system: None,
            messages,
            temperature: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// The text of the last user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// A message in the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a user message with text content.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create an assistant message with text content.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct Response {
    pub text: String,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl Response {
    /// Create an end-of-turn response with the given text.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

// ============================================================================
// Streaming types
// ============================================================================

/// Events from a streaming response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta { text: String },
    MessageDelta { stop_reason: Option<StopReason> },
    MessageStop,
    Ping,
    Error { message: String },
}
