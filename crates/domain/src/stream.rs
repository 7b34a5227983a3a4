//! Streaming event types shared between the LLM pipeline and its consumers.

use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::tool::ToolCallRequest;

/// A boxed async stream, used for LLM streaming responses and parser output.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Token usage for one generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Raw chunks yielded by the abstract generation service.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateChunk {
    /// A slice of model output text.
    Text(String),
    /// Terminal marker carrying the usage record.
    Done { usage: Usage },
}

/// Classification of parser-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    /// The tool-call prelude was not a valid JSON array.
    MalformedPrelude,
    /// A decoded tool call failed registry validation.
    InvalidToolCall,
}

/// Events produced by the LLM output parser.
///
/// Single-consumer, ordered, terminal: after `End` no further events are
/// emitted. Emitted tool calls are never retracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    ToolCall { call: ToolCallRequest },
    Content { delta: String },
    End { usage: Usage },
    Error { kind: ParseErrorKind, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_add_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 });
        total.add(&Usage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 });
        assert_eq!(total.prompt_tokens, 11);
        assert_eq!(total.completion_tokens, 7);
        assert_eq!(total.total_tokens, 18);
    }

    #[test]
    fn output_event_tagged_serialization() {
        let ev = OutputEvent::Content { delta: "hello".into() };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"content\""));

        let ev = OutputEvent::Error {
            kind: ParseErrorKind::MalformedPrelude,
            message: "truncated".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"kind\":\"malformed_prelude\""));
    }
}
