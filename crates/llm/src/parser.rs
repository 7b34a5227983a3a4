//! Streaming LLM output parser.
//!
//! Wire grammar: `<tool_calls_region> <delimiter> <markdown_region>`, where
//! the region is a JSON array of tool-call objects (possibly empty) and the
//! delimiter is [`TOOL_CALL_DELIMITER`]. The parser is push-based: feed it
//! text chunks, collect [`OutputEvent`]s; [`parse_stream`] lifts it over an
//! async chunk stream.
//!
//! State machine:
//! - `SCAN_PRELUDE` accumulates chunks and decodes array elements
//!   incrementally, emitting each completed tool call as early as decoding
//!   permits. Emitted calls are never retracted.
//! - The first occurrence of the delimiter switches to `EMIT_CONTENT`;
//!   a partial prelude is flushed as `ErrorEvent{malformed_prelude}`.
//! - `EMIT_CONTENT` forwards every chunk verbatim (leading whitespace
//!   around the delimiter is normalized away).
//! - End of stream in `SCAN_PRELUDE`: a buffer that never was a tool-call
//!   array is the degenerate no-tool-call response and is emitted as one
//!   `ContentEvent`; a buffer that died mid-JSON yields
//!   `ErrorEvent{malformed_prelude}` and no markdown.

use std::sync::Arc;

use futures_util::StreamExt;

use butler_domain::error::Result;
use butler_domain::stream::{BoxStream, GenerateChunk, OutputEvent, ParseErrorKind, Usage};
use butler_domain::tool::ToolCallRequest;

/// Fixed multi-codepoint marker between the tool-call prelude and the
/// markdown body. The system prompt directives must quote exactly this
/// constant so prompt and parser cannot drift.
pub const TOOL_CALL_DELIMITER: &str = "✂️🐱";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry-backed validation of decoded tool calls, applied before
/// emission. Invalid entries become `ErrorEvent{invalid_tool_call}` and
/// are not dispatched.
pub trait ToolCallValidator: Send + Sync {
    fn validate(&self, call: &ToolCallRequest) -> Result<()>;
}

/// Pass-through validator for tests and registry-free deployments.
pub struct AcceptAll;

impl ToolCallValidator for AcceptAll {
    fn validate(&self, _call: &ToolCallRequest) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ScanPrelude,
    EmitContent,
}

pub struct OutputParser {
    validator: Arc<dyn ToolCallValidator>,
    state: State,
    buffer: String,
    /// Array elements already decoded (emitted or rejected).
    handled_elements: usize,
    /// The buffer can no longer be a tool-call array (markdown response).
    not_an_array: bool,
    /// A later element failed to decode as JSON; scanning stopped.
    malformed: bool,
    /// The prelude array closed cleanly.
    array_done: bool,
    /// Swallow whitespace at the start of the markdown region.
    trim_leading_content: bool,
}

impl OutputParser {
    pub fn new(validator: Arc<dyn ToolCallValidator>) -> Self {
        Self {
            validator,
            state: State::ScanPrelude,
            buffer: String::new(),
            handled_elements: 0,
            not_an_array: false,
            malformed: false,
            array_done: false,
            trim_leading_content: true,
        }
    }

    /// Feed one chunk; returns the events it produced.
    pub fn push(&mut self, chunk: &str) -> Vec<OutputEvent> {
        match self.state {
            State::EmitContent => self.emit_content(chunk),
            State::ScanPrelude => {
                self.buffer.push_str(chunk);
                let mut events = Vec::new();

                let delimiter_at = self.buffer.find(TOOL_CALL_DELIMITER);
                let scan_end = delimiter_at.unwrap_or(self.buffer.len());
                self.scan_elements(scan_end, &mut events);

                if let Some(at) = delimiter_at {
                    if self.not_an_array || self.malformed || !self.array_done {
                        events.push(OutputEvent::Error {
                            kind: ParseErrorKind::MalformedPrelude,
                            message: "tool-call prelude was not a complete JSON array".into(),
                        });
                    }
                    let rest = self.buffer[at + TOOL_CALL_DELIMITER.len()..].to_string();
                    self.state = State::EmitContent;
                    self.buffer.clear();
                    events.extend(self.emit_content(&rest));
                }
                events
            }
        }
    }

    /// Signal end of stream. Consumes the parser and emits the terminal
    /// events including `End`.
    pub fn finish(mut self, usage: Usage) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        if self.state == State::ScanPrelude && !self.buffer.trim().is_empty() {
            if self.not_an_array {
                // Degenerate no-tool-call response: the whole stream is
                // markdown, emitted as one event.
                let content = std::mem::take(&mut self.buffer);
                events.push(OutputEvent::Content { delta: content });
            } else if !self.array_done || self.malformed {
                events.push(OutputEvent::Error {
                    kind: ParseErrorKind::MalformedPrelude,
                    message: "stream ended inside the tool-call prelude".into(),
                });
            } else {
                tracing::warn!("stream ended after the tool-call prelude with no delimiter");
            }
        }
        events.push(OutputEvent::End { usage });
        events
    }

    fn emit_content(&mut self, chunk: &str) -> Vec<OutputEvent> {
        let text = if self.trim_leading_content {
            let trimmed = chunk.trim_start();
            if trimmed.is_empty() {
                return Vec::new();
            }
            self.trim_leading_content = false;
            trimmed
        } else {
            chunk
        };
        if text.is_empty() {
            return Vec::new();
        }
        vec![OutputEvent::Content { delta: text.to_string() }]
    }

    /// Incrementally decode array elements inside `buffer[..scan_end]`.
    /// Previously handled elements are skipped; each newly completed one
    /// is validated and emitted (or rejected) exactly once.
    fn scan_elements(&mut self, scan_end: usize, events: &mut Vec<OutputEvent>) {
        if self.not_an_array || self.malformed || self.array_done {
            return;
        }
        let scan = extract_elements(&self.buffer[..scan_end], self.handled_elements);
        match scan {
            Extraction::NothingYet => {}
            Extraction::NotAnArray => self.not_an_array = true,
            Extraction::Elements { new, array_done } => {
                self.array_done = array_done;
                for element in new {
                    let index = self.handled_elements;
                    self.handle_element(&element, index, events);
                    if self.not_an_array || self.malformed {
                        return;
                    }
                    self.handled_elements += 1;
                }
            }
        }
    }

    fn handle_element(&mut self, element: &str, index: usize, events: &mut Vec<OutputEvent>) {
        match serde_json::from_str::<ToolCallRequest>(element) {
            Ok(call) => match self.validator.validate(&call) {
                Ok(()) => events.push(OutputEvent::ToolCall { call }),
                Err(e) => {
                    tracing::warn!(call_id = %call.id, error = %e, "dropping invalid tool call");
                    events.push(OutputEvent::Error {
                        kind: ParseErrorKind::InvalidToolCall,
                        message: e.to_string(),
                    });
                }
            },
            Err(_) => {
                if serde_json::from_str::<serde_json::Value>(element).is_err() {
                    // Not JSON at all. A first pseudo-element means the
                    // stream is markdown that merely starts with '['; a
                    // later one means the array itself broke.
                    if index == 0 {
                        self.not_an_array = true;
                    } else {
                        tracing::warn!(index, "dropping malformed prelude element");
                        self.malformed = true;
                    }
                } else {
                    events.push(OutputEvent::Error {
                        kind: ParseErrorKind::InvalidToolCall,
                        message: format!("element {index} is not a tool call object"),
                    });
                }
            }
        }
    }
}

enum Extraction {
    /// Only whitespace so far.
    NothingYet,
    /// The first non-whitespace character is not `[`.
    NotAnArray,
    Elements {
        /// Completed element texts beyond the already-handled prefix.
        new: Vec<String>,
        /// The array's closing bracket arrived.
        array_done: bool,
    },
}

/// Pure scan: completed array elements past `skip`, plus whether the
/// array has closed.
fn extract_elements(text: &str, skip: usize) -> Extraction {
    let Some(start) = text.find(|c: char| !c.is_whitespace()) else {
        return Extraction::NothingYet;
    };
    let bytes = text.as_bytes();
    if bytes[start] != b'[' {
        return Extraction::NotAnArray;
    }

    let mut new = Vec::new();
    let mut array_done = false;
    let mut i = start + 1;
    let mut index = 0usize;
    loop {
        while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b',') {
            i += 1;
        }
        if i >= bytes.len() {
            break; // await more input
        }
        if bytes[i] == b']' {
            array_done = true;
            break;
        }
        let Some(end) = element_end(bytes, i) else {
            break; // element incomplete, await more input
        };
        if index >= skip {
            new.push(text[i..end].to_string());
        }
        index += 1;
        i = end;
    }
    Extraction::Elements { new, array_done }
}

/// Find the exclusive end of the JSON element starting at `start`, or
/// `None` if it is still incomplete. Tracks nesting depth and string
/// escapes; all structural characters are ASCII, so byte scanning is
/// UTF-8 safe.
fn element_end(bytes: &[u8], start: usize) -> Option<usize> {
    let first = bytes[start];
    let mut depth: u32 = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut i = start;
    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            if escape {
                escape = false;
            } else if c == b'\\' {
                escape = true;
            } else if c == b'"' {
                in_string = false;
                if depth == 0 && first == b'"' {
                    return Some(i + 1);
                }
            }
        } else {
            match c {
                b'"' => in_string = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    if depth == 0 {
                        // The array's own closing bracket: a bare scalar
                        // ended just before it.
                        return Some(i);
                    }
                    depth -= 1;
                    if depth == 0 && (first == b'{' || first == b'[') {
                        return Some(i + 1);
                    }
                }
                b',' if depth == 0 => return Some(i),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Encoding & stream adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Encode a response in the wire grammar. The inverse of parsing, used by
/// tests and by scripted/mock generators.
pub fn encode_response(calls: &[ToolCallRequest], markdown: &str) -> String {
    let prelude = serde_json::to_string(calls).unwrap_or_else(|_| "[]".into());
    format!("{prelude}\n\n{TOOL_CALL_DELIMITER}\n\n{markdown}")
}

/// Lift the parser over an async chunk stream. Transport errors pass
/// through as `Err` and terminate the stream; parse-level problems are
/// `Ok(OutputEvent::Error { .. })` events.
pub fn parse_stream(
    input: BoxStream<'static, Result<GenerateChunk>>,
    validator: Arc<dyn ToolCallValidator>,
) -> BoxStream<'static, Result<OutputEvent>> {
    let stream = async_stream::stream! {
        let mut parser = OutputParser::new(validator);
        let mut usage = Usage::default();
        let mut input = input;
        while let Some(item) = input.next().await {
            match item {
                Ok(GenerateChunk::Text(text)) => {
                    for event in parser.push(&text) {
                        yield Ok(event);
                    }
                }
                Ok(GenerateChunk::Done { usage: u }) => {
                    usage = u;
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        for event in parser.finish(usage) {
            yield Ok(event);
        }
    };
    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
