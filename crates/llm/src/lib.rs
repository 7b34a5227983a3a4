//! LLM pipeline: abstract generation/embedding clients, per-provider rate
//! limiting, and the streaming output parser that splits model output into
//! a tool-call prelude and a markdown body.

pub mod client;
pub mod parser;
pub mod sanitize;

pub use client::{
    EmbeddingClient, GenerateParams, GenerateRequest, LlmClient, MockEmbedder, MockLlm,
    RateLimited,
};
pub use parser::{parse_stream, AcceptAll, OutputParser, ToolCallValidator, TOOL_CALL_DELIMITER};
pub use sanitize::DisplaySanitizer;
