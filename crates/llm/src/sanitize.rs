//! Display sanitation for the markdown region.
//!
//! The parser never rewrites content; the turn driver runs the assistant
//! body through a [`DisplaySanitizer`] before persisting it, stripping any
//! leaked delimiter glyphs and lines that look like tool-call JSON for a
//! registered tool. The per-tool patterns are compiled once at startup.

use regex::{Regex, RegexSet};

use crate::parser::TOOL_CALL_DELIMITER;

/// Strips leaked wire-format artifacts from display markdown:
/// - every occurrence of the delimiter,
/// - lines that open like JSON (`{`/`[`) and name a registered tool in a
///   `"type"` position.
pub struct DisplaySanitizer {
    /// One `"type" : "<tool>"` pattern per registered tool, whitespace
    /// tolerant around the colon.
    tool_patterns: RegexSet,
    json_prefix: Regex,
}

impl DisplaySanitizer {
    pub fn new(known_tools: &[String]) -> Self {
        let patterns: Vec<String> = known_tools
            .iter()
            .map(|tool| format!("\"type\"\\s*:\\s*\"{}\"", regex::escape(tool)))
            .collect();
        let tool_patterns = RegexSet::new(&patterns).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "tool patterns failed to compile; sanitizer disabled");
            RegexSet::empty()
        });
        let json_prefix = Regex::new(r"^\s*[\[{]").expect("static pattern");
        Self { tool_patterns, json_prefix }
    }

    /// Sanitize assistant content for display.
    pub fn sanitize(&self, content: &str) -> String {
        let without_delimiter = content.replace(TOOL_CALL_DELIMITER, "");
        let mut out = String::with_capacity(without_delimiter.len());
        let mut kept_any = false;
        for (i, line) in without_delimiter.lines().enumerate() {
            if self.is_leaked_tool_call(line) {
                tracing::debug!(line_no = i, "stripped leaked tool-call JSON from display content");
                continue;
            }
            if kept_any {
                out.push('\n');
            }
            out.push_str(line);
            kept_any = true;
        }
        // `lines()` swallows a trailing newline.
        if without_delimiter.ends_with('\n') {
            out.push('\n');
        }
        out
    }

    fn is_leaked_tool_call(&self, line: &str) -> bool {
        self.json_prefix.is_match(line) && self.tool_patterns.is_match(line)
    }
}
