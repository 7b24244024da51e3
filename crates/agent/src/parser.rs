//! Tool invocation parsing.
//!
//! The sequential (legacy) protocol embeds a single tool request in the
//! model's text as a JSON block; the batched protocol delivers calls
//! already structured by the model client and only needs validation here.
//!
//! Parsing is deliberately lenient: a malformed block is treated as "no
//! call found" and the surrounding text becomes the final answer. A model
//! that garbles a tool request must not crash the loop.

use deskclaw_core::ToolCall;
use tracing::{debug, warn};
use uuid::Uuid;

/// Extract a single embedded tool call from a model response.
///
/// Recognized shapes, first match wins:
/// - a fenced ```` ```json ```` (or ```` ```tool ````) block containing
///   `{"tool": name, "args": {...}}`
/// - a bare top-level JSON object of the same shape
///
/// The `name`/`arguments` key spellings are accepted as synonyms. Returns
/// `None` for anything else — never an error.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    for candidate in fenced_blocks(text).chain(bare_object(text)) {
        if let Some(call) = call_from_json(candidate) {
            return Some(call);
        }
    }
    None
}

/// Validate calls arriving pre-parsed from the batched protocol.
///
/// Each call must carry a non-empty name and a non-empty id (the id
/// correlates the call with its result message). Invalid entries are
/// dropped, not fatal.
pub fn validate_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .filter(|c| {
            let ok = !c.name.is_empty() && !c.id.is_empty();
            if !ok {
                warn!(name = %c.name, id = %c.id, "Dropping malformed tool call from batch");
            }
            ok
        })
        .collect()
}

/// Iterate the contents of fenced code blocks in the text.
fn fenced_blocks(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        loop {
            let start = rest.find("```")?;
            let after = &rest[start + 3..];
            // skip the info string ("json", "tool", or empty)
            let body_start = after.find('\n').map(|i| i + 1)?;
            let body = &after[body_start..];
            let end = body.find("```")?;
            let block = &body[..end];
            rest = &body[end + 3..];

            let info = after[..body_start].trim();
            if info.is_empty() || info.eq_ignore_ascii_case("json") || info.eq_ignore_ascii_case("tool") {
                return Some(block);
            }
        }
    })
}

/// Find one bare top-level JSON object by brace matching.
fn bare_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Try to interpret a JSON snippet as a tool call.
fn call_from_json(snippet: &str) -> Option<ToolCall> {
    let value: serde_json::Value = serde_json::from_str(snippet.trim()).ok()?;
    let obj = value.as_object()?;

    let name = obj
        .get("tool")
        .or_else(|| obj.get("name"))?
        .as_str()?
        .trim()
        .to_string();
    if name.is_empty() {
        return None;
    }

    let arguments = obj
        .get("args")
        .or_else(|| obj.get("arguments"))
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    if !arguments.is_object() {
        return None;
    }

    debug!(tool = %name, "Parsed embedded tool call");
    Some(ToolCall {
        // the sequential protocol has no model-assigned id; synthesize one
        id: Uuid::new_v4().to_string(),
        name,
        arguments,
    })
}
