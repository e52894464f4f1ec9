//! Event extraction from droid's `stream-json` output.
//!
//! Each stdout line is ideally one JSON object with a `type` tag, but lines can
//! arrive truncated or garbled. `parse_line` never fails: a line that does not
//! decode yields at most a `Completion` recovered by the best-effort scans.

use serde_json::Value;

/// A typed event from one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    ToolCall { name: String, detail: Option<String> },
    Completion { text: String, session_id: Option<String> },
    TextChunk { text: String },
    Error { message: String },
}

impl ToolEvent {
    /// Status line shown in the live display, e.g. `→ Edit: src/main.rs`.
    pub fn status_line(&self) -> Option<String> {
        match self {
            ToolEvent::ToolCall { name, detail: Some(detail) } => Some(format!("→ {}: {}", name, detail)),
            ToolEvent::ToolCall { name, detail: None } => Some(format!("→ {}", name)),
            _ => None,
        }
    }
}

/// Parse one line. Strict JSON first, then the fallback scans.
pub fn parse_line(line: &str) -> Option<ToolEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(line) {
        Ok(value) => parse_value(&value),
        Err(_) => {
            let text = scan_final_text(line);
            let session_id = scan_session_id(line);
            match (text, session_id) {
                (None, None) => None,
                (text, session_id) => Some(ToolEvent::Completion {
                    text: text.unwrap_or_default(),
                    session_id,
                }),
            }
        }
    }
}

fn parse_value(value: &Value) -> Option<ToolEvent> {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
    match kind {
        "tool_call" => {
            let name = str_field(value, &["toolName", "name"]).unwrap_or_else(|| "unknown".to_string());
            let params = tool_params(value);
            let detail = tool_detail(&name, &params);
            Some(ToolEvent::ToolCall { name, detail })
        }
        "completion" => Some(ToolEvent::Completion {
            text: str_field(value, &["finalText"]).unwrap_or_default(),
            session_id: str_field(value, &["session_id", "sessionId"]),
        }),
        "text" => Some(ToolEvent::TextChunk {
            text: str_field(value, &["text"]).unwrap_or_default(),
        }),
        "error" => Some(ToolEvent::Error {
            message: str_field(value, &["message"]).unwrap_or_else(|| "Unknown error".to_string()),
        }),
        _ => None,
    }
}

/// First non-empty string among `keys`.
fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Tool parameters from `input`, `parameters` or `args`; a string value is
/// decoded as nested JSON. Anything unusable becomes an empty object.
fn tool_params(value: &Value) -> Value {
    let raw = ["input", "parameters", "args"]
        .iter()
        .filter_map(|k| value.get(*k))
        .find(|v| !v.is_null() && !is_empty_container(v));

    match raw {
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(v) if v.is_object() => v,
            _ => Value::Object(Default::default()),
        },
        Some(v) if v.is_object() => v.clone(),
        _ => Value::Object(Default::default()),
    }
}

fn is_empty_container(v: &Value) -> bool {
    match v {
        Value::Object(m) => m.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn param(params: &Value, keys: &[&str]) -> Option<String> {
    str_field(params, keys)
}

fn head(s: &str, n: usize) -> String {
    if s.chars().count() > n {
        format!("{}...", s.chars().take(n).collect::<String>())
    } else {
        s.to_string()
    }
}

fn tail(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count > n + 3 {
        format!("...{}", s.chars().skip(count - n).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Human-readable detail for the tools droid uses most.
fn tool_detail(name: &str, params: &Value) -> Option<String> {
    match name {
        "Read" | "Edit" | "MultiEdit" | "Create" => {
            param(params, &["file_path", "path"]).map(|p| tail(&p, 47))
        }
        "Grep" => param(params, &["pattern"]).map(|p| format!("'{}'", head(&p, 20))),
        "Glob" => {
            let patterns: Vec<&str> = params
                .get("patterns")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).take(2).collect())
                .unwrap_or_default();
            if patterns.is_empty() {
                param(params, &["pattern"])
            } else {
                Some(patterns.join(", "))
            }
        }
        "LS" => param(params, &["directory_path", "path"])
            .map(|p| p.rsplit('/').find(|s| !s.is_empty()).unwrap_or(&p).to_string()),
        "Execute" => param(params, &["command"]).map(|c| head(&c, 40)),
        "WebSearch" => param(params, &["query"]).map(|q| format!("'{}'", head(&q, 25))),
        _ => None,
    }
}

/// Field names that can follow `finalText` in a completion record.
const FINAL_TEXT_BOUNDARIES: [&str; 5] = [
    "\",\"numTurns\"",
    "\",\"durationMs\"",
    "\",\"session_id\"",
    "\",\"sessionId\"",
    "\"}",
];

/// Locate a quoted `finalText` key in a raw line and pull out its value up to
/// the next plausible field boundary, un-escaping backslash sequences.
pub fn scan_final_text(line: &str) -> Option<String> {
    const KEY: &str = "\"finalText\"";
    let key_at = line.find(KEY)?;
    let rest = line[key_at + KEY.len()..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('"')?;

    let end = FINAL_TEXT_BOUNDARIES
        .iter()
        .filter_map(|b| find_unescaped(rest, b))
        .min()
        .or_else(|| find_unescaped(rest, "\""))
        .unwrap_or(rest.len());
    Some(unescape(&rest[..end]))
}

/// First occurrence of `pattern` whose leading quote is not backslash-escaped.
fn find_unescaped(text: &str, pattern: &str) -> Option<usize> {
    text.match_indices(pattern)
        .map(|(at, _)| at)
        .find(|&at| text.as_bytes()[..at].iter().rev().take_while(|&&b| b == b'\\').count() % 2 == 0)
}

/// Locate a quoted `sessionId` / `session_id` key in a raw line.
pub fn scan_session_id(line: &str) -> Option<String> {
    for key in ["\"session_id\"", "\"sessionId\""] {
        let Some(key_at) = line.find(key) else {
            continue;
        };
        let rest = line[key_at + key.len()..].trim_start();
        let Some(rest) = rest.strip_prefix(':').map(str::trim_start) else {
            continue;
        };
        let Some(rest) = rest.strip_prefix('"') else {
            continue;
        };
        if let Some(end) = rest.find('"') {
            let id = &rest[..end];
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}

/// Final text from a line, whether it is valid JSON or not.
pub fn extract_final_text(line: &str) -> Option<String> {
    if !line.contains("\"finalText\"") {
        return None;
    }
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(value) => Some(str_field(&value, &["finalText"]).unwrap_or_default()),
        Err(_) => scan_final_text(line),
    }
}

/// Session id from a line, whether it is valid JSON or not.
pub fn extract_session_id(line: &str) -> Option<String> {
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(value) => str_field(&value, &["session_id", "sessionId"]),
        Err(_) => scan_session_id(line),
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
