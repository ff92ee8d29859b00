//! Best-effort recovery of truncated or slightly malformed tool-argument JSON.

use serde_json::{Map, Value};

/// Parse accumulated tool arguments into an object.
///
/// Returns the arguments and whether they had to be repaired. Empty input is a
/// legitimate "no arguments" call. Input that cannot be repaired degrades to an
/// empty object so the call itself is preserved.
pub fn reconstruct_arguments(raw: &str) -> (Value, bool) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (Value::Object(Map::new()), false);
    }
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return (value, false);
    }
    match repair_json(trimmed) {
        Some(value @ Value::Object(_)) => {
            tracing::warn!(raw_len = raw.len(), "repaired malformed tool arguments");
            (value, true)
        }
        _ => {
            tracing::warn!(
                raw = %crate::util::text::snippet(trimmed, 200),
                "unrecoverable tool arguments; substituting empty object"
            );
            (Value::Object(Map::new()), true)
        }
    }
}

/// Attempt to turn `raw` into valid JSON.
///
/// First closes open strings and containers, strips trailing commas and fills a
/// dangling `:` with `null`. If that still fails, the last incomplete member is
/// dropped (cut at a structural comma) and the closing pass is retried.
pub fn repair_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    if let Some(value) = close_structure(trimmed).and_then(|s| serde_json::from_str(&s).ok()) {
        return Some(value);
    }
    structural_commas(trimmed)
        .into_iter()
        .rev()
        .take(8)
        .find_map(|cut| {
            close_structure(&trimmed[..cut]).and_then(|s| serde_json::from_str(&s).ok())
        })
}

fn close_structure(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '{' => {
                stack.push('}');
                out.push(ch);
            }
            '[' => {
                stack.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                strip_trailing_comma(&mut out);
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }

    if in_string {
        // A dangling escape would swallow the closing quote.
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    strip_trailing_comma(&mut out);
    if out.trim_end().ends_with(':') {
        out.push_str("null");
    }
    while let Some(closer) = stack.pop() {
        strip_trailing_comma(&mut out);
        out.push(closer);
    }
    Some(out)
}

fn strip_trailing_comma(out: &mut String) {
    let kept = out.trim_end().len();
    out.truncate(kept);
    if out.ends_with(',') {
        out.pop();
        let kept = out.trim_end().len();
        out.truncate(kept);
    }
}

/// Byte offsets of commas outside strings and inside at least one container.
fn structural_commas(input: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in input.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth = depth.saturating_sub(1),
            ',' if depth > 0 => positions.push(idx),
            _ => {}
        }
    }
    positions
}
