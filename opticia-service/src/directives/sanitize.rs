//! Best-effort repair of JSON the model wrote inline, often after a trip
//! through speech transcription.
//!
//! Repair runs in stages, each tried only when the previous output still
//! fails a strict parse:
//! 1. normalize curly quotes, collapse newlines, drop doubled and trailing commas
//! 2. quote bare keys and turn single-quoted strings into double-quoted ones
//! 3. regex reconstruction of a task title and its step titles

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

use crate::session::StepSpec;

static DOUBLE_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*,").expect("valid regex"));
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("valid regex"));
static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:").expect("valid regex")
});
static SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([:\[,{]\s*)'([^']*)'").expect("valid regex"));
static TITLE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)["']?title["']?\s*:\s*["']([^"']+)["']"#).expect("valid regex")
});
static STEPS_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)["']?steps["']?\s*:\s*\["#).expect("valid regex"));
static QUOTED_STRING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["']([^"']+)["']"#).expect("valid regex"));

/// Stage 1: purely lexical cleanup that never changes valid JSON.
pub fn normalize(raw: &str) -> String {
    let straightened: String = raw
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => '\'',
            '\r' | '\n' | '\t' => ' ',
            other => other,
        })
        .collect();
    let collapsed = DOUBLE_COMMA.replace_all(&straightened, ",");
    TRAILING_COMMA.replace_all(&collapsed, "$1").into_owned()
}

/// Stage 2: structural repair for keys and string delimiters.
pub fn quote_keys_and_strings(normalized: &str) -> String {
    let keyed = BARE_KEY.replace_all(normalized, r#"$1"$2":"#);
    SINGLE_QUOTED
        .replace_all(&keyed, |caps: &Captures| {
            format!("{}\"{}\"", &caps[1], caps[2].replace('"', "\\\""))
        })
        .into_owned()
}

/// Parse a directive payload, escalating through the repair stages.
pub fn parse_lenient(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(raw) {
        return Some(value);
    }
    let normalized = normalize(raw);
    if let Ok(value) = serde_json::from_str(&normalized) {
        return Some(value);
    }
    serde_json::from_str(&quote_keys_and_strings(&normalized)).ok()
}

/// Stage 3: pull a task title and step titles out of text that no longer
/// parses as JSON at all.
pub fn recover_task(raw: &str) -> Option<(String, Vec<StepSpec>)> {
    let text = normalize(raw);

    let steps_start = STEPS_KEY.find(&text).map(|m| m.end());
    let head = match steps_start {
        Some(end) => &text[..end],
        None => text.as_str(),
    };
    let title = TITLE_FIELD
        .captures(head)
        .map(|caps| caps[1].trim().to_string())?;

    let Some(start) = steps_start else {
        return Some((title, Vec::new()));
    };
    let tail = &text[start..];
    let steps_text = tail.find(']').map_or(tail, |end| &tail[..end]);

    let mut titles: Vec<String> = TITLE_FIELD
        .captures_iter(steps_text)
        .map(|caps| caps[1].trim().to_string())
        .collect();
    if titles.is_empty() {
        titles = QUOTED_STRING
            .captures_iter(steps_text)
            .map(|caps| caps[1].trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
    }

    let steps = titles
        .into_iter()
        .map(|title| StepSpec {
            title,
            description: None,
        })
        .collect();
    Some((title, steps))
}
