//! Control directives the model embeds in its streamed text.
//!
//! The model is instructed to write bracketed tags such as
//! `[TASK: {...}]`, `[TASK_UPDATE: {...}]`, `[TASK_COMPLETE]`,
//! `[SEARCH: query]` and `[REPORT: topic]` alongside its spoken answer.
//! Parsing is tolerant: payloads may be damaged by transcription, and a
//! payload that cannot be recovered is logged and dropped.

mod sanitize;

use regex::Regex;
use serde_json::Value;
use std::str::FromStr;
use std::sync::LazyLock;
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{debug, warn};

use crate::session::{StepSpec, StepStatus};

/// A structured instruction extracted from turn text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    TaskCreate { title: String, steps: Vec<StepSpec> },
    StepUpdate { step: usize, status: StepStatus },
    TaskComplete,
    Search { query: String },
    Report { topic: String },
}

/// Tag families, in the order they are applied within a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum DirectiveKind {
    TaskCreate,
    StepUpdate,
    TaskComplete,
    Search,
    Report,
}

/// Parses directives out of turn text.
///
/// Implementations may be stricter or tuned to a particular model; the
/// receive loop only depends on this trait.
pub trait DirectiveParser: Send + Sync {
    /// Parse the first instance of one tag family, if any
    fn try_parse(&self, kind: DirectiveKind, text: &str) -> Option<Directive>;

    /// Parse at most one directive per family
    fn extract(&self, text: &str) -> Vec<Directive> {
        DirectiveKind::iter()
            .filter_map(|kind| self.try_parse(kind, text))
            .collect()
    }
}

static TASK_CREATE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*TASK\s*:").expect("valid regex"));
static STEP_UPDATE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*TASK[_ ]?UPDATE\s*:").expect("valid regex"));
static TASK_COMPLETE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*TASK[_ ]?COMPLETE\s*\]").expect("valid regex"));
static SEARCH_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*SEARCH\s*:\s*([^\]]+)\]").expect("valid regex"));
static REPORT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*REPORT\s*:\s*([^\]]+)\]").expect("valid regex"));
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\s*(TASK[_ ]?UPDATE|TASK[_ ]?COMPLETE|TASK|SEARCH|REPORT)\b")
        .expect("valid regex")
});
static STEP_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)step["']?\s*:\s*["']?(\d+)"#).expect("valid regex"));
static STATUS_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)status["']?\s*:\s*["']?(completed|current|upcoming)"#).expect("valid regex")
});

/// Default parser: bracket counting plus staged JSON repair
#[derive(Debug, Default, Clone, Copy)]
pub struct TolerantParser;

impl DirectiveParser for TolerantParser {
    fn try_parse(&self, kind: DirectiveKind, text: &str) -> Option<Directive> {
        match kind {
            DirectiveKind::TaskCreate => parse_task_create(text),
            DirectiveKind::StepUpdate => parse_step_update(text),
            DirectiveKind::TaskComplete => TASK_COMPLETE_TAG
                .is_match(text)
                .then_some(Directive::TaskComplete),
            DirectiveKind::Search => {
                tag_argument(&SEARCH_TAG, text).map(|query| Directive::Search { query })
            }
            DirectiveKind::Report => {
                tag_argument(&REPORT_TAG, text).map(|topic| Directive::Report { topic })
            }
        }
    }
}

/// Whether the text already contains a control tag, which makes waiting
/// for late transcription pointless
pub fn has_directive_prefix(text: &str) -> bool {
    ANY_TAG.is_match(text)
}

/// Remove every control tag, including JSON payloads, and collapse whitespace
pub fn strip_directives(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(m) = ANY_TAG.find(rest) {
        out.push_str(&rest[..m.start()]);
        let after = &rest[m.end()..];
        let skip = tag_span_len(after);
        rest = &after[skip..];
    }
    out.push_str(rest);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Length of the remainder of a tag (payload plus closing bracket)
fn tag_span_len(after_token: &str) -> usize {
    let trimmed = after_token.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
    let offset = after_token.len() - trimmed.len();
    if trimmed.starts_with('{') {
        if let Some(end) = matching_brace(trimmed, 0) {
            let tail = &trimmed[end + 1..];
            return offset + end + 1 + tail.find(']').map_or(tail.len(), |i| i + 1);
        }
        return after_token.len();
    }
    after_token
        .find(']')
        .map_or(after_token.len(), |i| i + 1)
}

/// Byte index of the `}` matching the `{` at `open`, skipping braces
/// inside double-quoted strings
fn matching_brace(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[open..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' | '\u{201D}' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' | '\u{201C}' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// The brace-balanced JSON payload following a tag token
fn tag_payload<'a>(tag: &Regex, text: &'a str) -> Option<&'a str> {
    let token = tag.find(text)?;
    let open = token.end() + text[token.end()..].find('{')?;
    match matching_brace(text, open) {
        Some(close) => Some(&text[open..=close]),
        None => {
            warn!(payload = %&text[open..], "Unbalanced directive payload");
            None
        }
    }
}

fn tag_argument(tag: &Regex, text: &str) -> Option<String> {
    let caps = tag.captures(text)?;
    let arg = caps[1]
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '\u{201C}' || c == '\u{201D}')
        .trim();
    (!arg.is_empty()).then(|| arg.to_string())
}

fn parse_task_create(text: &str) -> Option<Directive> {
    let raw = tag_payload(&TASK_CREATE_TAG, text)?;

    let (title, steps) = match sanitize::parse_lenient(raw) {
        Some(value) => task_from_value(&value),
        None => {
            debug!(payload = %raw, "Task payload is not JSON, trying reconstruction");
            match sanitize::recover_task(raw) {
                Some(recovered) => recovered,
                None => {
                    warn!(payload = %raw, "Dropping unparseable task directive");
                    return None;
                }
            }
        }
    };

    if steps.is_empty() {
        warn!(title = %title, "Dropping task directive without steps");
        return None;
    }
    Some(Directive::TaskCreate { title, steps })
}

fn task_from_value(value: &Value) -> (String, Vec<StepSpec>) {
    let title = value
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Task")
        .to_string();

    let steps = value
        .get("steps")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| match item {
                    Value::String(title) => Some(StepSpec {
                        title: title.trim().to_string(),
                        description: None,
                    }),
                    Value::Object(fields) => Some(StepSpec {
                        title: fields
                            .get("title")
                            .and_then(Value::as_str)
                            .map(|t| t.trim().to_string())
                            .unwrap_or_else(|| format!("Step {}", i + 1)),
                        description: fields
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    }),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    (title, steps)
}

fn parse_step_update(text: &str) -> Option<Directive> {
    let raw = tag_payload(&STEP_UPDATE_TAG, text)?;

    let parsed = sanitize::parse_lenient(raw).and_then(|value| {
        let step = match value.get("step")? {
            Value::Number(n) => usize::try_from(n.as_u64()?).ok()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| StepStatus::from_str(s.trim()).ok())
            .unwrap_or(StepStatus::Completed);
        Some((step, status))
    });

    let (step, status) = match parsed {
        Some(found) => found,
        None => {
            let step = STEP_NUMBER
                .captures(raw)
                .and_then(|caps| caps[1].parse().ok());
            let Some(step) = step else {
                warn!(payload = %raw, "Dropping unparseable step update");
                return None;
            };
            let status = STATUS_WORD
                .captures(raw)
                .and_then(|caps| StepStatus::from_str(&caps[1]).ok())
                .unwrap_or(StepStatus::Completed);
            (step, status)
        }
    };

    Some(Directive::StepUpdate { step, status })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<Directive> {
        TolerantParser.extract(text)
    }

    fn task_titles(directive: &Directive) -> (String, Vec<String>) {
        match directive {
            Directive::TaskCreate { title, steps } => (
                title.clone(),
                steps.iter().map(|s| s.title.clone()).collect(),
            ),
            other => panic!("expected task, got {:?}", other),
        }
    }

    #[test]
    fn test_task_create_strict_json() {
        let found = parse(
            r#"[TASK: {"title": "Fix Sink", "steps": [{"title":"Turn off water"}]}] Let's begin."#,
        );
        assert_eq!(found.len(), 1);
        let (title, steps) = task_titles(&found[0]);
        assert_eq!(title, "Fix Sink");
        assert_eq!(steps, vec!["Turn off water"]);
    }

    #[test]
    fn test_task_create_unquoted_keys_and_single_quotes() {
        let found = parse("[TASK: {title: 'Fix Sink', steps: ['Turn off water']}]");
        let (title, steps) = task_titles(&found[0]);
        assert_eq!(title, "Fix Sink");
        assert_eq!(steps, vec!["Turn off water"]);
    }

    #[test]
    fn test_task_create_smart_quotes() {
        let found = parse(
            "Sure! [TASK: {\u{201C}title\u{201D}: \u{201C}Fix Sink\u{201D}, \u{201C}steps\u{201D}: [{\u{201C}title\u{201D}: \u{201C}Turn off water\u{201D}},]}]",
        );
        let (title, steps) = task_titles(&found[0]);
        assert_eq!(title, "Fix Sink");
        assert_eq!(steps, vec!["Turn off water"]);
    }

    #[test]
    fn test_nested_braces_are_balanced() {
        let text = r#"[TASK: {"title": "Cook", "steps": [{"title": "Boil", "meta": {"mins": 5}}, {"title": "Serve"}]}] trailing } brace"#;
        let (title, steps) = task_titles(&parse(text)[0]);
        assert_eq!(title, "Cook");
        assert_eq!(steps, vec!["Boil", "Serve"]);
    }

    #[test]
    fn test_braces_inside_strings_do_not_count() {
        let text = r#"[TASK: {"title": "Use {curly} tags", "steps": ["One"]}]"#;
        let (title, _) = task_titles(&parse(text)[0]);
        assert_eq!(title, "Use {curly} tags");
    }

    #[test]
    fn test_description_is_kept() {
        let text = r#"[TASK: {"title": "T", "steps": [{"title": "A", "description": "first"}, {}]}]"#;
        match &parse(text)[0] {
            Directive::TaskCreate { steps, .. } => {
                assert_eq!(steps[0].description.as_deref(), Some("first"));
                assert_eq!(steps[1].title, "Step 2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_step_update_variants() {
        assert_eq!(
            parse(r#"Great job! [TASK_UPDATE: {"step": 1, "status": "completed"}]"#),
            vec![Directive::StepUpdate {
                step: 1,
                status: StepStatus::Completed
            }]
        );
        assert_eq!(
            parse("[task update: {step: '2'}]"),
            vec![Directive::StepUpdate {
                step: 2,
                status: StepStatus::Completed
            }]
        );
        assert_eq!(
            parse("[TASK_UPDATE: {step: 0 status: current}]"),
            vec![Directive::StepUpdate {
                step: 0,
                status: StepStatus::Current
            }]
        );
    }

    #[test]
    fn test_task_complete_search_and_report() {
        let found = parse("All done [TASK_COMPLETE] [SEARCH: best drain cleaner] [REPORT: 'Sink repair']");
        assert_eq!(
            found,
            vec![
                Directive::TaskComplete,
                Directive::Search {
                    query: "best drain cleaner".to_string()
                },
                Directive::Report {
                    topic: "Sink repair".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_first_instance_per_family_wins() {
        let found = parse("[SEARCH: first] then [SEARCH: second]");
        assert_eq!(
            found,
            vec![Directive::Search {
                query: "first".to_string()
            }]
        );
    }

    #[test]
    fn test_malformed_payloads_are_dropped() {
        assert!(parse(r#"[TASK: {"title": "Never closed", "steps": ["#).is_empty());
        assert!(parse("[TASK_UPDATE: {nonsense}]").is_empty());
        assert!(parse("[TASK: {\"title\": \"Empty\", \"steps\": []}]").is_empty());
        assert!(parse("[SEARCH:   ]").is_empty());
        assert!(parse("Just talking about tasks and searches.").is_empty());
    }

    #[test]
    fn test_has_directive_prefix() {
        assert!(has_directive_prefix("ok [TASK: {"));
        assert!(has_directive_prefix("[task_complete]"));
        assert!(has_directive_prefix("[SEARCH: x]"));
        assert!(!has_directive_prefix("a [TASKS] list"));
        assert!(!has_directive_prefix("plain text"));
    }

    #[test]
    fn test_strip_directives() {
        let text = r#"Let's start. [TASK: {"title": "A", "steps": [{"title": "x]"}]}] First, [TASK_UPDATE: {"step": 0}] turn it off. [TASK_COMPLETE] [SEARCH: pipes]"#;
        assert_eq!(strip_directives(text), "Let's start. First, turn it off.");
        assert_eq!(strip_directives("no tags here"), "no tags here");
        assert_eq!(strip_directives("cut off [TASK: {\"title\""), "cut off");
    }
}
