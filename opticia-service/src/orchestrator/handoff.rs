//! Context handoff text sent to a freshly reconnected upstream session.

use crate::config::HandoffPolicy;
use crate::directives::strip_directives;
use crate::session::{Role, SYSTEM_PREFIX, SessionState, StepStatus};

const PREAMBLE: &str = "[CONTEXT HANDOFF] This is a continuation of an ongoing conversation. \
     The previous session timed out.";
const CLOSING: &str = "Continue the conversation naturally from where we left off. \
     Do NOT mention the session restart to the user.";

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

fn task_block(state: &SessionState) -> Option<String> {
    let task = state.active_task.as_ref()?;
    let mut lines = vec![format!("[ACTIVE TASK] \"{}\" — IN PROGRESS", task.title)];
    for (i, step) in task.steps.iter().enumerate() {
        let marker = match step.status {
            StepStatus::Completed => " ✓ DONE",
            _ if i == task.current_step => " ← CURRENT STEP",
            _ => "",
        };
        lines.push(format!("  {}. {}{}", i + 1, step.title, marker));
    }
    if task.is_finished() {
        lines.push(
            "IMPORTANT: Every step is done. Confirm with the user and close the task with \
             [TASK_COMPLETE]. Do NOT create a new [TASK:] block."
                .to_string(),
        );
    } else {
        lines.push(format!(
            "IMPORTANT: Continue guiding from step {}. Do NOT restart the task or create a new \
             [TASK:] block. The task UI is already showing on the user's screen.",
            task.current_step + 1
        ));
    }
    Some(lines.join("\n"))
}

/// Recent transcript lines, newest selected first within the budget and
/// rendered oldest first
fn recent_lines(state: &SessionState, policy: &HandoffPolicy) -> Vec<String> {
    let mut selected = Vec::new();
    let mut used = 0;
    for turn in state.history().rev() {
        let line = match turn.role {
            Role::User => {
                if turn.content.trim_start().starts_with(SYSTEM_PREFIX) {
                    continue;
                }
                format!("- User: {}", truncate(turn.content.trim(), policy.max_entry_chars))
            }
            Role::Assistant => {
                let stripped = strip_directives(&turn.content);
                if stripped.is_empty() {
                    continue;
                }
                format!("- Assistant: {}", truncate(&stripped, policy.max_entry_chars))
            }
        };
        let cost = line.chars().count() + 1;
        if used + cost > policy.max_chars {
            break;
        }
        used += cost;
        selected.push(line);
    }
    selected.reverse();
    selected
}

/// Build the handoff message for a restored session
pub fn build_handoff(state: &SessionState, policy: &HandoffPolicy) -> String {
    let mut sections = vec![PREAMBLE.to_string()];
    if let Some(block) = task_block(state) {
        sections.push(block);
    }

    let lines = recent_lines(state, policy);
    if !lines.is_empty() {
        sections.push(format!("Recent conversation:\n{}", lines.join("\n")));
    }

    if !state.running_summary.is_empty() {
        sections.push(format!("Current objective: {}", state.running_summary));
    }
    sections.push(CLOSING.to_string());
    sections.join("\n\n")
}
