//! Per-conversation state owned by one live session at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use strum::{Display, EnumString};

use crate::config::SessionPolicy;

/// Marker prefixes for turns the broker injects on the user's behalf
pub const SYSTEM_PREFIX: &str = "[SYSTEM]";
pub const SEARCH_RESULTS_PREFIX: &str = "[Search results]";

/// Who authored a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the transcript handed to the upstream model on reconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

/// Modality the client asked for
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SessionMode {
    #[default]
    Voice,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StepStatus {
    Upcoming,
    Current,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: StepStatus,
}

/// A multi-step task the model is guiding the user through.
///
/// `current_step` is the index of the first step that is not completed,
/// or `steps.len()` once every step is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTask {
    pub id: String,
    pub title: String,
    pub steps: Vec<TaskStep>,
    pub current_step: usize,
}

/// A step as parsed from a task directive, before it gets an id and status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub title: String,
    pub description: Option<String>,
}

impl ActiveTask {
    pub fn is_finished(&self) -> bool {
        self.current_step >= self.steps.len()
    }

    fn recompute_current(&mut self) {
        self.current_step = self
            .steps
            .iter()
            .position(|s| s.status != StepStatus::Completed)
            .unwrap_or(self.steps.len());
        let current = self.current_step;
        for (i, step) in self.steps.iter_mut().enumerate() {
            if step.status == StepStatus::Completed {
                continue;
            }
            step.status = if i == current {
                StepStatus::Current
            } else {
                StepStatus::Upcoming
            };
        }
    }

    /// Human-readable progress line used as the running summary
    pub fn progress_summary(&self) -> String {
        match self.steps.get(self.current_step) {
            Some(step) => format!(
                "Guiding: {} (step {}/{}: {})",
                self.title,
                self.current_step + 1,
                self.steps.len(),
                step.title
            ),
            None => format!(
                "Guiding: {} (all {} steps completed)",
                self.title,
                self.steps.len()
            ),
        }
    }
}

/// State of one logical conversation
#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: String,
    pub mode: SessionMode,
    pub video_seen: bool,
    pub started_at: Option<DateTime<Utc>>,
    history: VecDeque<ConversationTurn>,
    history_limit: usize,
    pub active_task: Option<ActiveTask>,
    pub running_summary: String,
    pub tool_call_count: u32,
    pub denied_report_topics: BTreeSet<String>,
}

impl SessionState {
    pub fn new(id: impl Into<String>, mode: SessionMode, history_limit: usize) -> Self {
        Self {
            id: id.into(),
            mode,
            video_seen: false,
            started_at: None,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            active_task: None,
            running_summary: String::new(),
            tool_call_count: 0,
            denied_report_topics: BTreeSet::new(),
        }
    }

    // ==================== History ====================

    pub fn history(&self) -> impl DoubleEndedIterator<Item = &ConversationTurn> + ExactSizeIterator {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Append a turn, evicting the oldest entries beyond the retention bound
    pub fn push_turn(&mut self, role: Role, content: impl Into<String>) {
        self.history.push_back(ConversationTurn {
            role,
            content: content.into(),
        });
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    /// Record text the user typed and refresh the running summary from it
    pub fn record_user_text(&mut self, content: &str, summary_chars: usize) {
        self.push_turn(Role::User, content);
        self.update_summary_from(content, summary_chars);
    }

    /// Refresh the running summary from a user utterance. Broker-injected
    /// turns never become the summary.
    pub fn update_summary_from(&mut self, content: &str, summary_chars: usize) {
        let trimmed = content.trim();
        if trimmed.is_empty()
            || trimmed.starts_with(SYSTEM_PREFIX)
            || trimmed.starts_with(SEARCH_RESULTS_PREFIX)
        {
            return;
        }
        self.running_summary = trimmed.chars().take(summary_chars).collect();
    }

    // ==================== Clock ====================

    pub fn session_timeout(&self, policy: &SessionPolicy) -> Duration {
        if self.video_seen {
            policy.short_timeout()
        } else {
            policy.long_timeout()
        }
    }

    /// Time left before the upstream limit, clamped at zero
    pub fn time_remaining_at(&self, now: DateTime<Utc>, policy: &SessionPolicy) -> Duration {
        let timeout = self.session_timeout(policy);
        let Some(started_at) = self.started_at else {
            return timeout;
        };
        let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
        timeout.saturating_sub(elapsed)
    }

    pub fn time_remaining(&self, policy: &SessionPolicy) -> Duration {
        self.time_remaining_at(Utc::now(), policy)
    }

    pub fn should_reconnect_at(&self, now: DateTime<Utc>, policy: &SessionPolicy) -> bool {
        self.time_remaining_at(now, policy) < policy.reconnect_buffer()
    }

    pub fn should_reconnect(&self, policy: &SessionPolicy) -> bool {
        self.should_reconnect_at(Utc::now(), policy)
    }

    // ==================== Task ====================

    /// Install a new task, replacing any existing one
    pub fn set_task(&mut self, title: impl Into<String>, steps: Vec<StepSpec>) -> &ActiveTask {
        let id = format!("task-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let mut task = ActiveTask {
            id,
            title: title.into(),
            steps: steps
                .into_iter()
                .enumerate()
                .map(|(i, spec)| TaskStep {
                    id: format!("step-{}", i),
                    title: spec.title,
                    description: spec.description,
                    status: StepStatus::Upcoming,
                })
                .collect(),
            current_step: 0,
        };
        task.recompute_current();
        self.running_summary = task.progress_summary();
        self.active_task.insert(task)
    }

    /// Apply a status to one step. Completing a step also completes every
    /// step before it, since guidance is linear. Returns the updated task,
    /// or `None` when there is no task or the index is out of range.
    pub fn update_step(&mut self, index: usize, status: StepStatus) -> Option<&ActiveTask> {
        let task = self.active_task.as_mut()?;
        if index >= task.steps.len() {
            return None;
        }
        if status == StepStatus::Completed {
            for step in &mut task.steps[..=index] {
                step.status = StepStatus::Completed;
            }
        } else {
            task.steps[index].status = status;
        }
        task.recompute_current();
        if status == StepStatus::Completed {
            self.running_summary = task.progress_summary();
        }
        self.active_task.as_ref()
    }

    pub fn clear_task(&mut self) -> Option<ActiveTask> {
        self.active_task.take()
    }

    // ==================== Handoff ====================

    /// Serialize everything a replacement session needs
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            mode: self.mode,
            video_seen: self.video_seen,
            history: self.history.iter().cloned().collect(),
            active_task: self.active_task.clone(),
            running_summary: self.running_summary.clone(),
            tool_call_count: self.tool_call_count,
            denied_report_topics: self.denied_report_topics.iter().cloned().collect(),
        }
    }

    /// Build fresh state from a snapshot. The clock is not carried over;
    /// it starts when the new upstream connection opens.
    pub fn restore(snapshot: SessionSnapshot, history_limit: usize) -> Self {
        let mut state = Self::new(snapshot.id, snapshot.mode, history_limit);
        state.video_seen = snapshot.video_seen;
        for turn in snapshot.history {
            state.push_turn(turn.role, turn.content);
        }
        state.active_task = snapshot.active_task;
        state.running_summary = snapshot.running_summary;
        state.tool_call_count = snapshot.tool_call_count;
        state.denied_report_topics = snapshot.denied_report_topics.into_iter().collect();
        state
    }
}

/// Serialized form of [`SessionState`] carried across a handoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub mode: SessionMode,
    pub video_seen: bool,
    pub history: Vec<ConversationTurn>,
    pub active_task: Option<ActiveTask>,
    pub running_summary: String,
    pub tool_call_count: u32,
    #[serde(default)]
    pub denied_report_topics: Vec<String>,
}
