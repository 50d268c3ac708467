//! Tools the model can call.
//!
//! This module provides:
//! - The tool registry with masking and uniform async dispatch
//! - Tool result types fed back to the model
//! - Built-in tools (grounded search, research, vision helpers)

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

mod builtin;
mod registry;
mod search;

pub use builtin::{BuiltinTool, register_builtin_tools};
pub use registry::{ToolDefinition, ToolHandler, ToolRegistry};
pub use search::{GroundedSearchClient, SearchAnswer, SearchBackend, SearchSource};

/// Result of one tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

/// Tool execution outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutcome {
    Success { result: Value },
    Error { error: String },
}

impl ToolResult {
    pub fn success(tool: impl Into<String>, result: Value) -> Self {
        Self {
            tool: tool.into(),
            outcome: ToolOutcome::Success { result },
        }
    }

    pub fn error(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            outcome: ToolOutcome::Error {
                error: error.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            ToolOutcome::Error { error } => Some(error),
            ToolOutcome::Success { .. } => None,
        }
    }

    /// Payload sent back upstream as the function response
    pub fn response_payload(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Success { result } => json!({ "result": result }),
            ToolOutcome::Error { error } => json!({ "error": error }),
        }
    }

    /// Plain-text rendering for feeding results back as a conversation turn
    pub fn to_context_text(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success { result } => match result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolOutcome::Error { error } => format!("failed: {}", error),
        }
    }
}
