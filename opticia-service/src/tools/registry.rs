//! Tool registry shared by the receive loop and client-initiated execution.
//!
//! Enumeration order is lexicographic by name and masking never removes an
//! entry, so the capability list declared to the model stays byte-stable
//! across turns and reconnects.

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use super::ToolResult;
use crate::error::ToolError;

/// Handler invoked with the model-supplied arguments
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value, String>;
}

/// Public description of a registered tool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub enabled: bool,
}

struct RegisteredTool {
    description: String,
    parameters: Value,
    enabled: AtomicBool,
    handler: Arc<dyn ToolHandler>,
}

/// Catalog of callable tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique; a second registration under the
    /// same name is rejected.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), ToolError> {
        let name = name.into();
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered { name });
        }
        debug!(tool = %name, "Registering tool");
        self.tools.insert(
            name,
            RegisteredTool {
                description: description.into(),
                parameters,
                enabled: AtomicBool::new(true),
                handler,
            },
        );
        Ok(())
    }

    /// Tool definitions in name order. Disabled tools are included only when
    /// asked for, and keep their position when they are.
    pub fn definitions(&self, include_disabled: bool) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter_map(|(name, tool)| {
                let enabled = tool.enabled.load(Ordering::Acquire);
                (include_disabled || enabled).then(|| ToolDefinition {
                    name: name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                    enabled,
                })
            })
            .collect()
    }

    /// Enable or disable a tool. Returns false if no such tool exists.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.tools.get(name) {
            Some(tool) => {
                tool.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Run a tool. Every failure, including a panicking handler, comes back
    /// as a failed result rather than an error.
    pub async fn execute(&self, name: &str, args: Value) -> ToolResult {
        let outcome = self.dispatch(name, args).await;
        let label = if outcome.is_ok() { "success" } else { "error" };
        metrics::counter!("opticia_tool_calls_total", "tool" => name.to_string(), "outcome" => label)
            .increment(1);

        match outcome {
            Ok(result) => ToolResult::success(name, result),
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool execution failed");
                ToolResult::error(name, e.to_string())
            }
        }
    }

    async fn dispatch(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_string(),
        })?;
        if !tool.enabled.load(Ordering::Acquire) {
            return Err(ToolError::ToolDisabled {
                name: name.to_string(),
            });
        }

        let handler = tool.handler.clone();
        match AssertUnwindSafe(handler.call(args)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ToolError::Execution {
                name: name.to_string(),
                message,
            }),
            Err(_) => Err(ToolError::Execution {
                name: name.to_string(),
                message: "handler panicked".to_string(),
            }),
        }
    }
}
