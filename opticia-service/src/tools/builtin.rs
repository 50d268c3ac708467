//! Built-in tools registered at startup.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use super::registry::{ToolHandler, ToolRegistry};
use super::search::SearchBackend;
use crate::error::{ToolError, format_error_chain};

/// Names of the built-in tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum BuiltinTool {
    WebSearch,
    DeepResearch,
    VisionAnalyze,
    VisionDirect,
}

impl BuiltinTool {
    fn description(self) -> &'static str {
        match self {
            BuiltinTool::WebSearch => "Search the web for current information using Google Search.",
            BuiltinTool::DeepResearch => {
                "Perform comprehensive research on a topic using multiple sources. Use for complex questions requiring synthesis of information from various sources."
            }
            BuiltinTool::VisionAnalyze => {
                "Request detailed analysis of a specific area in the current view. Use when you need to focus on a particular region, read small text, or examine details."
            }
            BuiltinTool::VisionDirect => {
                "Request the user to adjust their camera angle or position. Use when you need a different view to provide better guidance."
            }
        }
    }

    fn parameters(self) -> Value {
        match self {
            BuiltinTool::WebSearch => json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The search query" }
                },
                "required": ["query"]
            }),
            BuiltinTool::DeepResearch => json!({
                "type": "object",
                "properties": {
                    "topic": { "type": "string", "description": "The research topic or question" },
                    "aspects": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Specific aspects to research (optional)"
                    },
                    "depth": {
                        "type": "string",
                        "enum": ["quick", "standard", "thorough"],
                        "description": "Research depth level (default: standard)"
                    }
                },
                "required": ["topic"]
            }),
            BuiltinTool::VisionAnalyze => json!({
                "type": "object",
                "properties": {
                    "region": {
                        "type": "string",
                        "description": "Description of the region to analyze (e.g., 'the label on the bottle')"
                    },
                    "analysis_type": {
                        "type": "string",
                        "enum": ["text", "detail", "color", "measurement"],
                        "description": "Type of analysis needed"
                    }
                },
                "required": ["region"]
            }),
            BuiltinTool::VisionDirect => json!({
                "type": "object",
                "properties": {
                    "instruction": {
                        "type": "string",
                        "description": "Natural language instruction for camera adjustment"
                    },
                    "reason": {
                        "type": "string",
                        "description": "Brief explanation of why this view is needed"
                    }
                },
                "required": ["instruction"]
            }),
        }
    }

    fn handler(self, search: &Arc<dyn SearchBackend>) -> Arc<dyn ToolHandler> {
        match self {
            BuiltinTool::WebSearch => Arc::new(WebSearch {
                search: search.clone(),
            }),
            BuiltinTool::DeepResearch => Arc::new(DeepResearch {
                search: search.clone(),
            }),
            BuiltinTool::VisionAnalyze => Arc::new(VisionAnalyze),
            BuiltinTool::VisionDirect => Arc::new(VisionDirect),
        }
    }
}

/// Register every built-in tool
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    search: Arc<dyn SearchBackend>,
) -> Result<(), ToolError> {
    for tool in BuiltinTool::iter() {
        registry.register(
            tool.to_string(),
            tool.description(),
            tool.parameters(),
            tool.handler(&search),
        )?;
    }
    Ok(())
}

fn required_str<'a>(args: &'a Value, key: &str, message: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| message.to_string())
}

struct WebSearch {
    search: Arc<dyn SearchBackend>,
}

#[async_trait]
impl ToolHandler for WebSearch {
    async fn call(&self, args: Value) -> Result<Value, String> {
        let query = required_str(&args, "query", "Query is required")?;
        let answer = self
            .search
            .search(query)
            .await
            .map_err(|e| format_error_chain(&e).chars().take(200).collect::<String>())?;
        serde_json::to_value(answer).map_err(|e| e.to_string())
    }
}

struct DeepResearch {
    search: Arc<dyn SearchBackend>,
}

const MAX_FINDINGS: usize = 10;

#[async_trait]
impl ToolHandler for DeepResearch {
    async fn call(&self, args: Value) -> Result<Value, String> {
        let topic = required_str(&args, "topic", "Topic is required")?;
        let depth = args
            .get("depth")
            .and_then(Value::as_str)
            .unwrap_or("standard");
        let query_count = match depth {
            "quick" => 2,
            "thorough" => 6,
            _ => 4,
        };

        let aspects = args
            .get("aspects")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();

        let queries: Vec<String> = std::iter::once(topic.to_string())
            .chain(
                aspects
                    .iter()
                    .take(query_count - 1)
                    .map(|aspect| format!("{} {}", topic, aspect)),
            )
            .collect();

        let mut findings = Vec::new();
        let mut seen_urls: Vec<String> = Vec::new();
        for query in &queries {
            let answer = self
                .search
                .search(query)
                .await
                .map_err(|e| format_error_chain(&e))?;
            let snippet: String = answer.answer.chars().take(150).collect();
            for source in answer.sources {
                if seen_urls.contains(&source.url) {
                    continue;
                }
                seen_urls.push(source.url.clone());
                findings.push(json!({
                    "title": source.title,
                    "snippet": snippet,
                    "url": source.url,
                    "query": query,
                }));
            }
        }

        findings.truncate(MAX_FINDINGS);
        let sources_count = seen_urls.len();
        seen_urls.truncate(MAX_FINDINGS);
        Ok(json!({
            "topic": topic,
            "depth": depth,
            "sources_count": sources_count,
            "findings": findings,
            "sources": seen_urls,
        }))
    }
}

struct VisionAnalyze;

#[async_trait]
impl ToolHandler for VisionAnalyze {
    async fn call(&self, args: Value) -> Result<Value, String> {
        let region = required_str(&args, "region", "Region description is required")?;
        let analysis_type = args
            .get("analysis_type")
            .and_then(Value::as_str)
            .unwrap_or("detail");
        Ok(json!({
            "action": "analyze_region",
            "region": region,
            "analysis_type": analysis_type,
            "message": format!("Focusing on: {}", region),
        }))
    }
}

struct VisionDirect;

#[async_trait]
impl ToolHandler for VisionDirect {
    async fn call(&self, args: Value) -> Result<Value, String> {
        let instruction = required_str(&args, "instruction", "Instruction is required")?;
        let reason = args.get("reason").and_then(Value::as_str).unwrap_or("");
        Ok(json!({
            "action": "camera_direction",
            "instruction": instruction,
            "reason": reason,
            "message": instruction,
        }))
    }
}
