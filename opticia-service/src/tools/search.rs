//! Grounded web search over the model provider's REST API.
//!
//! Search runs as a side-channel request rather than through the live
//! session, so it works regardless of which tools the live model accepts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::SearchError;

/// Sources kept per answer
const MAX_SOURCES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSource {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchAnswer {
    pub query: String,
    pub answer: String,
    pub sources: Vec<SearchSource>,
}

/// Anything that can answer a search query
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str) -> Result<SearchAnswer, SearchError>;
}

/// REST client for grounded `generateContent` calls
pub struct GroundedSearchClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GroundedSearchClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(SearchError::Request)?;

        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            model: config.search_model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<TextPart>,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<WebChunk>,
}

#[derive(Debug, Deserialize)]
struct WebChunk {
    title: Option<String>,
    uri: Option<String>,
}

impl GenerateContentResponse {
    fn into_answer(self, query: &str) -> SearchAnswer {
        let candidate = self.candidates.into_iter().next();
        let (content, grounding) = match candidate {
            Some(c) => (c.content, c.grounding_metadata),
            None => (None, None),
        };

        let answer: String = content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        let sources = grounding
            .map(|g| {
                g.grounding_chunks
                    .into_iter()
                    .filter_map(|chunk| chunk.web)
                    .map(|web| SearchSource {
                        title: web.title.unwrap_or_default(),
                        url: web.uri.unwrap_or_default(),
                    })
                    .take(MAX_SOURCES)
                    .collect()
            })
            .unwrap_or_default();

        SearchAnswer {
            query: query.to_string(),
            answer: if answer.trim().is_empty() {
                "No results found.".to_string()
            } else {
                answer
            },
            sources,
        }
    }
}

#[async_trait]
impl SearchBackend for GroundedSearchClient {
    async fn search(&self, query: &str) -> Result<SearchAnswer, SearchError> {
        if self.api_key.trim().is_empty() {
            return Err(SearchError::MissingCredentials);
        }

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "contents": [{
                "parts": [{ "text": format!("Search and provide a concise, factual answer: {}", query) }]
            }],
            "tools": [{ "google_search": {} }]
        });

        debug!(query = %query, "Running grounded search");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(SearchError::Request)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(SearchError::Status {
                status,
                message: message.chars().take(200).collect(),
            });
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(SearchError::InvalidResponse)?;
        Ok(parsed.into_answer(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing_keeps_five_sources() {
        let chunks: Vec<_> = (0..8)
            .map(|i| json!({"web": {"title": format!("Site {}", i), "uri": format!("https://s{}.example", i)}}))
            .collect();
        let raw = json!({
            "candidates": [{
                "content": {"parts": [{"text": "Paris "}, {"text": "is the capital."}]},
                "groundingMetadata": {"groundingChunks": chunks}
            }]
        });
        let parsed: GenerateContentResponse = serde_json::from_value(raw).unwrap();
        let answer = parsed.into_answer("capital of France");

        assert_eq!(answer.answer, "Paris is the capital.");
        assert_eq!(answer.sources.len(), 5);
        assert_eq!(answer.sources[0].url, "https://s0.example");
    }

    #[test]
    fn test_empty_response_has_placeholder_answer() {
        let parsed: GenerateContentResponse = serde_json::from_value(json!({})).unwrap();
        let answer = parsed.into_answer("q");
        assert_eq!(answer.answer, "No results found.");
        assert!(answer.sources.is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_request() {
        let config = crate::config::ServiceConfig::default().upstream;
        let client = GroundedSearchClient::new(&config).unwrap();
        assert!(matches!(
            client.search("anything").await,
            Err(SearchError::MissingCredentials)
        ));
    }
}
