//! Configuration sections and their defaults.

use serde::Deserialize;
use std::time::Duration;

/// Root service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_upstream")]
    pub upstream: UpstreamConfig,

    #[serde(default = "default_session")]
    pub session: SessionPolicy,

    #[serde(default = "default_handoff")]
    pub handoff: HandoffPolicy,

    #[serde(default = "default_directives")]
    pub directives: DirectivePolicy,

    #[serde(default = "default_network")]
    pub network: NetworkConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            upstream: default_upstream(),
            session: default_session(),
            handoff: default_handoff(),
            directives: default_directives(),
            network: default_network(),
            tools: ToolsConfig::default(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Upstream live-model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Empty means unconfigured; session start then fails with `UpstreamUnavailable`.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Model used for grounded web search over REST
    #[serde(default = "default_search_model")]
    pub search_model: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Capacity of the per-session outbound command channel
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,

    /// Declare registry tools to the model as callable functions
    #[serde(default = "default_true")]
    pub declare_tools: bool,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

/// Per-session clock and retention policy
#[derive(Debug, Clone, Deserialize)]
pub struct SessionPolicy {
    /// Upstream limit once any video has been sent
    #[serde(default = "default_short_timeout_secs")]
    pub short_timeout_secs: u64,

    /// Upstream limit for audio/text-only sessions
    #[serde(default = "default_long_timeout_secs")]
    pub long_timeout_secs: u64,

    #[serde(default = "default_reconnect_buffer_secs")]
    pub reconnect_buffer_secs: u64,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Characters of the latest user utterance kept as the running summary
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,

    /// Pause after a failed receive iteration
    #[serde(default = "default_receive_retry_ms")]
    pub receive_retry_ms: u64,
}

impl SessionPolicy {
    pub fn short_timeout(&self) -> Duration {
        Duration::from_secs(self.short_timeout_secs)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_secs(self.long_timeout_secs)
    }

    pub fn reconnect_buffer(&self) -> Duration {
        Duration::from_secs(self.reconnect_buffer_secs)
    }

    pub fn receive_retry(&self) -> Duration {
        Duration::from_millis(self.receive_retry_ms)
    }
}

/// Character budget for the handoff message sent after reconnect
#[derive(Debug, Clone, Deserialize)]
pub struct HandoffPolicy {
    #[serde(default = "default_handoff_max_chars")]
    pub max_chars: usize,

    #[serde(default = "default_handoff_max_entry_chars")]
    pub max_entry_chars: usize,
}

/// Delays for deferred directive extraction
#[derive(Debug, Clone, Deserialize)]
pub struct DirectivePolicy {
    /// Delay after a delta arrives while extraction is pending
    #[serde(default = "default_late_delta_ms")]
    pub late_delta_ms: u64,

    /// Delay after turn-complete when the turn buffer holds text
    #[serde(default = "default_after_turn_ms")]
    pub after_turn_ms: u64,

    /// Delay after turn-complete when the turn buffer is empty
    #[serde(default = "default_empty_turn_ms")]
    pub empty_turn_ms: u64,
}

impl DirectivePolicy {
    pub fn late_delta(&self) -> Duration {
        Duration::from_millis(self.late_delta_ms)
    }

    pub fn after_turn(&self) -> Duration {
        Duration::from_millis(self.after_turn_ms)
    }

    pub fn empty_turn(&self) -> Duration {
        Duration::from_millis(self.empty_turn_ms)
    }
}

/// Network quality monitor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Latency samples kept per connection
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

/// Tool catalog configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsConfig {
    /// Tools masked off at startup. They stay in the catalog but refuse to run.
    #[serde(default)]
    pub disabled: Vec<String>,
}

// ==================== Default Value Functions ====================

pub(crate) fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

pub(crate) fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub(crate) fn default_port() -> u16 {
    8080
}

pub(crate) fn default_upstream() -> UpstreamConfig {
    UpstreamConfig {
        api_key: String::new(),
        ws_url: default_ws_url(),
        rest_url: default_rest_url(),
        model: default_model(),
        search_model: default_search_model(),
        connect_timeout_secs: default_connect_timeout_secs(),
        command_buffer: default_command_buffer(),
        declare_tools: default_true(),
    }
}

fn default_ws_url() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}

fn default_rest_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_model() -> String {
    "models/gemini-2.5-flash-native-audio-preview-12-2025".to_string()
}

fn default_search_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_command_buffer() -> usize {
    256
}

fn default_true() -> bool {
    true
}

pub(crate) fn default_session() -> SessionPolicy {
    SessionPolicy {
        short_timeout_secs: default_short_timeout_secs(),
        long_timeout_secs: default_long_timeout_secs(),
        reconnect_buffer_secs: default_reconnect_buffer_secs(),
        history_limit: default_history_limit(),
        summary_chars: default_summary_chars(),
        receive_retry_ms: default_receive_retry_ms(),
    }
}

fn default_short_timeout_secs() -> u64 {
    120
}

fn default_long_timeout_secs() -> u64 {
    900
}

fn default_reconnect_buffer_secs() -> u64 {
    15
}

fn default_history_limit() -> usize {
    30
}

fn default_summary_chars() -> usize {
    200
}

fn default_receive_retry_ms() -> u64 {
    100
}

pub(crate) fn default_handoff() -> HandoffPolicy {
    HandoffPolicy {
        max_chars: default_handoff_max_chars(),
        max_entry_chars: default_handoff_max_entry_chars(),
    }
}

fn default_handoff_max_chars() -> usize {
    4000
}

fn default_handoff_max_entry_chars() -> usize {
    500
}

pub(crate) fn default_directives() -> DirectivePolicy {
    DirectivePolicy {
        late_delta_ms: default_late_delta_ms(),
        after_turn_ms: default_after_turn_ms(),
        empty_turn_ms: default_empty_turn_ms(),
    }
}

fn default_late_delta_ms() -> u64 {
    1500
}

fn default_after_turn_ms() -> u64 {
    2000
}

fn default_empty_turn_ms() -> u64 {
    5000
}

pub(crate) fn default_network() -> NetworkConfig {
    NetworkConfig {
        window_size: default_window_size(),
    }
}

fn default_window_size() -> usize {
    20
}
