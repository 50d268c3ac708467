//! WebSocket message types.
//!
//! Every frame in either direction is an envelope
//! `{type, sessionId, timestamp, payload}` with a dot-namespaced `type`.
//! Inbound frames are decoded eagerly into [`ClientMessage`]; outbound
//! events are the [`ServerEvent`] union.

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use strum::{Display, EnumString};
use tokio::sync::mpsc;

use crate::error::MessageError;
use crate::resilience::{FallbackOutcome, MediaMode, NetworkQuality, NetworkStats};
use crate::session::{ActiveTask, SessionMode, StepStatus};

// ==================== Inbound ====================

/// Raw inbound envelope, before the payload is interpreted
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Inbound message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum MessageType {
    #[strum(serialize = "session.start")]
    SessionStart,
    #[strum(serialize = "session.end")]
    SessionEnd,
    #[strum(serialize = "mode.switch")]
    ModeSwitch,
    #[strum(serialize = "text.send")]
    TextSend,
    #[strum(serialize = "audio.chunk")]
    AudioChunk,
    #[strum(serialize = "video.frame")]
    VideoFrame,
    #[strum(serialize = "photo.capture")]
    PhotoCapture,
    #[strum(serialize = "tool.execute")]
    ToolExecute,
    #[strum(serialize = "tool.response")]
    ToolResponse,
    #[strum(serialize = "task.accept")]
    TaskAccept,
    #[strum(serialize = "task.decline")]
    TaskDecline,
    #[strum(serialize = "task.step_done")]
    TaskStepDone,
    #[strum(serialize = "report.decline")]
    ReportDecline,
    #[strum(serialize = "fallback.trigger")]
    FallbackTrigger,
    #[strum(serialize = "fallback.recover")]
    FallbackRecover,
    #[strum(serialize = "network.ping")]
    NetworkPing,
    #[strum(serialize = "network.stats")]
    NetworkStats,
    #[strum(serialize = "conversation.new")]
    ConversationNew,
    #[strum(serialize = "thinking.show")]
    ThinkingShow,
    #[strum(serialize = "video.modeSwitch")]
    VideoModeSwitch,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionStartPayload {
    #[serde(default)]
    pub mode: Option<SessionMode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModeSwitchPayload {
    pub mode: SessionMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSendPayload {
    #[serde(default)]
    pub content: String,
    /// Current camera frame, base64
    #[serde(default)]
    pub frame: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioChunkPayload {
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaPayload {
    #[serde(default)]
    pub data: String,
    #[serde(default = "default_image_mime")]
    pub mime_type: String,
    /// What the user wants to know about a captured photo
    #[serde(default)]
    pub context: Option<String>,
}

fn default_image_mime() -> String {
    "image/jpeg".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutePayload {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponsePayload {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_call_id: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDonePayload {
    #[serde(default)]
    pub step_index: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportDeclinePayload {
    #[serde(default)]
    pub topic: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FallbackTriggerPayload {
    #[serde(rename = "type", default = "default_fallback_kind")]
    pub kind: String,
    #[serde(default = "default_fallback_reason")]
    pub reason: String,
}

fn default_fallback_kind() -> String {
    "video".to_string()
}

fn default_fallback_reason() -> String {
    "user_requested".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FallbackRecoverPayload {
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPingPayload {
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default)]
    pub timestamp: Value,
}

/// Which surface the client streams video from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VideoSource {
    #[default]
    Camera,
    Screen,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoModeSwitchPayload {
    #[serde(default)]
    pub mode: VideoSource,
}

/// A decoded inbound message
#[derive(Debug, Clone)]
pub enum ClientMessage {
    SessionStart(SessionStartPayload),
    SessionEnd,
    ModeSwitch(ModeSwitchPayload),
    TextSend(TextSendPayload),
    AudioChunk(AudioChunkPayload),
    VideoFrame(MediaPayload),
    PhotoCapture(MediaPayload),
    ToolExecute(ToolExecutePayload),
    ToolResponse(ToolResponsePayload),
    TaskAccept,
    TaskDecline,
    TaskStepDone(StepDonePayload),
    ReportDecline(ReportDeclinePayload),
    FallbackTrigger(FallbackTriggerPayload),
    FallbackRecover(FallbackRecoverPayload),
    NetworkPing(NetworkPingPayload),
    NetworkStats,
    ConversationNew,
    ThinkingShow,
    VideoModeSwitch(VideoModeSwitchPayload),
}

fn payload<T: DeserializeOwned>(kind: MessageType, value: Value) -> Result<T, MessageError> {
    // Absent payloads decode like empty objects
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|source| MessageError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

impl ClientMessage {
    /// Decode a binary frame, which must carry the same UTF-8 JSON as a text frame
    pub fn decode_bytes(data: &[u8]) -> Result<Self, MessageError> {
        let text = std::str::from_utf8(data).map_err(MessageError::NotUtf8)?;
        Self::decode(text)
    }

    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let raw: RawEnvelope = serde_json::from_str(text).map_err(MessageError::Malformed)?;
        let kind = MessageType::from_str(&raw.kind)
            .map_err(|_| MessageError::UnknownType { kind: raw.kind })?;
        let body = raw.payload;

        Ok(match kind {
            MessageType::SessionStart => ClientMessage::SessionStart(payload(kind, body)?),
            MessageType::SessionEnd => ClientMessage::SessionEnd,
            MessageType::ModeSwitch => ClientMessage::ModeSwitch(payload(kind, body)?),
            MessageType::TextSend => ClientMessage::TextSend(payload(kind, body)?),
            MessageType::AudioChunk => ClientMessage::AudioChunk(payload(kind, body)?),
            MessageType::VideoFrame => ClientMessage::VideoFrame(payload(kind, body)?),
            MessageType::PhotoCapture => ClientMessage::PhotoCapture(payload(kind, body)?),
            MessageType::ToolExecute => ClientMessage::ToolExecute(payload(kind, body)?),
            MessageType::ToolResponse => ClientMessage::ToolResponse(payload(kind, body)?),
            MessageType::TaskAccept => ClientMessage::TaskAccept,
            MessageType::TaskDecline => ClientMessage::TaskDecline,
            MessageType::TaskStepDone => ClientMessage::TaskStepDone(payload(kind, body)?),
            MessageType::ReportDecline => ClientMessage::ReportDecline(payload(kind, body)?),
            MessageType::FallbackTrigger => ClientMessage::FallbackTrigger(payload(kind, body)?),
            MessageType::FallbackRecover => ClientMessage::FallbackRecover(payload(kind, body)?),
            MessageType::NetworkPing => ClientMessage::NetworkPing(payload(kind, body)?),
            MessageType::NetworkStats => ClientMessage::NetworkStats,
            MessageType::ConversationNew => ClientMessage::ConversationNew,
            MessageType::ThinkingShow => ClientMessage::ThinkingShow,
            MessageType::VideoModeSwitch => ClientMessage::VideoModeSwitch(payload(kind, body)?),
        })
    }

    /// Wire name, for logging
    pub fn kind(&self) -> MessageType {
        match self {
            ClientMessage::SessionStart(_) => MessageType::SessionStart,
            ClientMessage::SessionEnd => MessageType::SessionEnd,
            ClientMessage::ModeSwitch(_) => MessageType::ModeSwitch,
            ClientMessage::TextSend(_) => MessageType::TextSend,
            ClientMessage::AudioChunk(_) => MessageType::AudioChunk,
            ClientMessage::VideoFrame(_) => MessageType::VideoFrame,
            ClientMessage::PhotoCapture(_) => MessageType::PhotoCapture,
            ClientMessage::ToolExecute(_) => MessageType::ToolExecute,
            ClientMessage::ToolResponse(_) => MessageType::ToolResponse,
            ClientMessage::TaskAccept => MessageType::TaskAccept,
            ClientMessage::TaskDecline => MessageType::TaskDecline,
            ClientMessage::TaskStepDone(_) => MessageType::TaskStepDone,
            ClientMessage::ReportDecline(_) => MessageType::ReportDecline,
            ClientMessage::FallbackTrigger(_) => MessageType::FallbackTrigger,
            ClientMessage::FallbackRecover(_) => MessageType::FallbackRecover,
            ClientMessage::NetworkPing(_) => MessageType::NetworkPing,
            ClientMessage::NetworkStats => MessageType::NetworkStats,
            ClientMessage::ConversationNew => MessageType::ConversationNew,
            ClientMessage::ThinkingShow => MessageType::ThinkingShow,
            ClientMessage::VideoModeSwitch(_) => MessageType::VideoModeSwitch,
        }
    }
}

// ==================== Outbound ====================

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "connection.established")]
    ConnectionEstablished { session_id: String },
    #[serde(rename = "session.ready")]
    SessionReady {
        session_id: String,
        capabilities: Vec<&'static str>,
        mode: SessionMode,
    },
    #[serde(rename = "session.ended")]
    SessionEnded { session_id: String },
    #[serde(rename = "mode.switched")]
    ModeSwitched {
        previous_mode: SessionMode,
        current_mode: SessionMode,
    },
    #[serde(rename = "session.reconnecting")]
    SessionReconnecting {
        /// Whole seconds left on the expiring upstream session
        time_remaining: u64,
    },
    #[serde(rename = "session.reconnected")]
    SessionReconnected {},

    #[serde(rename = "ai.text")]
    AiText { content: String, complete: bool },
    #[serde(rename = "ai.audio")]
    AiAudio { data: String, sample_rate: u32 },
    #[serde(rename = "ai.tool_call")]
    AiToolCall { name: String, args: Value },
    #[serde(rename = "ai.turn_complete")]
    AiTurnComplete {},
    #[serde(rename = "ai.interrupted")]
    AiInterrupted {},
    #[serde(rename = "user.transcription")]
    UserTranscription { content: String },

    #[serde(rename = "task.propose")]
    TaskPropose(ActiveTask),
    #[serde(rename = "task.start")]
    TaskStart(ActiveTask),
    #[serde(rename = "task.step_update")]
    TaskStepUpdate {
        step_index: usize,
        status: StepStatus,
    },
    #[serde(rename = "task.complete")]
    TaskComplete {},
    #[serde(rename = "report.suggest")]
    ReportSuggest { topic: String },

    #[serde(rename = "tool.result")]
    ToolResult {
        tool_name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "fallback.activated")]
    FallbackActivated {
        from: MediaMode,
        to: MediaMode,
        reason: String,
        message: String,
        can_recover: bool,
    },
    #[serde(rename = "fallback.audio")]
    FallbackAudio {
        reason: String,
        message: String,
        audio_enabled: bool,
    },
    #[serde(rename = "fallback.recovered")]
    FallbackRecovered { mode: MediaMode, message: String },
    #[serde(rename = "fallback.nochange")]
    FallbackNoChange {
        current_mode: MediaMode,
        audio_enabled: bool,
    },

    #[serde(rename = "network.pong")]
    NetworkPong {
        timestamp: Value,
        quality: NetworkQuality,
    },
    #[serde(rename = "network.degraded")]
    NetworkDegraded {
        suggestion: String,
        stats: NetworkStats,
    },
    #[serde(rename = "network.stats")]
    NetworkStats(NetworkStats),

    #[serde(rename = "conversation.reset")]
    ConversationReset { message: String },
    #[serde(rename = "thinking.enabled")]
    ThinkingEnabled { visible: bool },
    #[serde(rename = "video.modeSwitched")]
    VideoModeSwitched { mode: VideoSource },

    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
}

/// Longest error message sent to clients
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl AsRef<str>, recoverable: bool) -> Self {
        metrics_error(code.into(), message.as_ref(), recoverable)
    }

    /// Wire name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionEstablished { .. } => "connection.established",
            ServerEvent::SessionReady { .. } => "session.ready",
            ServerEvent::SessionEnded { .. } => "session.ended",
            ServerEvent::ModeSwitched { .. } => "mode.switched",
            ServerEvent::SessionReconnecting { .. } => "session.reconnecting",
            ServerEvent::SessionReconnected {} => "session.reconnected",
            ServerEvent::AiText { .. } => "ai.text",
            ServerEvent::AiAudio { .. } => "ai.audio",
            ServerEvent::AiToolCall { .. } => "ai.tool_call",
            ServerEvent::AiTurnComplete {} => "ai.turn_complete",
            ServerEvent::AiInterrupted {} => "ai.interrupted",
            ServerEvent::UserTranscription { .. } => "user.transcription",
            ServerEvent::TaskPropose(_) => "task.propose",
            ServerEvent::TaskStart(_) => "task.start",
            ServerEvent::TaskStepUpdate { .. } => "task.step_update",
            ServerEvent::TaskComplete {} => "task.complete",
            ServerEvent::ReportSuggest { .. } => "report.suggest",
            ServerEvent::ToolResult { .. } => "tool.result",
            ServerEvent::FallbackActivated { .. } => "fallback.activated",
            ServerEvent::FallbackAudio { .. } => "fallback.audio",
            ServerEvent::FallbackRecovered { .. } => "fallback.recovered",
            ServerEvent::FallbackNoChange { .. } => "fallback.nochange",
            ServerEvent::NetworkPong { .. } => "network.pong",
            ServerEvent::NetworkDegraded { .. } => "network.degraded",
            ServerEvent::NetworkStats(_) => "network.stats",
            ServerEvent::ConversationReset { .. } => "conversation.reset",
            ServerEvent::ThinkingEnabled { .. } => "thinking.enabled",
            ServerEvent::VideoModeSwitched { .. } => "video.modeSwitched",
            ServerEvent::Error { .. } => "error",
        }
    }
}

impl From<FallbackOutcome> for ServerEvent {
    fn from(outcome: FallbackOutcome) -> Self {
        match outcome {
            FallbackOutcome::Activated {
                from,
                to,
                reason,
                message,
                can_recover,
            } => ServerEvent::FallbackActivated {
                from,
                to,
                reason,
                message: message.to_string(),
                can_recover,
            },
            FallbackOutcome::AudioDisabled { reason, message } => ServerEvent::FallbackAudio {
                reason,
                message: message.to_string(),
                audio_enabled: false,
            },
            FallbackOutcome::Recovered { mode, message } => ServerEvent::FallbackRecovered {
                mode,
                message: message.to_string(),
            },
            FallbackOutcome::NoChange {
                current_mode,
                audio_enabled,
            } => ServerEvent::FallbackNoChange {
                current_mode,
                audio_enabled,
            },
        }
    }
}

fn metrics_error(code: String, message: &str, recoverable: bool) -> ServerEvent {
    metrics::counter!("opticia_errors_total", "code" => code.clone()).increment(1);
    ServerEvent::Error {
        code,
        message: message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect(),
        recoverable,
    }
}

/// Outbound envelope written to the socket
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope<'a> {
    #[serde(flatten)]
    pub event: &'a ServerEvent,
    pub session_id: &'a str,
    pub timestamp: String,
}

impl<'a> OutboundEnvelope<'a> {
    pub fn new(session_id: &'a str, event: &'a ServerEvent) -> Self {
        Self {
            event,
            session_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Typed output channel for one downstream connection
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver that drains it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event. Returns false once the connection is gone.
    pub fn publish(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
