//! Upstream real-time model interface.
//!
//! A live connection is an actor: callers enqueue [`UpstreamCommand`]s on a
//! bounded channel and read [`UpstreamEvent`]s from another. Sends never
//! wait for a model reply. The event channel closes when the underlying
//! stream ends.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::error::{UpstreamError, UpstreamResult};
use crate::tools::ToolDefinition;

pub mod gemini;
mod messages;
#[cfg(test)]
pub mod testing;

pub use gemini::GeminiLiveClient;

/// Everything needed to open a live session
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub session_id: String,
    pub model: String,
    /// Must be identical for every session so the upstream can cache it
    pub system_instruction: String,
    /// Function declarations, in registry order. Empty to declare none.
    pub tools: Vec<ToolDefinition>,
}

/// Outbound traffic to the model
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamCommand {
    /// A user turn. `turn_complete: false` adds context without asking for a reply.
    ClientContent { text: String, turn_complete: bool },
    /// Raw 16 kHz PCM16 mono audio
    RealtimeAudio(Bytes),
    /// A video frame or still image
    RealtimeVideo { data: Bytes, mime_type: String },
    ToolResponse {
        call_id: String,
        name: String,
        response: Value,
    },
    Close,
}

impl UpstreamCommand {
    /// Media may be dropped under backpressure; conversation content may not
    fn is_droppable(&self) -> bool {
        matches!(
            self,
            UpstreamCommand::RealtimeAudio(_) | UpstreamCommand::RealtimeVideo { .. }
        )
    }
}

/// Inbound traffic from the model, already classified
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    TextDelta(String),
    AudioDelta { data: Bytes, sample_rate: u32 },
    InputTranscription(String),
    OutputTranscription(String),
    ToolCall { id: String, name: String, args: Value },
    TurnComplete,
    /// The user barged in and the model stopped its answer
    Interrupted,
    /// The upstream announced it will close the stream soon
    GoAway { time_left: Option<String> },
}

/// What happened to an enqueued command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Media dropped under backpressure
    Dropped,
}

/// Handle for enqueueing commands on a live connection
#[derive(Debug, Clone)]
pub struct UpstreamSender {
    tx: mpsc::Sender<UpstreamCommand>,
}

impl UpstreamSender {
    pub fn new(tx: mpsc::Sender<UpstreamCommand>) -> Self {
        Self { tx }
    }

    /// Enqueue without waiting. Media is dropped when the queue is full.
    pub fn enqueue(&self, command: UpstreamCommand) -> UpstreamResult<Delivery> {
        match self.tx.try_send(command) {
            Ok(()) => Ok(Delivery::Queued),
            Err(TrySendError::Full(command)) if command.is_droppable() => {
                debug!("Upstream queue full, dropping media frame");
                Ok(Delivery::Dropped)
            }
            Err(TrySendError::Full(_)) => Err(UpstreamError::Send {
                message: "command queue is full".to_string(),
            }),
            Err(TrySendError::Closed(_)) => Err(UpstreamError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a live connection. Each item is one event or one
/// transient receive failure.
pub type UpstreamEvents = mpsc::Receiver<UpstreamResult<UpstreamEvent>>;

/// An open live connection
#[derive(Debug)]
pub struct UpstreamConnection {
    pub sender: UpstreamSender,
    pub events: UpstreamEvents,
}

/// Opens live connections to a real-time model
#[async_trait]
pub trait LiveUpstream: Send + Sync {
    async fn connect(&self, setup: SessionSetup) -> UpstreamResult<UpstreamConnection>;
}
