//! Conversational session: one upstream connection plus the state it serves.
//!
//! Sends are non-blocking enqueues onto the upstream command channel; all
//! replies come back through the receive loop started with
//! [`LiveSession::start_receive_loop`]. A session is never reused after
//! [`LiveSession::close`]; a handoff builds a new one from a snapshot.

mod demux;
pub mod prompts;
mod state;

use bytes::Bytes;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::directives::DirectiveParser;
use crate::error::{ServiceError, ServiceResult, UpstreamError};
use crate::tools::ToolRegistry;
use crate::upstream::{
    Delivery, LiveUpstream, SessionSetup, UpstreamCommand, UpstreamEvents, UpstreamSender,
};
use crate::websocket::EventSink;

pub use state::{
    ActiveTask, ConversationTurn, Role, SEARCH_RESULTS_PREFIX, SYSTEM_PREFIX, SessionMode,
    SessionSnapshot, SessionState, StepSpec, StepStatus, TaskStep,
};

/// Callback fired when the reconnect timer comes due
pub type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Shared collaborators every session needs
#[derive(Clone)]
pub struct SessionDeps {
    pub upstream: Arc<dyn LiveUpstream>,
    pub tools: Arc<ToolRegistry>,
    pub parser: Arc<dyn DirectiveParser>,
    pub config: Arc<ServiceConfig>,
}

/// An image or video frame attached to a user turn
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    pub mime_type: String,
}

struct ReconnectTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    on_due: ReconnectCallback,
}

pub struct LiveSession {
    id: String,
    state: Arc<Mutex<SessionState>>,
    deps: SessionDeps,
    sender: OnceLock<UpstreamSender>,
    events: Mutex<Option<UpstreamEvents>>,
    active: Arc<AtomicBool>,
    closed: AtomicBool,
    cancel: CancellationToken,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    timer: Mutex<Option<ReconnectTimer>>,
}

impl LiveSession {
    pub fn new(state: SessionState, deps: SessionDeps) -> Self {
        Self {
            id: state.id.clone(),
            state: Arc::new(Mutex::new(state)),
            deps,
            sender: OnceLock::new(),
            events: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            receive_task: Mutex::new(None),
            timer: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Open the upstream connection and start the session clock
    pub async fn start(&self) -> ServiceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.not_active());
        }
        if self.sender.get().is_some() {
            return Ok(());
        }

        let upstream = &self.deps.config.upstream;
        let tools = if upstream.declare_tools {
            self.deps.tools.definitions(true)
        } else {
            Vec::new()
        };
        let setup = SessionSetup {
            session_id: self.id.clone(),
            model: upstream.model.clone(),
            system_instruction: prompts::SYSTEM_INSTRUCTION.to_string(),
            tools,
        };

        let connection = self.deps.upstream.connect(setup).await?;

        self.state.lock().await.started_at = Some(Utc::now());
        *self.events.lock().await = Some(connection.events);
        if self.sender.set(connection.sender).is_err() {
            return Err(ServiceError::Internal {
                message: format!("session {} started twice", self.id),
            });
        }
        self.active.store(true, Ordering::Release);

        info!(session_id = %self.id, "Live session started");
        Ok(())
    }

    /// Whether sends will currently be accepted
    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.active.load(Ordering::Acquire)
            && self.sender.get().is_some_and(|s| !s.is_closed())
    }

    fn not_active(&self) -> ServiceError {
        ServiceError::SessionNotActive {
            session_id: self.id.clone(),
        }
    }

    fn enqueue(&self, command: UpstreamCommand) -> ServiceResult<Delivery> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.not_active());
        }
        let sender = self.sender.get().ok_or_else(|| self.not_active())?;
        sender.enqueue(command).map_err(|e| match e {
            UpstreamError::Closed => {
                self.active.store(false, Ordering::Release);
                self.not_active()
            }
            other => ServiceError::Internal {
                message: other.to_string(),
            },
        })
    }

    // ==================== Sends ====================

    /// Send a user turn, optionally with the current camera frame, and ask
    /// for a reply
    pub async fn send_text(&self, content: &str, frame: Option<MediaFrame>) -> ServiceResult<()> {
        if let Some(frame) = frame {
            self.enqueue(UpstreamCommand::RealtimeVideo {
                data: frame.data,
                mime_type: frame.mime_type,
            })?;
            self.mark_video_seen().await;
        }
        self.enqueue(UpstreamCommand::ClientContent {
            text: content.to_string(),
            turn_complete: true,
        })?;

        let summary_chars = self.deps.config.session.summary_chars;
        self.state
            .lock()
            .await
            .record_user_text(content, summary_chars);
        debug!(session_id = %self.id, chars = content.len(), "Sent user text");
        Ok(())
    }

    /// Send broker-authored text. It is not recorded in history.
    pub fn send_instruction(&self, text: &str, turn_complete: bool) -> ServiceResult<()> {
        self.enqueue(UpstreamCommand::ClientContent {
            text: text.to_string(),
            turn_complete,
        })
        .map(|_| ())
    }

    /// Stream 16 kHz PCM16 mono audio
    pub fn send_audio_chunk(&self, data: Bytes) -> ServiceResult<Delivery> {
        self.enqueue(UpstreamCommand::RealtimeAudio(data))
    }

    /// Stream one camera frame
    pub async fn send_video_frame(&self, data: Bytes, mime_type: &str) -> ServiceResult<Delivery> {
        let delivery = self.enqueue(UpstreamCommand::RealtimeVideo {
            data,
            mime_type: mime_type.to_string(),
        })?;
        self.mark_video_seen().await;
        Ok(delivery)
    }

    /// Send a single still image followed by a prompt about it
    pub async fn send_image(
        &self,
        data: Bytes,
        mime_type: &str,
        prompt: Option<&str>,
    ) -> ServiceResult<()> {
        self.enqueue(UpstreamCommand::RealtimeVideo {
            data,
            mime_type: mime_type.to_string(),
        })?;
        self.mark_video_seen().await;
        let prompt = prompt.unwrap_or(prompts::DEFAULT_IMAGE_PROMPT);
        self.send_text(prompt, None).await
    }

    /// Answer a model function call with a client-produced result
    pub fn send_tool_response(
        &self,
        call_id: &str,
        name: &str,
        response: serde_json::Value,
    ) -> ServiceResult<()> {
        self.enqueue(UpstreamCommand::ToolResponse {
            call_id: call_id.to_string(),
            name: name.to_string(),
            response,
        })
        .map(|_| ())
    }

    /// The first video frame shortens the upstream limit, so the reconnect
    /// timer is re-armed against the new deadline.
    async fn mark_video_seen(&self) {
        let first = {
            let mut state = self.state.lock().await;
            !std::mem::replace(&mut state.video_seen, true)
        };
        if !first {
            return;
        }
        debug!(session_id = %self.id, "First video frame, session limit shortened");
        let on_due = self.timer.lock().await.as_ref().map(|t| t.on_due.clone());
        if let Some(on_due) = on_due {
            self.schedule_reconnect_timer(on_due).await;
        }
    }

    // ==================== State ====================

    /// Run a closure against the session state
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn should_reconnect(&self) -> bool {
        self.state
            .lock()
            .await
            .should_reconnect(&self.deps.config.session)
    }

    pub async fn time_remaining(&self) -> Duration {
        self.state
            .lock()
            .await
            .time_remaining(&self.deps.config.session)
    }

    // ==================== Background tasks ====================

    /// Start the receive loop publishing into `sink`. A second call while a
    /// loop exists is a no-op; the first sink stays in place.
    pub async fn start_receive_loop(&self, sink: EventSink) -> ServiceResult<()> {
        let mut task = self.receive_task.lock().await;
        if task.is_some() {
            debug!(session_id = %self.id, "Receive loop already running");
            return Ok(());
        }
        let events = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| self.not_active())?;
        let sender = self.sender.get().cloned().ok_or_else(|| self.not_active())?;

        let context = demux::ReceiveContext {
            session_id: self.id.clone(),
            state: self.state.clone(),
            sender,
            tools: self.deps.tools.clone(),
            parser: self.deps.parser.clone(),
            config: self.deps.config.clone(),
            cancel: self.cancel.child_token(),
            active: self.active.clone(),
            sink,
        };
        let (started_tx, started_rx) = oneshot::channel();
        *task = Some(tokio::spawn(demux::run(context, events, started_tx)));

        started_rx.await.map_err(|_| ServiceError::Internal {
            message: format!("receive loop for {} exited before starting", self.id),
        })
    }

    /// Arm the one-shot reconnect timer at `timeout - buffer` from the
    /// session start, replacing any previous timer.
    pub async fn schedule_reconnect_timer(&self, on_due: ReconnectCallback) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let buffer = self.deps.config.session.reconnect_buffer();
        let delay = self.time_remaining().await.saturating_sub(buffer);

        let mut timer = self.timer.lock().await;
        if let Some(previous) = timer.take() {
            previous.cancel.cancel();
        }

        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let callback = on_due.clone();
        let session_id = self.id.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    info!(session_id = %session_id, "Reconnect timer fired");
                    callback();
                }
            }
        });
        debug!(session_id = %self.id, delay_ms = delay.as_millis() as u64, "Reconnect timer armed");

        *timer = Some(ReconnectTimer {
            cancel,
            handle,
            on_due,
        });
    }

    /// Stop the receive loop and timer, wait for both, then release the
    /// upstream connection. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let timer = self.timer.lock().await.take();
        if let Some(timer) = timer {
            if let Err(e) = timer.handle.await {
                warn!(session_id = %self.id, error = %e, "Reconnect timer task failed");
            }
        }

        let task = self.receive_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(session_id = %self.id, error = %e, "Receive loop task failed");
            }
        }

        self.active.store(false, Ordering::Release);
        if let Some(sender) = self.sender.get() {
            // The upstream may already be gone
            let _ = sender.enqueue(UpstreamCommand::Close);
        }
        info!(session_id = %self.id, "Live session closed");
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
