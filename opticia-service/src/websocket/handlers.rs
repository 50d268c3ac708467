//! WebSocket connection loop and client message routing.
//!
//! Each inbound message is dispatched by type. Failures stop at this
//! boundary: they become an `error` event and the connection stays open.

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{MessageError, ServiceError, ServiceResult, format_error_chain};
use crate::resilience::{FallbackKind, MediaMode};
use crate::service::BrokerService;
use crate::session::{LiveSession, MediaFrame, SessionMode, StepStatus, prompts};
use crate::upstream::Delivery;

use super::messages::{ClientMessage, EventSink, OutboundEnvelope, ServerEvent};

/// Capabilities advertised in `session.ready`
const CAPABILITIES: [&str; 5] = ["voice", "text", "vision", "tasks", "search"];

/// Handle one client connection until it closes
pub async fn handle_ws_connection(socket: WebSocket, service: Arc<BrokerService>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sink, mut event_rx) = EventSink::channel();
    service.connections.add_connection(conn_id.clone(), sink.clone());

    let conn_id_for_send = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let envelope = OutboundEnvelope::new(&conn_id_for_send, &event);
            match serde_json::to_string(&envelope) {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(conn_id = %conn_id_for_send, error = %e, "Failed to serialize event");
                }
            }
        }
        debug!(conn_id = %conn_id_for_send, "WebSocket send task ended");
    });

    service.connections.send_to(
        &conn_id,
        ServerEvent::ConnectionEstablished {
            session_id: conn_id.clone(),
        },
    );

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => {
                handle_client_message(&service, &conn_id, &sink, text.as_str()).await;
            }
            Ok(Message::Binary(data)) => {
                handle_client_frame(&service, &conn_id, &sink, &data).await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(conn_id = %conn_id, "WebSocket connection closed by client");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    service.release_connection(&conn_id).await;
    send_task.abort();
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

/// Decode and dispatch one client message, reporting failures to the client
pub async fn handle_client_message(
    service: &BrokerService,
    conn_id: &str,
    sink: &EventSink,
    text: &str,
) {
    route(service, conn_id, sink, ClientMessage::decode(text)).await;
}

/// Binary frames carry the same JSON envelope as text frames
pub async fn handle_client_frame(
    service: &BrokerService,
    conn_id: &str,
    sink: &EventSink,
    data: &[u8],
) {
    route(service, conn_id, sink, ClientMessage::decode_bytes(data)).await;
}

async fn route(
    service: &BrokerService,
    conn_id: &str,
    sink: &EventSink,
    decoded: Result<ClientMessage, MessageError>,
) {
    let message = match decoded {
        Ok(message) => message,
        Err(e) => {
            warn!(conn_id = %conn_id, error = %e, "Rejected client message");
            sink.publish(ServerEvent::error(e.error_code(), e.to_string(), true));
            return;
        }
    };

    let kind = message.kind();
    debug!(conn_id = %conn_id, kind = %kind, "Client message");
    if let Err(e) = dispatch(service, conn_id, sink, message).await {
        warn!(conn_id = %conn_id, kind = %kind, error = %e, "Client message failed");
        sink.publish(ServerEvent::error(
            e.error_code(),
            format_error_chain(&e),
            e.recoverable(),
        ));
    }
}

fn decode_media(data: &str) -> ServiceResult<Bytes> {
    BASE64
        .decode(data.trim())
        .map(Bytes::from)
        .map_err(|e| ServiceError::InvalidRequest {
            message: format!("invalid base64 data: {}", e),
        })
}

/// The connection's session for control messages. Never starts a new
/// conversation, but still hands off an expiring one.
async fn existing_session(
    service: &BrokerService,
    conn_id: &str,
    sink: &EventSink,
) -> ServiceResult<Arc<LiveSession>> {
    if service.orchestrator.current(conn_id).await.is_none() {
        return Err(ServiceError::SessionNotActive {
            session_id: conn_id.to_string(),
        });
    }
    service.orchestrator.session_for(conn_id, None, sink).await
}

async fn dispatch(
    service: &BrokerService,
    conn_id: &str,
    sink: &EventSink,
    message: ClientMessage,
) -> ServiceResult<()> {
    let orchestrator = &service.orchestrator;
    match message {
        // ==================== Lifecycle ====================
        ClientMessage::SessionStart(payload) => {
            let mode = payload.mode.unwrap_or_default();
            orchestrator.session_for(conn_id, Some(mode), sink).await?;
            sink.publish(ServerEvent::SessionReady {
                session_id: conn_id.to_string(),
                capabilities: CAPABILITIES.to_vec(),
                mode,
            });
        }
        ClientMessage::SessionEnd => {
            orchestrator.close_session(conn_id).await;
            sink.publish(ServerEvent::SessionEnded {
                session_id: conn_id.to_string(),
            });
        }
        ClientMessage::ModeSwitch(payload) => {
            let previous = orchestrator.set_mode(conn_id, payload.mode, sink).await;
            if let Some(session) = orchestrator.current(conn_id).await
                && session.is_active()
                && previous != payload.mode
            {
                session.send_instruction(
                    &prompts::mode_switched(payload.mode == SessionMode::Voice),
                    false,
                )?;
            }
            sink.publish(ServerEvent::ModeSwitched {
                previous_mode: previous,
                current_mode: payload.mode,
            });
        }
        ClientMessage::ConversationNew => {
            orchestrator.close_session(conn_id).await;
            service.fallback.cleanup(conn_id);
            service.network.cleanup(conn_id);
            sink.publish(ServerEvent::ConversationReset {
                message: "Started a new conversation".to_string(),
            });
        }

        // ==================== Conversation ====================
        ClientMessage::TextSend(payload) => {
            let content = payload.content.trim();
            if content.is_empty() {
                return Err(ServiceError::InvalidRequest {
                    message: "text content is required".to_string(),
                });
            }
            let frame = match payload.frame.as_deref().filter(|f| !f.is_empty()) {
                Some(data) => Some(MediaFrame {
                    data: decode_media(data)?,
                    mime_type: payload
                        .mime_type
                        .unwrap_or_else(|| "image/jpeg".to_string()),
                }),
                None => None,
            };
            let session = orchestrator.session_for(conn_id, None, sink).await?;
            session.send_text(content, frame).await?;
        }
        ClientMessage::AudioChunk(payload) => {
            let data = decode_media(&payload.data)?;
            let session = orchestrator.session_for(conn_id, None, sink).await?;
            session.send_audio_chunk(data)?;
        }
        ClientMessage::VideoFrame(payload) => {
            let data = decode_media(&payload.data)?;
            let session = orchestrator.session_for(conn_id, None, sink).await?;
            match session.send_video_frame(data, &payload.mime_type).await? {
                Delivery::Queued => service.network.record_frame_sent(conn_id),
                Delivery::Dropped => service.network.record_frame_dropped(conn_id),
            }
        }
        ClientMessage::PhotoCapture(payload) => {
            let data = decode_media(&payload.data)?;
            let prompt = prompts::photo_prompt(payload.context.as_deref());
            let session = orchestrator.session_for(conn_id, None, sink).await?;
            session
                .send_image(data, &payload.mime_type, Some(&prompt))
                .await?;
        }

        // ==================== Tools ====================
        ClientMessage::ToolExecute(payload) => {
            let result = service
                .tools
                .execute(&payload.tool_name, payload.args)
                .await;
            let error = result.error_message().map(str::to_string);
            let success = result.is_success();
            let value = match result.outcome {
                crate::tools::ToolOutcome::Success { result } => Some(result),
                crate::tools::ToolOutcome::Error { .. } => None,
            };
            sink.publish(ServerEvent::ToolResult {
                tool_name: payload.tool_name,
                success,
                result: value,
                error,
            });
        }
        ClientMessage::ToolResponse(payload) => {
            let session = existing_session(service, conn_id, sink).await?;
            session.send_tool_response(
                &payload.tool_call_id,
                &payload.tool_name,
                json!({ "result": payload.result }),
            )?;
        }

        // ==================== Tasks ====================
        ClientMessage::TaskAccept => {
            let session = existing_session(service, conn_id, sink).await?;
            let task = session
                .with_state(|state| state.active_task.clone())
                .await
                .ok_or_else(|| ServiceError::InvalidRequest {
                    message: "no task to accept".to_string(),
                })?;
            info!(conn_id = %conn_id, task = %task.title, "Task accepted");
            let instruction = prompts::task_accepted(&task);
            sink.publish(ServerEvent::TaskStart(task));
            session.send_instruction(&instruction, true)?;
        }
        ClientMessage::TaskDecline => {
            let session = existing_session(service, conn_id, sink).await?;
            let declined = session.with_state(|state| state.clear_task()).await;
            info!(conn_id = %conn_id, had_task = declined.is_some(), "Task declined");
            session.send_instruction(&prompts::task_declined(), true)?;
        }
        ClientMessage::TaskStepDone(payload) => {
            let index = payload.step_index;
            let session = existing_session(service, conn_id, sink).await?;
            let updated = session
                .with_state(|state| state.update_step(index, StepStatus::Completed).is_some())
                .await;
            if !updated {
                return Err(ServiceError::InvalidRequest {
                    message: format!("no task step {}", index),
                });
            }
            sink.publish(ServerEvent::TaskStepUpdate {
                step_index: index,
                status: StepStatus::Completed,
            });
            session.send_instruction(&prompts::step_done(index), true)?;
        }
        ClientMessage::ReportDecline(payload) => {
            let topic = payload.topic.trim().to_lowercase();
            if topic.is_empty() {
                return Err(ServiceError::InvalidRequest {
                    message: "report topic is required".to_string(),
                });
            }
            let session = existing_session(service, conn_id, sink).await?;
            session
                .with_state(|state| state.denied_report_topics.insert(topic))
                .await;
        }

        // ==================== Resilience ====================
        ClientMessage::FallbackTrigger(payload) => {
            let kind = FallbackKind::from_str(&payload.kind).map_err(|_| {
                ServiceError::InvalidRequest {
                    message: format!("unknown fallback type: {}", payload.kind),
                }
            })?;
            let outcome = service.fallback.trigger(conn_id, kind, &payload.reason);
            sink.publish(outcome.into());
        }
        ClientMessage::FallbackRecover(payload) => {
            let mode = match payload.mode.as_deref() {
                Some(mode) => MediaMode::from_str(mode).map_err(|_| {
                    ServiceError::InvalidRequest {
                        message: format!("unknown media mode: {}", mode),
                    }
                })?,
                None => MediaMode::Video,
            };
            let outcome = service.fallback.recover(conn_id, mode);
            sink.publish(outcome.into());
        }
        ClientMessage::NetworkPing(payload) => {
            service.network.record_latency(conn_id, payload.latency_ms);
            match service.network.fallback_suggestion(conn_id) {
                Some((suggestion, stats)) => sink.publish(ServerEvent::NetworkDegraded {
                    suggestion: suggestion.to_string(),
                    stats,
                }),
                None => sink.publish(ServerEvent::NetworkPong {
                    timestamp: payload.timestamp,
                    quality: service.network.stats(conn_id).quality,
                }),
            };
        }
        ClientMessage::NetworkStats => {
            sink.publish(ServerEvent::NetworkStats(service.network.stats(conn_id)));
        }

        // ==================== Presentation ====================
        ClientMessage::ThinkingShow => {
            sink.publish(ServerEvent::ThinkingEnabled { visible: true });
        }
        ClientMessage::VideoModeSwitch(payload) => {
            info!(conn_id = %conn_id, mode = %payload.mode, "Video source switched");
            if let Some(session) = orchestrator.current(conn_id).await {
                let summary = format!("User switched to {} view", payload.mode);
                session
                    .with_state(|state| state.running_summary = summary)
                    .await;
            }
            sink.publish(ServerEvent::VideoModeSwitched { mode: payload.mode });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::websocket::messages::VideoSource;
    use crate::tools::ToolRegistry;
    use crate::upstream::UpstreamCommand;
    use crate::upstream::testing::ScriptedUpstream;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn service(upstream: &ScriptedUpstream) -> BrokerService {
        let mut config = ServiceConfig::default();
        config.upstream.api_key = "test".to_string();
        config.directives.after_turn_ms = 20;
        config.directives.empty_turn_ms = 20;
        config.directives.late_delta_ms = 20;
        BrokerService::new(config, Arc::new(upstream.clone()), ToolRegistry::new())
    }

    async fn next(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("sink open")
    }

    async fn send(service: &BrokerService, sink: &EventSink, text: &str) {
        handle_client_message(service, "conn", sink, text).await;
    }

    #[tokio::test]
    async fn test_session_start_and_text_turn() {
        let upstream = ScriptedUpstream::new();
        let service = service(&upstream);
        let (sink, mut rx) = EventSink::channel();

        send(&service, &sink, r#"{"type": "session.start", "payload": {"mode": "text"}}"#).await;
        match next(&mut rx).await {
            ServerEvent::SessionReady { mode, capabilities, .. } => {
                assert_eq!(mode, SessionMode::Text);
                assert!(capabilities.contains(&"vision"));
            }
            other => panic!("unexpected {:?}", other),
        }

        send(
            &service,
            &sink,
            r#"{"type": "text.send", "payload": {"content": "What's the capital of France?"}}"#,
        )
        .await;
        let mut completions = 0;
        loop {
            match next(&mut rx).await {
                ServerEvent::AiTurnComplete {} => {
                    completions += 1;
                    break;
                }
                ServerEvent::AiText { .. } => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(completions, 1);
        service.release_connection("conn").await;
    }

    #[tokio::test]
    async fn test_errors_are_reported_and_connection_survives() {
        let upstream = ScriptedUpstream::new();
        let service = service(&upstream);
        let (sink, mut rx) = EventSink::channel();

        send(&service, &sink, "{nope").await;
        match next(&mut rx).await {
            ServerEvent::Error { code, recoverable, .. } => {
                assert_eq!(code, "parse_error");
                assert!(recoverable);
            }
            other => panic!("unexpected {:?}", other),
        }

        send(&service, &sink, r#"{"type": "text.send", "payload": {"content": "  "}}"#).await;
        match next(&mut rx).await {
            ServerEvent::Error { code, .. } => assert_eq!(code, "invalid_request"),
            other => panic!("unexpected {:?}", other),
        }

        send(&service, &sink, r#"{"type": "task.accept"}"#).await;
        match next(&mut rx).await {
            ServerEvent::Error { code, recoverable, .. } => {
                assert_eq!(code, "session_not_active");
                assert!(recoverable);
            }
            other => panic!("unexpected {:?}", other),
        }

        send(&service, &sink, r#"{"type": "audio.chunk", "payload": {"data": "@@@"}}"#).await;
        match next(&mut rx).await {
            ServerEvent::Error { code, .. } => assert_eq!(code, "invalid_request"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_binary_frame_is_reported() {
        let upstream = ScriptedUpstream::silent();
        let service = service(&upstream);
        let (sink, mut rx) = EventSink::channel();

        handle_client_frame(&service, "conn", &sink, &[0xff, 0xfe, 0x00]).await;
        match next(&mut rx).await {
            ServerEvent::Error { code, recoverable, .. } => {
                assert_eq!(code, "parse_error");
                assert!(recoverable);
            }
            other => panic!("unexpected {:?}", other),
        }

        handle_client_frame(&service, "conn", &sink, br#"{"type": "network.stats"}"#).await;
        assert!(matches!(next(&mut rx).await, ServerEvent::NetworkStats(_)));
    }

    #[tokio::test]
    async fn test_thinking_and_video_source_switch() {
        let upstream = ScriptedUpstream::silent();
        let service = service(&upstream);
        let (sink, mut rx) = EventSink::channel();

        send(&service, &sink, r#"{"type": "thinking.show", "payload": {}}"#).await;
        assert_eq!(next(&mut rx).await, ServerEvent::ThinkingEnabled { visible: true });

        // No session yet: only the acknowledgement
        send(&service, &sink, r#"{"type": "video.modeSwitch", "payload": {"mode": "screen"}}"#).await;
        assert_eq!(
            next(&mut rx).await,
            ServerEvent::VideoModeSwitched {
                mode: VideoSource::Screen
            }
        );
        assert_eq!(service.orchestrator.session_count(), 0);

        send(&service, &sink, r#"{"type": "session.start"}"#).await;
        assert!(matches!(next(&mut rx).await, ServerEvent::SessionReady { .. }));
        send(&service, &sink, r#"{"type": "video.modeSwitch", "payload": {"mode": "camera"}}"#).await;
        assert!(matches!(next(&mut rx).await, ServerEvent::VideoModeSwitched { .. }));
        let session = service.orchestrator.current("conn").await.unwrap();
        assert_eq!(
            session.with_state(|s| s.running_summary.clone()).await,
            "User switched to camera view"
        );
        service.release_connection("conn").await;
    }

    #[tokio::test]
    async fn test_upstream_connect_failure_is_not_recoverable() {
        let upstream = ScriptedUpstream::new();
        upstream.set_fail_connect(true);
        let service = service(&upstream);
        let (sink, mut rx) = EventSink::channel();

        send(&service, &sink, r#"{"type": "text.send", "payload": {"content": "hi"}}"#).await;
        match next(&mut rx).await {
            ServerEvent::Error { code, recoverable, .. } => {
                assert_eq!(code, "upstream_unavailable");
                assert!(!recoverable);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_task_accept_and_step_done() {
        let upstream = ScriptedUpstream::with_responder(|command| match command {
            UpstreamCommand::ClientContent { text, turn_complete: true } if text == "guide me" => vec![
                crate::upstream::UpstreamEvent::TextDelta(
                    r#"[TASK: {title: 'Fix Sink', steps: ['Turn off water', 'Remove trap']}] Sure."#
                        .to_string(),
                ),
                crate::upstream::UpstreamEvent::TurnComplete,
            ],
            _ => Vec::new(),
        });
        let service = service(&upstream);
        let (sink, mut rx) = EventSink::channel();

        send(&service, &sink, r#"{"type": "text.send", "payload": {"content": "guide me"}}"#).await;
        let task = loop {
            if let ServerEvent::TaskPropose(task) = next(&mut rx).await {
                break task;
            }
        };
        assert_eq!(task.title, "Fix Sink");
        assert_eq!(task.steps.len(), 2);

        send(&service, &sink, r#"{"type": "task.accept"}"#).await;
        let started = loop {
            if let ServerEvent::TaskStart(task) = next(&mut rx).await {
                break task;
            }
        };
        assert_eq!(started.id, task.id);

        send(&service, &sink, r#"{"type": "task.step_done", "payload": {"stepIndex": 0}}"#).await;
        let update = loop {
            let event = next(&mut rx).await;
            if matches!(event, ServerEvent::TaskStepUpdate { .. }) {
                break event;
            }
        };
        assert_eq!(
            update,
            ServerEvent::TaskStepUpdate {
                step_index: 0,
                status: StepStatus::Completed
            }
        );

        send(&service, &sink, r#"{"type": "report.decline", "payload": {"topic": "Sinks"}}"#).await;
        let session = service.orchestrator.current("conn").await.unwrap();
        assert!(
            session
                .with_state(|s| s.denied_report_topics.contains("sinks"))
                .await
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let texts = upstream.texts_for(0);
        assert!(texts.iter().any(|(t, _)| t.contains("accepted the guided task")));
        assert!(texts.iter().any(|(t, _)| t.contains("completed step 1")));
        service.release_connection("conn").await;
    }

    #[tokio::test]
    async fn test_fallback_and_network_messages() {
        let upstream = ScriptedUpstream::silent();
        let service = service(&upstream);
        let (sink, mut rx) = EventSink::channel();

        send(&service, &sink, r#"{"type": "fallback.trigger", "payload": {"type": "video", "reason": "bandwidth"}}"#).await;
        match next(&mut rx).await {
            ServerEvent::FallbackActivated { from, to, .. } => {
                assert_eq!(from, MediaMode::Video);
                assert_eq!(to, MediaMode::Photo);
            }
            other => panic!("unexpected {:?}", other),
        }
        send(&service, &sink, r#"{"type": "fallback.recover", "payload": {"mode": "video"}}"#).await;
        assert!(matches!(next(&mut rx).await, ServerEvent::FallbackRecovered { .. }));

        send(&service, &sink, r#"{"type": "fallback.trigger", "payload": {"type": "smoke"}}"#).await;
        assert!(matches!(next(&mut rx).await, ServerEvent::Error { .. }));

        send(&service, &sink, r#"{"type": "network.ping", "payload": {"latencyMs": 40, "timestamp": 17}}"#).await;
        match next(&mut rx).await {
            ServerEvent::NetworkPong { timestamp, .. } => assert_eq!(timestamp, json!(17)),
            other => panic!("unexpected {:?}", other),
        }
        send(&service, &sink, r#"{"type": "network.stats"}"#).await;
        assert!(matches!(next(&mut rx).await, ServerEvent::NetworkStats(_)));

        send(&service, &sink, r#"{"type": "conversation.new"}"#).await;
        assert!(matches!(next(&mut rx).await, ServerEvent::ConversationReset { .. }));
        assert_eq!(service.fallback.len(), 0);
        assert_eq!(service.network.len(), 0);
    }

    #[tokio::test]
    async fn test_upstream_interruption_is_forwarded() {
        let upstream = ScriptedUpstream::silent();
        let service = service(&upstream);
        let (sink, mut rx) = EventSink::channel();

        send(&service, &sink, r#"{"type": "session.start"}"#).await;
        assert!(matches!(next(&mut rx).await, ServerEvent::SessionReady { .. }));

        upstream
            .inject(0, Ok(crate::upstream::UpstreamEvent::Interrupted))
            .await;
        assert_eq!(next(&mut rx).await, ServerEvent::AiInterrupted {});
        service.release_connection("conn").await;
    }

    #[tokio::test]
    async fn test_video_frames_are_counted() {
        let upstream = ScriptedUpstream::silent();
        let service = service(&upstream);
        let (sink, _rx) = EventSink::channel();
        send(&service, &sink, r#"{"type": "video.frame", "payload": {"data": "AAAA"}}"#).await;
        // Stats stay empty until a latency sample exists
        assert_eq!(service.network.stats("conn").frames_sent, 0);
        send(&service, &sink, r#"{"type": "network.ping", "payload": {"latencyMs": 40, "timestamp": 1}}"#).await;
        assert_eq!(service.network.stats("conn").frames_sent, 1);
        let session = service.orchestrator.current("conn").await.unwrap();
        assert!(session.with_state(|s| s.video_seen).await);

        service.release_connection("conn").await;
        assert_eq!(service.orchestrator.session_count(), 0);
        assert_eq!(service.network.len(), 0);
    }
}
