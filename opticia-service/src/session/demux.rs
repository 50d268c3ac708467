//! Receive loop for one live session.
//!
//! Reads the upstream event stream, republishes typed events to the
//! connection's sink, and finalizes each turn: history, directives, and a
//! single `ai.turn_complete`. Finalization may be deferred after the
//! upstream's turn-complete marker because voice transcription can trail
//! it by seconds; any delta that arrives meanwhile pushes the deadline out.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{Role, SEARCH_RESULTS_PREFIX, SessionState};
use crate::config::ServiceConfig;
use crate::directives::{Directive, DirectiveParser, has_directive_prefix};
use crate::tools::{BuiltinTool, ToolRegistry};
use crate::upstream::{UpstreamCommand, UpstreamEvent, UpstreamEvents, UpstreamSender};
use crate::websocket::{EventSink, ServerEvent};

pub(super) struct ReceiveContext {
    pub session_id: String,
    pub state: Arc<Mutex<SessionState>>,
    pub sender: UpstreamSender,
    pub tools: Arc<ToolRegistry>,
    pub parser: Arc<dyn DirectiveParser>,
    pub config: Arc<ServiceConfig>,
    pub cancel: CancellationToken,
    pub active: Arc<AtomicBool>,
    pub sink: EventSink,
}

/// Text collected for the turn in progress
#[derive(Debug, Default)]
struct TurnBuffers {
    /// Model text and output transcription
    text: String,
    /// User speech-to-text
    input: String,
    /// When the deferred finalization is due, if one is pending
    deadline: Option<Instant>,
}

impl TurnBuffers {
    /// Whether anything of the current turn is still unfinalized
    fn is_pending(&self) -> bool {
        self.deadline.is_some() || !self.text.trim().is_empty() || !self.input.trim().is_empty()
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(super) async fn run(
    ctx: ReceiveContext,
    mut events: UpstreamEvents,
    started: oneshot::Sender<()>,
) {
    let _ = started.send(());
    info!(session_id = %ctx.session_id, "Receive loop started");

    let mut turn = TurnBuffers::default();
    loop {
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => {
                debug!(session_id = %ctx.session_id, "Receive loop cancelled");
                break;
            }

            _ = wait_for(turn.deadline) => {
                ctx.finalize_turn(&mut turn).await;
            }

            event = events.recv() => match event {
                Some(Ok(event)) => ctx.handle_event(event, &mut turn).await,
                Some(Err(e)) => {
                    error!(session_id = %ctx.session_id, error = %e, "Upstream receive failed");
                    ctx.sink.publish(ServerEvent::error("ai_error", e.to_string(), true));
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => break,
                        _ = tokio::time::sleep(ctx.config.session.receive_retry()) => {}
                    }
                }
                None => {
                    if turn.deadline.is_some() {
                        ctx.finalize_turn(&mut turn).await;
                    }
                    ctx.active.store(false, Ordering::Release);
                    if !ctx.cancel.is_cancelled() {
                        warn!(session_id = %ctx.session_id, "Upstream stream ended");
                        ctx.sink.publish(ServerEvent::error(
                            "upstream_closed",
                            "The AI connection closed. It will reopen on your next message.",
                            true,
                        ));
                    }
                    break;
                }
            }
        }
    }
    // A turn still waiting on its deadline is flushed so a handoff
    // snapshot taken after close sees it
    if ctx.cancel.is_cancelled() && turn.is_pending() {
        debug!(session_id = %ctx.session_id, "Flushing pending turn on shutdown");
        ctx.finalize_turn(&mut turn).await;
    }
    info!(session_id = %ctx.session_id, "Receive loop ended");
}

impl ReceiveContext {
    async fn handle_event(&self, event: UpstreamEvent, turn: &mut TurnBuffers) {
        match event {
            UpstreamEvent::TextDelta(text) | UpstreamEvent::OutputTranscription(text) => {
                turn.text.push_str(&text);
                self.sink.publish(ServerEvent::AiText {
                    content: text,
                    complete: false,
                });
                self.extend_deadline(turn);
            }
            UpstreamEvent::InputTranscription(text) => {
                turn.input.push_str(&text);
                self.sink
                    .publish(ServerEvent::UserTranscription { content: text });
                self.extend_deadline(turn);
            }
            UpstreamEvent::AudioDelta { data, sample_rate } => {
                self.sink.publish(ServerEvent::AiAudio {
                    data: BASE64.encode(&data),
                    sample_rate,
                });
            }
            UpstreamEvent::ToolCall { id, name, args } => {
                self.run_tool_call(id, name, args).await;
            }
            UpstreamEvent::TurnComplete => {
                if has_directive_prefix(&turn.text) {
                    self.finalize_turn(turn).await;
                } else {
                    let policy = &self.config.directives;
                    let delay = if turn.text.trim().is_empty() {
                        policy.empty_turn()
                    } else {
                        policy.after_turn()
                    };
                    turn.deadline = Some(Instant::now() + delay);
                }
            }
            UpstreamEvent::Interrupted => {
                debug!(session_id = %self.session_id, "Model turn interrupted");
                self.sink.publish(ServerEvent::AiInterrupted {});
            }
            UpstreamEvent::GoAway { time_left } => {
                info!(
                    session_id = %self.session_id,
                    time_left = ?time_left,
                    "Upstream announced shutdown"
                );
            }
        }
    }

    /// A late delta pushes a pending finalization out
    fn extend_deadline(&self, turn: &mut TurnBuffers) {
        if turn.deadline.is_some() {
            turn.deadline = Some(Instant::now() + self.config.directives.late_delta());
        }
    }

    /// Execute a model function call and answer it before reading on
    async fn run_tool_call(&self, call_id: String, name: String, args: serde_json::Value) {
        self.state.lock().await.tool_call_count += 1;
        self.sink.publish(ServerEvent::AiToolCall {
            name: name.clone(),
            args: args.clone(),
        });

        let result = self.tools.execute(&name, args).await;
        debug!(
            session_id = %self.session_id,
            tool = %name,
            success = result.is_success(),
            "Tool call finished"
        );
        if let Err(e) = self.sender.enqueue(UpstreamCommand::ToolResponse {
            call_id,
            name,
            response: result.response_payload(),
        }) {
            warn!(session_id = %self.session_id, error = %e, "Failed to send tool response");
        }
    }

    async fn finalize_turn(&self, turn: &mut TurnBuffers) {
        turn.deadline = None;
        let input = std::mem::take(&mut turn.input);
        let text = std::mem::take(&mut turn.text);

        let directives = {
            let mut state = self.state.lock().await;
            let input = input.trim();
            if !input.is_empty() {
                state.record_user_text(input, self.config.session.summary_chars);
            }
            let reply = text.trim();
            if !reply.is_empty() {
                state.push_turn(Role::Assistant, reply);
            }
            self.parser.extract(&text)
        };

        for directive in directives {
            self.apply_directive(directive).await;
        }
        self.sink.publish(ServerEvent::AiTurnComplete {});
    }

    async fn apply_directive(&self, directive: Directive) {
        debug!(session_id = %self.session_id, directive = ?directive, "Applying directive");
        match directive {
            Directive::TaskCreate { title, steps } => {
                let task = self.state.lock().await.set_task(title, steps).clone();
                info!(
                    session_id = %self.session_id,
                    task = %task.title,
                    steps = task.steps.len(),
                    "Task proposed"
                );
                self.sink.publish(ServerEvent::TaskPropose(task));
            }
            Directive::StepUpdate { step, status } => {
                let updated = self.state.lock().await.update_step(step, status).is_some();
                if updated {
                    self.sink.publish(ServerEvent::TaskStepUpdate {
                        step_index: step,
                        status,
                    });
                } else {
                    warn!(session_id = %self.session_id, step, "Step update without a matching task step");
                }
            }
            Directive::TaskComplete => {
                if self.state.lock().await.clear_task().is_some() {
                    self.sink.publish(ServerEvent::TaskComplete {});
                } else {
                    debug!(session_id = %self.session_id, "Task complete without an active task");
                }
            }
            Directive::Search { query } => self.spawn_search(query),
            Directive::Report { topic } => {
                let declined = self
                    .state
                    .lock()
                    .await
                    .denied_report_topics
                    .contains(&topic.to_lowercase());
                if declined {
                    debug!(session_id = %self.session_id, topic = %topic, "Report topic was declined");
                } else {
                    self.sink.publish(ServerEvent::ReportSuggest { topic });
                }
            }
        }
    }

    /// Run a search off the receive loop and feed the answer back as a turn
    fn spawn_search(&self, query: String) {
        let tool = BuiltinTool::WebSearch.to_string();
        let args = json!({ "query": query });
        self.sink.publish(ServerEvent::AiToolCall {
            name: tool.clone(),
            args: args.clone(),
        });

        let tools = self.tools.clone();
        let state = self.state.clone();
        let sender = self.sender.clone();
        let token = self.cancel.child_token();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = tools.execute(&tool, args) => result,
            };
            state.lock().await.tool_call_count += 1;

            let text = format!("{}: {}", SEARCH_RESULTS_PREFIX, result.to_context_text());
            if let Err(e) = sender.enqueue(UpstreamCommand::ClientContent {
                text,
                turn_complete: true,
            }) {
                warn!(session_id = %session_id, error = %e, "Failed to send search results");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::TolerantParser;
    use crate::error::UpstreamError;
    use crate::session::{SessionMode, StepStatus};
    use crate::tools::ToolHandler;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value) -> Result<Value, String> {
            Ok(args)
        }
    }

    struct Harness {
        events: mpsc::Sender<crate::error::UpstreamResult<UpstreamEvent>>,
        commands: mpsc::Receiver<UpstreamCommand>,
        sink_rx: mpsc::UnboundedReceiver<ServerEvent>,
        state: Arc<Mutex<SessionState>>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn harness(delay_ms: u64) -> Harness {
        let mut config = ServiceConfig::default();
        config.directives.after_turn_ms = delay_ms;
        config.directives.empty_turn_ms = delay_ms;
        config.directives.late_delta_ms = delay_ms;
        config.session.receive_retry_ms = 5;

        let mut tools = ToolRegistry::new();
        tools
            .register("echo", "Echo arguments", json!({"type": "object"}), Arc::new(Echo))
            .unwrap();
        tools
            .register(
                "web_search",
                "Search",
                json!({"type": "object"}),
                Arc::new(Echo),
            )
            .unwrap();

        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (sink, sink_rx) = EventSink::channel();
        let state = Arc::new(Mutex::new(SessionState::new("d", SessionMode::Voice, 30)));
        let cancel = CancellationToken::new();
        let ctx = ReceiveContext {
            session_id: "d".to_string(),
            state: state.clone(),
            sender: UpstreamSender::new(command_tx),
            tools: Arc::new(tools),
            parser: Arc::new(TolerantParser),
            config: Arc::new(config),
            cancel: cancel.clone(),
            active: Arc::new(AtomicBool::new(true)),
            sink,
        };
        let (started_tx, started_rx) = oneshot::channel();
        let handle = tokio::spawn(run(ctx, event_rx, started_tx));
        started_rx.await.unwrap();
        Harness {
            events: event_tx,
            commands: command_rx,
            sink_rx,
            state,
            cancel,
            handle,
        }
    }

    impl Harness {
        async fn send(&self, event: UpstreamEvent) {
            self.events.send(Ok(event)).await.unwrap();
        }

        /// Collect events up to and including the next turn completion
        async fn until_turn_complete(&mut self) -> Vec<ServerEvent> {
            let mut seen = Vec::new();
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), self.sink_rx.recv())
                    .await
                    .expect("turn completed in time")
                    .expect("sink open");
                let done = matches!(event, ServerEvent::AiTurnComplete {});
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }

        async fn history(&self) -> Vec<(Role, String)> {
            self.state
                .lock()
                .await
                .history()
                .map(|t| (t.role, t.content.clone()))
                .collect()
        }
    }

    #[tokio::test]
    async fn test_turn_is_finalized_once() {
        let mut h = harness(20).await;
        h.send(UpstreamEvent::TextDelta("The capital ".to_string())).await;
        h.send(UpstreamEvent::TextDelta("is Paris.".to_string())).await;
        h.send(UpstreamEvent::TurnComplete).await;

        let events = h.until_turn_complete().await;
        let texts = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::AiText { .. }))
            .count();
        assert_eq!(texts, 2);
        assert_eq!(
            h.history().await,
            vec![(Role::Assistant, "The capital is Paris.".to_string())]
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(h.sink_rx.try_recv().is_err());
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_flushes_deferred_turn() {
        let mut h = harness(5_000).await;
        h.send(UpstreamEvent::InputTranscription("what is this".to_string())).await;
        h.send(UpstreamEvent::OutputTranscription("A faucet.".to_string())).await;
        h.send(UpstreamEvent::TurnComplete).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.cancel.cancel();
        (&mut h.handle).await.unwrap();

        assert_eq!(
            h.history().await,
            vec![
                (Role::User, "what is this".to_string()),
                (Role::Assistant, "A faucet.".to_string()),
            ]
        );
        let mut completions = 0;
        while let Ok(event) = h.sink_rx.try_recv() {
            if matches!(event, ServerEvent::AiTurnComplete {}) {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_idle_cancel_publishes_nothing() {
        let mut h = harness(20).await;
        h.cancel.cancel();
        (&mut h.handle).await.unwrap();
        assert!(h.sink_rx.try_recv().is_err());
        assert!(h.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_late_transcription_joins_the_turn() {
        let mut h = harness(100).await;
        h.send(UpstreamEvent::InputTranscription("how do I ".to_string())).await;
        h.send(UpstreamEvent::TurnComplete).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.send(UpstreamEvent::InputTranscription("fix my sink".to_string())).await;
        h.send(UpstreamEvent::OutputTranscription("Let's start.".to_string()))
            .await;

        h.until_turn_complete().await;
        assert_eq!(
            h.history().await,
            vec![
                (Role::User, "how do I fix my sink".to_string()),
                (Role::Assistant, "Let's start.".to_string()),
            ]
        );
        assert_eq!(h.state.lock().await.running_summary, "how do I fix my sink");
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_tagged_turn_is_finalized_immediately() {
        // A delay long enough that only the immediate path can finish in time
        let mut h = harness(60_000).await;
        h.send(UpstreamEvent::TextDelta(
            r#"[TASK: {"title": "Fix Sink", "steps": [{"title": "Turn off water"}, {"title": "Remove trap"}]}] Let's begin."#
                .to_string(),
        ))
        .await;
        h.send(UpstreamEvent::TurnComplete).await;

        let events = h.until_turn_complete().await;
        let proposed = events.iter().find_map(|e| match e {
            ServerEvent::TaskPropose(task) => Some(task.clone()),
            _ => None,
        });
        let task = proposed.expect("task proposed");
        assert_eq!(task.title, "Fix Sink");
        assert_eq!(task.current_step, 0);

        h.send(UpstreamEvent::TextDelta(
            r#"[TASK_UPDATE: {"step": 0, "status": "completed"}] Nice."#.to_string(),
        ))
        .await;
        h.send(UpstreamEvent::TurnComplete).await;
        let events = h.until_turn_complete().await;
        assert!(events.contains(&ServerEvent::TaskStepUpdate {
            step_index: 0,
            status: StepStatus::Completed,
        }));
        assert_eq!(
            h.state.lock().await.active_task.as_ref().unwrap().current_step,
            1
        );

        h.send(UpstreamEvent::TextDelta("[TASK_COMPLETE] All done.".to_string()))
            .await;
        h.send(UpstreamEvent::TurnComplete).await;
        let events = h.until_turn_complete().await;
        assert!(events.contains(&ServerEvent::TaskComplete {}));
        assert!(h.state.lock().await.active_task.is_none());
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_tool_call_round_trip() {
        let mut h = harness(20).await;
        h.send(UpstreamEvent::ToolCall {
            id: "call-1".to_string(),
            name: "echo".to_string(),
            args: json!({"x": 1}),
        })
        .await;
        h.send(UpstreamEvent::ToolCall {
            id: "call-2".to_string(),
            name: "missing".to_string(),
            args: json!({}),
        })
        .await;

        let first = h.commands.recv().await.unwrap();
        assert_eq!(
            first,
            UpstreamCommand::ToolResponse {
                call_id: "call-1".to_string(),
                name: "echo".to_string(),
                response: json!({"result": {"x": 1}}),
            }
        );
        match h.commands.recv().await.unwrap() {
            UpstreamCommand::ToolResponse { response, .. } => {
                assert_eq!(response, json!({"error": "Unknown tool: missing"}))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.state.lock().await.tool_call_count, 2);
        assert!(matches!(
            h.sink_rx.recv().await.unwrap(),
            ServerEvent::AiToolCall { .. }
        ));
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_search_directive_feeds_results_back() {
        let mut h = harness(20).await;
        h.send(UpstreamEvent::TextDelta("[SEARCH: rust async] One moment.".to_string()))
            .await;
        h.send(UpstreamEvent::TurnComplete).await;
        let events = h.until_turn_complete().await;
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::AiToolCall { name, .. } if name == "web_search"
        )));

        match tokio::time::timeout(Duration::from_secs(5), h.commands.recv())
            .await
            .unwrap()
            .unwrap()
        {
            UpstreamCommand::ClientContent {
                text,
                turn_complete,
            } => {
                assert!(text.starts_with(SEARCH_RESULTS_PREFIX));
                assert!(text.contains("rust async"));
                assert!(turn_complete);
            }
            other => panic!("unexpected {:?}", other),
        }
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_declined_report_is_suppressed() {
        let mut h = harness(20).await;
        h.state
            .lock()
            .await
            .denied_report_topics
            .insert("sink repair".to_string());

        h.send(UpstreamEvent::TextDelta("[REPORT: Sink Repair] Done.".to_string()))
            .await;
        h.send(UpstreamEvent::TurnComplete).await;
        let events = h.until_turn_complete().await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServerEvent::ReportSuggest { .. })));

        h.send(UpstreamEvent::TextDelta("[REPORT: Tile grout] Done.".to_string()))
            .await;
        h.send(UpstreamEvent::TurnComplete).await;
        let events = h.until_turn_complete().await;
        assert!(events.contains(&ServerEvent::ReportSuggest {
            topic: "Tile grout".to_string()
        }));
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_error_is_published_and_loop_continues() {
        let mut h = harness(20).await;
        h.events
            .send(Err(UpstreamError::Protocol {
                message: "bad frame".to_string(),
            }))
            .await
            .unwrap();
        match h.sink_rx.recv().await.unwrap() {
            ServerEvent::Error {
                code, recoverable, ..
            } => {
                assert_eq!(code, "ai_error");
                assert!(recoverable);
            }
            other => panic!("unexpected {:?}", other),
        }

        h.send(UpstreamEvent::TextDelta("still here".to_string())).await;
        h.send(UpstreamEvent::TurnComplete).await;
        h.until_turn_complete().await;
        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_end_marks_inactive() {
        let mut h = harness(20).await;
        drop(h.events);
        h.handle.await.unwrap();
        match h.sink_rx.recv().await.unwrap() {
            ServerEvent::Error { code, .. } => assert_eq!(code, "upstream_closed"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
