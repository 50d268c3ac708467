//! In-process upstream that records commands and answers from a script.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{
    LiveUpstream, SessionSetup, UpstreamCommand, UpstreamConnection, UpstreamEvent,
    UpstreamSender,
};
use crate::error::{UpstreamError, UpstreamResult};

type Responder = dyn Fn(&UpstreamCommand) -> Vec<UpstreamEvent> + Send + Sync;

#[derive(Default)]
struct Recorded {
    fail_connect: bool,
    setups: Vec<SessionSetup>,
    commands: Vec<(usize, UpstreamCommand)>,
    event_senders: Vec<mpsc::Sender<UpstreamResult<UpstreamEvent>>>,
}

#[derive(Clone)]
pub struct ScriptedUpstream {
    recorded: Arc<Mutex<Recorded>>,
    responder: Arc<Responder>,
}

impl Default for ScriptedUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedUpstream {
    /// Answers every completed user turn with two text deltas and a turn end
    pub fn new() -> Self {
        Self::with_responder(|command| match command {
            UpstreamCommand::ClientContent {
                turn_complete: true,
                ..
            } => vec![
                UpstreamEvent::TextDelta("The capital of France".to_string()),
                UpstreamEvent::TextDelta(" is Paris.".to_string()),
                UpstreamEvent::TurnComplete,
            ],
            _ => Vec::new(),
        })
    }

    pub fn with_responder(
        responder: impl Fn(&UpstreamCommand) -> Vec<UpstreamEvent> + Send + Sync + 'static,
    ) -> Self {
        Self {
            recorded: Arc::new(Mutex::new(Recorded::default())),
            responder: Arc::new(responder),
        }
    }

    /// A double that stays silent
    pub fn silent() -> Self {
        Self::with_responder(|_| Vec::new())
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.recorded.lock().unwrap().fail_connect = fail;
    }

    pub fn connect_count(&self) -> usize {
        self.recorded.lock().unwrap().setups.len()
    }

    pub fn setups(&self) -> Vec<SessionSetup> {
        self.recorded.lock().unwrap().setups.clone()
    }

    /// Commands received on one connection, in arrival order
    pub fn commands_for(&self, connection: usize) -> Vec<UpstreamCommand> {
        self.recorded
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(index, _)| *index == connection)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Text of every `ClientContent` on one connection
    pub fn texts_for(&self, connection: usize) -> Vec<(String, bool)> {
        self.commands_for(connection)
            .into_iter()
            .filter_map(|command| match command {
                UpstreamCommand::ClientContent {
                    text,
                    turn_complete,
                } => Some((text, turn_complete)),
                _ => None,
            })
            .collect()
    }

    /// Push an event (or a receive failure) into one connection's stream
    pub async fn inject(&self, connection: usize, event: UpstreamResult<UpstreamEvent>) {
        let sender = self.recorded.lock().unwrap().event_senders[connection].clone();
        let _ = sender.send(event).await;
    }

    /// End one connection's event stream as if the socket dropped
    pub fn drop_stream(&self, connection: usize) {
        let (replacement, _) = mpsc::channel(1);
        self.recorded.lock().unwrap().event_senders[connection] = replacement;
    }
}

#[async_trait]
impl LiveUpstream for ScriptedUpstream {
    async fn connect(&self, setup: SessionSetup) -> UpstreamResult<UpstreamConnection> {
        let (command_tx, mut command_rx) = mpsc::channel::<UpstreamCommand>(64);
        let (event_tx, event_rx) = mpsc::channel(256);

        let index = {
            let mut recorded = self.recorded.lock().unwrap();
            if recorded.fail_connect {
                return Err(UpstreamError::Handshake {
                    message: "scripted connect failure".to_string(),
                });
            }
            recorded.setups.push(setup);
            recorded.event_senders.push(event_tx);
            recorded.setups.len() - 1
        };

        let recorded = self.recorded.clone();
        let responder = self.responder.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let is_close = command == UpstreamCommand::Close;
                let replies = responder(&command);
                let sender = {
                    let mut recorded = recorded.lock().unwrap();
                    recorded.commands.push((index, command));
                    recorded.event_senders[index].clone()
                };
                if is_close {
                    break;
                }
                for reply in replies {
                    if sender.send(Ok(reply)).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(UpstreamConnection {
            sender: UpstreamSender::new(command_tx),
            events: event_rx,
        })
    }
}
