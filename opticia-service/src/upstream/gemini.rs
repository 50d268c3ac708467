//! Live model client over a bidirectional WebSocket.
//!
//! Each connection runs one pump task that selects over the outbound
//! command channel and the socket, answering pings and forwarding decoded
//! events. The pump exits when the socket closes, the command channel
//! closes, or a `Close` command arrives; the event channel closes with it.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::messages::{ServerFrame, encode_command, encode_setup};
use super::{
    LiveUpstream, SessionSetup, UpstreamCommand, UpstreamConnection, UpstreamEvent,
    UpstreamSender,
};
use crate::config::UpstreamConfig;
use crate::error::{UpstreamError, UpstreamResult};

/// Buffered events per connection before the pump applies backpressure
const EVENT_BUFFER: usize = 512;

pub struct GeminiLiveClient {
    config: UpstreamConfig,
}

impl GeminiLiveClient {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LiveUpstream for GeminiLiveClient {
    async fn connect(&self, setup: SessionSetup) -> UpstreamResult<UpstreamConnection> {
        if !self.config.has_credentials() {
            return Err(UpstreamError::MissingCredentials);
        }

        let url = format!("{}?key={}", self.config.ws_url, self.config.api_key);
        let timeout = self.config.connect_timeout();

        let (ws_stream, _response) =
            match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => {
                    return Err(UpstreamError::Connection {
                        url: self.config.ws_url.clone(),
                        source: e,
                    });
                }
                Err(_) => {
                    return Err(UpstreamError::Handshake {
                        message: format!("connect timed out after {:?}", timeout),
                    });
                }
            };

        let (mut ws_sink, mut ws_source) = ws_stream.split();

        let setup_frame = encode_setup(&setup).map_err(|e| UpstreamError::Protocol {
            message: format!("failed to encode setup: {}", e),
        })?;
        ws_sink
            .send(Message::Text(setup_frame))
            .await
            .map_err(|e| UpstreamError::Handshake {
                message: format!("failed to send setup: {}", e),
            })?;

        let acknowledged = tokio::time::timeout(timeout, async {
            while let Some(message) = ws_source.next().await {
                let raw = match message {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(frame)) => {
                        return Err(UpstreamError::Handshake {
                            message: format!("closed during setup: {:?}", frame),
                        });
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(UpstreamError::Handshake {
                            message: e.to_string(),
                        });
                    }
                };
                match ServerFrame::parse(&raw) {
                    Ok(frame) if frame.is_setup_complete() => return Ok(()),
                    Ok(_) => debug!("Ignoring frame before setup completed"),
                    Err(e) => warn!(error = %e, "Undecodable frame during setup"),
                }
            }
            Err(UpstreamError::Closed)
        })
        .await;

        match acknowledged {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(UpstreamError::Handshake {
                    message: "setup was not acknowledged in time".to_string(),
                });
            }
        }

        info!(
            session_id = %setup.session_id,
            model = %setup.model,
            tools = setup.tools.len(),
            "Upstream session opened"
        );

        let (command_tx, mut command_rx) =
            mpsc::channel::<UpstreamCommand>(self.config.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel::<UpstreamResult<UpstreamEvent>>(EVENT_BUFFER);
        let session_id = setup.session_id;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        let Some(command) = command else {
                            let _ = ws_sink.send(Message::Close(None)).await;
                            break;
                        };
                        let Some(encoded) = encode_command(&command) else {
                            let _ = ws_sink.send(Message::Close(None)).await;
                            break;
                        };
                        let frame = match encoded {
                            Ok(frame) => frame,
                            Err(e) => {
                                error!(session_id = %session_id, error = %e, "Failed to encode upstream command");
                                continue;
                            }
                        };
                        if let Err(e) = ws_sink.send(Message::Text(frame)).await {
                            error!(session_id = %session_id, error = %e, "Upstream send failed");
                            let _ = event_tx
                                .send(Err(UpstreamError::Send { message: e.to_string() }))
                                .await;
                            break;
                        }
                    }
                    message = ws_source.next() => {
                        let raw = match message {
                            Some(Ok(Message::Text(text))) => text.into_bytes(),
                            Some(Ok(Message::Binary(data))) => data,
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    warn!(session_id = %session_id, error = %e, "Failed to answer ping");
                                }
                                continue;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!(session_id = %session_id, frame = ?frame, "Upstream closed the stream");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                error!(session_id = %session_id, error = %e, "Upstream stream error");
                                let _ = event_tx
                                    .send(Err(UpstreamError::Protocol { message: e.to_string() }))
                                    .await;
                                break;
                            }
                            None => break,
                        };

                        let events = match ServerFrame::parse(&raw) {
                            Ok(frame) => frame.into_events().into_iter().map(Ok).collect(),
                            Err(e) => vec![Err(UpstreamError::Protocol {
                                message: format!("undecodable frame: {}", e),
                            })],
                        };
                        for event in events {
                            if event_tx.send(event).await.is_err() {
                                debug!(session_id = %session_id, "Event receiver dropped");
                                return;
                            }
                        }
                    }
                }
            }
            debug!(session_id = %session_id, "Upstream pump ended");
        });

        Ok(UpstreamConnection {
            sender: UpstreamSender::new(command_tx),
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    #[tokio::test]
    async fn test_connect_without_key_is_unavailable() {
        let client = GeminiLiveClient::new(ServiceConfig::default().upstream);
        let setup = SessionSetup {
            session_id: "s".to_string(),
            model: "m".to_string(),
            system_instruction: "x".to_string(),
            tools: Vec::new(),
        };
        assert!(matches!(
            client.connect(setup).await,
            Err(UpstreamError::MissingCredentials)
        ));
    }
}
