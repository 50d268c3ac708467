//! Wire format of the live model's bidirectional stream.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{SessionSetup, UpstreamCommand, UpstreamEvent};

/// Output audio rate when the upstream does not say otherwise
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

// ==================== Client → Server ====================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig,
    system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclarations<'a>>,
    input_audio_transcription: Empty,
    output_audio_transcription: Empty,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations<'a> {
    function_declarations: Vec<FunctionDeclaration<'a>>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientFrame {
    ClientContent {
        turns: Vec<Content>,
        #[serde(rename = "turnComplete")]
        turn_complete: bool,
    },
    RealtimeInput {
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<Blob>,
        #[serde(skip_serializing_if = "Option::is_none")]
        video: Option<Blob>,
    },
    ToolResponse {
        #[serde(rename = "functionResponses")]
        function_responses: Vec<FunctionResponse>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

impl Blob {
    fn encode(mime_type: &str, data: &[u8]) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data: BASE64.encode(data),
        }
    }
}

#[derive(Debug, Serialize)]
struct FunctionResponse {
    id: String,
    name: String,
    response: Value,
}

/// Serialize the opening setup frame
pub fn encode_setup(setup: &SessionSetup) -> serde_json::Result<String> {
    let tools = if setup.tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolDeclarations {
            function_declarations: setup
                .tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: &tool.name,
                    description: &tool.description,
                    parameters: &tool.parameters,
                })
                .collect(),
        }]
    };

    serde_json::to_string(&SetupMessage {
        setup: Setup {
            model: &setup.model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO"],
            },
            system_instruction: Content {
                role: None,
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
            tools,
            input_audio_transcription: Empty {},
            output_audio_transcription: Empty {},
        },
    })
}

/// Serialize one command. `Close` has no wire form.
pub fn encode_command(command: &UpstreamCommand) -> Option<serde_json::Result<String>> {
    let frame = match command {
        UpstreamCommand::ClientContent {
            text,
            turn_complete,
        } => ClientFrame::ClientContent {
            turns: vec![Content {
                role: Some("user"),
                parts: vec![TextPart { text: text.clone() }],
            }],
            turn_complete: *turn_complete,
        },
        UpstreamCommand::RealtimeAudio(data) => ClientFrame::RealtimeInput {
            audio: Some(Blob::encode(INPUT_AUDIO_MIME, data)),
            video: None,
        },
        UpstreamCommand::RealtimeVideo { data, mime_type } => ClientFrame::RealtimeInput {
            audio: None,
            video: Some(Blob::encode(mime_type, data)),
        },
        UpstreamCommand::ToolResponse {
            call_id,
            name,
            response,
        } => ClientFrame::ToolResponse {
            function_responses: vec![FunctionResponse {
                id: call_id.clone(),
                name: name.clone(),
                response: response.clone(),
            }],
        },
        UpstreamCommand::Close => return None,
    };
    Some(serde_json::to_string(&frame))
}

// ==================== Server → Client ====================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallFrame>,
    go_away: Option<GoAwayFrame>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    text: Option<String>,
    inline_data: Option<Blob>,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallFrame {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    id: Option<String>,
    name: String,
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAwayFrame {
    time_left: Option<String>,
}

impl ServerFrame {
    pub fn parse(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten one frame into events, in stream order. Undecodable audio
    /// payloads are skipped.
    pub fn into_events(self) -> Vec<UpstreamEvent> {
        let mut events = Vec::new();

        if let Some(content) = self.server_content {
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                        events.push(UpstreamEvent::TextDelta(text));
                    }
                    if let Some(blob) = part.inline_data {
                        if let Ok(data) = BASE64.decode(blob.data.as_bytes()) {
                            events.push(UpstreamEvent::AudioDelta {
                                data: Bytes::from(data),
                                sample_rate: sample_rate(&blob.mime_type),
                            });
                        }
                    }
                }
            }
            if let Some(text) = content.input_transcription.and_then(|t| t.text) {
                events.push(UpstreamEvent::InputTranscription(text));
            }
            if let Some(text) = content.output_transcription.and_then(|t| t.text) {
                events.push(UpstreamEvent::OutputTranscription(text));
            }
            if content.interrupted {
                events.push(UpstreamEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(UpstreamEvent::TurnComplete);
            }
        }

        if let Some(call) = self.tool_call {
            for fc in call.function_calls {
                events.push(UpstreamEvent::ToolCall {
                    id: fc.id.unwrap_or_else(|| fc.name.clone()),
                    name: fc.name,
                    args: fc.args.unwrap_or(Value::Object(Default::default())),
                });
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(UpstreamEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        events
    }
}

fn sample_rate(mime_type: &str) -> u32 {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
        .unwrap_or(DEFAULT_OUTPUT_SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolDefinition;
    use serde_json::json;

    #[test]
    fn test_setup_frame_shape() {
        let setup = SessionSetup {
            session_id: "s".to_string(),
            model: "models/live".to_string(),
            system_instruction: "be helpful".to_string(),
            tools: vec![ToolDefinition {
                name: "web_search".to_string(),
                description: "search".to_string(),
                parameters: json!({"type": "object"}),
                enabled: true,
            }],
        };
        let value: Value = serde_json::from_str(&encode_setup(&setup).unwrap()).unwrap();
        assert_eq!(value["setup"]["model"], "models/live");
        assert_eq!(
            value["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            value["setup"]["systemInstruction"]["parts"][0]["text"],
            "be helpful"
        );
        assert_eq!(
            value["setup"]["tools"][0]["functionDeclarations"][0]["name"],
            "web_search"
        );
        assert_eq!(value["setup"]["outputAudioTranscription"], json!({}));
    }

    #[test]
    fn test_setup_without_tools_omits_field() {
        let setup = SessionSetup {
            session_id: "s".to_string(),
            model: "m".to_string(),
            system_instruction: "x".to_string(),
            tools: Vec::new(),
        };
        let value: Value = serde_json::from_str(&encode_setup(&setup).unwrap()).unwrap();
        assert!(value["setup"].get("tools").is_none());
    }

    #[test]
    fn test_command_frames() {
        let text = encode_command(&UpstreamCommand::ClientContent {
            text: "hello".to_string(),
            turn_complete: false,
        })
        .unwrap()
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(value["clientContent"]["turns"][0]["parts"][0]["text"], "hello");
        assert_eq!(value["clientContent"]["turnComplete"], false);

        let audio = encode_command(&UpstreamCommand::RealtimeAudio(Bytes::from_static(b"\x01\x02")))
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&audio).unwrap();
        assert_eq!(value["realtimeInput"]["audio"]["mimeType"], INPUT_AUDIO_MIME);
        assert_eq!(value["realtimeInput"]["audio"]["data"], "AQI=");

        let response = encode_command(&UpstreamCommand::ToolResponse {
            call_id: "c1".to_string(),
            name: "web_search".to_string(),
            response: json!({"result": 1}),
        })
        .unwrap()
        .unwrap();
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["toolResponse"]["functionResponses"][0]["id"], "c1");

        assert!(encode_command(&UpstreamCommand::Close).is_none());
    }

    #[test]
    fn test_server_content_events_in_order() {
        let raw = json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"text": "Hi"},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAE="}}
                ]},
                "outputTranscription": {"text": "Hi there"},
                "turnComplete": true
            }
        });
        let frame = ServerFrame::parse(raw.to_string().as_bytes()).unwrap();
        assert!(!frame.is_setup_complete());
        assert_eq!(
            frame.into_events(),
            vec![
                UpstreamEvent::TextDelta("Hi".to_string()),
                UpstreamEvent::AudioDelta {
                    data: Bytes::from_static(b"\x00\x01"),
                    sample_rate: 24_000
                },
                UpstreamEvent::OutputTranscription("Hi there".to_string()),
                UpstreamEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_tool_call_and_setup_complete() {
        let frame = ServerFrame::parse(br#"{"setupComplete": {}}"#).unwrap();
        assert!(frame.is_setup_complete());
        assert!(frame.into_events().is_empty());

        let raw = br#"{"toolCall": {"functionCalls": [{"id": "1", "name": "vision_direct", "args": {"instruction": "closer"}}]}}"#;
        let events = ServerFrame::parse(raw).unwrap().into_events();
        assert_eq!(
            events,
            vec![UpstreamEvent::ToolCall {
                id: "1".to_string(),
                name: "vision_direct".to_string(),
                args: json!({"instruction": "closer"}),
            }]
        );
    }

    #[test]
    fn test_sample_rate_parsing() {
        assert_eq!(sample_rate("audio/pcm;rate=16000"), 16_000);
        assert_eq!(sample_rate("audio/pcm"), DEFAULT_OUTPUT_SAMPLE_RATE);
    }
}
