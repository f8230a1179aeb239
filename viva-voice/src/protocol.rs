// Viva - Realtime wire protocol
// JSON text frames over a streaming socket; audio rides inside as base64 PCM16.

use base64::Engine;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Sample rate the service speaks on both directions.
pub const TARGET_SAMPLE_RATE_HZ: u32 = 24_000;
pub const TARGET_CHANNELS: u16 = 1;

/// Full session configuration sent with `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
    pub max_response_output_tokens: MaxTokens,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: vec!["audio".to_string(), "text".to_string()],
            instructions: String::new(),
            voice: "alloy".to_string(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: Some(TranscriptionConfig {
                model: "whisper-1".to_string(),
            }),
            turn_detection: TurnDetection::default(),
            temperature: 0.8,
            max_response_output_tokens: MaxTokens::Unbounded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            create_response: true,
        }
    }
}

/// Response token cap: a concrete limit or the service's "inf" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxTokens {
    Limited(u32),
    Unbounded,
}

impl Serialize for MaxTokens {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MaxTokens::Limited(n) => serializer.serialize_u32(*n),
            MaxTokens::Unbounded => serializer.serialize_str("inf"),
        }
    }
}

impl<'de> Deserialize<'de> for MaxTokens {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_u64()
                .map(|n| MaxTokens::Limited(n as u32))
                .ok_or_else(|| de::Error::custom("max tokens must be a non-negative integer")),
            Value::String(s) if s == "inf" => Ok(MaxTokens::Unbounded),
            other => Err(de::Error::custom(format!(
                "invalid max tokens value: {other}"
            ))),
        }
    }
}

/// Client-originated events. Always framed as text, even for audio payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioClear,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: Value },
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

/// Server-originated events the client consumes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Value,
    },
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Value,
    },
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioCommitted,
    #[serde(rename = "input_audio_buffer.cleared")]
    InputAudioCleared,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        item: Value,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.truncated")]
    ConversationItemTruncated,
    #[serde(rename = "conversation.item.deleted")]
    ConversationItemDeleted,
    #[serde(rename = "response.created")]
    ResponseCreated,
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded,
    #[serde(rename = "response.output_item.done")]
    OutputItemDone,
    #[serde(rename = "response.content_part.added")]
    ContentPartAdded,
    #[serde(rename = "response.content_part.done")]
    ContentPartDone,
    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },
    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio.done")]
    AudioDone,
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        arguments: String,
    },
    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated {
        #[serde(default)]
        rate_limits: Value,
    },
    #[serde(rename = "error")]
    Error { error: ApiErrorBody },
}

/// Body of a server `error` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl fmt::Display for ApiErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Discriminators this client understands. Anything else is dropped silently
/// so newer servers can add event types without breaking us.
const KNOWN_SERVER_EVENTS: &[&str] = &[
    "session.created",
    "session.updated",
    "input_audio_buffer.committed",
    "input_audio_buffer.cleared",
    "input_audio_buffer.speech_started",
    "input_audio_buffer.speech_stopped",
    "conversation.item.created",
    "conversation.item.input_audio_transcription.completed",
    "conversation.item.truncated",
    "conversation.item.deleted",
    "response.created",
    "response.done",
    "response.output_item.added",
    "response.output_item.done",
    "response.content_part.added",
    "response.content_part.done",
    "response.text.delta",
    "response.text.done",
    "response.audio_transcript.delta",
    "response.audio_transcript.done",
    "response.audio.delta",
    "response.audio.done",
    "response.function_call_arguments.delta",
    "response.function_call_arguments.done",
    "rate_limits.updated",
    "error",
];

pub fn is_known_server_event(kind: &str) -> bool {
    KNOWN_SERVER_EVENTS.contains(&kind)
}

/// Outcome of decoding one inbound text frame.
#[derive(Debug)]
pub enum Inbound {
    Event(ServerEvent),
    /// Unrecognized discriminator, carried for logging.
    Unknown(String),
}

/// Decode an inbound frame, discriminator first.
///
/// Unknown discriminators are reported as `Inbound::Unknown` and should be
/// dropped; a recognized discriminator with an undecodable payload is an
/// `Err` the caller logs and skips.
pub fn decode_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if !is_known_server_event(&kind) {
        return Ok(Inbound::Unknown(kind));
    }
    Ok(Inbound::Event(serde_json::from_value(value)?))
}

pub fn encode_pcm16_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_pcm16_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_carry_wire_discriminators() {
        let append = ClientEvent::InputAudioAppend {
            audio: "AAAA".to_string(),
        };
        let value = serde_json::to_value(&append).expect("serialize append");
        assert_eq!(value["type"], "input_audio_buffer.append");
        assert_eq!(value["audio"], "AAAA");

        let commit = serde_json::to_value(ClientEvent::InputAudioCommit).unwrap();
        assert_eq!(commit["type"], "input_audio_buffer.commit");

        let clear = serde_json::to_value(ClientEvent::InputAudioClear).unwrap();
        assert_eq!(clear["type"], "input_audio_buffer.clear");

        let cancel = serde_json::to_value(ClientEvent::ResponseCancel).unwrap();
        assert_eq!(cancel["type"], "response.cancel");
    }

    #[test]
    fn response_create_omits_empty_body() {
        let value = serde_json::to_value(ClientEvent::ResponseCreate { response: None }).unwrap();
        assert_eq!(value["type"], "response.create");
        assert!(value.get("response").is_none());
    }

    #[test]
    fn session_update_includes_turn_detection() {
        let config = SessionConfig {
            instructions: "be brief".to_string(),
            ..SessionConfig::default()
        };
        let value = serde_json::to_value(ClientEvent::SessionUpdate { session: config }).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["instructions"], "be brief");
        assert_eq!(value["session"]["max_response_output_tokens"], "inf");
    }

    #[test]
    fn max_tokens_round_trips_both_forms() {
        let limited: MaxTokens = serde_json::from_str("2048").expect("number form");
        assert_eq!(limited, MaxTokens::Limited(2048));
        let unbounded: MaxTokens = serde_json::from_str("\"inf\"").expect("sentinel form");
        assert_eq!(unbounded, MaxTokens::Unbounded);

        assert_eq!(serde_json::to_string(&MaxTokens::Limited(16)).unwrap(), "16");
        assert_eq!(
            serde_json::to_string(&MaxTokens::Unbounded).unwrap(),
            "\"inf\""
        );

        assert!(serde_json::from_str::<MaxTokens>("\"lots\"").is_err());
    }

    #[test]
    fn decodes_audio_delta() {
        let frame = r#"{"type":"response.audio.delta","delta":"AAEC","response_id":"r1"}"#;
        match decode_inbound(frame).expect("decode") {
            Inbound::Event(ServerEvent::AudioDelta { delta }) => assert_eq!(delta, "AAEC"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unknown_discriminator_is_reported_not_error() {
        let frame = r#"{"type":"response.hologram.delta","delta":"x"}"#;
        match decode_inbound(frame).expect("decode") {
            Inbound::Unknown(kind) => assert_eq!(kind, "response.hologram.delta"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn known_discriminator_with_bad_payload_is_error() {
        // audio delta without its required field
        let frame = r#"{"type":"response.audio.delta"}"#;
        assert!(decode_inbound(frame).is_err());
    }

    #[test]
    fn decodes_error_event_body() {
        let frame = r#"{"type":"error","error":{"message":"bad session","type":"invalid_request_error","code":"invalid_request"}}"#;
        match decode_inbound(frame).expect("decode") {
            Inbound::Event(ServerEvent::Error { error }) => {
                assert_eq!(error.code.as_deref(), Some("invalid_request"));
                assert_eq!(error.to_string(), "invalid_request: bad session");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unit_events_tolerate_extra_fields() {
        let frame = r#"{"type":"input_audio_buffer.committed","item_id":"item_1","previous_item_id":null}"#;
        match decode_inbound(frame).expect("decode") {
            Inbound::Event(ServerEvent::InputAudioCommitted) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn base64_payloads_reassemble_exactly() {
        let chunks: [&[u8]; 3] = [&[1, 2, 3, 4], &[5, 6], &[7, 8, 9, 10, 11, 12]];
        let mut original = Vec::new();
        let mut reassembled = Vec::new();
        for chunk in chunks {
            original.extend_from_slice(chunk);
            let encoded = encode_pcm16_base64(chunk);
            reassembled.extend(decode_pcm16_base64(&encoded).expect("decode"));
        }
        assert_eq!(reassembled, original);
    }
}
