//! Demultiplexer for upstream provider messages.
//!
//! Each wire message may carry several payloads at once (audio parts plus a
//! function call plus transcription fragments), so parsing yields a list.

use base64::Engine;
use serde_json::Value;
use tracing::warn;

/// One semantic event extracted from a provider message.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    SetupComplete,
    /// Raw 16-bit PCM decoded from an inline `audio/pcm*` part.
    Audio(Vec<u8>),
    /// Transcription fragment of what the subject said.
    UserTranscript(String),
    /// Transcription fragment of what the assistant said.
    AssistantTranscript(String),
    TurnComplete,
    Interrupted,
    ToolCall { name: String, args: Value },
}

/// Parse one provider message into its events. Unknown shapes produce an
/// empty list and the read loop keeps going.
pub fn parse_server_message(raw: &str) -> Vec<UpstreamEvent> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unparseable upstream message: {}", e);
            return Vec::new();
        }
    };
    parse_server_value(&value)
}

pub fn parse_server_value(value: &Value) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();

    if value
        .get("setupComplete")
        .map(|v| !v.is_null())
        .unwrap_or(false)
    {
        events.push(UpstreamEvent::SetupComplete);
    }

    let Some(content) = value.get("serverContent") else {
        return events;
    };

    // Native transcription fragments ride alongside the model turn.
    if let Some(text) = content
        .pointer("/inputTranscription/text")
        .or_else(|| content.pointer("/inputAudioTranscription/text"))
        .and_then(|t| t.as_str())
    {
        if !text.is_empty() {
            events.push(UpstreamEvent::UserTranscript(text.to_string()));
        }
    }

    if let Some(text) = content
        .pointer("/outputTranscription/text")
        .or_else(|| content.pointer("/audioTranscription/text"))
        .and_then(|t| t.as_str())
    {
        if !text.is_empty() {
            events.push(UpstreamEvent::AssistantTranscript(text.to_string()));
        }
    }

    if content
        .get("interrupted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        events.push(UpstreamEvent::Interrupted);
    }

    if let Some(parts) = content.pointer("/modelTurn/parts").and_then(|p| p.as_array()) {
        for part in parts {
            if let Some(inline) = part.get("inlineData") {
                let mime = inline
                    .get("mimeType")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default();
                let data = inline.get("data").and_then(|d| d.as_str()).unwrap_or_default();
                if mime.to_ascii_lowercase().starts_with("audio/pcm") && !data.is_empty() {
                    match base64::engine::general_purpose::STANDARD.decode(data) {
                        Ok(audio) => events.push(UpstreamEvent::Audio(audio)),
                        Err(e) => warn!("Bad base64 in audio part: {}", e),
                    }
                }
            }

            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                if !name.is_empty() {
                    events.push(UpstreamEvent::ToolCall {
                        name,
                        args: call.get("args").cloned().unwrap_or(Value::Null),
                    });
                }
            }
        }
    }

    // turnComplete arrives after the parts it closes.
    if content
        .get("turnComplete")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        events.push(UpstreamEvent::TurnComplete);
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use serde_json::json;

    #[test]
    fn setup_complete_detected() {
        let events = parse_server_message(r#"{"setupComplete": {}}"#);
        assert_eq!(events, vec![UpstreamEvent::SetupComplete]);
    }

    #[test]
    fn audio_part_is_base64_decoded() {
        let pcm: Vec<u8> = vec![0x01, 0x02, 0x03, 0x04];
        let encoded = base64::engine::general_purpose::STANDARD.encode(&pcm);
        let message = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": encoded}}
                    ]
                }
            }
        });
        let events = parse_server_value(&message);
        assert_eq!(events, vec![UpstreamEvent::Audio(pcm)]);
    }

    #[test]
    fn non_audio_inline_data_is_skipped() {
        let message = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "image/png", "data": "aGVsbG8="}}
                    ]
                }
            }
        });
        assert!(parse_server_value(&message).is_empty());
    }

    #[test]
    fn function_call_extracted_with_args() {
        let message = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"functionCall": {"name": "alert_family",
                            "args": {"reason": "dor no peito", "severity": "critica"}}}
                    ]
                }
            }
        });
        let events = parse_server_value(&message);
        assert_eq!(events.len(), 1);
        match &events[0] {
            UpstreamEvent::ToolCall { name, args } => {
                assert_eq!(name, "alert_family");
                assert_eq!(args["severity"], "critica");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn transcripts_and_turn_complete_in_one_message() {
        let message = json!({
            "serverContent": {
                "inputTranscription": {"text": "estou com dor"},
                "outputTranscription": {"text": "vou avisar sua família"},
                "turnComplete": true
            }
        });
        let events = parse_server_value(&message);
        assert_eq!(
            events,
            vec![
                UpstreamEvent::UserTranscript("estou com dor".into()),
                UpstreamEvent::AssistantTranscript("vou avisar sua família".into()),
                UpstreamEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn legacy_transcription_field_names_accepted() {
        let message = json!({
            "serverContent": {
                "inputAudioTranscription": {"text": "bom dia"},
                "audioTranscription": {"text": "bom dia, Maria"}
            }
        });
        let events = parse_server_value(&message);
        assert_eq!(
            events,
            vec![
                UpstreamEvent::UserTranscript("bom dia".into()),
                UpstreamEvent::AssistantTranscript("bom dia, Maria".into()),
            ]
        );
    }

    #[test]
    fn interrupted_flag_surfaces() {
        let message = json!({"serverContent": {"interrupted": true}});
        assert_eq!(parse_server_value(&message), vec![UpstreamEvent::Interrupted]);
    }

    #[test]
    fn garbage_and_unknown_shapes_yield_nothing() {
        assert!(parse_server_message("not json at all").is_empty());
        assert!(parse_server_message(r#"{"something":"else"}"#).is_empty());
        assert!(parse_server_message(r#"{"serverContent":{}}"#).is_empty());
    }

    #[test]
    fn mixed_parts_preserve_order() {
        let pcm = base64::engine::general_purpose::STANDARD.encode([0u8; 4]);
        let message = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm", "data": pcm}},
                        {"functionCall": {"name": "confirm_medication",
                            "args": {"medication_name": "Losartana"}}}
                    ]
                },
                "turnComplete": true
            }
        });
        let events = parse_server_value(&message);
        assert!(matches!(events[0], UpstreamEvent::Audio(_)));
        assert!(matches!(events[1], UpstreamEvent::ToolCall { .. }));
        assert_eq!(events[2], UpstreamEvent::TurnComplete);
    }
}
