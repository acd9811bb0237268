//! Downstream control-frame protocol.
//!
//! Control frames are JSON text frames; media is opaque binary. The inbound
//! variants form a closed sum type: an unrecognized `type` is a parse
//! error the reader logs and skips, never a silent accept.

use serde::{Deserialize, Serialize};

/// Frames the device may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Register {
        cpf: String,
    },
    StartCall,
    Hangup,
    Ping,
}

/// Frames the relay sends back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Registered,
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        status: String,
    },
    Pong,
    Error {
        message: String,
    },
}

pub fn parse_control_frame(raw: &str) -> Result<ControlFrame, serde_json::Error> {
    serde_json::from_str(raw)
}

impl ServerFrame {
    pub fn session_created(session_id: &str) -> Self {
        ServerFrame::SessionCreated {
            session_id: session_id.to_string(),
            status: "ready".to_string(),
        }
    }

    pub fn error(message: &str) -> Self {
        ServerFrame::Error {
            message: message.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_parses() {
        let frame = parse_control_frame(r#"{"type":"register","cpf":"12345678900"}"#).unwrap();
        assert_eq!(
            frame,
            ControlFrame::Register {
                cpf: "12345678900".into()
            }
        );
    }

    #[test]
    fn bare_frames_parse() {
        assert_eq!(
            parse_control_frame(r#"{"type":"start_call"}"#).unwrap(),
            ControlFrame::StartCall
        );
        assert_eq!(
            parse_control_frame(r#"{"type":"hangup"}"#).unwrap(),
            ControlFrame::Hangup
        );
        assert_eq!(
            parse_control_frame(r#"{"type":"ping"}"#).unwrap(),
            ControlFrame::Ping
        );
    }

    #[test]
    fn unknown_variant_is_rejected() {
        assert!(parse_control_frame(r#"{"type":"self_destruct"}"#).is_err());
        assert!(parse_control_frame(r#"{"no_type":"here"}"#).is_err());
        assert!(parse_control_frame("not json").is_err());
    }

    #[test]
    fn register_requires_cpf_field() {
        assert!(parse_control_frame(r#"{"type":"register"}"#).is_err());
    }

    #[test]
    fn session_created_uses_camel_case_session_id() {
        let frame = ServerFrame::session_created("abc-123");
        let json = frame.to_json();
        assert_eq!(
            json,
            r#"{"type":"session_created","sessionId":"abc-123","status":"ready"}"#
        );
    }

    #[test]
    fn outbound_frames_serialize_with_snake_case_type() {
        assert_eq!(ServerFrame::Registered.to_json(), r#"{"type":"registered"}"#);
        assert_eq!(ServerFrame::Pong.to_json(), r#"{"type":"pong"}"#);
        assert_eq!(
            ServerFrame::error("nope").to_json(),
            r#"{"type":"error","message":"nope"}"#
        );
    }
}
