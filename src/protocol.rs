//! Wire protocol
//!
//! JSON text frames over the bidirectional channel (§4.7). One message
//! per frame; unknown types and malformed JSON both produce an `error`
//! frame rather than closing the channel.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinQueue {
        #[serde(rename = "inviteToken", default)]
        invite_token: Option<String>,
    },
    LeaveQueue,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        #[serde(rename = "queueSize")]
        queue_size: usize,
        #[serde(rename = "sessionActive")]
        session_active: bool,
        platforms: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    QueueUpdate {
        position: usize,
        #[serde(rename = "estimatedWaitMinutes")]
        estimated_wait_minutes: u64,
    },
    SessionStarted {
        token: String,
        url: String,
    },
    SessionEnded {
        reason: String,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    HeartbeatAck,
}

pub mod error_codes {
    pub const UNKNOWN_MESSAGE_TYPE: &str = "ERR_UNKNOWN_MESSAGE_TYPE";
    pub const INVALID_MESSAGE_FORMAT: &str = "ERR_INVALID_MESSAGE_FORMAT";
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn error_with_details(
        code: &str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

/// Parse one inbound frame. Invalid JSON or an unrecognized `type` both
/// become an `Err` carrying the appropriate error frame to send back —
/// the caller never closes the connection for this.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, ServerMessage> {
    serde_json::from_str::<serde_json::Value>(raw)
        .map_err(|_| ServerMessage::error(error_codes::INVALID_MESSAGE_FORMAT, "invalid JSON"))
        .and_then(|value| {
            serde_json::from_value(value).map_err(|_| {
                ServerMessage::error(error_codes::UNKNOWN_MESSAGE_TYPE, "unknown message type")
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_queue_with_invite_token() {
        let msg = parse_client_message(r#"{"type":"join_queue","inviteToken":"INV1"}"#).unwrap();
        match msg {
            ClientMessage::JoinQueue { invite_token } => {
                assert_eq!(invite_token, Some("INV1".to_string()))
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_join_queue_without_invite_token() {
        let msg = parse_client_message(r#"{"type":"join_queue"}"#).unwrap();
        match msg {
            ClientMessage::JoinQueue { invite_token } => assert_eq!(invite_token, None),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_leave_queue_and_heartbeat() {
        assert!(matches!(
            parse_client_message(r#"{"type":"leave_queue"}"#).unwrap(),
            ClientMessage::LeaveQueue
        ));
        assert!(matches!(
            parse_client_message(r#"{"type":"heartbeat"}"#).unwrap(),
            ClientMessage::Heartbeat
        ));
    }

    #[test]
    fn invalid_json_yields_error_frame_not_panic() {
        let err = parse_client_message("not json").unwrap_err();
        match err {
            ServerMessage::Error { code, .. } => {
                assert_eq!(code, error_codes::INVALID_MESSAGE_FORMAT)
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_yields_error_frame() {
        let err = parse_client_message(r#"{"type":"do_a_barrel_roll"}"#).unwrap_err();
        match err {
            ServerMessage::Error { code, .. } => {
                assert_eq!(code, error_codes::UNKNOWN_MESSAGE_TYPE)
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_message_serializes_with_tag() {
        let msg = ServerMessage::SessionStarted {
            token: "tok".into(),
            url: "https://example.test".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"session_started""#));
        assert!(json.contains(r#""token":"tok""#));
    }

    #[test]
    fn status_omits_position_when_absent() {
        let msg = ServerMessage::Status {
            queue_size: 0,
            session_active: false,
            platforms: vec!["jira".into()],
            position: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("position"));
    }
}
