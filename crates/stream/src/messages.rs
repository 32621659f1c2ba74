//! Progress stream message types and parser.
//!
//! The server sends JSON text frames tagged by a `"type"` field. Progress
//! events carry their fields next to the tag:
//! `{"type": "progress", "job_id": "...", "progress": 42, ...}`.

use serde::{Deserialize, Serialize};
use vidshelf_core::progress::ProgressEvent;

/// Messages received from the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The auth token was accepted; events follow.
    AuthOk,

    /// The auth token was refused. Not retried.
    AuthError {
        #[serde(default)]
        message: String,
    },

    /// A job progress update.
    #[serde(alias = "job_progress")]
    Progress(ProgressEvent),

    /// Any message type this client does not handle.
    #[serde(other)]
    Other,
}

/// Messages sent to the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth { token: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        // Infallible for string-only variants.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse a raw text frame into a [`ServerMessage`].
pub fn parse_server_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use vidshelf_core::progress::JobStatus;

    #[test]
    fn parse_auth_ok() {
        assert_eq!(
            parse_server_message(r#"{"type": "auth_ok"}"#).unwrap(),
            ServerMessage::AuthOk
        );
    }

    #[test]
    fn parse_auth_error_without_message() {
        let msg = parse_server_message(r#"{"type": "auth_error"}"#).unwrap();
        assert_matches!(msg, ServerMessage::AuthError { message } if message.is_empty());
    }

    #[test]
    fn parse_progress_with_loose_fields() {
        let json = r#"{
            "type": "progress",
            "job_id": 17,
            "entity_id": "v9",
            "status": "processing",
            "progress": "250",
            "stage": "Captions",
            "extra": {"ignored": true}
        }"#;
        let msg = parse_server_message(json).unwrap();
        assert_matches!(msg, ServerMessage::Progress(event) => {
            assert_eq!(event.job_id, "17");
            assert_eq!(event.entity_id.as_deref(), Some("v9"));
            assert_eq!(event.status, JobStatus::Processing);
            assert_eq!(event.progress, 100);
            assert_eq!(event.stage.unwrap().as_str(), "captions");
        });
    }

    #[test]
    fn parse_job_progress_alias() {
        let msg =
            parse_server_message(r#"{"type": "job_progress", "job_id": "j1", "progress": 5}"#)
                .unwrap();
        assert_matches!(msg, ServerMessage::Progress(event) if event.progress == 5);
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let msg = parse_server_message(r#"{"type": "presence", "users": 3}"#).unwrap();
        assert_eq!(msg, ServerMessage::Other);
    }

    #[test]
    fn progress_without_job_id_is_rejected() {
        assert!(parse_server_message(r#"{"type": "progress", "progress": 5}"#).is_err());
    }

    #[test]
    fn auth_message_shape() {
        let json = ClientMessage::Auth {
            token: "secret".into(),
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["token"], "secret");
    }
}
