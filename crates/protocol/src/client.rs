//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from a browser/extension client to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Liveness probe; answered with `pong`
    Ping,

    /// Authenticate the socket with a previously-minted plaintext token.
    /// Must arrive within the authentication deadline or the socket is
    /// closed with code 4008.
    Subscribe { token: String, client_id: String },

    /// Enqueue a prompt authored by the subscribed participant
    Prompt {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Value>,
    },

    /// Ask the sandbox to interrupt the current agent turn
    Stop,

    /// Typing signal; may pre-warm the sandbox
    Typing,

    /// Presence update (editor focus, cursor position)
    Presence {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cursor: Option<Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_parses_camel_case_fields() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","token":"t0k","clientId":"c-1"}"#).unwrap();
        match msg {
            ClientMessage::Subscribe { token, client_id } => {
                assert_eq!(token, "t0k");
                assert_eq!(client_id, "c-1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn prompt_defaults_optional_fields() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"prompt","content":"hi"}"#).unwrap();
        match msg {
            ClientMessage::Prompt {
                content,
                model,
                attachments,
            } => {
                assert_eq!(content, "hi");
                assert!(model.is_none());
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
