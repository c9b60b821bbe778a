//! Sandbox ↔ coordinator wire types
//!
//! Sandbox events are heterogeneous JSON. The variants the coordinator
//! interprets carry typed fields; everything else flows through as an
//! opaque payload that is persisted and re-broadcast verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EventType, PromptAuthor};

/// Events emitted by a sandbox toward the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SandboxEvent {
    ToolCall {
        #[serde(flatten)]
        data: Value,
    },
    ToolResult {
        #[serde(flatten)]
        data: Value,
    },
    Token {
        #[serde(flatten)]
        data: Value,
    },
    Error {
        #[serde(flatten)]
        data: Value,
    },
    GitSync {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sha: Option<String>,
    },
    ExecutionComplete {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    Heartbeat {
        #[serde(flatten)]
        data: Value,
    },
    PushComplete {
        branch_name: String,
    },
    PushError {
        branch_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl SandboxEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            SandboxEvent::ToolCall { .. } => EventType::ToolCall,
            SandboxEvent::ToolResult { .. } => EventType::ToolResult,
            SandboxEvent::Token { .. } => EventType::Token,
            SandboxEvent::Error { .. } => EventType::Error,
            SandboxEvent::GitSync { .. } => EventType::GitSync,
            SandboxEvent::ExecutionComplete { .. } => EventType::ExecutionComplete,
            SandboxEvent::Heartbeat { .. } => EventType::Heartbeat,
            SandboxEvent::PushComplete { .. } => EventType::PushComplete,
            SandboxEvent::PushError { .. } => EventType::PushError,
        }
    }

    /// Message id the event attributes itself to, when it carries one
    pub fn message_id(&self) -> Option<&str> {
        match self {
            SandboxEvent::ExecutionComplete { message_id, .. } => message_id.as_deref(),
            _ => None,
        }
    }
}

/// Commands sent by the coordinator toward a connected sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SandboxCommand {
    /// Dispatch the head-of-queue prompt
    Prompt {
        message_id: String,
        content: String,
        model: String,
        author: PromptAuthor,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Value>,
    },

    /// Interrupt the current agent turn
    Stop,

    /// Terminate the agent process; the coordinator is about to close
    /// the socket and will reject reconnects
    Shutdown,

    /// Push the working tree to the named branch using the supplied
    /// short-lived installation token
    Push {
        branch_name: String,
        repo_owner: String,
        repo_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        github_token: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_complete_carries_message_id() {
        let ev: SandboxEvent = serde_json::from_str(
            r#"{"type":"execution_complete","success":true,"messageId":"m-7"}"#,
        )
        .unwrap();
        assert_eq!(ev.event_type(), EventType::ExecutionComplete);
        assert_eq!(ev.message_id(), Some("m-7"));
    }

    #[test]
    fn execution_complete_message_id_is_optional() {
        let ev: SandboxEvent =
            serde_json::from_str(r#"{"type":"execution_complete","success":false}"#).unwrap();
        assert_eq!(ev.message_id(), None);
    }

    #[test]
    fn opaque_event_preserves_payload() {
        let ev: SandboxEvent = serde_json::from_str(
            r#"{"type":"tool_call","name":"bash","args":{"cmd":"ls"}}"#,
        )
        .unwrap();
        match &ev {
            SandboxEvent::ToolCall { data } => {
                assert_eq!(data["name"], "bash");
                assert_eq!(data["args"]["cmd"], "ls");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn push_command_wire_shape() {
        let cmd = SandboxCommand::Push {
            branch_name: "slipway/s1".into(),
            repo_owner: "acme".into(),
            repo_name: "web".into(),
            github_token: Some("ghs_abc".into()),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "push");
        assert_eq!(json["branchName"], "slipway/s1");
        assert_eq!(json["githubToken"], "ghs_abc");
    }

    #[test]
    fn git_sync_sha_optional() {
        let ev: SandboxEvent =
            serde_json::from_str(r#"{"type":"git_sync","status":"syncing"}"#).unwrap();
        match ev {
            SandboxEvent::GitSync { status, sha } => {
                assert_eq!(status, "syncing");
                assert!(sha.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
