//! Shared enums and record types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Completed,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(SessionStatus::Created),
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "archived" => Some(SessionStatus::Archived),
            _ => None,
        }
    }
}

/// Prompt message status. Transitions are monotone:
/// pending → processing → {completed | failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "processing" => Some(MessageStatus::Processing),
            "completed" => Some(MessageStatus::Completed),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

/// Where a prompt originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Web,
    Slack,
    Extension,
    Github,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::Web => "web",
            MessageSource::Slack => "slack",
            MessageSource::Extension => "extension",
            MessageSource::Github => "github",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "web" => Some(MessageSource::Web),
            "slack" => Some(MessageSource::Slack),
            "extension" => Some(MessageSource::Extension),
            "github" => Some(MessageSource::Github),
            _ => None,
        }
    }
}

/// Participant role within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Owner => "owner",
            ParticipantRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(ParticipantRole::Owner),
            "member" => Some(ParticipantRole::Member),
            _ => None,
        }
    }
}

/// Sandbox lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Spawning,
    Connecting,
    Warming,
    Syncing,
    Ready,
    Running,
    Stale,
    Snapshotting,
    Stopped,
    Failed,
}

impl SandboxStatus {
    /// Terminal states are sticky: once stopped/stale/failed, a sandbox
    /// never bounces back to a non-terminal state without a fresh spawn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SandboxStatus::Stopped | SandboxStatus::Stale | SandboxStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Pending => "pending",
            SandboxStatus::Spawning => "spawning",
            SandboxStatus::Connecting => "connecting",
            SandboxStatus::Warming => "warming",
            SandboxStatus::Syncing => "syncing",
            SandboxStatus::Ready => "ready",
            SandboxStatus::Running => "running",
            SandboxStatus::Stale => "stale",
            SandboxStatus::Snapshotting => "snapshotting",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SandboxStatus::Pending),
            "spawning" => Some(SandboxStatus::Spawning),
            "connecting" => Some(SandboxStatus::Connecting),
            "warming" => Some(SandboxStatus::Warming),
            "syncing" => Some(SandboxStatus::Syncing),
            "ready" => Some(SandboxStatus::Ready),
            "running" => Some(SandboxStatus::Running),
            "stale" => Some(SandboxStatus::Stale),
            "snapshotting" => Some(SandboxStatus::Snapshotting),
            "stopped" => Some(SandboxStatus::Stopped),
            "failed" => Some(SandboxStatus::Failed),
            _ => None,
        }
    }
}

/// Event type discriminator for persisted sandbox events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ToolCall,
    ToolResult,
    Token,
    Error,
    GitSync,
    ExecutionComplete,
    Heartbeat,
    PushComplete,
    PushError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::Token => "token",
            EventType::Error => "error",
            EventType::GitSync => "git_sync",
            EventType::ExecutionComplete => "execution_complete",
            EventType::Heartbeat => "heartbeat",
            EventType::PushComplete => "push_complete",
            EventType::PushError => "push_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool_call" => Some(EventType::ToolCall),
            "tool_result" => Some(EventType::ToolResult),
            "token" => Some(EventType::Token),
            "error" => Some(EventType::Error),
            "git_sync" => Some(EventType::GitSync),
            "execution_complete" => Some(EventType::ExecutionComplete),
            "heartbeat" => Some(EventType::Heartbeat),
            "push_complete" => Some(EventType::PushComplete),
            "push_error" => Some(EventType::PushError),
            _ => None,
        }
    }
}

/// Artifact type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Pr,
    Screenshot,
    Preview,
    Branch,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Pr => "pr",
            ArtifactType::Screenshot => "screenshot",
            ArtifactType::Preview => "preview",
            ArtifactType::Branch => "branch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pr" => Some(ArtifactType::Pr),
            "screenshot" => Some(ArtifactType::Screenshot),
            "preview" => Some(ArtifactType::Preview),
            "branch" => Some(ArtifactType::Branch),
            _ => None,
        }
    }
}

/// Public view of a participant (no token material)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_email: Option<String>,
    pub role: ParticipantRole,
}

/// A persisted prompt message, as exposed on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub source: MessageSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// A persisted sandbox event, as exposed on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub event_type: EventType,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub created_at: i64,
}

/// A persisted artifact, as exposed on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub id: String,
    pub artifact_type: ArtifactType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub metadata: Value,
    pub created_at: i64,
}

/// Session + sandbox summary (internal state endpoint, subscribe payload)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub repo_owner: String,
    pub repo_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub status: SessionStatus,
    pub sandbox_status: SandboxStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One item of the interleaved history replay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryItem {
    Message(MessageRecord),
    Event(EventRecord),
}

impl HistoryItem {
    pub fn created_at(&self) -> i64 {
        match self {
            HistoryItem::Message(m) => m.created_at,
            HistoryItem::Event(e) => e.created_at,
        }
    }
}

/// State payload delivered with `subscribed`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedState {
    pub session: SessionView,
    pub history: Vec<HistoryItem>,
    /// True when older history exists beyond the replay window; clients
    /// page it via the messages/events endpoints.
    pub history_truncated: bool,
}

/// One client's presence entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub participant_id: String,
    pub client_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Value>,
}

/// Author metadata attached to a dispatched prompt command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptAuthor {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(SandboxStatus::Stopped.is_terminal());
        assert!(SandboxStatus::Stale.is_terminal());
        assert!(SandboxStatus::Failed.is_terminal());
        assert!(!SandboxStatus::Ready.is_terminal());
        assert!(!SandboxStatus::Snapshotting.is_terminal());
    }

    #[test]
    fn status_roundtrip_via_str() {
        for s in [
            SandboxStatus::Pending,
            SandboxStatus::Spawning,
            SandboxStatus::Connecting,
            SandboxStatus::Ready,
            SandboxStatus::Running,
            SandboxStatus::Snapshotting,
            SandboxStatus::Stopped,
            SandboxStatus::Stale,
            SandboxStatus::Failed,
        ] {
            assert_eq!(SandboxStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SandboxStatus::parse("bogus"), None);
    }

    #[test]
    fn message_status_wire_names() {
        let json = serde_json::to_string(&MessageStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }
}
