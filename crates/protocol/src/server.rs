//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{
    ArtifactRecord, EventRecord, ParticipantInfo, PresenceEntry, SandboxStatus, SessionStatus,
    SubscribedState,
};

/// Messages broadcast or replied to connected clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Pong {
        timestamp: i64,
    },

    /// Subscribe handshake succeeded; carries state and replayed history
    Subscribed {
        session_id: String,
        state: SubscribedState,
        participant_id: String,
        participant: ParticipantInfo,
    },

    PromptQueued {
        message_id: String,
        position: u64,
    },

    SandboxStatus {
        status: SandboxStatus,
    },
    SandboxSpawning,
    SandboxWarming,
    SandboxWarning {
        message: String,
    },
    SandboxError {
        error: String,
    },
    SandboxRestored {
        message: String,
    },
    SnapshotSaved {
        image_id: String,
        reason: String,
    },

    /// Raw sandbox event fan-out (persisted first, then broadcast)
    SandboxEvent {
        event: EventRecord,
    },

    PresenceSync {
        participants: Vec<PresenceEntry>,
    },
    PresenceUpdate {
        participants: Vec<PresenceEntry>,
    },

    ArtifactCreated {
        artifact: ArtifactRecord,
    },

    SessionStatus {
        status: SessionStatus,
    },

    Error {
        code: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_queued_wire_shape() {
        let msg = ServerMessage::PromptQueued {
            message_id: "m-1".into(),
            position: 2,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "prompt_queued");
        assert_eq!(json["messageId"], "m-1");
        assert_eq!(json["position"], 2);
    }

    #[test]
    fn unit_variants_serialize_with_only_type() {
        let json = serde_json::to_value(&ServerMessage::SandboxSpawning).unwrap();
        assert_eq!(json, serde_json::json!({"type": "sandbox_spawning"}));
    }
}
