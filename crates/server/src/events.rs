//! Sandbox event router
//!
//! Every inbound sandbox event is persisted, broadcast to clients as
//! `sandbox_event`, and then dispatched to its side-effect handler.
//! Events produced while a prompt is in flight are attached to that
//! prompt unless they carry their own message id.

use serde_json::Value;
use tracing::{debug, warn};

use slipway_protocol::{new_id, EventRecord, EventType, SandboxEvent, ServerMessage};

use crate::clock::now_ms;
use crate::core::{SessionCore, SessionHandle};
use crate::pr::normalize_branch;
use crate::queue;

pub async fn route_sandbox_event(
    core: &mut SessionCore,
    handle: &SessionHandle,
    raw: Value,
) -> anyhow::Result<()> {
    let Some(type_str) = raw.get("type").and_then(Value::as_str) else {
        warn!(
            component = "events",
            event = "events.missing_type",
            session = %core.name,
            "Sandbox event without a type discriminator"
        );
        return Ok(());
    };
    let Some(event_type) = EventType::parse(type_str) else {
        warn!(
            component = "events",
            event = "events.unknown_type",
            session = %core.name,
            event_type = %type_str,
            "Unknown sandbox event type"
        );
        return Ok(());
    };

    // Typed view for the variants the coordinator interprets; the raw
    // body is what gets persisted and re-broadcast.
    let typed: Option<SandboxEvent> = serde_json::from_value(raw.clone()).ok();

    let message_id = typed
        .as_ref()
        .and_then(|t| t.message_id().map(str::to_string))
        .or_else(|| {
            core.store
                .processing_message()
                .ok()
                .flatten()
                .map(|m| m.id)
        });

    let now = now_ms();
    let record = EventRecord {
        id: new_id(),
        event_type,
        data: raw,
        message_id: message_id.clone(),
        created_at: now,
    };
    core.store.insert_event(
        &record.id,
        record.event_type,
        &record.data,
        record.message_id.as_deref(),
        now,
    )?;

    core.broadcast(&ServerMessage::SandboxEvent {
        event: record.clone(),
    });

    match typed {
        Some(SandboxEvent::ExecutionComplete {
            success,
            message_id,
        }) => {
            queue::handle_execution_complete(core, handle, success, message_id.as_deref()).await?;
        }
        Some(SandboxEvent::GitSync { status, sha }) => {
            core.store.set_git_sync_status(&status)?;
            if let Some(sha) = sha {
                core.store.set_current_sha(&sha, now)?;
            }
        }
        Some(SandboxEvent::Heartbeat { .. }) => {
            core.store.set_heartbeat(now)?;
        }
        Some(SandboxEvent::PushComplete { branch_name }) => {
            resolve_push(core, &branch_name, Ok(()));
        }
        Some(SandboxEvent::PushError { branch_name, error }) => {
            resolve_push(
                core,
                &branch_name,
                Err(error.unwrap_or_else(|| "push failed".to_string())),
            );
        }
        // Opaque event types have no coordinator-side effects.
        _ => {}
    }

    Ok(())
}

/// Resolve the pending push keyed by the normalized branch name. Push
/// events for branches nobody is waiting on are ignored.
fn resolve_push(core: &mut SessionCore, branch: &str, result: Result<(), String>) {
    let key = normalize_branch(branch);
    match core.pending_pushes.remove(&key) {
        Some(waiter) => {
            // A dropped waiter already timed out; nothing to report.
            let _ = waiter.send(result);
        }
        None => {
            debug!(
                component = "events",
                event = "events.push_unmatched",
                session = %core.name,
                branch = %branch,
                "Push event for unknown branch ignored"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot;

    use slipway_protocol::MessageSource;

    use crate::queue;
    use crate::testutil::{deps, session_handle, FakeProvider};

    #[tokio::test]
    async fn events_are_persisted_then_broadcast() {
        let handle = session_handle(deps(FakeProvider::new()));
        let mut core = handle.lock().await;

        route_sandbox_event(
            &mut core,
            &handle,
            json!({"type": "token", "text": "hel"}),
        )
        .await
        .unwrap();

        let events = core.store.events_page(None, 10, None, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Token);
        assert_eq!(events[0].data["text"], "hel");
    }

    #[tokio::test]
    async fn events_attach_to_processing_message() {
        let handle = session_handle(deps(FakeProvider::new()));
        let mut core = handle.lock().await;
        let _rx = crate::testutil::attach_fake_sandbox(&mut core);
        let (id, _) = queue::enqueue(
            &mut core,
            "u1",
            "hi",
            MessageSource::Web,
            None,
            vec![],
            None,
        )
        .unwrap();
        queue::process_next(&mut core, &handle).await.unwrap();

        route_sandbox_event(&mut core, &handle, json!({"type": "tool_call", "name": "bash"}))
            .await
            .unwrap();

        let events = core
            .store
            .events_page(None, 10, Some(EventType::ToolCall), None)
            .unwrap();
        assert_eq!(events[0].message_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn git_sync_updates_sandbox_and_session() {
        let handle = session_handle(deps(FakeProvider::new()));
        let mut core = handle.lock().await;

        route_sandbox_event(
            &mut core,
            &handle,
            json!({"type": "git_sync", "status": "synced", "sha": "abc123"}),
        )
        .await
        .unwrap();

        let sandbox = core.store.sandbox().unwrap().unwrap();
        assert_eq!(sandbox.git_sync_status.as_deref(), Some("synced"));
        let session = core.store.session().unwrap().unwrap();
        assert_eq!(session.current_sha.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn heartbeat_stamps_last_heartbeat() {
        let handle = session_handle(deps(FakeProvider::new()));
        let mut core = handle.lock().await;

        route_sandbox_event(&mut core, &handle, json!({"type": "heartbeat"}))
            .await
            .unwrap();

        let sandbox = core.store.sandbox().unwrap().unwrap();
        assert!(sandbox.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn push_complete_resolves_normalized_branch() {
        let handle = session_handle(deps(FakeProvider::new()));
        let mut core = handle.lock().await;
        let (tx, rx) = oneshot::channel();
        core.pending_pushes.insert("slipway/s1".to_string(), tx);

        // Remote case-folds and pads; resolution still matches.
        route_sandbox_event(
            &mut core,
            &handle,
            json!({"type": "push_complete", "branchName": " Slipway/S1 "}),
        )
        .await
        .unwrap();

        assert!(core.pending_pushes.is_empty());
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn push_error_rejects_waiter() {
        let handle = session_handle(deps(FakeProvider::new()));
        let mut core = handle.lock().await;
        let (tx, rx) = oneshot::channel();
        core.pending_pushes.insert("slipway/s1".to_string(), tx);

        route_sandbox_event(
            &mut core,
            &handle,
            json!({"type": "push_error", "branchName": "slipway/s1", "error": "rejected"}),
        )
        .await
        .unwrap();

        assert_eq!(rx.await.unwrap(), Err("rejected".to_string()));
    }

    #[tokio::test]
    async fn unknown_branch_push_is_ignored() {
        let handle = session_handle(deps(FakeProvider::new()));
        let mut core = handle.lock().await;

        route_sandbox_event(
            &mut core,
            &handle,
            json!({"type": "push_complete", "branchName": "unrelated"}),
        )
        .await
        .unwrap();
        // No waiter, no panic, event persisted.
        assert_eq!(core.store.event_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_is_dropped() {
        let handle = session_handle(deps(FakeProvider::new()));
        let mut core = handle.lock().await;

        route_sandbox_event(&mut core, &handle, json!({"type": "mystery"}))
            .await
            .unwrap();
        assert_eq!(core.store.event_count().unwrap(), 0);
    }
}
