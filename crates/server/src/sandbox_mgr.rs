//! Lifecycle effect layer
//!
//! Applies the pure decisions from `lifecycle` against the store and
//! the provider port: spawn/restore envelopes, snapshots, the single
//! per-session alarm, and the typing-driven warm path. Upstream
//! failures never propagate out of here; they degrade to a broadcast
//! `sandbox_error` plus persisted state.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use slipway_protocol::{SandboxCommand, SandboxStatus, ServerMessage};
use slipway_ports::CreateSandboxRequest;

use crate::clock::now_ms;
use crate::core::{SessionCore, SessionHandle};
use crate::crypto;
use crate::lifecycle::{
    check_breaker, decide_inactivity, decide_snapshot, decide_spawn, heartbeat_is_stale,
    post_snapshot_status, should_warm, BreakerDecision, InactivityDecision, SnapshotDecision,
    SpawnDecision, SpawnInput,
};
use crate::secrets;
use crate::store::SessionRow;

pub const REASON_EXECUTION_COMPLETE: &str = "execution_complete";
pub const REASON_INACTIVITY_TIMEOUT: &str = "inactivity_timeout";
pub const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";

/// Evaluate the spawn decision and execute it. Callers invoke this
/// whenever a prompt needs a sandbox that is not connected.
pub async fn ensure_sandbox(core: &mut SessionCore, handle: &SessionHandle) -> anyhow::Result<()> {
    let Some(sandbox) = core.store.sandbox()? else {
        return Ok(());
    };
    let now = now_ms();
    let input = SpawnInput {
        status: sandbox.status,
        created_at: sandbox.created_at,
        has_snapshot: sandbox.snapshot_image_id.is_some(),
        has_sandbox_socket: core.sandbox_socket_open(),
        in_memory_spawning: core.is_spawning,
    };

    match decide_spawn(&input, &core.deps.config.spawn, now) {
        SpawnDecision::Skip(reason) => {
            debug!(
                component = "lifecycle",
                event = "spawn.skipped",
                session = %core.name,
                reason = %reason,
                "Spawn skipped"
            );
            Ok(())
        }
        SpawnDecision::Wait => {
            debug!(
                component = "lifecycle",
                event = "spawn.deferred",
                session = %core.name,
                status = sandbox.status.as_str(),
                "Spawn deferred; trigger stays pending"
            );
            Ok(())
        }
        SpawnDecision::Restore => {
            let image = sandbox
                .snapshot_image_id
                .clone()
                .unwrap_or_default();
            run_spawn(core, handle, Some(image)).await
        }
        SpawnDecision::Spawn => run_spawn(core, handle, None).await,
    }
}

/// Spawn/restore envelope: circuit breaker, pre-persisted identity,
/// provider call, failure classification.
async fn run_spawn(
    core: &mut SessionCore,
    handle: &SessionHandle,
    snapshot_image: Option<String>,
) -> anyhow::Result<()> {
    let Some(sandbox) = core.store.sandbox()? else {
        return Ok(());
    };
    let now = now_ms();

    match check_breaker(
        sandbox.spawn_failure_count,
        sandbox.last_failure_at,
        &core.deps.config.breaker,
        now,
    ) {
        BreakerDecision::Block { wait_ms } => {
            let error = format!(
                "Sandbox spawning temporarily disabled after repeated failures; retry in {}s",
                wait_ms / 1000
            );
            warn!(
                component = "lifecycle",
                event = "spawn.breaker_open",
                session = %core.name,
                wait_ms = wait_ms,
                "Circuit breaker open"
            );
            core.broadcast(&ServerMessage::SandboxError { error });
            return Ok(());
        }
        BreakerDecision::Proceed { reset: true } => {
            core.store.reset_spawn_failures()?;
        }
        BreakerDecision::Proceed { reset: false } => {}
    }

    core.is_spawning = true;
    let result = do_spawn(core, handle, snapshot_image).await;
    core.is_spawning = false;
    result
}

async fn do_spawn(
    core: &mut SessionCore,
    handle: &SessionHandle,
    snapshot_image: Option<String>,
) -> anyhow::Result<()> {
    let Some(session) = core.store.session()? else {
        anyhow::bail!("no session for spawn");
    };
    let now = now_ms();
    let auth_token = crypto::random_token();
    let sandbox_id = format!(
        "sandbox-{}-{}-{}",
        session.repo_owner, session.repo_name, now
    );

    // Persist identity before the provider call so the concurrently
    // connecting sandbox finds its validation record.
    core.store.prepare_spawn(&sandbox_id, &auth_token, now)?;
    core.broadcast(&ServerMessage::SandboxSpawning);
    core.broadcast_sandbox_status(SandboxStatus::Spawning);

    let request = CreateSandboxRequest {
        session_id: session.id.clone(),
        sandbox_id: sandbox_id.clone(),
        repo_owner: session.repo_owner.clone(),
        repo_name: session.repo_name.clone(),
        control_plane_url: core.deps.config.control_plane_url.clone(),
        auth_token,
        provider: core.deps.config.provider_name.clone(),
        model: session.model.clone(),
        env: materialize_env(core, &session),
    };

    let restoring = snapshot_image.is_some();
    let result = match &snapshot_image {
        Some(image) => {
            info!(
                component = "lifecycle",
                event = "spawn.restore",
                session = %core.name,
                sandbox_id = %sandbox_id,
                image_id = %image,
                "Restoring sandbox from snapshot"
            );
            core.deps
                .provider
                .restore_from_snapshot(&request, image)
                .await
        }
        None => {
            info!(
                component = "lifecycle",
                event = "spawn.create",
                session = %core.name,
                sandbox_id = %sandbox_id,
                "Spawning fresh sandbox"
            );
            core.deps.provider.create_sandbox(&request).await
        }
    };

    match result {
        Ok(spawned) => {
            core.store
                .set_provider_object_id(&spawned.provider_object_id)?;
            core.store.set_sandbox_status(SandboxStatus::Connecting)?;
            core.store.reset_spawn_failures()?;
            core.broadcast_sandbox_status(SandboxStatus::Connecting);
            if restoring {
                core.broadcast(&ServerMessage::SandboxRestored {
                    message: "Sandbox restored from snapshot".to_string(),
                });
            }
            reschedule_inactivity(core, handle);
        }
        Err(e) => {
            // Transient failures leave the breaker counter untouched;
            // unknown classes count as permanent.
            let permanent = !e.is_transient();
            warn!(
                component = "lifecycle",
                event = "spawn.failed",
                session = %core.name,
                sandbox_id = %sandbox_id,
                permanent = permanent,
                error = %e.message,
                "Sandbox spawn failed"
            );
            core.store
                .record_spawn_failure(&e.message, permanent, now_ms())?;
            core.broadcast_sandbox_status(SandboxStatus::Failed);
            core.broadcast(&ServerMessage::SandboxError { error: e.message });
        }
    }
    Ok(())
}

/// User-scoped secrets materialized into the sandbox environment.
/// Reserved operational variables are stripped so they can never shadow
/// the coordinator-supplied values.
fn materialize_env(core: &SessionCore, session: &SessionRow) -> HashMap<String, String> {
    let Some(repo_id) = session.repo_id else {
        return HashMap::new();
    };
    match core.deps.secrets.materialize(repo_id) {
        Ok(env) => env
            .into_iter()
            .filter(|(k, _)| !secrets::is_reserved_key(k))
            .collect(),
        Err(e) => {
            warn!(
                component = "lifecycle",
                event = "spawn.secrets_unavailable",
                session = %core.name,
                error = %e,
                "Proceeding without user secrets"
            );
            HashMap::new()
        }
    }
}

/// Take a snapshot if preconditions allow. Status transitions honor
/// terminal stickiness; a snapshot failure is logged and does not
/// prevent the status restoration that follows.
pub async fn snapshot(core: &mut SessionCore, reason: &str) -> anyhow::Result<()> {
    let Some(sandbox) = core.store.sandbox()? else {
        return Ok(());
    };
    let has_session = core.store.session()?.is_some();
    let decision = decide_snapshot(
        core.deps.provider.supports_snapshots(),
        sandbox.provider_object_id.is_some(),
        has_session,
        sandbox.status,
    );

    let enter_snapshotting = match decision {
        SnapshotDecision::Skip(why) => {
            debug!(
                component = "lifecycle",
                event = "snapshot.skipped",
                session = %core.name,
                reason = %reason,
                why = why,
                "Snapshot skipped"
            );
            return Ok(());
        }
        SnapshotDecision::Proceed { enter_snapshotting } => enter_snapshotting,
    };

    let previous = sandbox.status;
    let object_id = sandbox
        .provider_object_id
        .clone()
        .unwrap_or_default();

    if enter_snapshotting {
        core.store.set_sandbox_status(SandboxStatus::Snapshotting)?;
        core.broadcast_sandbox_status(SandboxStatus::Snapshotting);
    }

    let result = core.deps.provider.take_snapshot(&object_id).await;

    if enter_snapshotting {
        let next = post_snapshot_status(previous, reason);
        core.store.set_sandbox_status(next)?;
        core.broadcast_sandbox_status(next);
    }

    match result {
        Ok(image_id) => {
            core.store.set_snapshot_image_id(&image_id)?;
            info!(
                component = "lifecycle",
                event = "snapshot.saved",
                session = %core.name,
                image_id = %image_id,
                reason = %reason,
                "Snapshot saved"
            );
            core.broadcast(&ServerMessage::SnapshotSaved {
                image_id,
                reason: reason.to_string(),
            });
        }
        Err(e) => {
            warn!(
                component = "lifecycle",
                event = "snapshot.failed",
                session = %core.name,
                reason = %reason,
                error = %e.message,
                "Snapshot failed"
            );
        }
    }
    Ok(())
}

/// Typing-driven pre-warm.
pub async fn warm(core: &mut SessionCore, handle: &SessionHandle) -> anyhow::Result<()> {
    let Some(sandbox) = core.store.sandbox()? else {
        return Ok(());
    };
    if !should_warm(sandbox.status, core.sandbox_socket_open(), core.is_spawning) {
        return Ok(());
    }
    core.broadcast(&ServerMessage::SandboxWarming);
    ensure_sandbox(core, handle).await
}

/// Schedule the session's single alarm. A new alarm always replaces the
/// previous one; the generation counter invalidates stale timers.
pub fn schedule_alarm(core: &mut SessionCore, handle: &SessionHandle, delay_ms: i64) {
    core.alarm_generation += 1;
    let generation = core.alarm_generation;
    let handle = handle.clone();
    let delay = Duration::from_millis(delay_ms.max(0) as u64);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut core = handle.lock().await;
        if core.alarm_generation != generation {
            return; // replaced by a newer alarm
        }
        if let Err(e) = on_alarm(&mut core, &handle).await {
            warn!(
                component = "lifecycle",
                event = "alarm.failed",
                session = %handle.name,
                error = %e,
                "Alarm handler failed"
            );
        }
    });
}

/// Reschedule the inactivity check after an activity stamp.
pub fn reschedule_inactivity(core: &mut SessionCore, handle: &SessionHandle) {
    let cfg = core.deps.config.inactivity;
    let delay = match core.store.sandbox() {
        Ok(Some(sandbox)) => match decide_inactivity(
            sandbox.status,
            sandbox.last_activity,
            core.connected_client_count(),
            &cfg,
            now_ms(),
        ) {
            InactivityDecision::Schedule { delay_ms } | InactivityDecision::Extend { delay_ms } => {
                delay_ms
            }
            InactivityDecision::Timeout => cfg.min_check_ms,
        },
        _ => cfg.min_check_ms,
    };
    schedule_alarm(core, handle, delay);
}

/// The single alarm handler: inspects heartbeat health first, then the
/// inactivity policy. It never installs a competing alarm.
pub async fn on_alarm(core: &mut SessionCore, handle: &SessionHandle) -> anyhow::Result<()> {
    let now = now_ms();
    let Some(sandbox) = core.store.sandbox()? else {
        return Ok(());
    };

    if matches!(sandbox.status, SandboxStatus::Ready | SandboxStatus::Running)
        && heartbeat_is_stale(sandbox.last_heartbeat, &core.deps.config.heartbeat, now)
    {
        warn!(
            component = "lifecycle",
            event = "heartbeat.stale",
            session = %core.name,
            last_heartbeat = sandbox.last_heartbeat,
            "Sandbox heartbeat stale; marking stale"
        );
        core.store.set_sandbox_status(SandboxStatus::Stale)?;
        core.broadcast_sandbox_status(SandboxStatus::Stale);
        snapshot(core, REASON_HEARTBEAT_TIMEOUT).await?;
    }

    // Re-read: the heartbeat branch may have changed the status.
    let Some(sandbox) = core.store.sandbox()? else {
        return Ok(());
    };

    match decide_inactivity(
        sandbox.status,
        sandbox.last_activity,
        core.connected_client_count(),
        &core.deps.config.inactivity,
        now,
    ) {
        InactivityDecision::Schedule { delay_ms } => {
            schedule_alarm(core, handle, delay_ms);
        }
        InactivityDecision::Extend { delay_ms } => {
            info!(
                component = "lifecycle",
                event = "inactivity.extended",
                session = %core.name,
                clients = core.connected_client_count(),
                "Idle timeout extended while clients are connected"
            );
            core.broadcast(&ServerMessage::SandboxWarning {
                message: "Sandbox will shut down in 5 minutes due to inactivity. Send a message to keep it alive.".to_string(),
            });
            schedule_alarm(core, handle, delay_ms);
        }
        InactivityDecision::Timeout => {
            info!(
                component = "lifecycle",
                event = "inactivity.timeout",
                session = %core.name,
                "Idle timeout reached with no clients; stopping sandbox"
            );
            // Stop first so reconnects are rejected, then snapshot.
            core.store.set_sandbox_status(SandboxStatus::Stopped)?;
            core.broadcast_sandbox_status(SandboxStatus::Stopped);
            snapshot(core, REASON_INACTIVITY_TIMEOUT).await?;
            core.send_to_sandbox(&SandboxCommand::Shutdown);
            core.close_sandbox_socket(1000, "Inactivity timeout");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_ports::ProviderError;
    use slipway_protocol::SandboxStatus;

    use crate::testutil::{attach_fake_sandbox, deps, session_handle, FakeCall, FakeProvider};

    #[tokio::test]
    async fn fresh_spawn_persists_identity_and_connects() {
        let provider = FakeProvider::new();
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;

        ensure_sandbox(&mut core, &handle).await.unwrap();

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        let sandbox = core.store.sandbox().unwrap().unwrap();
        match &calls[0] {
            FakeCall::Create { sandbox_id } => {
                assert!(sandbox_id.starts_with("sandbox-acme-web-"));
                // What the provider was handed is what was persisted.
                assert_eq!(sandbox.modal_sandbox_id.as_deref(), Some(sandbox_id.as_str()));
            }
            other => panic!("unexpected call {other:?}"),
        }
        assert!(sandbox.auth_token.is_some());
        assert_eq!(sandbox.status, SandboxStatus::Connecting);
        assert_eq!(sandbox.provider_object_id.as_deref(), Some("obj-1"));
        assert_eq!(sandbox.spawn_failure_count, 0);
        assert!(!core.is_spawning);
    }

    #[tokio::test]
    async fn permanent_failure_marks_failed_and_counts() {
        let provider = FakeProvider::new();
        provider.push_spawn_result(Err(ProviderError::permanent("bad image")));
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;

        ensure_sandbox(&mut core, &handle).await.unwrap();

        let sandbox = core.store.sandbox().unwrap().unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Failed);
        assert_eq!(sandbox.spawn_failure_count, 1);
        assert_eq!(sandbox.last_spawn_error.as_deref(), Some("bad image"));
    }

    #[tokio::test]
    async fn transient_failure_leaves_breaker_untouched() {
        let provider = FakeProvider::new();
        provider.push_spawn_result(Err(ProviderError::transient("503")));
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;

        ensure_sandbox(&mut core, &handle).await.unwrap();

        let sandbox = core.store.sandbox().unwrap().unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Failed);
        assert_eq!(sandbox.spawn_failure_count, 0);
    }

    #[tokio::test]
    async fn breaker_opens_after_three_permanent_failures() {
        let provider = FakeProvider::new();
        for _ in 0..3 {
            provider.push_spawn_result(Err(ProviderError::permanent("boom")));
        }
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;

        for _ in 0..3 {
            ensure_sandbox(&mut core, &handle).await.unwrap();
        }
        assert_eq!(provider.create_calls(), 3);

        // Fourth attempt: breaker is open, no provider call is made.
        ensure_sandbox(&mut core, &handle).await.unwrap();
        assert_eq!(provider.create_calls(), 3);

        let sandbox = core.store.sandbox().unwrap().unwrap();
        assert_eq!(sandbox.spawn_failure_count, 3);
        assert_eq!(sandbox.status, SandboxStatus::Failed);
    }

    #[tokio::test]
    async fn stopped_sandbox_with_snapshot_restores() {
        let provider = FakeProvider::new();
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;
        core.store.set_snapshot_image_id("img-42").unwrap();
        core.store
            .set_sandbox_status(SandboxStatus::Stopped)
            .unwrap();

        ensure_sandbox(&mut core, &handle).await.unwrap();

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            FakeCall::Restore { image_id, .. } => assert_eq!(image_id, "img-42"),
            other => panic!("expected restore, got {other:?}"),
        }
        let sandbox = core.store.sandbox().unwrap().unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Connecting);
    }

    #[tokio::test]
    async fn spawn_skipped_while_connecting() {
        let provider = FakeProvider::new();
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;
        core.store
            .set_sandbox_status(SandboxStatus::Connecting)
            .unwrap();

        ensure_sandbox(&mut core, &handle).await.unwrap();
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn snapshot_restores_previous_status() {
        let provider = FakeProvider::new();
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;
        core.store.set_provider_object_id("obj-9").unwrap();
        core.store.set_sandbox_status(SandboxStatus::Ready).unwrap();

        snapshot(&mut core, REASON_EXECUTION_COMPLETE).await.unwrap();

        let sandbox = core.store.sandbox().unwrap().unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Ready);
        assert_eq!(sandbox.snapshot_image_id.as_deref(), Some("img-1"));
    }

    #[tokio::test]
    async fn snapshot_keeps_terminal_status_sticky() {
        let provider = FakeProvider::new();
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;
        core.store.set_provider_object_id("obj-9").unwrap();
        core.store
            .set_sandbox_status(SandboxStatus::Stopped)
            .unwrap();

        snapshot(&mut core, REASON_INACTIVITY_TIMEOUT).await.unwrap();

        let sandbox = core.store.sandbox().unwrap().unwrap();
        // Never bounced through snapshotting, never left the terminal set.
        assert_eq!(sandbox.status, SandboxStatus::Stopped);
        assert_eq!(sandbox.snapshot_image_id.as_deref(), Some("img-1"));
    }

    #[tokio::test]
    async fn snapshot_skipped_without_provider_object() {
        let provider = FakeProvider::new();
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;
        core.store.set_sandbox_status(SandboxStatus::Ready).unwrap();

        snapshot(&mut core, REASON_EXECUTION_COMPLETE).await.unwrap();
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn warm_spawns_cold_sandbox_only() {
        let provider = FakeProvider::new();
        let handle = session_handle(deps(provider.clone()));
        {
            let mut core = handle.lock().await;
            core.store
                .set_sandbox_status(SandboxStatus::Stopped)
                .unwrap();
            warm(&mut core, &handle).await.unwrap();
            assert_eq!(provider.create_calls(), 1);
        }
        {
            // A live socket suppresses warming.
            let mut core = handle.lock().await;
            let _rx = attach_fake_sandbox(&mut core);
            warm(&mut core, &handle).await.unwrap();
            assert_eq!(provider.create_calls(), 1);
        }
    }

    #[tokio::test]
    async fn heartbeat_stale_alarm_marks_stale_and_snapshots() {
        let provider = FakeProvider::new();
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;
        core.store.set_provider_object_id("obj-9").unwrap();
        core.store.set_sandbox_status(SandboxStatus::Ready).unwrap();
        core.store.set_heartbeat(crate::clock::now_ms() - 91_000).unwrap();

        on_alarm(&mut core, &handle).await.unwrap();

        let sandbox = core.store.sandbox().unwrap().unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Stale);
        assert!(provider
            .calls()
            .iter()
            .any(|c| matches!(c, FakeCall::Snapshot { .. })));
    }

    #[tokio::test]
    async fn idle_timeout_with_clients_extends_and_warns() {
        let provider = FakeProvider::new();
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;
        core.store.set_provider_object_id("obj-9").unwrap();
        core.store.set_sandbox_status(SandboxStatus::Ready).unwrap();
        core.store.set_heartbeat(crate::clock::now_ms()).unwrap();
        core.store
            .touch_activity(crate::clock::now_ms() - 600_001)
            .unwrap();
        let mut client_rx = crate::testutil::attach_fake_client(&mut core, "sock-1");

        on_alarm(&mut core, &handle).await.unwrap();

        // Still alive, no snapshot, warning broadcast to the client.
        let sandbox = core.store.sandbox().unwrap().unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Ready);
        assert!(!provider
            .calls()
            .iter()
            .any(|c| matches!(c, FakeCall::Snapshot { .. })));
        let mut saw_warning = false;
        while let Some(frame) = crate::testutil::next_frame_json(&mut client_rx) {
            if frame["type"] == "sandbox_warning" {
                saw_warning = true;
            }
        }
        assert!(saw_warning);
    }

    #[tokio::test]
    async fn idle_timeout_with_no_clients_stops_and_snapshots() {
        let provider = FakeProvider::new();
        let handle = session_handle(deps(provider.clone()));
        let mut core = handle.lock().await;
        core.store.set_provider_object_id("obj-9").unwrap();
        core.store.set_sandbox_status(SandboxStatus::Ready).unwrap();
        core.store.set_heartbeat(crate::clock::now_ms()).unwrap();
        core.store
            .touch_activity(crate::clock::now_ms() - 600_001)
            .unwrap();
        let mut sandbox_rx = attach_fake_sandbox(&mut core);

        on_alarm(&mut core, &handle).await.unwrap();

        let sandbox = core.store.sandbox().unwrap().unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Stopped);
        assert!(provider
            .calls()
            .iter()
            .any(|c| matches!(c, FakeCall::Snapshot { .. })));
        // Shutdown command was queued, then the socket was closed.
        let mut saw_shutdown = false;
        let mut saw_close = false;
        while let Ok(frame) = sandbox_rx.try_recv() {
            match frame {
                crate::core::OutFrame::Text(json) => {
                    if json.contains("\"shutdown\"") {
                        saw_shutdown = true;
                    }
                }
                crate::core::OutFrame::Close { code, .. } => {
                    assert_eq!(code, 1000);
                    saw_close = true;
                }
                _ => {}
            }
        }
        assert!(saw_shutdown);
        assert!(saw_close);
        assert!(core.sandbox_sock.is_none());
    }
}
