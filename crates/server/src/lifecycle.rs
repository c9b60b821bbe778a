//! Pure lifecycle decision functions
//!
//! All spawn/idle/health policy lives here as synchronous functions over
//! plain inputs: `decide(state, config, now) -> decision`. No IO, no
//! async, no locking — fully unit-testable. The effect layer in
//! `sandbox_mgr` executes the decisions.

use slipway_protocol::SandboxStatus;

use crate::config::{BreakerConfig, HeartbeatConfig, InactivityConfig, SpawnConfig};

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Safe to attempt a spawn. `reset` means the failure window has
    /// elapsed and the counter should be zeroed first.
    Proceed { reset: bool },
    /// Too many recent permanent failures; retry after `wait_ms`.
    Block { wait_ms: i64 },
}

pub fn check_breaker(
    failure_count: u32,
    last_failure_at: Option<i64>,
    cfg: &BreakerConfig,
    now: i64,
) -> BreakerDecision {
    let last = match last_failure_at {
        Some(t) if failure_count > 0 => t,
        _ => return BreakerDecision::Proceed { reset: false },
    };

    let age = now - last;
    // At exactly the window boundary the counter resets (>=, not >).
    if age >= cfg.window_ms {
        return BreakerDecision::Proceed { reset: true };
    }
    if failure_count >= cfg.threshold {
        return BreakerDecision::Block {
            wait_ms: cfg.window_ms - age,
        };
    }
    BreakerDecision::Proceed { reset: false }
}

// ---------------------------------------------------------------------------
// Spawn decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SpawnInput {
    pub status: SandboxStatus,
    pub created_at: i64,
    pub has_snapshot: bool,
    pub has_sandbox_socket: bool,
    pub in_memory_spawning: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnDecision {
    /// Restore from the captured snapshot image
    Restore,
    /// A spawn is already underway or unnecessary
    Skip(String),
    /// Too soon; leave the trigger pending and let the next event retry
    Wait,
    /// Fresh spawn
    Spawn,
}

/// Rules are evaluated strictly in order; the first match wins.
pub fn decide_spawn(input: &SpawnInput, cfg: &SpawnConfig, now: i64) -> SpawnDecision {
    // 1. A terminal sandbox with a snapshot restores instead of spawning.
    if input.has_snapshot && input.status.is_terminal() {
        return SpawnDecision::Restore;
    }

    // 2. Persisted in-flight states guard across requests.
    if matches!(
        input.status,
        SandboxStatus::Spawning | SandboxStatus::Connecting
    ) {
        return SpawnDecision::Skip(format!("already {}", input.status.as_str()));
    }

    // 3. A ready record is trusted while its socket lives, and briefly
    //    after spawn while the socket is still on its way.
    if input.status == SandboxStatus::Ready {
        if input.has_sandbox_socket {
            return SpawnDecision::Skip("ready with active WS".to_string());
        }
        if now - input.created_at < cfg.ready_wait_ms {
            return SpawnDecision::Wait;
        }
    }

    // 4. Spawn cooldown, except for states that already ended.
    if now - input.created_at < cfg.cooldown_ms
        && !matches!(input.status, SandboxStatus::Failed | SandboxStatus::Stopped)
    {
        return SpawnDecision::Wait;
    }

    // 5. The in-memory flag guards re-entry within a single request.
    if input.in_memory_spawning {
        return SpawnDecision::Skip("spawn in progress".to_string());
    }

    SpawnDecision::Spawn
}

// ---------------------------------------------------------------------------
// Inactivity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InactivityDecision {
    /// Check again after `delay_ms`
    Schedule { delay_ms: i64 },
    /// Clients are connected; grant a grace period and warn them
    Extend { delay_ms: i64 },
    /// Nobody is watching; snapshot and stop
    Timeout,
}

pub fn decide_inactivity(
    status: SandboxStatus,
    last_activity: Option<i64>,
    connected_clients: usize,
    cfg: &InactivityConfig,
    now: i64,
) -> InactivityDecision {
    let active_states = matches!(status, SandboxStatus::Ready | SandboxStatus::Running);
    let last = match last_activity {
        Some(t) if !status.is_terminal() && active_states => t,
        _ => {
            return InactivityDecision::Schedule {
                delay_ms: cfg.min_check_ms,
            }
        }
    };

    let inactive = now - last;
    if inactive >= cfg.timeout_ms {
        if connected_clients > 0 {
            return InactivityDecision::Extend {
                delay_ms: cfg.extension_ms,
            };
        }
        return InactivityDecision::Timeout;
    }

    InactivityDecision::Schedule {
        delay_ms: (cfg.timeout_ms - inactive).max(cfg.min_check_ms),
    }
}

// ---------------------------------------------------------------------------
// Heartbeat health
// ---------------------------------------------------------------------------

/// `last_heartbeat = None` means the sandbox is still warming up, which
/// is not stale.
pub fn heartbeat_is_stale(last_heartbeat: Option<i64>, cfg: &HeartbeatConfig, now: i64) -> bool {
    match last_heartbeat {
        Some(t) => now - t > cfg.stale_after_ms,
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Warm decision
// ---------------------------------------------------------------------------

/// Typing signals pre-warm the sandbox unless one is already live or on
/// its way.
pub fn should_warm(
    status: SandboxStatus,
    has_sandbox_socket: bool,
    in_memory_spawning: bool,
) -> bool {
    !(has_sandbox_socket
        || in_memory_spawning
        || matches!(
            status,
            SandboxStatus::Spawning | SandboxStatus::Connecting
        ))
}

// ---------------------------------------------------------------------------
// Snapshot preconditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotDecision {
    Skip(&'static str),
    /// `enter_snapshotting` is false when the sandbox is already in a
    /// terminal state — terminal states are sticky and must not bounce
    /// through `snapshotting`.
    Proceed { enter_snapshotting: bool },
}

pub fn decide_snapshot(
    provider_supports: bool,
    has_provider_object: bool,
    has_session: bool,
    status: SandboxStatus,
) -> SnapshotDecision {
    if !provider_supports {
        return SnapshotDecision::Skip("provider does not support snapshots");
    }
    if !has_provider_object {
        return SnapshotDecision::Skip("no provider object id");
    }
    if !has_session {
        return SnapshotDecision::Skip("no session");
    }
    if status == SandboxStatus::Snapshotting {
        return SnapshotDecision::Skip("snapshot already in progress");
    }
    SnapshotDecision::Proceed {
        enter_snapshotting: !status.is_terminal(),
    }
}

/// Status to restore once the snapshot call returns. A heartbeat-timeout
/// snapshot leaves the sandbox stale.
pub fn post_snapshot_status(previous: SandboxStatus, reason: &str) -> SandboxStatus {
    if reason == "heartbeat_timeout" {
        SandboxStatus::Stale
    } else {
        previous
    }
}
