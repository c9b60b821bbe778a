//! Sandbox provider port
//!
//! The lifecycle controller drives this trait; it never sees a concrete
//! provider type. Errors carry a permanent/transient classification that
//! feeds the spawn circuit breaker.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// How a provider failure should be treated by the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Counts toward the spawn failure threshold
    Permanent,
    /// Retryable; does not mutate the breaker
    Transient,
}

#[derive(Debug, Error)]
#[error("provider error ({kind:?}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// Everything a provider needs to materialize a sandbox.
///
/// `sandbox_id` and `auth_token` are allocated and persisted by the
/// coordinator before this call is made, so the sandbox that boots and
/// connects back can be validated against durable state.
#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub session_id: String,
    pub sandbox_id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub control_plane_url: String,
    pub auth_token: String,
    pub provider: String,
    pub model: Option<String>,
    /// User-scoped secrets materialized into the sandbox environment.
    /// Operational variables always override user values.
    pub env: HashMap<String, String>,
}

/// Returned by a successful create/restore call
#[derive(Debug, Clone)]
pub struct SpawnedSandbox {
    /// Provider-internal object id, required for snapshot calls
    pub provider_object_id: String,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Materialize a fresh sandbox
    async fn create_sandbox(&self, req: &CreateSandboxRequest)
        -> Result<SpawnedSandbox, ProviderError>;

    /// Restore a sandbox from a previously captured snapshot image
    async fn restore_from_snapshot(
        &self,
        req: &CreateSandboxRequest,
        snapshot_image_id: &str,
    ) -> Result<SpawnedSandbox, ProviderError>;

    /// Capture a filesystem snapshot; returns the new image id
    async fn take_snapshot(&self, provider_object_id: &str) -> Result<String, ProviderError>;

    /// Whether this provider supports snapshot/restore at all
    fn supports_snapshots(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ProviderError::transient("503").is_transient());
        assert!(!ProviderError::permanent("bad image").is_transient());
    }
}
