//! Pull-request path
//!
//! The acting identity is the author of the currently-processing
//! prompt. The push round-trip goes through the sandbox with a
//! short-lived installation token (the user's OAuth token never leaves
//! the coordinator); the PR itself is created with the user's token.
//! The 180 s push timeout is enforced by the waiter, which always
//! clears its pending-push entry.

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

use slipway_protocol::{new_id, ArtifactRecord, ArtifactType, SandboxCommand, ServerMessage};
use slipway_ports::CreatePullRequest;

use crate::clock::now_ms;
use crate::config::Config;
use crate::core::SessionHandle;

#[derive(Debug, Error)]
pub enum PrError {
    #[error("no prompt is currently processing; cannot determine acting user")]
    NoProcessingMessage,
    #[error("author of the processing prompt is not a participant")]
    UnknownAuthor,
    #[error("GitHub token expired or unreadable; please re-authenticate")]
    AuthExpired,
    #[error("push to {branch} failed: {reason}")]
    PushFailed { branch: String, reason: String },
    #[error("push to {branch} timed out")]
    PushTimeout { branch: String },
    #[error("code host error: {0}")]
    CodeHost(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for PrError {
    fn from(e: anyhow::Error) -> Self {
        PrError::Internal(e.to_string())
    }
}

/// Branch keys are case-folded and trimmed to absorb remotes that
/// case-fold branch names in their responses.
pub fn normalize_branch(branch: &str) -> String {
    branch.trim().to_lowercase()
}

pub async fn create_pr(
    handle: &SessionHandle,
    title: String,
    body: String,
) -> Result<Value, PrError> {
    // Phase 1: resolve acting identity and credentials under the lock.
    let (deps, session_name, repo_owner, repo_name, user_token) = {
        let core = handle.lock().await;
        let processing = core
            .store
            .processing_message()
            .map_err(PrError::from)?
            .ok_or(PrError::NoProcessingMessage)?;
        let participant = core
            .store
            .participant(&processing.author_id)
            .map_err(PrError::from)?
            .ok_or(PrError::UnknownAuthor)?;

        let token_enc = participant
            .access_token_enc
            .as_deref()
            .ok_or(PrError::AuthExpired)?;
        let token = core
            .deps
            .master_key
            .decrypt(token_enc)
            .map_err(|_| PrError::AuthExpired)?;
        if let Some(expires_at) = participant.token_expires_at {
            if expires_at <= now_ms() + core.deps.config.token_expiry_skew_ms {
                return Err(PrError::AuthExpired);
            }
        }

        let session = core
            .store
            .session()
            .map_err(PrError::from)?
            .ok_or_else(|| PrError::Internal("no session".into()))?;
        (
            core.deps.clone(),
            session.name,
            session.repo_owner,
            session.repo_name,
            token,
        )
    };

    // Phase 2: upstream calls without the session lock.
    let repo = deps
        .code_host
        .get_repository(&repo_owner, &repo_name, &user_token)
        .await
        .map_err(|e| PrError::CodeHost(e.to_string()))?;

    let head_branch = Config::head_branch_for(&session_name);

    let push_token = match (&deps.identity, deps.config.github_app_installation_id) {
        (Some(identity), Some(installation_id)) => {
            match identity.generate_installation_token(installation_id).await {
                Ok(t) => Some(t.token),
                Err(e) => {
                    warn!(
                        component = "pr",
                        event = "pr.installation_token_failed",
                        session = %session_name,
                        error = %e,
                        "Falling back to sandbox-local credentials for push"
                    );
                    None
                }
            }
        }
        _ => None,
    };

    // Phase 3: push round-trip. Register the waiter and send the
    // command under the lock, await the result without it.
    let push_rx = {
        let mut core = handle.lock().await;
        if core.sandbox_socket_open() {
            let (tx, rx) = oneshot::channel();
            core.pending_pushes.insert(normalize_branch(&head_branch), tx);
            core.send_to_sandbox(&SandboxCommand::Push {
                branch_name: head_branch.clone(),
                repo_owner: repo_owner.clone(),
                repo_name: repo_name.clone(),
                github_token: push_token,
            });
            Some(rx)
        } else {
            // No sandbox connected: assume the user pushed manually.
            info!(
                component = "pr",
                event = "pr.push_skipped",
                session = %session_name,
                "No sandbox socket; assuming branch was pushed manually"
            );
            None
        }
    };

    if let Some(rx) = push_rx {
        let timeout = Duration::from_millis(deps.config.push_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => {
                return Err(PrError::PushFailed {
                    branch: head_branch,
                    reason,
                });
            }
            Ok(Err(_closed)) => {
                return Err(PrError::PushFailed {
                    branch: head_branch,
                    reason: "push channel closed".to_string(),
                });
            }
            Err(_elapsed) => {
                // Reject and clear the entry so a late event is ignored.
                let mut core = handle.lock().await;
                core.pending_pushes.remove(&normalize_branch(&head_branch));
                return Err(PrError::PushTimeout {
                    branch: head_branch,
                });
            }
        }
    }

    // Phase 4: create the PR with the user's own token.
    let body_with_footer = format!(
        "{body}\n\n---\n_Created from [slipway session {session_name}]({}/sessions/{session_name})_",
        deps.config.control_plane_url
    );
    let pr = deps
        .code_host
        .create_pull_request(
            &CreatePullRequest {
                owner: repo_owner.clone(),
                name: repo_name.clone(),
                title,
                body: body_with_footer,
                head: head_branch.clone(),
                base: repo.default_branch.clone(),
            },
            &user_token,
        )
        .await
        .map_err(|e| PrError::CodeHost(e.to_string()))?;

    // Phase 5: persist the artifact and notify clients.
    {
        let core = handle.lock().await;
        let now = now_ms();
        let artifact = ArtifactRecord {
            id: new_id(),
            artifact_type: ArtifactType::Pr,
            url: Some(pr.html_url.clone()),
            metadata: json!({
                "number": pr.number,
                "state": pr.state,
                "head": head_branch,
                "base": repo.default_branch,
            }),
            created_at: now,
        };
        core.store.insert_artifact(&artifact).map_err(PrError::from)?;
        core.store
            .set_branch_name(&head_branch, now)
            .map_err(PrError::from)?;
        core.broadcast(&ServerMessage::ArtifactCreated {
            artifact: artifact.clone(),
        });
        info!(
            component = "pr",
            event = "pr.created",
            session = %session_name,
            number = pr.number,
            url = %pr.html_url,
            "Pull request created"
        );
    }

    Ok(json!({
        "number": pr.number,
        "htmlUrl": pr.html_url,
        "state": pr.state,
        "head": head_branch,
    }))
}
