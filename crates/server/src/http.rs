//! Internal HTTP API
//!
//! Requests arrive with the session name in the path, standing in
//! for the transport proxy that resolves session routing upstream.
//! Validation failures return 4xx with `{"error": reason}`; upstream
//! failures degrade to 5xx without crashing the instance.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use slipway_protocol::{
    new_id, EventType, MessageSource, MessageStatus, ParticipantRole, SessionStatus,
};

use crate::clock::now_ms;
use crate::core::SessionHandle;
use crate::crypto;
use crate::pr::{self, PrError};
use crate::queue;
use crate::registry::SessionRegistry;
use crate::store::ParticipantRow;

pub type AppState = Arc<SessionRegistry>;

const MAX_EVENT_PAGE: u32 = 200;
const MAX_MESSAGE_PAGE: u32 = 100;

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn resolve(registry: &SessionRegistry, name: &str) -> Result<SessionHandle, Response> {
    registry
        .get(name)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "session not found"))
}

pub async fn healthz() -> impl IntoResponse {
    "OK"
}

// ---------------------------------------------------------------------------
// Session init & state
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    #[serde(default)]
    pub session_name: Option<String>,
    pub repo_owner: String,
    pub repo_name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub github_login: Option<String>,
    #[serde(default)]
    pub github_name: Option<String>,
    #[serde(default)]
    pub github_email: Option<String>,
    #[serde(default)]
    pub github_user_id: Option<i64>,
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default)]
    pub github_token_encrypted: Option<String>,
    #[serde(default)]
    pub github_token_expires_at: Option<i64>,
}

pub async fn init(
    Path(name): Path<String>,
    State(registry): State<AppState>,
    Json(req): Json<InitRequest>,
) -> Response {
    if !SessionRegistry::valid_name(&name) {
        return api_error(StatusCode::BAD_REQUEST, "invalid session name");
    }
    if let Some(body_name) = &req.session_name {
        if body_name != &name {
            return api_error(StatusCode::BAD_REQUEST, "session name mismatch");
        }
    }

    let handle = match registry.open_for_init(&name).await {
        Ok(h) => h,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let core = handle.lock().await;
    match core.store.session() {
        Ok(Some(_)) => return api_error(StatusCode::CONFLICT, "session already exists"),
        Ok(None) => {}
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let session_id = new_id();
    let now = now_ms();
    let token_enc = match (&req.github_token, &req.github_token_encrypted) {
        (_, Some(already)) => Some(already.clone()),
        (Some(plain), None) => match core.deps.master_key.encrypt(plain) {
            Ok(enc) => Some(enc),
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        (None, None) => None,
    };

    let result = core
        .store
        .create_session(
            &session_id,
            &name,
            req.title.as_deref(),
            &req.repo_owner,
            &req.repo_name,
            req.model.as_deref(),
            now,
        )
        .and_then(|_| core.store.init_sandbox(&new_id()))
        .and_then(|_| {
            core.store.upsert_participant(&ParticipantRow {
                user_id: req.user_id.clone(),
                github_login: req.github_login.clone(),
                github_name: req.github_name.clone(),
                github_email: req.github_email.clone(),
                github_user_id: req.github_user_id,
                role: ParticipantRole::Owner,
                access_token_enc: token_enc,
                refresh_token_enc: None,
                token_expires_at: req.github_token_expires_at,
                ws_auth_token_hash: None,
                ws_token_issued_at: None,
                created_at: now,
            })
        });
    if let Err(e) = result {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    Json(json!({ "sessionId": session_id, "status": "created" })).into_response()
}

pub async fn state(Path(name): Path<String>, State(registry): State<AppState>) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let core = handle.lock().await;
    let session = match core.store.session() {
        Ok(Some(s)) => s,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let sandbox = match core.store.sandbox() {
        Ok(s) => s,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let sandbox_status = sandbox
        .as_ref()
        .map(|s| s.status)
        .unwrap_or(slipway_protocol::SandboxStatus::Pending);
    let sandbox_json = sandbox.map(|s| {
        json!({
            "status": s.status.as_str(),
            "gitSyncStatus": s.git_sync_status,
            "lastHeartbeat": s.last_heartbeat,
            "lastActivity": s.last_activity,
            "snapshotImageId": s.snapshot_image_id,
            "spawnFailureCount": s.spawn_failure_count,
            "lastSpawnError": s.last_spawn_error,
        })
    });
    Json(json!({
        "session": session.to_view(sandbox_status),
        "sandbox": sandbox_json,
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub content: String,
    pub author_id: String,
    pub source: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub callback_context: Option<Value>,
}

pub async fn prompt(
    Path(name): Path<String>,
    State(registry): State<AppState>,
    Json(req): Json<PromptRequest>,
) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    if req.content.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "content must not be empty");
    }
    let Some(source) = MessageSource::parse(&req.source) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("invalid source {:?}", req.source),
        );
    };

    let mut core = handle.lock().await;
    match core.store.participant(&req.author_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("unknown author {:?}", req.author_id),
            )
        }
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let (message_id, _position) = match queue::enqueue(
        &mut core,
        &req.author_id,
        &req.content,
        source,
        req.model,
        req.attachments,
        req.callback_context,
    ) {
        Ok(pair) => pair,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    if let Err(e) = queue::process_next(&mut core, &handle).await {
        warn!(
            component = "http",
            event = "http.prompt.queue_drive_failed",
            session = %name,
            error = %e,
            "Queue drive after enqueue failed"
        );
    }

    Json(json!({ "messageId": message_id, "status": "queued" })).into_response()
}

pub async fn stop(Path(name): Path<String>, State(registry): State<AppState>) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let core = handle.lock().await;
    let sent = core.send_to_sandbox(&slipway_protocol::SandboxCommand::Stop);
    Json(json!({ "sent": sent })).into_response()
}

// ---------------------------------------------------------------------------
// Sandbox events over HTTP
// ---------------------------------------------------------------------------

pub async fn sandbox_event(
    Path(name): Path<String>,
    State(registry): State<AppState>,
    Json(event): Json<Value>,
) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let mut core = handle.lock().await;
    match crate::events::route_sandbox_event(&mut core, &handle, event).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

pub async fn participants_get(
    Path(name): Path<String>,
    State(registry): State<AppState>,
) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let core = handle.lock().await;
    match core.store.participants() {
        Ok(rows) => {
            let infos: Vec<_> = rows.iter().map(ParticipantRow::to_info).collect();
            Json(json!({ "participants": infos })).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRequest {
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub github_login: Option<String>,
    #[serde(default)]
    pub github_name: Option<String>,
    #[serde(default)]
    pub github_email: Option<String>,
    #[serde(default)]
    pub github_user_id: Option<i64>,
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default)]
    pub github_token_encrypted: Option<String>,
    #[serde(default)]
    pub github_token_expires_at: Option<i64>,
}

pub async fn participants_post(
    Path(name): Path<String>,
    State(registry): State<AppState>,
    Json(req): Json<ParticipantRequest>,
) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let role = match req.role.as_deref() {
        None => ParticipantRole::Member,
        Some(r) => match ParticipantRole::parse(r) {
            Some(role) => role,
            None => return api_error(StatusCode::BAD_REQUEST, format!("invalid role {r:?}")),
        },
    };

    let core = handle.lock().await;
    let token_enc = match (&req.github_token, &req.github_token_encrypted) {
        (_, Some(already)) => Some(already.clone()),
        (Some(plain), None) => match core.deps.master_key.encrypt(plain) {
            Ok(enc) => Some(enc),
            Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        (None, None) => None,
    };
    let row = ParticipantRow {
        user_id: req.user_id.clone(),
        github_login: req.github_login,
        github_name: req.github_name,
        github_email: req.github_email,
        github_user_id: req.github_user_id,
        role,
        access_token_enc: token_enc,
        refresh_token_enc: None,
        token_expires_at: req.github_token_expires_at,
        ws_auth_token_hash: None,
        ws_token_issued_at: None,
        created_at: now_ms(),
    };
    match core.store.upsert_participant(&row) {
        Ok(()) => Json(json!({ "participant": row.to_info() })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Events / artifacts / messages
// ---------------------------------------------------------------------------

pub async fn events_get(
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(registry): State<AppState>,
) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let cursor = params.get("cursor").and_then(|c| c.parse::<i64>().ok());
    let limit = params
        .get("limit")
        .and_then(|l| l.parse::<u32>().ok())
        .unwrap_or(MAX_EVENT_PAGE)
        .min(MAX_EVENT_PAGE);
    let event_type = match params.get("type") {
        None => None,
        Some(t) => match EventType::parse(t) {
            Some(et) => Some(et),
            None => {
                return api_error(StatusCode::BAD_REQUEST, format!("invalid event type {t:?}"))
            }
        },
    };
    let message_id = params.get("message_id").map(String::as_str);

    let core = handle.lock().await;
    match core.store.events_page(cursor, limit, event_type, message_id) {
        Ok(events) => {
            let next_cursor = events.last().map(|e| e.created_at);
            Json(json!({ "events": events, "nextCursor": next_cursor })).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn artifacts_get(Path(name): Path<String>, State(registry): State<AppState>) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let core = handle.lock().await;
    match core.store.artifacts() {
        Ok(artifacts) => Json(json!({ "artifacts": artifacts })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn messages_get(
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(registry): State<AppState>,
) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let cursor = params.get("cursor").and_then(|c| c.parse::<i64>().ok());
    let limit = params
        .get("limit")
        .and_then(|l| l.parse::<u32>().ok())
        .unwrap_or(MAX_MESSAGE_PAGE)
        .min(MAX_MESSAGE_PAGE);
    let status = match params.get("status") {
        None => None,
        Some(s) => match MessageStatus::parse(s) {
            Some(status) => Some(status),
            None => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid message status {s:?}"),
                )
            }
        },
    };

    let core = handle.lock().await;
    match core.store.messages_page(cursor, limit, status) {
        Ok(rows) => {
            let messages: Vec<_> = rows.iter().map(|m| m.to_record()).collect();
            let next_cursor = messages.last().map(|m| m.created_at);
            Json(json!({ "messages": messages, "nextCursor": next_cursor })).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Pull requests
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePrRequest {
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

pub async fn create_pr(
    Path(name): Path<String>,
    State(registry): State<AppState>,
    Json(req): Json<CreatePrRequest>,
) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    match pr::create_pr(&handle, req.title, req.body.unwrap_or_default()).await {
        Ok(pr_json) => Json(pr_json).into_response(),
        Err(e) => {
            let status = match &e {
                PrError::NoProcessingMessage | PrError::UnknownAuthor => StatusCode::BAD_REQUEST,
                PrError::AuthExpired => StatusCode::UNAUTHORIZED,
                PrError::PushTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                PrError::PushFailed { .. } | PrError::CodeHost(_) => StatusCode::BAD_GATEWAY,
                PrError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            api_error(status, e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tokens & lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsTokenRequest {
    pub user_id: String,
}

/// Mint a 256-bit WebSocket token. Only its SHA-256 is persisted; the
/// plaintext exists in this response alone.
pub async fn ws_token(
    Path(name): Path<String>,
    State(registry): State<AppState>,
    Json(req): Json<WsTokenRequest>,
) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let core = handle.lock().await;
    let token = crypto::random_token();
    let hash = crypto::sha256_hex(&token);
    match core.store.set_ws_token(&req.user_id, &hash, now_ms()) {
        Ok(true) => Json(json!({ "token": token })).into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "unknown participant"),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRequest {
    pub user_id: String,
}

async fn set_archive_status(
    registry: &SessionRegistry,
    name: &str,
    user_id: &str,
    status: SessionStatus,
) -> Response {
    let handle = match resolve(registry, name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let core = handle.lock().await;
    match core.store.participant(user_id) {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::FORBIDDEN, "unknown participant"),
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
    if let Err(e) = core.store.set_session_status(status, now_ms()) {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    core.broadcast(&slipway_protocol::ServerMessage::SessionStatus { status });
    Json(json!({ "status": status.as_str() })).into_response()
}

pub async fn archive(
    Path(name): Path<String>,
    State(registry): State<AppState>,
    Json(req): Json<ArchiveRequest>,
) -> Response {
    set_archive_status(&registry, &name, &req.user_id, SessionStatus::Archived).await
}

pub async fn unarchive(
    Path(name): Path<String>,
    State(registry): State<AppState>,
    Json(req): Json<ArchiveRequest>,
) -> Response {
    set_archive_status(&registry, &name, &req.user_id, SessionStatus::Active).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyTokenRequest {
    pub token: String,
}

pub async fn verify_sandbox_token(
    Path(name): Path<String>,
    State(registry): State<AppState>,
    Json(req): Json<VerifyTokenRequest>,
) -> Response {
    let handle = match resolve(&registry, &name).await {
        Ok(h) => h,
        Err(r) => return r,
    };
    let core = handle.lock().await;
    let valid = match core.store.sandbox() {
        Ok(Some(sandbox)) => {
            sandbox.auth_token.as_deref() == Some(req.token.as_str())
                && !matches!(
                    sandbox.status,
                    slipway_protocol::SandboxStatus::Stopped
                        | slipway_protocol::SandboxStatus::Stale
                )
        }
        _ => false,
    };
    Json(json!({ "valid": valid })).into_response()
}

// ---------------------------------------------------------------------------
// Repository secrets
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutSecretsRequest {
    pub repo_owner: String,
    pub repo_name: String,
    pub secrets: HashMap<String, String>,
}

pub async fn secrets_put(
    Path(repo_id): Path<i64>,
    State(registry): State<AppState>,
    Json(req): Json<PutSecretsRequest>,
) -> Response {
    let secrets = &registry.deps().secrets;
    match secrets.set_secrets(repo_id, &req.repo_owner, &req.repo_name, &req.secrets) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) if e.is_validation() => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn secrets_list(Path(repo_id): Path<i64>, State(registry): State<AppState>) -> Response {
    match registry.deps().secrets.list(repo_id) {
        Ok(metas) => Json(json!({ "secrets": metas })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn secrets_materialize(
    Path(repo_id): Path<i64>,
    State(registry): State<AppState>,
) -> Response {
    match registry.deps().secrets.materialize(repo_id) {
        Ok(env) => Json(json!({ "env": env })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
