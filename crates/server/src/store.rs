//! Per-session persistence
//!
//! One SQLite database per session, strictly owned by that session's
//! core. Schema setup applies a fixed ordered list of additive
//! migrations; "already exists"/"duplicate column" errors are swallowed
//! and recorded, anything else is fatal.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info};

use slipway_protocol::{
    ArtifactRecord, ArtifactType, EventRecord, EventType, MessageRecord, MessageSource,
    MessageStatus, ParticipantInfo, ParticipantRole, SandboxStatus, SessionStatus, SessionView,
};

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_initial",
        "CREATE TABLE session (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            title TEXT,
            repo_owner TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            repo_default_branch TEXT,
            repo_id INTEGER,
            branch_name TEXT,
            base_sha TEXT,
            current_sha TEXT,
            model TEXT,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE participants (
            user_id TEXT PRIMARY KEY,
            github_login TEXT,
            github_name TEXT,
            github_email TEXT,
            github_user_id INTEGER,
            role TEXT NOT NULL DEFAULT 'member',
            access_token_enc TEXT,
            refresh_token_enc TEXT,
            token_expires_at INTEGER,
            ws_auth_token_hash TEXT,
            ws_token_issued_at INTEGER,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE messages (
            id TEXT PRIMARY KEY,
            author_id TEXT NOT NULL,
            content TEXT NOT NULL,
            source TEXT NOT NULL,
            model TEXT,
            attachments TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER
        );
        CREATE TABLE events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            data TEXT NOT NULL,
            message_id TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE artifacts (
            id TEXT PRIMARY KEY,
            artifact_type TEXT NOT NULL,
            url TEXT,
            metadata TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE sandbox (
            id TEXT PRIMARY KEY,
            modal_sandbox_id TEXT,
            provider_object_id TEXT,
            auth_token TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            git_sync_status TEXT,
            last_heartbeat INTEGER,
            last_activity INTEGER,
            last_spawn_error TEXT,
            last_spawn_error_at INTEGER,
            spawn_failure_count INTEGER NOT NULL DEFAULT 0,
            last_failure_at INTEGER,
            created_at INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE ws_clients (
            socket_id TEXT PRIMARY KEY,
            participant_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX idx_messages_status_created ON messages(status, created_at);
        CREATE INDEX idx_events_created ON events(created_at);",
    ),
    (
        "0002_messages_callback_context",
        "ALTER TABLE messages ADD COLUMN callback_context TEXT;",
    ),
    (
        "0003_sandbox_snapshot_image",
        "ALTER TABLE sandbox ADD COLUMN snapshot_image_id TEXT;",
    ),
    (
        "0004_events_message_index",
        "CREATE INDEX idx_events_message ON events(message_id);",
    ),
];

/// True for the error classes additive migrations are allowed to hit on
/// an already-migrated database.
fn is_already_applied(e: &rusqlite::Error) -> bool {
    let msg = e.to_string();
    msg.contains("already exists") || msg.contains("duplicate column name")
}

pub struct SessionStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    pub title: Option<String>,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_default_branch: Option<String>,
    pub repo_id: Option<i64>,
    pub branch_name: Option<String>,
    pub base_sha: Option<String>,
    pub current_sha: Option<String>,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SessionRow {
    pub fn to_view(&self, sandbox_status: SandboxStatus) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            name: self.name.clone(),
            title: self.title.clone(),
            repo_owner: self.repo_owner.clone(),
            repo_name: self.repo_name.clone(),
            branch_name: self.branch_name.clone(),
            base_sha: self.base_sha.clone(),
            current_sha: self.current_sha.clone(),
            model: self.model.clone(),
            status: self.status,
            sandbox_status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub user_id: String,
    pub github_login: Option<String>,
    pub github_name: Option<String>,
    pub github_email: Option<String>,
    pub github_user_id: Option<i64>,
    pub role: ParticipantRole,
    pub access_token_enc: Option<String>,
    pub refresh_token_enc: Option<String>,
    pub token_expires_at: Option<i64>,
    pub ws_auth_token_hash: Option<String>,
    pub ws_token_issued_at: Option<i64>,
    pub created_at: i64,
}

impl ParticipantRow {
    pub fn to_info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id.clone(),
            github_login: self.github_login.clone(),
            github_name: self.github_name.clone(),
            github_email: self.github_email.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub source: MessageSource,
    pub model: Option<String>,
    pub attachments: Vec<Value>,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub callback_context: Option<Value>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl MessageRow {
    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            id: self.id.clone(),
            author_id: self.author_id.clone(),
            content: self.content.clone(),
            source: self.source,
            model: self.model.clone(),
            attachments: self.attachments.clone(),
            status: self.status,
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxRow {
    pub id: String,
    pub modal_sandbox_id: Option<String>,
    pub provider_object_id: Option<String>,
    pub snapshot_image_id: Option<String>,
    pub auth_token: Option<String>,
    pub status: SandboxStatus,
    pub git_sync_status: Option<String>,
    pub last_heartbeat: Option<i64>,
    pub last_activity: Option<i64>,
    pub last_spawn_error: Option<String>,
    pub last_spawn_error_at: Option<i64>,
    pub spawn_failure_count: u32,
    pub last_failure_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct WsClientRow {
    pub socket_id: String,
    pub participant_id: String,
    pub client_id: String,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl SessionStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_versions (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )",
        )?;

        let mut applied = 0usize;
        for (idx, (name, sql)) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            let recorded: Option<i64> = self
                .conn
                .query_row(
                    "SELECT version FROM schema_versions WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()?;
            if recorded.is_some() {
                continue;
            }

            match self.conn.execute_batch(sql) {
                Ok(()) => {
                    applied += 1;
                }
                Err(e) if is_already_applied(&e) => {
                    debug!(
                        component = "store",
                        event = "migration.already_applied",
                        name = %name,
                        "Migration target already exists"
                    );
                }
                Err(e) => {
                    return Err(anyhow::anyhow!("migration {name} failed: {e}"));
                }
            }

            self.conn.execute(
                "INSERT OR IGNORE INTO schema_versions (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![version, name, crate::clock::now_ms()],
            )?;
        }

        if applied > 0 {
            info!(
                component = "store",
                event = "migrations.applied",
                count = applied,
                "Applied session store migrations"
            );
        }
        Ok(())
    }

    // -- session ----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_session(
        &self,
        id: &str,
        name: &str,
        title: Option<&str>,
        repo_owner: &str,
        repo_name: &str,
        model: Option<&str>,
        now: i64,
    ) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO session (id, name, title, repo_owner, repo_name, model, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'created', ?7, ?7)",
            params![id, name, title, repo_owner, repo_name, model, now],
        )?;
        Ok(())
    }

    pub fn session(&self) -> anyhow::Result<Option<SessionRow>> {
        Ok(self
            .conn
            .query_row("SELECT * FROM session LIMIT 1", [], session_from_row)
            .optional()?)
    }

    pub fn set_session_status(&self, status: SessionStatus, now: i64) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE session SET status = ?1, updated_at = ?2",
            params![status.as_str(), now],
        )?;
        Ok(())
    }

    pub fn set_branch_name(&self, branch: &str, now: i64) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE session SET branch_name = ?1, updated_at = ?2",
            params![branch, now],
        )?;
        Ok(())
    }

    pub fn set_current_sha(&self, sha: &str, now: i64) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE session SET current_sha = ?1, updated_at = ?2",
            params![sha, now],
        )?;
        Ok(())
    }

    // -- participants -----------------------------------------------------

    pub fn upsert_participant(&self, p: &ParticipantRow) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO participants (user_id, github_login, github_name, github_email,
                github_user_id, role, access_token_enc, refresh_token_enc, token_expires_at,
                created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (user_id) DO UPDATE SET
                github_login = COALESCE(excluded.github_login, github_login),
                github_name = COALESCE(excluded.github_name, github_name),
                github_email = COALESCE(excluded.github_email, github_email),
                github_user_id = COALESCE(excluded.github_user_id, github_user_id),
                access_token_enc = COALESCE(excluded.access_token_enc, access_token_enc),
                refresh_token_enc = COALESCE(excluded.refresh_token_enc, refresh_token_enc),
                token_expires_at = COALESCE(excluded.token_expires_at, token_expires_at)",
            params![
                p.user_id,
                p.github_login,
                p.github_name,
                p.github_email,
                p.github_user_id,
                p.role.as_str(),
                p.access_token_enc,
                p.refresh_token_enc,
                p.token_expires_at,
                p.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn participant(&self, user_id: &str) -> anyhow::Result<Option<ParticipantRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM participants WHERE user_id = ?1",
                params![user_id],
                participant_from_row,
            )
            .optional()?)
    }

    pub fn participant_by_ws_hash(&self, hash: &str) -> anyhow::Result<Option<ParticipantRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM participants WHERE ws_auth_token_hash = ?1",
                params![hash],
                participant_from_row,
            )
            .optional()?)
    }

    pub fn participants(&self) -> anyhow::Result<Vec<ParticipantRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM participants ORDER BY created_at")?;
        let rows = stmt.query_map([], participant_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_ws_token(&self, user_id: &str, token_hash: &str, now: i64) -> anyhow::Result<bool> {
        let n = self.conn.execute(
            "UPDATE participants SET ws_auth_token_hash = ?1, ws_token_issued_at = ?2
             WHERE user_id = ?3",
            params![token_hash, now, user_id],
        )?;
        Ok(n > 0)
    }

    // -- messages ---------------------------------------------------------

    pub fn insert_message(&self, m: &MessageRow) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO messages (id, author_id, content, source, model, attachments,
                status, error, callback_context, created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                m.id,
                m.author_id,
                m.content,
                m.source.as_str(),
                m.model,
                json_opt(&m.attachments),
                m.status.as_str(),
                m.error,
                m.callback_context.as_ref().map(|v| v.to_string()),
                m.created_at,
                m.started_at,
                m.completed_at,
            ],
        )?;
        Ok(())
    }

    pub fn message(&self, id: &str) -> anyhow::Result<Option<MessageRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM messages WHERE id = ?1",
                params![id],
                message_from_row,
            )
            .optional()?)
    }

    /// Oldest pending message; tie-break on creation timestamp then id.
    pub fn oldest_pending(&self) -> anyhow::Result<Option<MessageRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM messages WHERE status = 'pending'
                 ORDER BY created_at, id LIMIT 1",
                [],
                message_from_row,
            )
            .optional()?)
    }

    pub fn processing_message(&self) -> anyhow::Result<Option<MessageRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM messages WHERE status = 'processing' LIMIT 1",
                [],
                message_from_row,
            )
            .optional()?)
    }

    /// Queue position material: pending + processing count.
    pub fn active_message_count(&self) -> anyhow::Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE status IN ('pending', 'processing')",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// pending → processing. Guarded so the transition is monotone.
    pub fn mark_processing(&self, id: &str, now: i64) -> anyhow::Result<bool> {
        let n = self.conn.execute(
            "UPDATE messages SET status = 'processing', started_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now, id],
        )?;
        Ok(n > 0)
    }

    /// processing → completed|failed. Guarded so the transition is monotone.
    pub fn complete_message(
        &self,
        id: &str,
        success: bool,
        error: Option<&str>,
        now: i64,
    ) -> anyhow::Result<bool> {
        let status = if success {
            MessageStatus::Completed
        } else {
            MessageStatus::Failed
        };
        let n = self.conn.execute(
            "UPDATE messages SET status = ?1, error = ?2, completed_at = ?3
             WHERE id = ?4 AND status = 'processing'",
            params![status.as_str(), error, now, id],
        )?;
        Ok(n > 0)
    }

    /// Ascending page; cursor is the created_at of the previous page's
    /// last item.
    pub fn messages_page(
        &self,
        cursor: Option<i64>,
        limit: u32,
        status: Option<MessageStatus>,
    ) -> anyhow::Result<Vec<MessageRow>> {
        let cursor = cursor.unwrap_or(-1);
        let mut out = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = self.conn.prepare(
                    "SELECT * FROM messages WHERE created_at > ?1 AND status = ?2
                     ORDER BY created_at, id LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![cursor, s.as_str(), limit], message_from_row)?;
                for r in rows {
                    out.push(r?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT * FROM messages WHERE created_at > ?1
                     ORDER BY created_at, id LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![cursor, limit], message_from_row)?;
                for r in rows {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }

    /// Most recent `limit` messages, returned oldest-first.
    pub fn recent_messages(&self, limit: u32) -> anyhow::Result<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM messages ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], message_from_row)?;
        let mut out = rows.collect::<Result<Vec<_>, _>>()?;
        out.reverse();
        Ok(out)
    }

    pub fn message_count(&self) -> anyhow::Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    // -- events -----------------------------------------------------------

    pub fn insert_event(
        &self,
        id: &str,
        event_type: EventType,
        data: &Value,
        message_id: Option<&str>,
        now: i64,
    ) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, event_type, data, message_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, event_type.as_str(), data.to_string(), message_id, now],
        )?;
        Ok(())
    }

    pub fn events_page(
        &self,
        cursor: Option<i64>,
        limit: u32,
        event_type: Option<EventType>,
        message_id: Option<&str>,
    ) -> anyhow::Result<Vec<EventRecord>> {
        let cursor = cursor.unwrap_or(-1);
        let type_str = event_type.map(|t| t.as_str());
        let mut stmt = self.conn.prepare(
            "SELECT * FROM events WHERE created_at > ?1
               AND (?3 IS NULL OR event_type = ?3)
               AND (?4 IS NULL OR message_id = ?4)
             ORDER BY created_at, id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cursor, limit, type_str, message_id], event_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent `limit` events, returned oldest-first.
    pub fn recent_events(&self, limit: u32) -> anyhow::Result<Vec<EventRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM events ORDER BY created_at DESC, id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], event_from_row)?;
        let mut out = rows.collect::<Result<Vec<_>, _>>()?;
        out.reverse();
        Ok(out)
    }

    pub fn event_count(&self) -> anyhow::Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    // -- artifacts ---------------------------------------------------------

    pub fn insert_artifact(&self, a: &ArtifactRecord) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO artifacts (id, artifact_type, url, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                a.id,
                a.artifact_type.as_str(),
                a.url,
                a.metadata.to_string(),
                a.created_at
            ],
        )?;
        Ok(())
    }

    pub fn artifacts(&self) -> anyhow::Result<Vec<ArtifactRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM artifacts ORDER BY created_at, id")?;
        let rows = stmt.query_map([], artifact_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -- sandbox -----------------------------------------------------------

    /// Insert the singleton sandbox row. `created_at` starts at 0 so the
    /// first spawn is not gated by cooldown.
    pub fn init_sandbox(&self, id: &str) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO sandbox (id, status, created_at) VALUES (?1, 'pending', 0)",
            params![id],
        )?;
        Ok(())
    }

    pub fn sandbox(&self) -> anyhow::Result<Option<SandboxRow>> {
        Ok(self
            .conn
            .query_row("SELECT * FROM sandbox LIMIT 1", [], sandbox_from_row)
            .optional()?)
    }

    pub fn set_sandbox_status(&self, status: SandboxStatus) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE sandbox SET status = ?1",
            params![status.as_str()],
        )?;
        Ok(())
    }

    /// Persist the pre-allocated sandbox identity before the provider is
    /// called, so a concurrently-connecting sandbox finds its validation
    /// record.
    pub fn prepare_spawn(
        &self,
        modal_sandbox_id: &str,
        auth_token: &str,
        now: i64,
    ) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE sandbox SET modal_sandbox_id = ?1, auth_token = ?2,
                status = 'spawning', created_at = ?3, provider_object_id = NULL,
                last_heartbeat = NULL, git_sync_status = NULL",
            params![modal_sandbox_id, auth_token, now],
        )?;
        Ok(())
    }

    pub fn set_provider_object_id(&self, object_id: &str) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE sandbox SET provider_object_id = ?1",
            params![object_id],
        )?;
        Ok(())
    }

    pub fn set_snapshot_image_id(&self, image_id: &str) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE sandbox SET snapshot_image_id = ?1",
            params![image_id],
        )?;
        Ok(())
    }

    pub fn record_spawn_failure(
        &self,
        error: &str,
        count_failure: bool,
        now: i64,
    ) -> anyhow::Result<()> {
        if count_failure {
            self.conn.execute(
                "UPDATE sandbox SET status = 'failed', last_spawn_error = ?1,
                    last_spawn_error_at = ?2,
                    spawn_failure_count = spawn_failure_count + 1,
                    last_failure_at = ?2",
                params![error, now],
            )?;
        } else {
            self.conn.execute(
                "UPDATE sandbox SET status = 'failed', last_spawn_error = ?1,
                    last_spawn_error_at = ?2",
                params![error, now],
            )?;
        }
        Ok(())
    }

    pub fn reset_spawn_failures(&self) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE sandbox SET spawn_failure_count = 0, last_failure_at = NULL",
            [],
        )?;
        Ok(())
    }

    pub fn set_heartbeat(&self, now: i64) -> anyhow::Result<()> {
        self.conn
            .execute("UPDATE sandbox SET last_heartbeat = ?1", params![now])?;
        Ok(())
    }

    pub fn touch_activity(&self, now: i64) -> anyhow::Result<()> {
        self.conn
            .execute("UPDATE sandbox SET last_activity = ?1", params![now])?;
        Ok(())
    }

    pub fn set_git_sync_status(&self, status: &str) -> anyhow::Result<()> {
        self.conn
            .execute("UPDATE sandbox SET git_sync_status = ?1", params![status])?;
        Ok(())
    }

    // -- websocket client mapping ------------------------------------------

    pub fn ws_client_insert(&self, row: &WsClientRow) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO ws_clients (socket_id, participant_id, client_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![row.socket_id, row.participant_id, row.client_id, row.created_at],
        )?;
        Ok(())
    }

    pub fn ws_client(&self, socket_id: &str) -> anyhow::Result<Option<WsClientRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT socket_id, participant_id, client_id, created_at
                 FROM ws_clients WHERE socket_id = ?1",
                params![socket_id],
                |row| {
                    Ok(WsClientRow {
                        socket_id: row.get(0)?,
                        participant_id: row.get(1)?,
                        client_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn ws_client_delete(&self, socket_id: &str) -> anyhow::Result<()> {
        self.conn.execute(
            "DELETE FROM ws_clients WHERE socket_id = ?1",
            params![socket_id],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn json_opt(values: &[Value]) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        Some(Value::Array(values.to_vec()).to_string())
    }
}

fn parse_json_array(text: Option<String>) -> Vec<Value> {
    text.and_then(|t| serde_json::from_str::<Value>(&t).ok())
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
}

fn parse_json(text: Option<String>) -> Option<Value> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    let status: String = row.get("status")?;
    Ok(SessionRow {
        id: row.get("id")?,
        name: row.get("name")?,
        title: row.get("title")?,
        repo_owner: row.get("repo_owner")?,
        repo_name: row.get("repo_name")?,
        repo_default_branch: row.get("repo_default_branch")?,
        repo_id: row.get("repo_id")?,
        branch_name: row.get("branch_name")?,
        base_sha: row.get("base_sha")?,
        current_sha: row.get("current_sha")?,
        model: row.get("model")?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Created),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<ParticipantRow> {
    let role: String = row.get("role")?;
    Ok(ParticipantRow {
        user_id: row.get("user_id")?,
        github_login: row.get("github_login")?,
        github_name: row.get("github_name")?,
        github_email: row.get("github_email")?,
        github_user_id: row.get("github_user_id")?,
        role: ParticipantRole::parse(&role).unwrap_or(ParticipantRole::Member),
        access_token_enc: row.get("access_token_enc")?,
        refresh_token_enc: row.get("refresh_token_enc")?,
        token_expires_at: row.get("token_expires_at")?,
        ws_auth_token_hash: row.get("ws_auth_token_hash")?,
        ws_token_issued_at: row.get("ws_token_issued_at")?,
        created_at: row.get("created_at")?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let source: String = row.get("source")?;
    let status: String = row.get("status")?;
    Ok(MessageRow {
        id: row.get("id")?,
        author_id: row.get("author_id")?,
        content: row.get("content")?,
        source: MessageSource::parse(&source).unwrap_or(MessageSource::Web),
        model: row.get("model")?,
        attachments: parse_json_array(row.get("attachments")?),
        status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Pending),
        error: row.get("error")?,
        callback_context: parse_json(row.get("callback_context")?),
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let event_type: String = row.get("event_type")?;
    let data: String = row.get("data")?;
    Ok(EventRecord {
        id: row.get("id")?,
        event_type: EventType::parse(&event_type).unwrap_or(EventType::Error),
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        message_id: row.get("message_id")?,
        created_at: row.get("created_at")?,
    })
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<ArtifactRecord> {
    let artifact_type: String = row.get("artifact_type")?;
    let metadata: Option<String> = row.get("metadata")?;
    Ok(ArtifactRecord {
        id: row.get("id")?,
        artifact_type: ArtifactType::parse(&artifact_type).unwrap_or(ArtifactType::Branch),
        url: row.get("url")?,
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or(Value::Null),
        created_at: row.get("created_at")?,
    })
}

fn sandbox_from_row(row: &Row<'_>) -> rusqlite::Result<SandboxRow> {
    let status: String = row.get("status")?;
    let failure_count: i64 = row.get("spawn_failure_count")?;
    Ok(SandboxRow {
        id: row.get("id")?,
        modal_sandbox_id: row.get("modal_sandbox_id")?,
        provider_object_id: row.get("provider_object_id")?,
        snapshot_image_id: row.get("snapshot_image_id")?,
        auth_token: row.get("auth_token")?,
        status: SandboxStatus::parse(&status).unwrap_or(SandboxStatus::Pending),
        git_sync_status: row.get("git_sync_status")?,
        last_heartbeat: row.get("last_heartbeat")?,
        last_activity: row.get("last_activity")?,
        last_spawn_error: row.get("last_spawn_error")?,
        last_spawn_error_at: row.get("last_spawn_error_at")?,
        spawn_failure_count: failure_count.max(0) as u32,
        last_failure_at: row.get("last_failure_at")?,
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipway_protocol::new_id;

    fn test_store() -> SessionStore {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .create_session("sid-1", "s1", None, "acme", "web", None, 1000)
            .unwrap();
        store.init_sandbox("sbx-1").unwrap();
        store
            .upsert_participant(&ParticipantRow {
                user_id: "u1".into(),
                github_login: Some("octocat".into()),
                github_name: None,
                github_email: None,
                github_user_id: Some(42),
                role: ParticipantRole::Owner,
                access_token_enc: None,
                refresh_token_enc: None,
                token_expires_at: None,
                ws_auth_token_hash: None,
                ws_token_issued_at: None,
                created_at: 1000,
            })
            .unwrap();
        store
    }

    fn pending_message(id: &str, created_at: i64) -> MessageRow {
        MessageRow {
            id: id.into(),
            author_id: "u1".into(),
            content: "hi".into(),
            source: MessageSource::Web,
            model: None,
            attachments: Vec::new(),
            status: MessageStatus::Pending,
            error: None,
            callback_context: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let store = SessionStore::open_in_memory().unwrap();
        // Re-running against the same connection is a no-op
        store.run_migrations().unwrap();
        store.run_migrations().unwrap();
    }

    #[test]
    fn migrations_swallow_already_exists_on_fresh_tracking_table() {
        let store = SessionStore::open_in_memory().unwrap();
        // Drop the tracking table: every migration re-runs and must hit
        // the already-exists swallow path rather than failing.
        store
            .conn
            .execute_batch("DROP TABLE schema_versions")
            .unwrap();
        store.run_migrations().unwrap();
        assert!(store.session().unwrap().is_none());
    }

    #[test]
    fn sandbox_created_at_is_zero_after_init() {
        let store = test_store();
        let sbx = store.sandbox().unwrap().unwrap();
        assert_eq!(sbx.created_at, 0);
        assert_eq!(sbx.status, SandboxStatus::Pending);
    }

    #[test]
    fn oldest_pending_orders_by_created_then_id() {
        let store = test_store();
        store.insert_message(&pending_message("b", 2000)).unwrap();
        store.insert_message(&pending_message("c", 1000)).unwrap();
        store.insert_message(&pending_message("a", 1000)).unwrap();
        let head = store.oldest_pending().unwrap().unwrap();
        assert_eq!(head.id, "a");
    }

    #[test]
    fn message_status_transitions_are_guarded() {
        let store = test_store();
        store.insert_message(&pending_message("m1", 1000)).unwrap();

        // pending → processing succeeds once
        assert!(store.mark_processing("m1", 2000).unwrap());
        assert!(!store.mark_processing("m1", 2000).unwrap());

        // processing → completed succeeds once
        assert!(store.complete_message("m1", true, None, 3000).unwrap());
        assert!(!store.complete_message("m1", false, None, 3000).unwrap());

        let m = store.message("m1").unwrap().unwrap();
        assert_eq!(m.status, MessageStatus::Completed);
        assert_eq!(m.started_at, Some(2000));
        assert_eq!(m.completed_at, Some(3000));
    }

    #[test]
    fn complete_skips_non_processing_rows() {
        let store = test_store();
        store.insert_message(&pending_message("m1", 1000)).unwrap();
        // still pending — completion must not apply
        assert!(!store.complete_message("m1", true, None, 2000).unwrap());
        let m = store.message("m1").unwrap().unwrap();
        assert_eq!(m.status, MessageStatus::Pending);
    }

    #[test]
    fn active_count_covers_pending_and_processing() {
        let store = test_store();
        store.insert_message(&pending_message("m1", 1000)).unwrap();
        store.insert_message(&pending_message("m2", 1100)).unwrap();
        store.mark_processing("m1", 1200).unwrap();
        assert_eq!(store.active_message_count().unwrap(), 2);
        store.complete_message("m1", true, None, 1300).unwrap();
        assert_eq!(store.active_message_count().unwrap(), 1);
    }

    #[test]
    fn events_page_filters_and_paginates() {
        let store = test_store();
        for i in 0..5i64 {
            store
                .insert_event(
                    &new_id(),
                    if i % 2 == 0 {
                        EventType::Token
                    } else {
                        EventType::ToolCall
                    },
                    &serde_json::json!({"i": i}),
                    None,
                    1000 + i,
                )
                .unwrap();
        }

        let page = store.events_page(None, 2, None, None).unwrap();
        assert_eq!(page.len(), 2);
        let next = store
            .events_page(Some(page.last().unwrap().created_at), 10, None, None)
            .unwrap();
        assert_eq!(next.len(), 3);

        let tokens = store
            .events_page(None, 10, Some(EventType::Token), None)
            .unwrap();
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn prepare_spawn_persists_identity_before_provider_call() {
        let store = test_store();
        store.prepare_spawn("sandbox-acme-web-123", "tok", 5000).unwrap();
        let sbx = store.sandbox().unwrap().unwrap();
        assert_eq!(sbx.modal_sandbox_id.as_deref(), Some("sandbox-acme-web-123"));
        assert_eq!(sbx.auth_token.as_deref(), Some("tok"));
        assert_eq!(sbx.status, SandboxStatus::Spawning);
        assert_eq!(sbx.created_at, 5000);
        assert!(sbx.provider_object_id.is_none());
    }

    #[test]
    fn spawn_failure_counter_only_counts_permanent() {
        let store = test_store();
        store.record_spawn_failure("boom", true, 1000).unwrap();
        store.record_spawn_failure("flaky", false, 2000).unwrap();
        let sbx = store.sandbox().unwrap().unwrap();
        assert_eq!(sbx.spawn_failure_count, 1);
        assert_eq!(sbx.last_failure_at, Some(1000));
        assert_eq!(sbx.status, SandboxStatus::Failed);

        store.reset_spawn_failures().unwrap();
        let sbx = store.sandbox().unwrap().unwrap();
        assert_eq!(sbx.spawn_failure_count, 0);
        assert!(sbx.last_failure_at.is_none());
    }

    #[test]
    fn ws_client_mapping_roundtrip() {
        let store = test_store();
        store
            .ws_client_insert(&WsClientRow {
                socket_id: "sock-1".into(),
                participant_id: "u1".into(),
                client_id: "c-1".into(),
                created_at: 1000,
            })
            .unwrap();
        let row = store.ws_client("sock-1").unwrap().unwrap();
        assert_eq!(row.participant_id, "u1");
        store.ws_client_delete("sock-1").unwrap();
        assert!(store.ws_client("sock-1").unwrap().is_none());
    }

    #[test]
    fn recent_messages_returns_oldest_first_window() {
        let store = test_store();
        for i in 0..5i64 {
            store
                .insert_message(&pending_message(&format!("m{i}"), 1000 + i))
                .unwrap();
        }
        let recent = store.recent_messages(3).unwrap();
        assert_eq!(
            recent.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m2", "m3", "m4"]
        );
    }
}
