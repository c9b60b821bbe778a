//! Repository secrets store
//!
//! Process-wide, per-repository KV of envelope-encrypted values. Keys
//! are normalized to upper-case on write, validated against a pattern
//! and a reserved set, and bounded by count, per-value, and aggregate
//! quotas. Lives in the shared control database, not the per-session
//! stores.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::info;

use crate::clock::now_ms;
use crate::crypto::MasterKey;

pub const MAX_SECRETS_PER_REPO: usize = 50;
pub const MAX_KEY_LEN: usize = 256;
pub const MAX_VALUE_BYTES: usize = 16 * 1024;
pub const MAX_AGGREGATE_BYTES: usize = 64 * 1024;

/// Operational variables plus provider API-key names. User secrets may
/// never shadow these, in any casing.
const RESERVED_KEYS: &[&str] = &[
    "CONTROL_PLANE_URL",
    "SANDBOX_AUTH_TOKEN",
    "SANDBOX_ID",
    "SESSION_ID",
    "REPO_OWNER",
    "REPO_NAME",
    "GIT_AUTHOR_NAME",
    "GIT_AUTHOR_EMAIL",
    "GITHUB_TOKEN",
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GEMINI_API_KEY",
    "MODAL_TOKEN_ID",
    "MODAL_TOKEN_SECRET",
];

pub fn is_reserved_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    RESERVED_KEYS.contains(&upper.as_str())
}

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("invalid secret key {0:?}: must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidKey(String),
    #[error("secret key {0:?} exceeds {MAX_KEY_LEN} characters")]
    KeyTooLong(String),
    #[error("secret key {0:?} is reserved")]
    ReservedKey(String),
    #[error("secret {0:?} exceeds 16 KiB value limit")]
    ValueTooLarge(String),
    #[error("exceeds {MAX_SECRETS_PER_REPO} secrets limit")]
    TooManySecrets,
    #[error("exceeds 64 KiB aggregate secrets limit")]
    AggregateTooLarge,
    #[error("failed to decrypt secret {0:?}")]
    Decrypt(String),
    #[error("secrets store error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("encryption failed for secret {0:?}")]
    Encrypt(String),
}

impl SecretsError {
    /// Every variant except storage/crypto failures rejects user input.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            SecretsError::Db(_) | SecretsError::Decrypt(_) | SecretsError::Encrypt(_)
        )
    }
}

fn validate_key(key: &str) -> Result<(), SecretsError> {
    if key.len() > MAX_KEY_LEN {
        return Err(SecretsError::KeyTooLong(key.to_string()));
    }
    let mut chars = key.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SecretsError::InvalidKey(key.to_string()));
    }
    if is_reserved_key(key) {
        return Err(SecretsError::ReservedKey(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMeta {
    pub key: String,
    pub created_at: i64,
    pub updated_at: i64,
}

pub struct SecretsStore {
    conn: Mutex<Connection>,
    key: MasterKey,
}

impl SecretsStore {
    pub fn open(path: &Path, key: MasterKey) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    pub fn open_in_memory(key: MasterKey) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    fn migrate(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS repo_secrets (
                repo_id INTEGER NOT NULL,
                repo_owner TEXT NOT NULL,
                repo_name TEXT NOT NULL,
                key TEXT NOT NULL,
                encrypted_value TEXT NOT NULL,
                value_bytes INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (repo_id, key)
            );
            CREATE INDEX IF NOT EXISTS idx_repo_secrets_owner_name
                ON repo_secrets(repo_owner, repo_name);",
        )?;
        Ok(())
    }

    /// Validate and upsert a batch of secrets for a repository. The
    /// whole batch is checked against the post-merge quotas before any
    /// write happens.
    pub fn set_secrets(
        &self,
        repo_id: i64,
        repo_owner: &str,
        repo_name: &str,
        entries: &HashMap<String, String>,
    ) -> Result<(), SecretsError> {
        // Normalize and validate every key first.
        let mut normalized: HashMap<String, &String> = HashMap::new();
        for (key, value) in entries {
            validate_key(key)?;
            if value.len() > MAX_VALUE_BYTES {
                return Err(SecretsError::ValueTooLarge(key.to_string()));
            }
            normalized.insert(key.to_ascii_uppercase(), value);
        }

        let mut conn = self.conn.lock().expect("secrets store poisoned");

        // Existing state, minus the keys this batch replaces.
        let mut existing_count = 0usize;
        let mut existing_bytes = 0usize;
        {
            let mut stmt = conn
                .prepare("SELECT key, value_bytes FROM repo_secrets WHERE repo_id = ?1")?;
            let rows = stmt.query_map(params![repo_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (key, bytes) = row?;
                if !normalized.contains_key(&key) {
                    existing_count += 1;
                    existing_bytes += bytes.max(0) as usize;
                }
            }
        }

        if existing_count + normalized.len() > MAX_SECRETS_PER_REPO {
            return Err(SecretsError::TooManySecrets);
        }
        let batch_bytes: usize = normalized.values().map(|v| v.len()).sum();
        if existing_bytes + batch_bytes > MAX_AGGREGATE_BYTES {
            return Err(SecretsError::AggregateTooLarge);
        }

        let now = now_ms();
        let tx = conn.transaction()?;
        for (key, value) in &normalized {
            let encrypted = self
                .key
                .encrypt(value)
                .map_err(|_| SecretsError::Encrypt(key.clone()))?;
            tx.execute(
                "INSERT INTO repo_secrets
                    (repo_id, repo_owner, repo_name, key, encrypted_value, value_bytes,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT (repo_id, key) DO UPDATE SET
                    encrypted_value = excluded.encrypted_value,
                    value_bytes = excluded.value_bytes,
                    updated_at = excluded.updated_at",
                params![
                    repo_id,
                    repo_owner,
                    repo_name,
                    key,
                    encrypted,
                    value.len() as i64,
                    now
                ],
            )?;
        }
        tx.commit()?;

        info!(
            component = "secrets",
            event = "secrets.updated",
            repo_id = repo_id,
            count = normalized.len(),
            "Repository secrets updated"
        );
        Ok(())
    }

    /// Key metadata only; values are never listed.
    pub fn list(&self, repo_id: i64) -> Result<Vec<SecretMeta>, SecretsError> {
        let conn = self.conn.lock().expect("secrets store poisoned");
        let mut stmt = conn.prepare(
            "SELECT key, created_at, updated_at FROM repo_secrets
             WHERE repo_id = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![repo_id], |row| {
            Ok(SecretMeta {
                key: row.get(0)?,
                created_at: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Decrypt every value for materialization into a sandbox session.
    /// A single undecryptable value fails the whole call, naming the
    /// offending key.
    pub fn materialize(&self, repo_id: i64) -> Result<HashMap<String, String>, SecretsError> {
        let conn = self.conn.lock().expect("secrets store poisoned");
        let mut stmt = conn
            .prepare("SELECT key, encrypted_value FROM repo_secrets WHERE repo_id = ?1")?;
        let rows = stmt.query_map(params![repo_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (key, encrypted) = row?;
            let value = self
                .key
                .decrypt(&encrypted)
                .map_err(|_| SecretsError::Decrypt(key.clone()))?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SecretsStore {
        SecretsStore::open_in_memory(MasterKey::random_for_tests()).unwrap()
    }

    fn one(key: &str, value: &str) -> HashMap<String, String> {
        HashMap::from([(key.to_string(), value.to_string())])
    }

    #[test]
    fn roundtrip_through_materialize() {
        let s = store();
        s.set_secrets(7, "acme", "web", &one("api_key", "s3cret"))
            .unwrap();
        let env = s.materialize(7).unwrap();
        // Keys are normalized upper-case on write
        assert_eq!(env.get("API_KEY").map(String::as_str), Some("s3cret"));
    }

    #[test]
    fn list_returns_metadata_only() {
        let s = store();
        s.set_secrets(7, "acme", "web", &one("API_KEY", "s3cret"))
            .unwrap();
        let metas = s.list(7).unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].key, "API_KEY");
    }

    #[test]
    fn rejects_invalid_key_pattern() {
        let s = store();
        for bad in ["1KEY", "KEY-DASH", "KEY SPACE", "", "KEY.DOT"] {
            let err = s.set_secrets(7, "acme", "web", &one(bad, "v")).unwrap_err();
            assert!(
                matches!(err, SecretsError::InvalidKey(_)),
                "{bad:?} gave {err}"
            );
        }
    }

    #[test]
    fn rejects_reserved_keys_in_any_case() {
        let s = store();
        for reserved in ["GITHUB_TOKEN", "github_token", "Control_Plane_Url"] {
            let err = s
                .set_secrets(7, "acme", "web", &one(reserved, "v"))
                .unwrap_err();
            assert!(
                matches!(err, SecretsError::ReservedKey(_)),
                "{reserved:?} gave {err}"
            );
        }
    }

    #[test]
    fn rejects_overlong_key() {
        let s = store();
        let key = "K".repeat(MAX_KEY_LEN + 1);
        let err = s.set_secrets(7, "acme", "web", &one(&key, "v")).unwrap_err();
        assert!(matches!(err, SecretsError::KeyTooLong(_)));
    }

    #[test]
    fn rejects_value_over_sixteen_kib() {
        let s = store();
        let err = s
            .set_secrets(7, "acme", "web", &one("BIG", &"x".repeat(MAX_VALUE_BYTES + 1)))
            .unwrap_err();
        assert!(matches!(err, SecretsError::ValueTooLarge(_)));
        // Exactly at the boundary is allowed
        s.set_secrets(7, "acme", "web", &one("BIG", &"x".repeat(MAX_VALUE_BYTES)))
            .unwrap();
    }

    #[test]
    fn enforces_fifty_key_quota() {
        let s = store();
        let mut batch = HashMap::new();
        for i in 0..MAX_SECRETS_PER_REPO {
            batch.insert(format!("K_{i}"), "y".to_string());
        }
        s.set_secrets(7, "acme", "web", &batch).unwrap();

        let err = s.set_secrets(7, "acme", "web", &one("K_50", "y")).unwrap_err();
        assert!(matches!(err, SecretsError::TooManySecrets));
        assert_eq!(err.to_string(), "exceeds 50 secrets limit");

        // Overwriting an existing key stays within quota
        s.set_secrets(7, "acme", "web", &one("K_0", "z")).unwrap();
    }

    #[test]
    fn enforces_aggregate_quota_across_batches() {
        let s = store();
        // 3 x 16 KiB fits, the 5th 16 KiB value exceeds 64 KiB aggregate
        for i in 0..4 {
            s.set_secrets(
                7,
                "acme",
                "web",
                &one(&format!("V_{i}"), &"x".repeat(MAX_VALUE_BYTES)),
            )
            .unwrap();
        }
        let err = s
            .set_secrets(7, "acme", "web", &one("V_4", "x"))
            .unwrap_err();
        assert!(matches!(err, SecretsError::AggregateTooLarge));

        // Replacing an existing value does not double-count it
        s.set_secrets(7, "acme", "web", &one("V_0", &"y".repeat(MAX_VALUE_BYTES)))
            .unwrap();
    }

    #[test]
    fn quotas_are_scoped_per_repo() {
        let s = store();
        s.set_secrets(1, "acme", "web", &one("A", &"x".repeat(MAX_VALUE_BYTES)))
            .unwrap();
        // A different repo id has its own budget
        s.set_secrets(2, "acme", "api", &one("A", &"x".repeat(MAX_VALUE_BYTES)))
            .unwrap();
        assert_eq!(s.list(1).unwrap().len(), 1);
        assert_eq!(s.list(2).unwrap().len(), 1);
    }

    #[test]
    fn validation_errors_are_flagged() {
        assert!(SecretsError::TooManySecrets.is_validation());
        assert!(SecretsError::ReservedKey("X".into()).is_validation());
        assert!(!SecretsError::Decrypt("X".into()).is_validation());
    }
}
