//! Identity port — GitHub App installation tokens
//!
//! Installation tokens are minted on demand: sign a short-lived RS256
//! JWT as the app, then exchange it for an installation token valid for
//! about an hour. The user's OAuth token is never sent to the sandbox;
//! pushes always use these scoped tokens.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::HTTP_TIMEOUT_SECS;

/// Clock skew allowance baked into the app JWT
const JWT_BACKDATE_SECS: u64 = 60;
/// App JWT lifetime (GitHub caps at 10 minutes)
const JWT_TTL_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid app private key: {0}")]
    Key(#[from] jsonwebtoken::errors::Error),
    #[error("identity request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("identity service returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: u64,
    exp: u64,
    iss: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[async_trait]
pub trait IdentityPort: Send + Sync {
    async fn generate_installation_token(
        &self,
        installation_id: u64,
    ) -> Result<InstallationToken, IdentityError>;
}

pub struct AppIdentity {
    http: reqwest::Client,
    api_base: String,
    app_id: String,
    private_key_pem: String,
}

impl AppIdentity {
    pub fn new(api_base: String, app_id: String, private_key_pem: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent("slipway-coordinator")
            .build()
            .expect("build identity http client");
        Self {
            http,
            api_base,
            app_id,
            private_key_pem,
        }
    }

    fn app_jwt(&self) -> Result<String, IdentityError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = AppClaims {
            iat: now.saturating_sub(JWT_BACKDATE_SECS),
            exp: now + JWT_TTL_SECS,
            iss: self.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key_pem.as_bytes())?;
        Ok(encode(&Header::new(Algorithm::RS256), &claims, &key)?)
    }
}

#[async_trait]
impl IdentityPort for AppIdentity {
    async fn generate_installation_token(
        &self,
        installation_id: u64,
    ) -> Result<InstallationToken, IdentityError> {
        let jwt = self.app_jwt()?;
        let url = format!(
            "{}/app/installations/{installation_id}/access_tokens",
            self.api_base
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Status { status, body });
        }
        Ok(response.json::<InstallationToken>().await?)
    }
}
