//! Modal-backed sandbox provider
//!
//! Thin HTTP client against the sandbox manager service that fronts
//! Modal. HTTP 5xx and transport timeouts are transient; 4xx responses
//! and anything unclassifiable are permanent.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::provider::{
    CreateSandboxRequest, ProviderError, SandboxProvider, SpawnedSandbox,
};

pub struct ModalProvider {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    session_id: &'a str,
    sandbox_id: &'a str,
    repo_owner: &'a str,
    repo_name: &'a str,
    control_plane_url: &'a str,
    sandbox_auth_token: &'a str,
    provider: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_image_id: Option<&'a str>,
    env: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    object_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotResponse {
    image_id: String,
}

impl ModalProvider {
    pub fn new(base_url: String, api_token: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("build modal http client");
        Self {
            http,
            base_url,
            api_token,
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ProviderError::transient(format!("sandbox manager unreachable: {e}"))
                } else {
                    ProviderError::permanent(format!("sandbox manager request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                component = "modal_provider",
                event = "provider.server_error",
                status = %status,
                "Sandbox manager returned server error"
            );
            return Err(ProviderError::transient(format!(
                "sandbox manager {status}: {body}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::permanent(format!(
                "sandbox manager {status}: {body}"
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::permanent(format!("invalid sandbox manager response: {e}")))
    }
}

#[async_trait]
impl SandboxProvider for ModalProvider {
    async fn create_sandbox(
        &self,
        req: &CreateSandboxRequest,
    ) -> Result<SpawnedSandbox, ProviderError> {
        debug!(
            component = "modal_provider",
            event = "provider.create",
            session_id = %req.session_id,
            sandbox_id = %req.sandbox_id,
            "Creating sandbox"
        );
        let body = CreateBody {
            session_id: &req.session_id,
            sandbox_id: &req.sandbox_id,
            repo_owner: &req.repo_owner,
            repo_name: &req.repo_name,
            control_plane_url: &req.control_plane_url,
            sandbox_auth_token: &req.auth_token,
            provider: &req.provider,
            model: req.model.as_deref(),
            snapshot_image_id: None,
            env: &req.env,
        };
        let created: CreateResponse = self.post("/sandboxes", &body).await?;
        Ok(SpawnedSandbox {
            provider_object_id: created.object_id,
        })
    }

    async fn restore_from_snapshot(
        &self,
        req: &CreateSandboxRequest,
        snapshot_image_id: &str,
    ) -> Result<SpawnedSandbox, ProviderError> {
        debug!(
            component = "modal_provider",
            event = "provider.restore",
            session_id = %req.session_id,
            sandbox_id = %req.sandbox_id,
            image_id = %snapshot_image_id,
            "Restoring sandbox from snapshot"
        );
        let body = CreateBody {
            session_id: &req.session_id,
            sandbox_id: &req.sandbox_id,
            repo_owner: &req.repo_owner,
            repo_name: &req.repo_name,
            control_plane_url: &req.control_plane_url,
            sandbox_auth_token: &req.auth_token,
            provider: &req.provider,
            model: req.model.as_deref(),
            snapshot_image_id: Some(snapshot_image_id),
            env: &req.env,
        };
        let created: CreateResponse = self.post("/sandboxes/restore", &body).await?;
        Ok(SpawnedSandbox {
            provider_object_id: created.object_id,
        })
    }

    async fn take_snapshot(&self, provider_object_id: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({ "objectId": provider_object_id });
        let snap: SnapshotResponse = self.post("/sandboxes/snapshot", &body).await?;
        Ok(snap.image_id)
    }
}
