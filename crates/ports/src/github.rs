//! Code-host port (GitHub)
//!
//! Two operations: resolve a repository's default branch, and open a
//! pull request. Both act with the requesting user's own OAuth token;
//! pushes use short-lived installation tokens minted elsewhere.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::HTTP_TIMEOUT_SECS;

#[derive(Debug, Error)]
pub enum CodeHostError {
    #[error("code host request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("code host returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryInfo {
    #[serde(rename = "default_branch")]
    pub default_branch: String,
    pub id: i64,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone)]
pub struct CreatePullRequest {
    pub owner: String,
    pub name: String,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestInfo {
    pub number: u64,
    #[serde(rename = "html_url")]
    pub html_url: String,
    pub state: String,
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
        user_token: &str,
    ) -> Result<RepositoryInfo, CodeHostError>;

    async fn create_pull_request(
        &self,
        req: &CreatePullRequest,
        user_token: &str,
    ) -> Result<PullRequestInfo, CodeHostError>;
}

pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
}

impl GithubClient {
    pub fn new(api_base: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent("slipway-coordinator")
            .build()
            .expect("build github http client");
        Self { http, api_base }
    }

    async fn check<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CodeHostError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CodeHostError::Status { status, body });
        }
        Ok(response.json::<T>().await?)
    }
}

#[derive(Debug, Serialize)]
struct PullRequestBody<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

#[async_trait]
impl CodeHost for GithubClient {
    async fn get_repository(
        &self,
        owner: &str,
        name: &str,
        user_token: &str,
    ) -> Result<RepositoryInfo, CodeHostError> {
        let url = format!("{}/repos/{owner}/{name}", self.api_base);
        let response = self
            .http
            .get(&url)
            .bearer_auth(user_token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        Self::check(response).await
    }

    async fn create_pull_request(
        &self,
        req: &CreatePullRequest,
        user_token: &str,
    ) -> Result<PullRequestInfo, CodeHostError> {
        debug!(
            component = "github",
            event = "github.create_pr",
            owner = %req.owner,
            repo = %req.name,
            head = %req.head,
            base = %req.base,
            "Creating pull request"
        );
        let url = format!("{}/repos/{}/{}/pulls", self.api_base, req.owner, req.name);
        let body = PullRequestBody {
            title: &req.title,
            body: &req.body,
            head: &req.head,
            base: &req.base,
        };
        let response = self
            .http
            .post(&url)
            .bearer_auth(user_token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await?;
        Self::check(response).await
    }
}
