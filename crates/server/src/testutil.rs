//! Shared test fixtures: scripted fakes for the integration ports and a
//! ready-made session handle over an in-memory store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use slipway_ports::{
    CodeHost, CreatePullRequest, CreateSandboxRequest, IdentityPort, InstallationToken,
    ProviderError, PullRequestInfo, RepositoryInfo, SandboxProvider, SpawnedSandbox,
};
use slipway_protocol::ParticipantRole;

use crate::config::Config;
use crate::core::{Deps, OutFrame, SandboxConn, SessionCore, SessionHandle};
use crate::crypto::MasterKey;
use crate::secrets::SecretsStore;
use crate::store::{ParticipantRow, SessionStore};

#[derive(Debug, Clone)]
pub enum FakeCall {
    Create { sandbox_id: String },
    Restore { sandbox_id: String, image_id: String },
    Snapshot { object_id: String },
}

/// Provider fake with scripted responses (FIFO). Defaults to success.
pub struct FakeProvider {
    pub calls: Mutex<Vec<FakeCall>>,
    pub spawn_results: Mutex<VecDeque<Result<SpawnedSandbox, ProviderError>>>,
    pub snapshot_results: Mutex<VecDeque<Result<String, ProviderError>>>,
    pub supports_snapshots: bool,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            spawn_results: Mutex::new(VecDeque::new()),
            snapshot_results: Mutex::new(VecDeque::new()),
            supports_snapshots: true,
        })
    }

    pub fn push_spawn_result(&self, result: Result<SpawnedSandbox, ProviderError>) {
        self.spawn_results.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn create_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, FakeCall::Create { .. }))
            .count()
    }

    fn next_spawn(&self) -> Result<SpawnedSandbox, ProviderError> {
        self.spawn_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(SpawnedSandbox {
                provider_object_id: "obj-1".to_string(),
            }))
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create_sandbox(
        &self,
        req: &CreateSandboxRequest,
    ) -> Result<SpawnedSandbox, ProviderError> {
        self.calls.lock().unwrap().push(FakeCall::Create {
            sandbox_id: req.sandbox_id.clone(),
        });
        self.next_spawn()
    }

    async fn restore_from_snapshot(
        &self,
        req: &CreateSandboxRequest,
        snapshot_image_id: &str,
    ) -> Result<SpawnedSandbox, ProviderError> {
        self.calls.lock().unwrap().push(FakeCall::Restore {
            sandbox_id: req.sandbox_id.clone(),
            image_id: snapshot_image_id.to_string(),
        });
        self.next_spawn()
    }

    async fn take_snapshot(&self, provider_object_id: &str) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(FakeCall::Snapshot {
            object_id: provider_object_id.to_string(),
        });
        self.snapshot_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok("img-1".to_string()))
    }

    fn supports_snapshots(&self) -> bool {
        self.supports_snapshots
    }
}

pub struct FakeCodeHost;

#[async_trait]
impl CodeHost for FakeCodeHost {
    async fn get_repository(
        &self,
        _owner: &str,
        _name: &str,
        _user_token: &str,
    ) -> Result<RepositoryInfo, slipway_ports::github::CodeHostError> {
        Ok(RepositoryInfo {
            default_branch: "main".to_string(),
            id: 7,
            private: false,
        })
    }

    async fn create_pull_request(
        &self,
        req: &CreatePullRequest,
        _user_token: &str,
    ) -> Result<PullRequestInfo, slipway_ports::github::CodeHostError> {
        Ok(PullRequestInfo {
            number: 42,
            html_url: format!("https://github.com/{}/{}/pull/42", req.owner, req.name),
            state: "open".to_string(),
        })
    }
}

pub struct FakeIdentity;

#[async_trait]
impl IdentityPort for FakeIdentity {
    async fn generate_installation_token(
        &self,
        _installation_id: u64,
    ) -> Result<InstallationToken, slipway_ports::identity::IdentityError> {
        Ok(InstallationToken {
            token: "ghs_installation".to_string(),
            expires_at: None,
        })
    }
}

pub fn deps_with(provider: Arc<dyn SandboxProvider>, config: Config) -> Arc<Deps> {
    let master_key = MasterKey::random_for_tests();
    Arc::new(Deps {
        master_key: master_key.clone(),
        provider,
        code_host: Arc::new(FakeCodeHost),
        identity: Some(Arc::new(FakeIdentity)),
        callback: None,
        secrets: Arc::new(SecretsStore::open_in_memory(master_key).unwrap()),
        config,
    })
}

pub fn deps(provider: Arc<dyn SandboxProvider>) -> Arc<Deps> {
    let mut config = Config::default();
    config.github_app_installation_id = Some(1);
    deps_with(provider, config)
}

/// Session handle over an in-memory store, pre-seeded with the session
/// row, singleton sandbox, and an owner participant `u1`.
pub fn session_handle(deps: Arc<Deps>) -> SessionHandle {
    let store = SessionStore::open_in_memory().unwrap();
    store
        .create_session("sid-1", "s1", None, "acme", "web", None, 1000)
        .unwrap();
    store.init_sandbox("sbx-1").unwrap();
    store
        .upsert_participant(&ParticipantRow {
            user_id: "u1".into(),
            github_login: Some("octocat".into()),
            github_name: Some("Octo Cat".into()),
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
    SessionHandle::new(SessionCore::new("s1".to_string(), store, deps))
}

/// Attach a fake sandbox socket; returns the receiver of its outbound
/// frames so tests can assert dispatched commands.
pub fn attach_fake_sandbox(core: &mut SessionCore) -> mpsc::Receiver<OutFrame> {
    let (tx, rx) = mpsc::channel(64);
    core.sandbox_sock = Some(SandboxConn {
        conn_seq: 1,
        sandbox_id: "sandbox-test".to_string(),
        outbound: tx,
    });
    rx
}

/// Drain any queued outbound frame into its JSON value.
pub fn next_frame_json(rx: &mut mpsc::Receiver<OutFrame>) -> Option<serde_json::Value> {
    match rx.try_recv() {
        Ok(OutFrame::Text(json)) => serde_json::from_str(&json).ok(),
        _ => None,
    }
}

/// Register an authenticated client connection; returns its broadcast
/// receiver.
pub fn attach_fake_client(core: &mut SessionCore, socket_id: &str) -> mpsc::Receiver<OutFrame> {
    let (tx, rx) = mpsc::channel(64);
    core.clients.insert(
        socket_id.to_string(),
        crate::core::ClientConn {
            socket_id: socket_id.to_string(),
            participant_id: "u1".to_string(),
            client_id: format!("client-{socket_id}"),
            outbound: tx,
        },
    );
    rx
}
