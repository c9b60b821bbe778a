//! Per-session core state
//!
//! `SessionCore` owns the session's store, sockets, and in-memory
//! caches. A `tokio::sync::Mutex` wraps the core so that at most one
//! request, websocket message, or timer callback is active per session
//! at a time; every state transition inside one callback is observed
//! atomically by the next. In-memory fields are caches of durable
//! state: they may be empty after a restart and are repopulated from
//! the store on miss.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use slipway_protocol::{
    PresenceEntry, SandboxCommand, SandboxStatus, ServerMessage,
};
use slipway_ports::{CallbackNotifier, CodeHost, IdentityPort, SandboxProvider};

use crate::config::Config;
use crate::crypto::MasterKey;
use crate::secrets::SecretsStore;
use crate::store::SessionStore;

/// Frames queued toward a socket's send task.
#[derive(Debug)]
pub enum OutFrame {
    Text(String),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// An authenticated client socket.
pub struct ClientConn {
    pub socket_id: String,
    pub participant_id: String,
    pub client_id: String,
    pub outbound: mpsc::Sender<OutFrame>,
}

/// The (single) live sandbox socket.
pub struct SandboxConn {
    /// Monotone per-process connection sequence; used to tell whether a
    /// disconnecting socket is still the tracked one.
    pub conn_seq: u64,
    pub sandbox_id: String,
    pub outbound: mpsc::Sender<OutFrame>,
}

/// Shared collaborators, constructed once at startup.
pub struct Deps {
    pub config: Config,
    pub master_key: MasterKey,
    pub provider: Arc<dyn SandboxProvider>,
    pub code_host: Arc<dyn CodeHost>,
    pub identity: Option<Arc<dyn IdentityPort>>,
    pub callback: Option<Arc<CallbackNotifier>>,
    pub secrets: Arc<SecretsStore>,
}

pub struct SessionCore {
    pub name: String,
    pub store: SessionStore,
    pub deps: Arc<Deps>,

    /// socket id → authenticated client (cache of `ws_clients`)
    pub clients: HashMap<String, ClientConn>,
    /// socket id → last presence report
    pub presence: HashMap<String, PresenceEntry>,
    pub sandbox_sock: Option<SandboxConn>,

    /// Guards spawn re-entry within a single request; persisted status
    /// (`spawning`/`connecting`) guards across requests.
    pub is_spawning: bool,

    /// normalized branch name → waiter for push_complete/push_error
    pub pending_pushes: HashMap<String, oneshot::Sender<Result<(), String>>>,

    /// Bumped whenever a new alarm is scheduled; a firing alarm whose
    /// generation no longer matches was replaced and does nothing.
    pub alarm_generation: u64,
}

impl SessionCore {
    pub fn new(name: String, store: SessionStore, deps: Arc<Deps>) -> Self {
        Self {
            name,
            store,
            deps,
            clients: HashMap::new(),
            presence: HashMap::new(),
            sandbox_sock: None,
            is_spawning: false,
            pending_pushes: HashMap::new(),
            alarm_generation: 0,
        }
    }

    pub fn sandbox_socket_open(&self) -> bool {
        self.sandbox_sock.is_some()
    }

    pub fn connected_client_count(&self) -> usize {
        self.clients.len()
    }

    /// Deliver a message to every connected client. Each send is
    /// guarded: a closed or congested socket is logged and skipped, one
    /// failure never blocks the others. The sandbox socket is excluded.
    pub fn broadcast(&self, msg: &ServerMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                warn!(
                    component = "core",
                    event = "broadcast.serialize_failed",
                    session = %self.name,
                    error = %e,
                    "Failed to serialize broadcast"
                );
                return;
            }
        };
        for client in self.clients.values() {
            if let Err(e) = client.outbound.try_send(OutFrame::Text(json.clone())) {
                debug!(
                    component = "core",
                    event = "broadcast.send_skipped",
                    session = %self.name,
                    socket_id = %client.socket_id,
                    error = %e,
                    "Skipping unreachable client"
                );
            }
        }
    }

    pub fn broadcast_sandbox_status(&self, status: SandboxStatus) {
        self.broadcast(&ServerMessage::SandboxStatus { status });
    }

    /// Best-effort command to the sandbox socket. Returns false when no
    /// sandbox is connected or the channel is gone.
    pub fn send_to_sandbox(&self, cmd: &SandboxCommand) -> bool {
        let Some(sandbox) = &self.sandbox_sock else {
            return false;
        };
        let json = match serde_json::to_string(cmd) {
            Ok(j) => j,
            Err(e) => {
                warn!(
                    component = "core",
                    event = "sandbox.serialize_failed",
                    session = %self.name,
                    error = %e,
                    "Failed to serialize sandbox command"
                );
                return false;
            }
        };
        match sandbox.outbound.try_send(OutFrame::Text(json)) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    component = "core",
                    event = "sandbox.send_failed",
                    session = %self.name,
                    error = %e,
                    "Failed to queue sandbox command"
                );
                false
            }
        }
    }

    /// Close and drop the tracked sandbox socket.
    pub fn close_sandbox_socket(&mut self, code: u16, reason: &str) {
        if let Some(sandbox) = self.sandbox_sock.take() {
            let _ = sandbox.outbound.try_send(OutFrame::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    pub fn presence_entries(&self) -> Vec<PresenceEntry> {
        self.presence.values().cloned().collect()
    }
}

/// Cheap-to-clone handle to a session's core.
#[derive(Clone)]
pub struct SessionHandle {
    pub name: String,
    core: Arc<Mutex<SessionCore>>,
}

impl SessionHandle {
    pub fn new(core: SessionCore) -> Self {
        Self {
            name: core.name.clone(),
            core: Arc::new(Mutex::new(core)),
        }
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, SessionCore> {
        self.core.lock().await
    }
}
