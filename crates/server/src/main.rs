//! Slipway Server
//!
//! Per-session coordinator between human clients and remote compute
//! sandboxes running an LLM coding agent. Provides prompt queuing,
//! real-time fan-out, and sandbox lifecycle control.

mod clock;
mod config;
mod core;
mod crypto;
mod events;
mod http;
mod hub;
mod lifecycle;
mod logging;
mod pr;
mod queue;
mod registry;
mod sandbox_mgr;
mod secrets;
mod store;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use slipway_ports::{AppIdentity, CallbackNotifier, GithubClient, ModalProvider};

use crate::config::Config;
use crate::core::Deps;
use crate::crypto::MasterKey;
use crate::logging::init_logging;
use crate::registry::SessionRegistry;
use crate::secrets::SecretsStore;

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let cfg = Config::from_env();
    std::fs::create_dir_all(&cfg.data_dir)?;

    let logging = init_logging(&cfg.data_dir)?;
    let _log_guard = logging.guard;
    let root_span =
        tracing::info_span!("slipway_server", service = "slipway-server", run_id = %logging.run_id);
    let _root_span_guard = root_span.enter();

    info!(
        component = "server",
        event = "server.starting",
        pid = std::process::id(),
        data_dir = %cfg.data_dir.display(),
        "Starting Slipway Server..."
    );

    let master_key = MasterKey::load(&cfg.data_dir)?;
    let secrets = Arc::new(SecretsStore::open(
        &cfg.data_dir.join("control.db"),
        master_key.clone(),
    )?);

    let identity = match (&cfg.github_app_id, &cfg.github_app_private_key) {
        (Some(app_id), Some(pem)) => Some(Arc::new(AppIdentity::new(
            cfg.github_api_base.clone(),
            app_id.clone(),
            pem.clone(),
        )) as Arc<dyn slipway_ports::IdentityPort>),
        _ => None,
    };
    let callback = match (&cfg.callback_url, &cfg.callback_secret) {
        (Some(url), Some(secret)) => Some(Arc::new(CallbackNotifier::new(
            url.clone(),
            secret.clone(),
        ))),
        _ => None,
    };

    let deps = Arc::new(Deps {
        master_key,
        provider: Arc::new(ModalProvider::new(
            cfg.modal_base_url.clone(),
            cfg.modal_api_token.clone(),
        )),
        code_host: Arc::new(GithubClient::new(cfg.github_api_base.clone())),
        identity,
        callback,
        secrets,
        config: cfg,
    });

    let registry = Arc::new(SessionRegistry::new(deps.clone()));

    let app = Router::new()
        .route("/healthz", get(http::healthz))
        .route("/sessions/{name}/ws", get(hub::ws_handler))
        .route("/sessions/{name}/internal/init", post(http::init))
        .route("/sessions/{name}/internal/state", get(http::state))
        .route("/sessions/{name}/internal/prompt", post(http::prompt))
        .route("/sessions/{name}/internal/stop", post(http::stop))
        .route(
            "/sessions/{name}/internal/sandbox-event",
            post(http::sandbox_event),
        )
        .route(
            "/sessions/{name}/internal/participants",
            get(http::participants_get).post(http::participants_post),
        )
        .route("/sessions/{name}/internal/events", get(http::events_get))
        .route(
            "/sessions/{name}/internal/artifacts",
            get(http::artifacts_get),
        )
        .route("/sessions/{name}/internal/messages", get(http::messages_get))
        .route("/sessions/{name}/internal/create-pr", post(http::create_pr))
        .route("/sessions/{name}/internal/ws-token", post(http::ws_token))
        .route("/sessions/{name}/internal/archive", post(http::archive))
        .route("/sessions/{name}/internal/unarchive", post(http::unarchive))
        .route(
            "/sessions/{name}/internal/verify-sandbox-token",
            post(http::verify_sandbox_token),
        )
        .route(
            "/repos/{repo_id}/secrets",
            get(http::secrets_list).put(http::secrets_put),
        )
        .route(
            "/repos/{repo_id}/secrets/materialize",
            post(http::secrets_materialize),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(registry);

    let addr = deps.config.bind_addr;
    info!(
        component = "server",
        event = "server.listening",
        bind_address = %addr,
        "Listening for connections"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
