//! Slipway Ports
//!
//! Integration ports the coordinator depends on: the sandbox compute
//! provider, the code-host API, the identity service that mints
//! installation tokens, and the outbound completion callback. The
//! lifecycle code depends on these traits; concrete providers depend on
//! the traits, never the other way around.

pub mod callback;
pub mod github;
pub mod identity;
pub mod modal;
pub mod provider;

pub use callback::{CallbackNotifier, CompletionCallback};
pub use github::{CodeHost, CreatePullRequest, GithubClient, PullRequestInfo, RepositoryInfo};
pub use identity::{AppIdentity, IdentityPort, InstallationToken};
pub use modal::ModalProvider;
pub use provider::{
    CreateSandboxRequest, ProviderError, ProviderErrorKind, SandboxProvider, SpawnedSandbox,
};

/// Per-request timeout applied to identity and code-host HTTP calls.
pub const HTTP_TIMEOUT_SECS: u64 = 60;
