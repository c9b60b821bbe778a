//! Slipway Protocol
//!
//! Shared types for communication between the session coordinator, browser
//! clients, and remote sandboxes. These types are serialized as JSON over
//! WebSocket and over the internal HTTP API.

use uuid::Uuid;

pub mod client;
pub mod sandbox;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use sandbox::{SandboxCommand, SandboxEvent};
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
