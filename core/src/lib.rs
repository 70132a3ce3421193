/// Helplink - realtime sync core for a community help-exchange chat client
///
/// One long-lived connection carries live events; REST stays the source of
/// truth. The pieces: connection management with an outbound queue, a typed
/// event dispatcher, presence, typing indicators and per-conversation
/// reconciliation of history with live events.

pub mod error;
pub mod config;
pub mod models;
pub mod protocol;
pub mod realtime;
pub mod api;
pub mod presence;
pub mod conversation;
pub mod typing;
pub mod notifications;
pub mod client;
pub mod utils;

pub use error::{SyncError, Result};
pub use config::Config;
pub use client::{ChatClient, SyncUpdate};
pub use realtime::{ConnectionManager, ConnectionState};
