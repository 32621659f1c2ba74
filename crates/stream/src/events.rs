//! Events and status published by the connection manager.

use serde::Serialize;
use vidshelf_core::progress::ProgressEvent;
use vidshelf_core::types::Timestamp;

/// Authentication state of the current channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    #[default]
    Unauthenticated,
    Authenticating,
    Authenticated,
    /// The server refused the token. Reconnecting stops.
    Failed,
}

/// Connection state surfaced to presentation code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    /// A dropped connection is being re-established.
    pub reconnecting: bool,
    pub auth: AuthStatus,
    /// Soft warning: the last history replay failed, only live events
    /// are being shown.
    pub history_error: Option<String>,
}

/// Broadcast by [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, Serialize)]
pub enum ConnectionEvent {
    /// An authenticated progress event, live or replayed.
    Progress(ProgressEvent),

    StatusChanged(ConnectionStatus),

    /// A reconnect succeeded; history since `since` is being fetched.
    HistoryGap { since: Option<Timestamp> },
}
