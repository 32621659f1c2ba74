//! Live connection to the server's progress stream.
//!
//! [`ConnectionManager`] keeps one authenticated channel open for all
//! consumers, reconnects with exponential backoff, checks liveness with
//! an idle heartbeat and replays missed events from a
//! [`HistorySource`] after a gap. Progress events land in the shared
//! [`vidshelf_store::ProgressStore`].

pub mod client;
pub mod events;
pub mod heartbeat;
pub mod history;
pub mod manager;
pub mod messages;
pub mod reconnect;

pub use client::{Channel, ChannelError, ConnectError, Connector, Frame, WsConnector};
pub use events::{AuthStatus, ConnectionEvent, ConnectionStatus};
pub use heartbeat::HeartbeatConfig;
pub use history::{HistoryError, HistorySource, NoHistory};
pub use manager::{ConnectionConfig, ConnectionHandle, ConnectionManager};
pub use reconnect::ReconnectConfig;
