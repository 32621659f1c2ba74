//! Reference-counted connection to the progress stream.
//!
//! [`ConnectionManager`] owns one persistent channel shared by every
//! consumer. [`connect`](ConnectionManager::connect) hands out a
//! [`ConnectionHandle`]; the first handle starts the connection task
//! (connect -> authenticate -> process -> reconnect) and dropping the
//! last one cancels it, including any pending backoff timer.
//!
//! Authenticated progress events are applied to the shared
//! [`ProgressStore`] and re-broadcast as [`ConnectionEvent`]s. After a
//! reconnect that follows an authenticated session, events missed
//! while offline are fetched from a [`HistorySource`] and replayed
//! through the same path.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vidshelf_core::progress::ProgressEvent;
use vidshelf_core::types::Timestamp;
use vidshelf_store::ProgressStore;

use crate::client::{Channel, Connector, Frame};
use crate::events::{AuthStatus, ConnectionEvent, ConnectionStatus};
use crate::heartbeat::{HeartbeatAction, HeartbeatConfig, Liveness};
use crate::history::{fetch_with_timeout, HistorySource};
use crate::messages::{parse_server_message, ClientMessage, ServerMessage};
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// Broadcast channel capacity for connection events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound for the goodbye frame on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// The history cursor is a client timestamp; back it off so modest
/// clock skew against the server cannot hide events from a replay.
/// Re-delivered events are dropped as duplicates by the store.
const CURSOR_SKEW_MARGIN_SECS: i64 = 5;

/// Timings for one managed connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    /// Upper bound for the post-reconnect history fetch.
    pub history_timeout: Duration,
    /// How long the server may take to answer the auth message.
    pub auth_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            history_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    /// History timeout, kept strictly below the reconnect ceiling.
    pub fn effective_history_timeout(&self) -> Duration {
        if self.history_timeout < self.reconnect.max_delay {
            self.history_timeout
        } else {
            self.reconnect.max_delay / 2
        }
    }
}

/// Shared connection to the progress stream.
///
/// Build once per session with [`ConnectionManager::new`] and keep the
/// `Arc`; consumers call [`connect`](Self::connect).
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    history: Arc<dyn HistorySource>,
    store: Arc<ProgressStore>,
    config: ConnectionConfig,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    lifecycle: Mutex<Lifecycle>,
}

/// Consumer count and the running connection task, if any.
#[derive(Default)]
struct Lifecycle {
    consumers: usize,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        history: Arc<dyn HistorySource>,
        store: Arc<ProgressStore>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            connector,
            history,
            store,
            config,
            status_tx: Arc::new(status_tx),
            event_tx,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Subscribe to progress, status and history-gap events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.store
    }

    /// Number of live [`ConnectionHandle`]s.
    pub fn consumer_count(&self) -> usize {
        self.lock_lifecycle().consumers
    }

    /// Acquire the shared connection, starting it if nobody holds it.
    ///
    /// `token` is used only when this call starts the connection; later
    /// callers share the already-authenticated session. A session that
    /// ended on rejected credentials is restarted with the new token.
    pub fn connect(self: &Arc<Self>, token: impl Into<String>) -> ConnectionHandle {
        let mut lifecycle = self.lock_lifecycle();
        lifecycle.consumers += 1;

        let stopped = lifecycle.task.as_ref().is_some_and(JoinHandle::is_finished)
            || self.status_tx.borrow().auth == AuthStatus::Failed;
        if lifecycle.cancel.is_some() && stopped {
            tracing::info!("Previous progress stream session has stopped, starting a new one");
            lifecycle.task.take();
            if let Some(cancel) = lifecycle.cancel.take() {
                cancel.cancel();
            }
            self.reset_status();
        }

        if lifecycle.cancel.is_none() {
            let cancel = CancellationToken::new();
            let ctx = SessionContext {
                connector: Arc::clone(&self.connector),
                history: Arc::clone(&self.history),
                store: Arc::clone(&self.store),
                config: self.config.clone(),
                status_tx: Arc::clone(&self.status_tx),
                event_tx: self.event_tx.clone(),
                cancel: cancel.clone(),
            };
            let token = token.into();

            tracing::info!(target_url = %self.connector.describe(), "Starting progress stream connection");
            lifecycle.task = Some(tokio::spawn(async move {
                run_connection_loop(ctx, token).await;
                tracing::info!("Progress stream connection task exited");
            }));
            lifecycle.cancel = Some(cancel);
        } else {
            tracing::debug!(
                consumers = lifecycle.consumers,
                "Sharing existing progress stream connection",
            );
        }
        drop(lifecycle);

        ConnectionHandle {
            manager: Arc::clone(self),
        }
    }

    /// Stop the connection regardless of outstanding handles and wait
    /// up to 5 seconds for the task to exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down progress stream connection");
        let (cancel, task) = {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.consumers = 0;
            (lifecycle.cancel.take(), lifecycle.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        self.reset_status();
    }

    // ---- private helpers ----

    fn acquire(&self) {
        self.lock_lifecycle().consumers += 1;
    }

    fn release(&self) {
        let cancel = {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.consumers = lifecycle.consumers.saturating_sub(1);
            if lifecycle.consumers > 0 {
                return;
            }
            // The task exits on cancellation; nothing to await here.
            lifecycle.task.take();
            lifecycle.cancel.take()
        };

        if let Some(cancel) = cancel {
            tracing::info!("Last consumer released, stopping progress stream connection");
            cancel.cancel();
            self.reset_status();
        }
    }

    fn reset_status(&self) {
        let idle = ConnectionStatus::default();
        let changed = self.status_tx.send_if_modified(|status| {
            if *status == idle {
                return false;
            }
            *status = idle.clone();
            true
        });
        if changed {
            let _ = self.event_tx.send(ConnectionEvent::StatusChanged(idle));
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A consumer's claim on the shared connection.
///
/// Cloning acquires another claim; dropping releases one. Dropping the
/// last claim stops the connection.
pub struct ConnectionHandle {
    manager: Arc<ConnectionManager>,
}

impl ConnectionHandle {
    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

impl Clone for ConnectionHandle {
    fn clone(&self) -> Self {
        self.manager.acquire();
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.manager.release();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Everything the connection task needs, owned so the task never keeps
/// the manager alive.
struct SessionContext {
    connector: Arc<dyn Connector>,
    history: Arc<dyn HistorySource>,
    store: Arc<ProgressStore>,
    config: ConnectionConfig,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
}

impl SessionContext {
    /// Apply `change` to the published status. Skipped once this task
    /// is cancelled, so a stopping task cannot overwrite the reset.
    fn update_status(&self, change: impl FnOnce(&mut ConnectionStatus)) {
        let cancel = &self.cancel;
        let mut published = None;
        self.status_tx.send_if_modified(|status| {
            if cancel.is_cancelled() {
                return false;
            }
            let before = status.clone();
            change(status);
            if *status == before {
                return false;
            }
            published = Some(status.clone());
            true
        });

        if let Some(status) = published {
            tracing::debug!(
                connected = status.connected,
                reconnecting = status.reconnecting,
                auth = ?status.auth,
                history_error = status.history_error.as_deref(),
                "Connection status changed",
            );
            let _ = self.event_tx.send(ConnectionEvent::StatusChanged(status));
        }
    }

    async fn ingest(&self, event: ProgressEvent) {
        let outcome = self.store.apply(event.clone()).await;
        tracing::trace!(job_id = %event.job_id, ?outcome, "Progress event ingested");
        let _ = self.event_tx.send(ConnectionEvent::Progress(event));
    }
}

/// How a session on one channel ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    AuthRejected(String),
    Dropped { authenticated: bool },
}

/// Core connection loop: connect -> session -> reconnect.
///
/// Runs until cancelled or the server rejects the credentials.
async fn run_connection_loop(ctx: SessionContext, token: String) {
    let mut cursor: Option<Timestamp> = None;
    let mut had_session = false;

    let first = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        result = ctx.connector.connect() => result,
    };
    let mut next = match first {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(error = %e, "Connection failed, entering reconnect loop");
            ctx.update_status(|s| s.reconnecting = true);
            match reconnect_loop(ctx.connector.as_ref(), &ctx.config.reconnect, &ctx.cancel).await {
                Some(channel) => channel,
                None => return,
            }
        }
    };

    loop {
        let mut channel = next;
        let end = run_session(&ctx, channel.as_mut(), &token, &mut cursor, had_session).await;

        match end {
            SessionEnd::Cancelled => {
                close_quietly(channel).await;
                return;
            }
            SessionEnd::AuthRejected(reason) => {
                tracing::error!(reason = %reason, "Progress stream rejected credentials, not retrying");
                close_quietly(channel).await;
                ctx.update_status(|s| {
                    s.connected = false;
                    s.reconnecting = false;
                    s.auth = AuthStatus::Failed;
                });
                return;
            }
            SessionEnd::Dropped { authenticated } => {
                drop(channel);
                had_session |= authenticated;
                if ctx.cancel.is_cancelled() {
                    return;
                }
                ctx.update_status(|s| {
                    s.connected = false;
                    s.reconnecting = true;
                    s.auth = AuthStatus::Unauthenticated;
                });

                tracing::info!("Connection lost, entering reconnect loop");
                next = match reconnect_loop(ctx.connector.as_ref(), &ctx.config.reconnect, &ctx.cancel).await {
                    Some(channel) => channel,
                    None => return,
                };
            }
        }
    }
}

/// Authenticate on `channel` and process frames until it ends.
async fn run_session(
    ctx: &SessionContext,
    channel: &mut dyn Channel,
    token: &str,
    cursor: &mut Option<Timestamp>,
    replay: bool,
) -> SessionEnd {
    ctx.update_status(|s| {
        s.connected = true;
        s.auth = AuthStatus::Authenticating;
    });

    let auth = ClientMessage::Auth {
        token: token.to_string(),
    };
    if let Err(e) = channel.send(Frame::Text(auth.to_json())).await {
        tracing::warn!(error = %e, "Failed to send auth message");
        return SessionEnd::Dropped {
            authenticated: false,
        };
    }

    let mut authenticated = false;
    let auth_deadline = Instant::now() + ctx.config.auth_timeout;
    let mut liveness = Liveness::new(ctx.config.heartbeat.clone(), Instant::now());

    loop {
        let now = Instant::now();
        if !authenticated && now >= auth_deadline {
            tracing::warn!("Progress stream did not answer the auth message");
            return SessionEnd::Dropped {
                authenticated: false,
            };
        }

        let heartbeat_at = match liveness.poll(now) {
            HeartbeatAction::Wait(at) => at,
            HeartbeatAction::SendPing => {
                if let Err(e) = channel.send(Frame::Ping(Vec::new())).await {
                    tracing::warn!(error = %e, "Failed to send heartbeat ping");
                    return SessionEnd::Dropped { authenticated };
                }
                liveness.ping_sent(now);
                continue;
            }
            HeartbeatAction::Dead => {
                tracing::warn!("Heartbeat timed out, treating connection as lost");
                return SessionEnd::Dropped { authenticated };
            }
        };
        let wake_at = if authenticated {
            heartbeat_at
        } else {
            heartbeat_at.min(auth_deadline)
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => return SessionEnd::Cancelled,
            _ = tokio::time::sleep_until(wake_at) => {}
            received = channel.recv() => {
                let frame = match received {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Progress stream receive error");
                        return SessionEnd::Dropped { authenticated };
                    }
                    None => {
                        tracing::info!("Progress stream ended");
                        return SessionEnd::Dropped { authenticated };
                    }
                };
                liveness.observe(Instant::now());

                let text = match frame {
                    Frame::Text(text) => text,
                    Frame::Ping(_) | Frame::Pong(_) => continue,
                    Frame::Close => return SessionEnd::Dropped { authenticated },
                };

                match parse_server_message(&text) {
                    Ok(ServerMessage::AuthOk) => {
                        if authenticated {
                            continue;
                        }
                        authenticated = true;
                        tracing::info!("Authenticated with progress stream");
                        ctx.update_status(|s| {
                            s.auth = AuthStatus::Authenticated;
                            s.reconnecting = false;
                        });
                        let since = cursor.replace(cursor_now());
                        if replay {
                            replay_history(ctx, since).await;
                        }
                    }
                    Ok(ServerMessage::AuthError { message }) => {
                        return SessionEnd::AuthRejected(message);
                    }
                    Ok(ServerMessage::Progress(event)) => {
                        if !authenticated {
                            tracing::debug!(job_id = %event.job_id, "Ignoring progress event before authentication");
                            continue;
                        }
                        *cursor = Some(cursor_now());
                        ctx.ingest(event).await;
                    }
                    Ok(ServerMessage::Other) => {
                        tracing::trace!("Ignoring unhandled progress stream message");
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            raw_message = %text,
                            "Failed to parse progress stream message",
                        );
                    }
                }
            }
        }
    }
}

/// Fetch and apply what was missed while offline. Failure only sets the
/// `history_error` warning; live events keep flowing.
async fn replay_history(ctx: &SessionContext, since: Option<Timestamp>) {
    let _ = ctx.event_tx.send(ConnectionEvent::HistoryGap { since });

    let timeout = ctx.config.effective_history_timeout();
    match fetch_with_timeout(ctx.history.as_ref(), since, timeout).await {
        Ok(events) => {
            tracing::info!(count = events.len(), "Replaying missed progress events");
            for event in events {
                ctx.ingest(event).await;
            }
            ctx.update_status(|s| s.history_error = None);
        }
        Err(e) => {
            tracing::warn!(error = %e, "History replay failed, showing live events only");
            let message = e.to_string();
            ctx.update_status(|s| s.history_error = Some(message));
        }
    }
}

fn cursor_now() -> Timestamp {
    Utc::now() - chrono::Duration::seconds(CURSOR_SKEW_MARGIN_SECS)
}

async fn close_quietly(mut channel: Box<dyn Channel>) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, channel.send(Frame::Close)).await;
}
