use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vidshelf_app::{AppConfig, LiveContext, ProgressView};
use vidshelf_stream::{AuthStatus, ConnectionEvent};

const DEFAULT_LOG_FILTER: &str = "vidshelf_app=debug,vidshelf_stream=debug,vidshelf_store=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    init_tracing();

    // --- Configuration ---
    let config = AppConfig::from_env().context("Invalid configuration")?;
    if config.auth_token.is_empty() {
        anyhow::bail!("VIDSHELF_AUTH_TOKEN must be set");
    }
    tracing::info!(ws_url = %config.ws_url, api_url = %config.api_url, "Loaded monitor configuration");

    // --- Live context ---
    let context = LiveContext::from_config(&config);
    let cancel = CancellationToken::new();
    let smoothing_handle = context.start_smoothing(config.tick_interval, cancel.child_token());

    let mut events = context.connection().subscribe();
    let connection = context.connect(config.auth_token.clone());

    // --- Watched entities (optional CLI arguments) ---
    let mut watchers = Vec::new();
    for entity_id in std::env::args().skip(1) {
        match context.load_entity(&entity_id).await {
            Ok(snapshot) => {
                tracing::info!(
                    entity_id = %snapshot.id,
                    import_stage = snapshot.import_stage.as_ref().map(|s| s.as_str()),
                    import_progress = snapshot.import_progress,
                    "Watching entity",
                );
            }
            Err(e) => {
                tracing::warn!(entity_id = %entity_id, error = %e, "Failed to load entity, watching live events only");
            }
        }
        let view = context.use_progress(&entity_id).await;
        watchers.push(tokio::spawn(watch_entity(entity_id, view, cancel.child_token())));
    }

    // --- Event loop ---
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            received = events.recv() => match received {
                Ok(ConnectionEvent::Progress(event)) => {
                    tracing::info!(
                        job_id = %event.job_id,
                        entity_id = event.entity_id.as_deref(),
                        status = %event.status,
                        progress = event.progress,
                        stage = event.stage.as_ref().map(|s| s.as_str()),
                        "Progress",
                    );
                }
                Ok(ConnectionEvent::StatusChanged(status)) => {
                    tracing::info!(
                        connected = status.connected,
                        reconnecting = status.reconnecting,
                        auth = ?status.auth,
                        history_error = status.history_error.as_deref(),
                        "Connection status",
                    );
                    if status.auth == AuthStatus::Failed {
                        tracing::error!("Credentials rejected by the progress stream");
                        break;
                    }
                }
                Ok(ConnectionEvent::HistoryGap { since }) => {
                    tracing::info!(?since, "Recovering missed progress events");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Monitor fell behind the event stream");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    // --- Shutdown ---
    cancel.cancel();
    drop(connection);
    context.connection().shutdown().await;
    let _ = smoothing_handle.await;
    for watcher in watchers {
        let _ = watcher.await;
    }
    tracing::info!("Monitor stopped");

    Ok(())
}

/// Log an entity's resolved progress whenever its whole percentage or
/// importing state changes.
async fn watch_entity(entity_id: String, mut view: ProgressView, cancel: CancellationToken) {
    let mut last = view.current().await;
    tracing::info!(
        entity_id = %entity_id,
        progress = last.display_progress.round() as u8,
        importing = last.importing,
        failed = last.failed,
        source = ?last.source,
        "Resolved progress",
    );

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = view.changed() => next,
        };
        let Ok(resolved) = next else {
            return;
        };

        let moved = resolved.display_progress.round() != last.display_progress.round();
        if moved || resolved.importing != last.importing || resolved.failed != last.failed {
            tracing::debug!(
                entity_id = %entity_id,
                progress = resolved.display_progress.round() as u8,
                target = resolved.progress,
                importing = resolved.importing,
                failed = resolved.failed,
                source = ?resolved.source,
                "Resolved progress",
            );
        }
        last = resolved;
    }
}

/// `LOG_FORMAT=json` switches to machine-readable output.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
