//! Exponential-backoff reconnection for the progress stream.
//!
//! When a session drops, the connection loop calls [`reconnect_loop`]
//! to keep retrying with increasing delays until a connection is
//! restored or the [`CancellationToken`] is triggered. Cancelling the
//! token also cancels a pending backoff timer.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{Channel, Connector};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Reconnect with exponential backoff.
///
/// Waits `initial_delay` before the first attempt so a server that
/// accepts and immediately drops connections is not hammered.
/// Returns `Some(channel)` once a connection succeeds, or `None` if
/// `cancel` is triggered first.
pub async fn reconnect_loop(
    connector: &dyn Connector,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<Box<dyn Channel>> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        tracing::info!(
            target_url = %connector.describe(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to progress stream",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Reconnect cancelled");
                return None;
            }
            result = connector.connect() => {
                match result {
                    Ok(channel) => {
                        tracing::info!(attempt, "Reconnected to progress stream");
                        return Some(channel);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Reconnect attempt {attempt} failed");
                    }
                }
            }
        }

        delay = next_delay(delay, config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::client::ConnectError;

    #[test]
    fn next_delay_doubles() {
        let config = ReconnectConfig::default();
        let d = next_delay(Duration::from_secs(1), &config);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &config);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn full_backoff_sequence() {
        let config = ReconnectConfig::default();
        let mut delay = config.initial_delay;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = next_delay(delay, &config);
        }
    }

    /// Refuses every connection and counts the attempts.
    struct Refusing {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self) -> Result<Box<dyn Channel>, ConnectError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ConnectError::Connection("refused".into()))
        }
    }

    #[tokio::test]
    async fn cancellation_token_stops_reconnect() {
        let cancel = CancellationToken::new();
        // Cancelled up front: no attempt is made.
        cancel.cancel();

        let connector = Refusing {
            attempts: AtomicUsize::new(0),
        };
        let result = reconnect_loop(&connector, &ReconnectConfig::default(), &cancel).await;
        assert!(result.is_none());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_follow_backoff_until_cancelled() {
        let cancel = CancellationToken::new();
        let connector = Refusing {
            attempts: AtomicUsize::new(0),
        };
        let config = ReconnectConfig::default();

        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                // Attempts at 1s, 3s, 7s; the next would be at 15s.
                tokio::time::sleep(Duration::from_secs(10)).await;
                cancel.cancel();
            })
        };

        let result = reconnect_loop(&connector, &config, &cancel).await;
        stopper.await.unwrap();
        assert!(result.is_none());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }
}
