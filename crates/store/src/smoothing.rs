//! Display-progress smoothing.
//!
//! The store never animates on its own; something has to call
//! [`ProgressStore::tick`] on a cadence. That cadence is a
//! [`TickSource`] so the animation can be driven by a real interval in
//! the application and by hand in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressStore;

/// Tunables for the smoothing animation and record lifetime.
#[derive(Debug, Clone)]
pub struct SmoothingConfig {
    /// Largest increase of `display_progress` per tick, in percentage
    /// points. Non-positive values disable smoothing (jump to target).
    pub step_cap: f32,
    /// How long a completed record stays visible before eviction.
    pub completion_grace: Duration,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            step_cap: 2.0,
            completion_grace: Duration::from_secs(5),
        }
    }
}

/// One animation step: move `display` towards `target` by at most
/// `step_cap`, never downwards, never past 100.
pub fn advance(display: f32, target: f32, step_cap: f32) -> f32 {
    if display >= target {
        return display;
    }
    let gap = target - display;
    let step = if step_cap > 0.0 { step_cap.min(gap) } else { gap };
    (display + step).clamp(0.0, 100.0)
}

/// A source of animation ticks.
#[async_trait]
pub trait TickSource: Send {
    /// Wait for the next tick. Returns `false` once the source is exhausted.
    async fn tick(&mut self) -> bool;
}

/// Ticks on a fixed wall-clock period.
pub struct IntervalTicks {
    interval: tokio::time::Interval,
}

impl IntervalTicks {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl TickSource for IntervalTicks {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticks delivered by hand through a [`ManualTicker`].
pub struct ManualTicks {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Sending half of [`ManualTicks`].
#[derive(Clone)]
pub struct ManualTicker {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicks {
    pub fn channel() -> (ManualTicker, ManualTicks) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ManualTicker { tx }, ManualTicks { rx })
    }
}

impl ManualTicker {
    /// Queue one tick. Returns `false` if the consumer is gone.
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

#[async_trait]
impl TickSource for ManualTicks {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

/// Drive [`ProgressStore::tick`] from `ticks` until cancelled or the
/// source is exhausted.
pub async fn run_smoothing<T: TickSource>(
    store: Arc<ProgressStore>,
    mut ticks: T,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            more = ticks.tick() => {
                if !more {
                    break;
                }
                store.tick().await;
            }
        }
    }
    tracing::debug!("Progress smoothing loop stopped");
}
