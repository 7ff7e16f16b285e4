//! Periodic expiry of shaping sessions.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{backend::ShapingBackend, orchestrator::Orchestrator};

/// Default seconds between two sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Spawns a task stopping expired sessions every `period` until `cancel` fires.
pub fn spawn<B: ShapingBackend>(
    orchestrator: Arc<Orchestrator<B>>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let stopped = orchestrator.stop_expired_shapings().await;
            if stopped > 0 {
                tracing::info!(stopped, remaining = orchestrator.shaped_device_count(), "expired shapings swept");
            }
        }

        tracing::debug!("sweeper stopped");
    })
}
