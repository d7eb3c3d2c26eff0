use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::actor::CoordinatorHandle;

/// Timer that asks the actor for one full cycle per interval.
pub struct ManagementLoop {
    handle: CoordinatorHandle,
    interval: Duration,
    startup_delay: Duration,
}

impl ManagementLoop {
    /// The startup delay is capped at the interval.
    pub fn new(handle: CoordinatorHandle, interval: Duration, startup_delay: Duration) -> Self {
        Self {
            handle,
            interval,
            startup_delay: startup_delay.min(interval),
        }
    }

    /// Runs until `shutdown` flips to true or the actor goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            startup_delay_secs = self.startup_delay.as_secs(),
            "management loop starting"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.startup_delay) => {}
            _ = shutdown.changed() => return,
        }

        let mut ticker = tokio::time::interval(self.interval);
        // A slow cycle should not cause a burst of catch-up cycles.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            match self.handle.run_cycle().await {
                Ok(report) => tracing::debug!(
                    scanned = report.scanned,
                    errors = report.errors.len(),
                    "tick complete"
                ),
                Err(e) => {
                    tracing::error!(error = %e, "coordinator unavailable, stopping loop");
                    break;
                }
            }
        }
        tracing::info!("management loop stopped");
    }
}
