//! Recurring background job.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;

pub type JobError = Box<dyn Error + Send + Sync>;

/// Work run on every scheduler tick.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    fn name(&self) -> &str {
        "scheduled-job"
    }

    async fn run(&self) -> Result<(), JobError>;
}

/// Run `job` every `interval` until `shutdown` is cancelled.
///
/// The first run happens one full interval after start. A failed run is
/// logged and the next tick proceeds as usual. A run in progress when
/// shutdown arrives is allowed to finish.
pub async fn run_scheduler(
    job: Arc<dyn ScheduledJob>,
    interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    tracing::info!(job = job.name(), interval_secs = interval.as_secs(), "Starting scheduler");

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match job.run().await {
            Ok(()) => tracing::debug!(job = job.name(), "Scheduled job completed"),
            Err(e) => tracing::error!(job = job.name(), error = %e, "Scheduled job failed"),
        }
    }

    tracing::info!(job = job.name(), "Scheduler stopped");
    Ok(())
}
