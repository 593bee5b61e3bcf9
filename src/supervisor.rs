//! Fail-fast supervision of listener and background tasks.
//!
//! All tasks share one cancellation token. The first task to fail cancels the
//! rest, which then get [`SHUTDOWN_GRACE_SECS`] to drain before they are
//! aborted. A task that returns `Ok` or [`ServerError::Closed`] has stopped on
//! purpose and does not bring its siblings down.

use std::future::Future;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::SHUTDOWN_GRACE_SECS;
use crate::error::ServerError;
use crate::metrics::Metrics;

pub struct Supervisor {
    tasks: JoinSet<Result<(), ServerError>>,
    names: Vec<(Id, &'static str)>,
    shutdown: CancellationToken,
    grace: Duration,
    metrics: Metrics,
}

impl Supervisor {
    /// Supervise tasks under a child of `shutdown`, so cancelling the parent
    /// stops every task while a failing task never cancels the parent.
    pub fn new(shutdown: &CancellationToken, metrics: Metrics) -> Self {
        Self {
            tasks: JoinSet::new(),
            names: Vec::new(),
            shutdown: shutdown.child_token(),
            grace: Duration::from_secs(SHUTDOWN_GRACE_SECS),
            metrics,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Token shared by every supervised task.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn `task` with the shared cancellation token.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
    {
        let future = task(self.shutdown.clone());
        let running = RunningTask::new(self.metrics.clone());
        let handle = self.tasks.spawn(async move {
            let _running = running;
            future.await
        });
        tracing::debug!(task = name, "Supervised task started");
        self.names.push((handle.id(), name));
    }

    fn name_of(&self, id: Id) -> &'static str {
        self.names
            .iter()
            .find(|(task_id, _)| *task_id == id)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }

    /// Wait for every task. Returns the first failure, if any.
    pub async fn wait(mut self) -> Result<(), ServerError> {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            let (name, outcome) = match joined {
                Ok((id, result)) => (self.name_of(id), result),
                Err(e) => (self.name_of(e.id()), Err(panicked(e))),
            };

            match outcome {
                Ok(()) | Err(ServerError::Closed) => {
                    tracing::info!(task = name, "Supervised task stopped");
                }
                Err(err) => {
                    tracing::error!(task = name, error = %err, "Supervised task failed");
                    self.shutdown.cancel();
                    self.drain().await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Give the remaining tasks the grace period to stop, then abort them.
    async fn drain(mut self) {
        let remaining = self.tasks.len();
        if remaining > 0 {
            tracing::info!(
                remaining,
                grace_secs = self.grace.as_secs(),
                "Waiting for remaining tasks to stop"
            );
        }

        let deadline = tokio::time::sleep(self.grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = self.tasks.join_next_with_id() => match joined {
                    None => break,
                    Some(Ok((id, Err(err)))) if !err.is_graceful() => {
                        tracing::warn!(task = self.name_of(id), error = %err, "Task failed while draining");
                    }
                    Some(Err(e)) if e.is_panic() => {
                        tracing::warn!(task = self.name_of(e.id()), "Task panicked while draining");
                    }
                    Some(_) => {}
                },
                _ = &mut deadline => {
                    tracing::warn!(remaining = self.tasks.len(), "Grace period elapsed, aborting remaining tasks");
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }
}

/// Keeps `runway_supervised_tasks` accurate for tasks that panic or are aborted.
struct RunningTask(Metrics);

impl RunningTask {
    fn new(metrics: Metrics) -> Self {
        metrics.task_started();
        Self(metrics)
    }
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.0.task_finished();
    }
}

fn panicked(err: JoinError) -> ServerError {
    if err.is_cancelled() {
        return ServerError::Closed;
    }
    let message = match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(e) => e.to_string(),
    };
    ServerError::Panicked(message)
}
