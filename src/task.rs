//! Recurring background jobs.
//!
//! Each job is one tokio task ticking on its own interval until its
//! cancellation token fires. An iteration runs in a child task, so a panic
//! inside it is logged and the next tick goes ahead as normal.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Handle to a running periodic job.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the loop to stop after the current iteration.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(task = self.name, error = %e, "background task ended abnormally");
        }
    }
}

pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut job: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let shutdown = token.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(task = name, ?period, "background task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = tokio::spawn(job()).await {
                        tracing::error!(task = name, error = %e, "iteration panicked");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!(task = name, "background task stopped");
                    break;
                }
            }
        }
    });

    TaskHandle { name, token, handle }
}
