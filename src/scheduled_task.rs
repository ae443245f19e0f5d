use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use rocket::tokio::{
    self,
    sync::Notify,
    task::{JoinError, JoinHandle},
    time::Duration,
};

/// A task scheduled for a specific point in the future.
/// It will automatically execute at that point, or can be cancelled or triggered early.
pub struct ScheduledTask<T> {
    handle: JoinHandle<T>,
    trigger: Arc<Notify>,
    run_at: DateTime<Utc>,
}

impl<T> ScheduledTask<T>
where
    T: Send + 'static,
{
    /// Schedule the given task to execute at time `run_at`.
    /// If `run_at` is in the past, the task will execute immediately.
    pub fn new<Fut>(task: Fut, run_at: DateTime<Utc>) -> Self
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let trigger = Arc::new(Notify::new());
        let early = trigger.clone();
        let wait = duration_until(run_at);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = early.notified() => {}
            }
            task.await
        });

        Self {
            handle,
            trigger,
            run_at,
        }
    }

    /// When the task is due, unless triggered early.
    pub fn run_at(&self) -> DateTime<Utc> {
        self.run_at
    }

    /// Has the task already run to completion (or been aborted)?
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Trigger the task now instead of waiting till the original time.
    pub fn trigger_now(&self) {
        // `notify_one` stores a permit, so this works even if the task
        // has not started waiting yet.
        self.trigger.notify_one();
    }

    /// Cancel the task. Returns true iff it had already completed before we could cancel it.
    pub async fn cancel(self) -> bool {
        self.handle.abort();
        self.handle.await.is_ok()
    }
}

/// Implement `Future` for `ScheduledTask` so we can directly `await` it.
impl<T> Future for ScheduledTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

/// Convert a `DateTime` into a duration from the current instant.
/// A `DateTime` in the past will produce a duration of zero.
fn duration_until(datetime: DateTime<Utc>) -> Duration {
    (datetime - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
