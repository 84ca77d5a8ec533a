//! Trailing-edge debouncing over tokio timers.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Runs the most recently submitted future once `delay` has passed without
/// a newer submission.
///
/// A zero delay still defers to a spawned task, so submissions made within
/// one actor turn collapse into the last one.
pub struct Debouncer {
    delay: Duration,
    task: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, task: None }
    }

    /// Replace any pending call with `fut`.
    pub fn call<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let delay = self.delay;
        self.task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            fut.await;
        }));
    }

    /// Abort the pending or running call. Returns whether there was one.
    pub fn cancel(&mut self) -> bool {
        match self.task.take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                true
            }
            _ => false,
        }
    }

    /// Whether a call is waiting or still running.
    pub fn is_pending(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
