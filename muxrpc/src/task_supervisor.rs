use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct SupervisorState {
    running: AtomicU64,
    /// Cancelled when stop is requested.
    stop: CancellationToken,
    /// Cancelled once stop was requested and the running count reached zero.
    drained: CancellationToken,
}

/// Tracks the accept/read/send loops of an endpoint so shutdown can wait for
/// all of them.
///
/// Each loop holds a [`TaskGuard`] and selects on its `stopped()` future;
/// dropping the guard decrements the running count. `all_stopped()` resolves
/// only after `stop()` was requested and every guard is gone.
#[derive(Debug, Default)]
pub struct TaskSupervisor(Arc<SupervisorState>);

#[derive(Debug)]
pub struct TaskGuard(Arc<SupervisorState>);

impl TaskSupervisor {
    #[must_use]
    pub fn start_task(&self) -> TaskGuard {
        self.0.running.fetch_add(1, Ordering::SeqCst);
        TaskGuard(self.0.clone())
    }

    pub fn stop(&self) {
        self.0.stop.cancel();
        if self.0.running.load(Ordering::SeqCst) == 0 {
            self.0.drained.cancel();
        }
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    pub async fn all_stopped(&self) {
        self.0.drained.cancelled().await;
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 && self.0.stop.is_cancelled() {
            self.0.drained.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_and_drain() {
        let supervisor = TaskSupervisor::default();
        let guard = supervisor.start_task();
        let handle = tokio::spawn(async move {
            guard.stopped().await;
            drop(guard);
        });

        supervisor.stop();
        supervisor.all_stopped().await;
        handle.await.unwrap();
        assert_eq!(supervisor.0.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_without_tasks() {
        let supervisor = TaskSupervisor::default();
        supervisor.stop();
        supervisor.all_stopped().await;
    }
}
