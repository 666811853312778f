use std::{borrow::Cow, time::Duration};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A named background task (acceptor, sweeper, per-stream monitor).
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Owns the long-lived background tasks and stops them on shutdown with a
/// bounded grace period.
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn push_handle(&mut self, name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) {
        self.push(TaskHandle::new(name, handle));
    }

    /// Wait up to `grace` for each task to observe the shutdown flag and
    /// return; abort stragglers.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        for task in self.tasks {
            let TaskHandle { name, mut handle } = task;
            let sleeper = tokio::time::sleep(grace);
            tokio::pin!(sleeper);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(task = %name, ?err, "task exited with error");
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    if let Err(err) = handle.await {
                        if !err.is_cancelled() {
                            debug!(task = %name, ?err, "task join after abort failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_waits_for_cooperative_tasks() {
        let mut tasks = TaskManager::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.push_handle(
            "cooperative",
            tokio::spawn(async move {
                let _ = rx.await;
            }),
        );
        tx.send(()).unwrap();
        tasks.shutdown_with_grace(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_aborts_stuck_tasks_after_grace() {
        let mut tasks = TaskManager::new();
        tasks.push_handle(
            "stuck",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        );
        tokio::time::timeout(
            Duration::from_secs(2),
            tasks.shutdown_with_grace(Duration::from_millis(20)),
        )
        .await
        .expect("shutdown must not hang on a stuck task");
    }
}
