//! Tracks spawned tasks so they can be joined together on shutdown.
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A group of named, spawned tasks.
///
/// This struct is responsible for:
/// - Spawning tasks and keeping track of their `JoinHandle`s.
/// - Joining all of them on shutdown, bounded by a grace period.
///
/// Tasks are never aborted. If the grace period elapses first, the remaining
/// tasks are detached and keep running until they observe cancellation.
#[derive(Clone, Debug, Default)]
pub struct TaskManager {
    handles: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a new task and adds its handle to the manager.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task_name = %name, "Spawning task");
        let handle = tokio::spawn(future);
        self.lock_handles().push((name, handle));
    }

    /// Number of tasks spawned and not yet joined.
    pub fn len(&self) -> usize {
        self.lock_handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<(String, JoinHandle<()>)>> {
        // A poisoned lock only means another thread panicked while pushing;
        // the vector itself is still usable.
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits for all managed tasks to complete, up to `grace`.
    ///
    /// Returns `true` if every task finished within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let handles = self.lock_handles().drain(..).collect::<Vec<_>>();
        info!(
            "TaskManager shutting down. Waiting up to {:?} for {} tasks to complete...",
            grace,
            handles.len()
        );

        let task_names: Vec<String> = handles.iter().map(|(name, _)| name.clone()).collect();
        debug!(tasks = ?task_names, "Awaiting all tasks.");

        let joined = join_all(handles.into_iter().map(|(_, handle)| handle));
        let results = match tokio::time::timeout(grace, joined).await {
            Ok(results) => results,
            Err(_) => {
                warn!(
                    tasks = ?task_names,
                    "Tasks did not finish within {:?}; continuing shutdown without them.",
                    grace
                );
                return false;
            }
        };

        let mut panics = 0;
        for (task_name, result) in task_names.iter().zip(results) {
            match result {
                Ok(()) => debug!(task_name = %task_name, "Task shut down gracefully."),
                Err(e) => {
                    error!(task_name = %task_name, error = %e, "Task panicked during shutdown.");
                    panics += 1;
                }
            }
        }

        if panics > 0 {
            error!("{} tasks panicked during shutdown.", panics);
        } else {
            info!("All tasks shut down gracefully.");
        }
        true
    }
}
