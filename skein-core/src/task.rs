//! Task spawning abstraction for single-threaded runtimes.

use std::future::Future;
use tokio::task::JoinHandle;

/// Provider trait for spawning local tasks.
///
/// Spawned futures are not required to be `Send`: they run on the same
/// thread as the caller, interleaving only at `.await` points.
pub trait TaskProvider: Clone {
    /// Spawn a named background task.
    ///
    /// The name is used for tracing only.
    fn spawn_task<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;
}

/// Tokio task provider backed by `tokio::task::spawn_local`.
///
/// Must be used from within a `tokio::task::LocalSet`.
#[derive(Debug, Clone, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let name = name.to_string();
        tracing::trace!(task = %name, "spawning local task");
        tokio::task::spawn_local(async move {
            future.await;
            tracing::trace!(task = %name, "local task finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[tokio::test]
    async fn test_spawn_local_runs() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let flag = Rc::new(Cell::new(false));
                let flag_clone = flag.clone();
                let handle = TokioTaskProvider.spawn_task("flag", async move {
                    flag_clone.set(true);
                });
                handle.await.expect("join");
                assert!(flag.get());
            })
            .await;
    }
}
