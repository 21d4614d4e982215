//! Task spawning abstraction for single-threaded runtimes.
//!
//! The peer subsystem runs one connection task per peer plus short-lived
//! timer and handler tasks. All of them are spawned through this trait.

use std::future::Future;

/// Provider for spawning local tasks in a single-threaded context.
///
/// Tasks are spawned with `spawn_local` semantics: futures need not be
/// `Send`, which lets peer state live in `Rc<RefCell<_>>` without lock
/// overhead.
pub trait TaskProvider: Clone {
    /// Spawn a named task that runs on the current thread.
    ///
    /// The name is attached to trace output; it has no scheduling
    /// significance.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;
}

/// Tokio-based task provider using `spawn_local`.
///
/// Spawned futures run on the current thread, so callers must be inside
/// a [`tokio::task::LocalSet`] (or a current-thread runtime driving
/// one). Spawning outside a `LocalSet` panics, per tokio's contract.
#[derive(Clone, Debug, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let task_name = name.to_string();
        tokio::task::spawn_local(async move {
            tracing::trace!("task {} starting", task_name);
            future.await;
            tracing::trace!("task {} completed", task_name);
        })
    }
}
