//! Runtime capability bundle.
//!
//! The peer subsystem needs three outside capabilities: a way to open
//! connections, a clock, and a task spawner. [`Providers`] folds the
//! three provider traits into a single type parameter, so a peer is
//! written as
//!
//! ```text
//! struct ClientPeer<P: Providers, C: MessageCodec> { .. }
//! ```
//!
//! rather than carrying one generic parameter (and its where clause)
//! per capability. [`TokioProviders`] is the production bundle; tests
//! assemble bundles out of scripted doubles to drive connection tasks
//! deterministically.

use std::future::Future;

use crate::{
    NetworkProvider, TaskProvider, TimeProvider, TokioNetworkProvider, TokioTaskProvider,
    TokioTimeProvider,
};

/// The runtime capabilities the peer subsystem consumes.
///
/// `Clone + 'static` lets every background task capture its own handle
/// to the bundle.
pub trait Providers: Clone + 'static {
    /// Opens connections and listeners.
    type Network: NetworkProvider + Clone + 'static;

    /// Sleeps, deadlines, and the clock.
    type Time: TimeProvider + Clone + 'static;

    /// Spawns local background tasks.
    type Task: TaskProvider + Clone + 'static;

    /// The network provider.
    fn network(&self) -> &Self::Network;

    /// The time provider.
    fn time(&self) -> &Self::Time;

    /// The task provider.
    fn task(&self) -> &Self::Task;

    /// Spawn a named background task on the bundle's task provider.
    ///
    /// Connection tasks, timers, and dial loops all start here.
    fn spawn<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.task().spawn_task(name, future)
    }
}

/// Production bundle over the Tokio runtime.
///
/// ## Example
///
/// ```rust
/// use tidepool_core::{Providers, TimeProvider, TokioProviders};
///
/// let providers = TokioProviders::new();
/// let _before = providers.time().now();
/// ```
#[derive(Clone, Default)]
pub struct TokioProviders {
    network: TokioNetworkProvider,
    time: TokioTimeProvider,
    task: TokioTaskProvider,
}

impl TokioProviders {
    /// Create a production bundle.
    ///
    /// The time provider's epoch is the moment of creation, so `now()`
    /// readings are only comparable within one bundle (and its clones).
    pub fn new() -> Self {
        Self::default()
    }
}

impl Providers for TokioProviders {
    type Network = TokioNetworkProvider;
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;

    fn network(&self) -> &Self::Network {
        &self.network
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }
}
