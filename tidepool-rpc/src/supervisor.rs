//! Client supervisor: a pool of peer connections across a host set.
//!
//! The supervisor owns the host registry and the set of live
//! connections, routes requests across the pool, and runs one dial loop
//! per disconnected host with exponential backoff. Routing and
//! reconnection decisions go through a [`SupervisorPolicy`], whose
//! default picks connections uniformly at random and reconnects
//! forever.
//!
//! # Backoff
//!
//! The first retry waits `connection_timeout`; each further failure
//! doubles the delay, capped at ten times the base. A successful
//! connection resets the state for that host. With a one-second base the
//! schedule runs 1, 2, 4, 8, 10, 10, ... seconds.
//!
//! # Retry semantics
//!
//! A request that fails with [`RpcError::ConnectionClosed`] is retried
//! exactly once, through fresh connection selection - the window where a
//! peer died between selection and delivery. Every other error reaches
//! the caller untouched; only the caller can judge whether its request
//! is safe to repeat.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use tidepool_core::{MessageCodec, Providers, TimeProvider};

use crate::config::ClientConfig;
use crate::error::{RpcError, RpcResult};
use crate::frame::FrameCodec;
use crate::peer::ClientPeer;

/// Pluggable supervisor behaviour.
///
/// Three hooks cover routing, reconnect judgement, and per-connection
/// setup. All have defaults apart from routing, which the stock
/// [`RandomPolicy`] provides.
#[async_trait(?Send)]
pub trait SupervisorPolicy<P: Providers, C: MessageCodec>: 'static {
    /// Pick a connection for a request from a pool snapshot.
    ///
    /// Returning `None` fails the request with
    /// [`RpcError::NoConnection`].
    fn choose_connection(
        &self,
        connections: &[Rc<ClientPeer<P, C>>],
    ) -> Option<Rc<ClientPeer<P, C>>>;

    /// Whether to keep dialling `host:port` after `attempts` failures.
    ///
    /// Also consulted with `attempts = 0` when an established connection
    /// closes unexpectedly, deciding whether to reconnect at all.
    /// Returning `false` removes the host.
    fn should_reconnect(&self, host: &str, port: u16, attempts: u32) -> bool {
        let _ = (host, port, attempts);
        true
    }

    /// Prepare a fresh connection before it joins the pool.
    ///
    /// The connection does not serve routed requests, and does not count
    /// toward [`ClientSupervisor::start`] completion, until this
    /// resolves. Failing closes the connection and re-engages the dial
    /// loop.
    async fn initialize_connection(&self, peer: &Rc<ClientPeer<P, C>>) -> RpcResult<()> {
        let _ = peer;
        Ok(())
    }
}

/// Default policy: uniform-random routing, reconnect forever, no
/// connection setup.
///
/// Selection draws from the thread-local generator. Routing spread
/// needs no seeding or reproducibility, so there is no hook for a
/// custom source; a policy that wants one implements
/// [`SupervisorPolicy`] itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomPolicy;

impl RandomPolicy {
    /// Create the default policy.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl<P, C> SupervisorPolicy<P, C> for RandomPolicy
where
    P: Providers,
    C: MessageCodec,
{
    fn choose_connection(
        &self,
        connections: &[Rc<ClientPeer<P, C>>],
    ) -> Option<Rc<ClientPeer<P, C>>> {
        if connections.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..connections.len());
        Some(Rc::clone(&connections[index]))
    }
}

/// Completion state of a host registration.
#[derive(Debug, Clone)]
enum RegistrationState {
    Pending,
    Ready,
    Failed(RpcError),
}

/// Handle to a host's initial-connection outcome.
///
/// Returned by [`ClientSupervisor::add_host`]; the same handle is
/// returned for repeated registrations of one host.
#[derive(Clone)]
pub struct Registration {
    rx: watch::Receiver<RegistrationState>,
}

impl Registration {
    /// Wait until the host's initial connection succeeds or its dial
    /// loop gives up.
    pub async fn wait(mut self) -> RpcResult<()> {
        loop {
            let current = self.rx.borrow().clone();
            match current {
                RegistrationState::Ready => return Ok(()),
                RegistrationState::Failed(e) => return Err(e),
                RegistrationState::Pending => {}
            }
            if self.rx.changed().await.is_err() {
                // The host entry is gone: removed, or the supervisor
                // itself was dropped.
                return Err(RpcError::Connect {
                    message: "registration cancelled before connecting".to_string(),
                });
            }
        }
    }
}

struct HostEntry {
    host: String,
    port: u16,
    registration_tx: watch::Sender<RegistrationState>,
    /// Kept so the sender side never observes zero receivers.
    registration_rx: watch::Receiver<RegistrationState>,
    /// A dial loop is currently active for this host.
    connecting: bool,
}

struct SupervisorState<P: Providers, C: MessageCodec> {
    hosts: Vec<HostEntry>,
    connections: Vec<Rc<ClientPeer<P, C>>>,
    running: bool,
}

impl<P: Providers, C: MessageCodec> SupervisorState<P, C> {
    fn host_index(&self, host: &str, port: u16) -> Option<usize> {
        self.hosts
            .iter()
            .position(|h| h.host == host && h.port == port)
    }
}

/// Pools client peers across a dynamic host set.
pub struct ClientSupervisor<P, C, PL>
where
    P: Providers,
    C: MessageCodec,
    PL: SupervisorPolicy<P, C>,
{
    providers: P,
    codec: FrameCodec<C>,
    config: ClientConfig,
    policy: Rc<PL>,
    state: Rc<RefCell<SupervisorState<P, C>>>,
}

impl<P, C, PL> Clone for ClientSupervisor<P, C, PL>
where
    P: Providers,
    C: MessageCodec,
    PL: SupervisorPolicy<P, C>,
{
    fn clone(&self) -> Self {
        Self {
            providers: self.providers.clone(),
            codec: self.codec.clone(),
            config: self.config.clone(),
            policy: Rc::clone(&self.policy),
            state: Rc::clone(&self.state),
        }
    }
}

impl<P, C> ClientSupervisor<P, C, RandomPolicy>
where
    P: Providers,
    C: MessageCodec,
{
    /// Create a supervisor with the default random routing policy.
    pub fn new(providers: P, codec: FrameCodec<C>, config: ClientConfig) -> Self {
        Self::with_policy(providers, codec, config, RandomPolicy::new())
    }
}

impl<P, C, PL> ClientSupervisor<P, C, PL>
where
    P: Providers,
    C: MessageCodec,
    PL: SupervisorPolicy<P, C>,
{
    /// Create a supervisor with a custom policy.
    ///
    /// Hosts listed in `config.hosts` are registered immediately;
    /// dialling still waits for [`start`](Self::start).
    pub fn with_policy(providers: P, codec: FrameCodec<C>, config: ClientConfig, policy: PL) -> Self {
        let supervisor = Self {
            providers,
            codec,
            config,
            policy: Rc::new(policy),
            state: Rc::new(RefCell::new(SupervisorState {
                hosts: Vec::new(),
                connections: Vec::new(),
                running: false,
            })),
        };
        for (host, port) in supervisor.config.hosts.clone() {
            supervisor.add_host(&host, port);
        }
        supervisor
    }

    /// Register a host. Idempotent: re-adding a known host returns its
    /// existing registration handle.
    ///
    /// When the supervisor is running, dialling starts immediately;
    /// otherwise it is deferred to [`start`](Self::start).
    pub fn add_host(&self, host: &str, port: u16) -> Registration {
        let (registration, needs_dial) = {
            let mut state = self.state.borrow_mut();
            if let Some(index) = state.host_index(host, port) {
                let entry = &state.hosts[index];
                let has_connection = state
                    .connections
                    .iter()
                    .any(|c| c.host() == host && c.port() == port);
                let needs_dial = state.running && !entry.connecting && !has_connection;
                (
                    Registration {
                        rx: entry.registration_rx.clone(),
                    },
                    needs_dial,
                )
            } else {
                let (tx, rx) = watch::channel(RegistrationState::Pending);
                state.hosts.push(HostEntry {
                    host: host.to_string(),
                    port,
                    registration_tx: tx,
                    registration_rx: rx.clone(),
                    connecting: false,
                });
                (Registration { rx }, state.running)
            }
        };

        if needs_dial {
            self.spawn_dial_loop(host.to_string(), port, false);
        }
        registration
    }

    /// Forget a host and close any live connection to it.
    ///
    /// A dial loop in flight for the host discovers the removal at its
    /// next checkpoint and aborts.
    pub fn remove_host(&self, host: &str, port: u16) {
        let closing = {
            let mut state = self.state.borrow_mut();
            state.hosts.retain(|h| !(h.host == host && h.port == port));
            let closing: Vec<_> = state
                .connections
                .iter()
                .filter(|c| c.host() == host && c.port() == port)
                .cloned()
                .collect();
            state
                .connections
                .retain(|c| !(c.host() == host && c.port() == port));
            closing
        };
        for connection in closing {
            connection.close(None);
        }
    }

    /// Connect to every registered host.
    ///
    /// Resolves once each host's initial connection - including retries
    /// and the initialize hook - has succeeded. A host whose dial loop
    /// gives up fails the whole start with that host's error.
    pub async fn start(&self) -> RpcResult<()> {
        let pending: Vec<(String, u16, Registration)> = {
            let mut state = self.state.borrow_mut();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state
                .hosts
                .iter()
                .map(|entry| {
                    (
                        entry.host.clone(),
                        entry.port,
                        Registration {
                            rx: entry.registration_rx.clone(),
                        },
                    )
                })
                .collect()
        };

        for (host, port, _) in &pending {
            self.spawn_dial_loop(host.clone(), *port, false);
        }
        // Dial loops progress concurrently; awaiting in sequence only
        // orders the observations.
        for (_, _, registration) in pending {
            registration.wait().await?;
        }
        Ok(())
    }

    /// Whether [`start`](Self::start) has run and
    /// [`stop`](Self::stop) has not.
    pub fn is_running(&self) -> bool {
        self.state.borrow().running
    }

    /// Stop routing and close every pooled connection cleanly.
    pub fn stop(&self) {
        let connections = {
            let mut state = self.state.borrow_mut();
            state.running = false;
            mem::take(&mut state.connections)
        };
        for connection in connections {
            connection.close(None);
        }
    }

    /// Snapshot of the current connection pool.
    pub fn connections(&self) -> Vec<Rc<ClientPeer<P, C>>> {
        self.state.borrow().connections.clone()
    }

    /// Route a request through the policy and await its response.
    ///
    /// Fails with [`RpcError::NoConnection`] when the policy returns no
    /// connection. A [`RpcError::ConnectionClosed`] outcome is retried
    /// exactly once via fresh selection.
    pub async fn send_request<Req, Resp>(
        &self,
        request: &Req,
        timeout: Option<Duration>,
    ) -> RpcResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        match self.send_routed(request, timeout).await {
            Err(RpcError::ConnectionClosed) => {
                tracing::debug!("request lost to a closing connection, retrying once");
                self.send_routed(request, timeout).await
            }
            other => other,
        }
    }

    /// Send on an explicit connection (typically from
    /// [`SupervisorPolicy::initialize_connection`]).
    ///
    /// If the connection closes under the request, the one retry goes
    /// through normal selection instead.
    pub async fn send_request_on<Req, Resp>(
        &self,
        connection: &Rc<ClientPeer<P, C>>,
        request: &Req,
        timeout: Option<Duration>,
    ) -> RpcResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        match Self::send_on(connection, request, timeout).await {
            Err(RpcError::ConnectionClosed) => {
                tracing::debug!("request lost to a closing connection, retrying once");
                self.send_routed(request, timeout).await
            }
            other => other,
        }
    }

    async fn send_routed<Req, Resp>(
        &self,
        request: &Req,
        timeout: Option<Duration>,
    ) -> RpcResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let chosen = {
            let state = self.state.borrow();
            self.policy.choose_connection(&state.connections)
        };
        let Some(connection) = chosen else {
            return Err(RpcError::NoConnection);
        };
        Self::send_on(&connection, request, timeout).await
    }

    async fn send_on<Req, Resp>(
        connection: &Rc<ClientPeer<P, C>>,
        request: &Req,
        timeout: Option<Duration>,
    ) -> RpcResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        if connection.is_closed() {
            return Err(RpcError::RequestNotSent);
        }
        connection.send_message(request, timeout).await
    }

    fn set_registration(&self, host: &str, port: u16, value: RegistrationState) {
        let state = self.state.borrow();
        if let Some(index) = state.host_index(host, port) {
            let _ = state.hosts[index].registration_tx.send(value);
        }
    }

    fn set_connecting(&self, host: &str, port: u16, connecting: bool) {
        let mut state = self.state.borrow_mut();
        if let Some(index) = state.host_index(host, port) {
            state.hosts[index].connecting = connecting;
        }
    }

    fn spawn_dial_loop(&self, host: String, port: u16, consult_policy_first: bool) {
        self.set_connecting(&host, port, true);
        let supervisor = self.clone();
        self.providers.spawn("supervisor_dial", async move {
            supervisor
                .dial_loop(host, port, consult_policy_first)
                .await;
        });
    }

    /// Dial `host:port` until admitted, aborted, or given up.
    ///
    /// `consult_policy_first` is set when re-engaging after a
    /// spontaneous close, so the policy gets its `attempts = 0` say
    /// before the first redial.
    async fn dial_loop(&self, host: String, port: u16, consult_policy_first: bool) {
        let base = self.config.connection_timeout;
        let max_delay = base * 10;
        let mut delay = base;
        let mut attempts: u32 = 0;

        if consult_policy_first && !self.policy.should_reconnect(&host, port, 0) {
            tracing::debug!(host = %host, port, "policy declined reconnect after close");
            self.set_connecting(&host, port, false);
            self.remove_host(&host, port);
            return;
        }

        loop {
            // Checkpoint: the host may have been removed or the
            // supervisor stopped while this loop slept.
            {
                let state = self.state.borrow();
                if state.host_index(&host, port).is_none() {
                    tracing::debug!(host = %host, port, "host removed, dial loop aborting");
                    return;
                }
                if !state.running {
                    drop(state);
                    self.set_registration(
                        &host,
                        port,
                        RegistrationState::Failed(RpcError::Connect {
                            message: format!("{}:{}: supervisor stopped", host, port),
                        }),
                    );
                    self.set_connecting(&host, port, false);
                    return;
                }
            }

            let error = match ClientPeer::connect(
                self.providers.clone(),
                &host,
                port,
                self.codec.clone(),
                self.config.clone(),
            )
            .await
            {
                Ok(peer) => match self.policy.initialize_connection(&peer).await {
                    Ok(()) => {
                        let admitted = {
                            let mut state = self.state.borrow_mut();
                            if state.running && state.host_index(&host, port).is_some() {
                                state.connections.push(Rc::clone(&peer));
                                true
                            } else {
                                false
                            }
                        };
                        if !admitted {
                            peer.close(None);
                            self.set_connecting(&host, port, false);
                            return;
                        }
                        tracing::debug!(host = %host, port, "connection established");
                        self.set_registration(&host, port, RegistrationState::Ready);
                        self.set_connecting(&host, port, false);
                        self.spawn_close_watcher(host, port, peer);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(host = %host, port, error = %e, "connection initialize failed");
                        peer.close(Some(e.clone()));
                        e
                    }
                },
                Err(e) => e,
            };

            attempts += 1;
            tracing::debug!(host = %host, port, attempts, error = %error, "connect attempt failed");

            if !self.policy.should_reconnect(&host, port, attempts) {
                tracing::warn!(host = %host, port, attempts, "reconnect policy gave up");
                self.set_registration(&host, port, RegistrationState::Failed(error));
                self.set_connecting(&host, port, false);
                self.remove_host(&host, port);
                return;
            }

            let _ = self.providers.time().sleep(delay).await;
            delay = std::cmp::min(delay * 2, max_delay);
        }
    }

    /// Watch one pooled connection; on an unexpected close, re-engage
    /// the dial loop for its host.
    fn spawn_close_watcher(&self, host: String, port: u16, peer: Rc<ClientPeer<P, C>>) {
        let supervisor = self.clone();
        self.providers
            .spawn("supervisor_close_watcher", async move {
                let cause = peer.closed().await;
                {
                    let mut state = supervisor.state.borrow_mut();
                    state.connections.retain(|c| !Rc::ptr_eq(c, &peer));
                }
                drop(peer);

                let should_redial = {
                    let state = supervisor.state.borrow();
                    state.running && state.host_index(&host, port).is_some()
                };

                match cause {
                    Some(error) if should_redial => {
                        tracing::warn!(host = %host, port, error = %error, "connection lost, reconnecting");
                        supervisor.spawn_dial_loop(host, port, true);
                    }
                    Some(error) => {
                        tracing::debug!(host = %host, port, error = %error, "connection lost, host no longer tracked");
                    }
                    None => {
                        tracing::debug!(host = %host, port, "connection closed cleanly");
                    }
                }
            });
    }
}
