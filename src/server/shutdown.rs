//! Server lifecycle state and shutdown strategies.
//!
//! The serve loop and whoever calls [`ServerHandle::shutdown`] only talk
//! through a `watch` channel carrying [`ServerState`]. Shutdown moves the
//! state to `Draining` (stop accepting, let in-flight requests finish) and,
//! if the grace period runs out, to `Closing` (abort what is left). The serve
//! loop answers with `Stopped` once every connection task is gone.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;

use crate::server::Error;

/// Where a server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed; routes may still be registered.
    Created,
    /// `start` has claimed the server and is binding.
    Starting,
    /// Accepting connections on the given address.
    Listening(SocketAddr),
    /// No longer accepting; waiting for in-flight requests.
    Draining,
    /// Grace period elapsed; remaining connections are being aborted.
    Closing,
    /// Terminal.
    Stopped,
}

/// How a shutdown finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight request completed within the grace period.
    Graceful,
    /// The grace period elapsed and remaining connections were force-closed.
    Forced,
}

/// A cloneable handle to a server's lifecycle.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    state: Arc<watch::Sender<ServerState>>,
    connections: Arc<AtomicUsize>,
}

impl ServerHandle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self {
            state: Arc::new(state),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Connection tasks the server is still tracking.
    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub(crate) fn set_active_connections(&self, count: usize) {
        self.connections.store(count, Ordering::Relaxed);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ServerState) {
        self.state.send_replace(state);
    }

    /// Move `Created` to `Starting`.
    ///
    /// Fails with `AlreadyStarted` while the server runs and with
    /// `ServerClosed` once it has been shut down.
    pub(crate) fn claim(&self) -> Result<(), Error> {
        let mut previous = ServerState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == ServerState::Created {
                *state = ServerState::Starting;
                true
            } else {
                false
            }
        });

        match previous {
            ServerState::Created => Ok(()),
            ServerState::Stopped => Err(Error::ServerClosed),
            _ => Err(Error::AlreadyStarted),
        }
    }

    /// Move a freshly bound server to `Listening`. Returns false if a
    /// shutdown arrived while binding.
    pub(crate) fn mark_listening(&self, addr: SocketAddr) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ServerState::Starting {
                *state = ServerState::Listening(addr);
                true
            } else {
                false
            }
        })
    }

    /// Settle the state when `start` exits. A server that never got past
    /// binding can be started again; anything further along is stopped.
    pub(crate) fn release(&self) {
        self.state.send_modify(|state| {
            *state = match *state {
                ServerState::Starting => ServerState::Created,
                _ => ServerState::Stopped,
            };
        });
    }

    /// The bound address, once the server is listening.
    ///
    /// Waits for `start` to bind. Returns `None` if the server stops (or
    /// never manages to listen) instead.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, ServerState::Created | ServerState::Starting))
            .await
            .ok()
            .map(|s| *s)?;

        match state {
            ServerState::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    /// Stop accepting connections and wait up to `grace` for in-flight
    /// requests, then force-close whatever is left.
    ///
    /// Shutting down a server that never started marks it stopped and
    /// returns immediately. Concurrent callers all wait for the same stop.
    pub async fn shutdown(&self, grace: Duration) -> Result<ShutdownOutcome, Error> {
        let mut previous = ServerState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                ServerState::Created => {
                    *state = ServerState::Stopped;
                    true
                }
                ServerState::Starting | ServerState::Listening(_) => {
                    *state = ServerState::Draining;
                    true
                }
                _ => false,
            }
        });

        match previous {
            ServerState::Created | ServerState::Stopped => return Ok(ShutdownOutcome::Graceful),
            ServerState::Starting | ServerState::Listening(_) => {
                info!("Shutting down server, grace period {grace:?}");
            }
            ServerState::Draining | ServerState::Closing => {}
        }

        let mut rx = self.subscribe();
        let is_stopped = |s: &ServerState| *s == ServerState::Stopped;

        let drained = tokio::time::timeout(grace, rx.wait_for(is_stopped))
            .await
            .map(|r| r.map(|_| ()));

        match drained {
            Ok(Ok(())) => Ok(ShutdownOutcome::Graceful),
            Ok(Err(_)) => Err(Error::Shutdown("server state channel closed".to_string())),
            Err(_) => {
                warn!("Grace period of {grace:?} elapsed, closing remaining connections");
                self.state.send_if_modified(|state| {
                    if *state == ServerState::Draining {
                        *state = ServerState::Closing;
                        true
                    } else {
                        false
                    }
                });
                rx.wait_for(is_stopped)
                    .await
                    .map(|_| ())
                    .map_err(|_| Error::Shutdown("server state channel closed".to_string()))?;
                Ok(ShutdownOutcome::Forced)
            }
        }
    }
}

/// A boxed future that resolves when shutdown should begin.
pub type TriggerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Something that can tell the server when to shut down.
pub trait ShutdownTrigger: Send + Sync + 'static {
    /// Resolve when shutdown should begin.
    fn wait(&self) -> TriggerFuture;
}

/// Fires on SIGINT or SIGTERM (Ctrl+C on non-Unix targets).
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignals;

impl ShutdownTrigger for OsSignals {
    fn wait(&self) -> TriggerFuture {
        Box::pin(wait_for_os_signal())
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            error!("Error setting up signal handlers: {e}");
            return std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(e) => {
            error!("Error setting up Ctrl+C handler: {e}");
            std::future::pending::<()>().await
        }
    }
}

/// Fires as soon as it is awaited.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl ShutdownTrigger for Immediate {
    fn wait(&self) -> TriggerFuture {
        Box::pin(std::future::ready(()))
    }
}

/// Fires when [`ManualTrigger::fire`] is called on any clone.
///
/// Firing before anyone waits is remembered. Dropping every clone without
/// firing also releases waiters.
#[derive(Debug, Clone)]
pub struct ManualTrigger {
    fired: Arc<watch::Sender<bool>>,
}

impl ManualTrigger {
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            fired: Arc::new(fired),
        }
    }

    pub fn fire(&self) {
        self.fired.send_replace(true);
    }
}

impl Default for ManualTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownTrigger for ManualTrigger {
    fn wait(&self) -> TriggerFuture {
        let mut rx = self.fired.subscribe();
        Box::pin(async move {
            let _ = rx.wait_for(|fired| *fired).await;
        })
    }
}

/// A boxed future produced by a shutdown strategy.
pub type StrategyFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

/// The logic run by [`crate::HttpServer::stop`].
#[derive(Clone)]
pub struct ShutdownStrategy {
    inner: Arc<dyn Fn(ServerHandle) -> StrategyFuture + Send + Sync>,
}

impl ShutdownStrategy {
    /// Wrap an arbitrary async callable.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(ServerHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |handle: ServerHandle| -> StrategyFuture { Box::pin(f(handle)) }),
        }
    }

    /// Wait for `trigger`, then shut down within `grace`.
    ///
    /// Both graceful and forced outcomes report `Ok`. A failing shutdown
    /// terminates the process.
    pub fn graceful(trigger: impl ShutdownTrigger, grace: Duration) -> Self {
        let trigger = Arc::new(trigger);
        Self::from_fn(move |handle: ServerHandle| {
            let triggered = trigger.wait();
            async move {
                triggered.await;
                match handle.shutdown(grace).await {
                    Ok(ShutdownOutcome::Graceful) => info!("Server stopped"),
                    Ok(ShutdownOutcome::Forced) => info!("Server stopped after waiting {grace:?}"),
                    Err(e) => {
                        error!("Server shutdown: {e}");
                        std::process::exit(1);
                    }
                }
                Ok(())
            }
        })
    }

    /// The strategy used when none is configured.
    pub fn os_signals(grace: Duration) -> Self {
        Self::graceful(OsSignals, grace)
    }

    pub(crate) fn run(&self, handle: ServerHandle) -> StrategyFuture {
        (self.inner)(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_before_start_is_immediate() {
        let handle = ServerHandle::new();
        let outcome = handle.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Graceful);
        assert_eq!(handle.state(), ServerState::Stopped);
        assert!(matches!(handle.claim(), Err(Error::ServerClosed)));
    }

    #[tokio::test]
    async fn test_claim_twice_fails() {
        let handle = ServerHandle::new();
        handle.claim().unwrap();
        assert!(matches!(handle.claim(), Err(Error::AlreadyStarted)));
    }

    #[test]
    fn test_release_resets_or_stops() {
        let handle = ServerHandle::new();
        handle.claim().unwrap();
        handle.release();
        assert_eq!(handle.state(), ServerState::Created);

        handle.claim().unwrap();
        handle.mark_listening("127.0.0.1:8080".parse().unwrap());
        handle.release();
        assert_eq!(handle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_graceful_outcome_when_serve_loop_drains() {
        let handle = ServerHandle::new();
        handle.claim().unwrap();
        assert!(handle.mark_listening("127.0.0.1:8080".parse().unwrap()));

        // Stand-in for the serve loop: stop as soon as draining starts
        let serve = handle.clone();
        let mut rx = serve.subscribe();
        let serve_loop = tokio::spawn(async move {
            let _ = rx.wait_for(|s| *s == ServerState::Draining).await;
            serve.set_state(ServerState::Stopped);
        });

        let outcome = handle.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Graceful);
        serve_loop.await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_outcome_when_grace_period_elapses() {
        let handle = ServerHandle::new();
        handle.claim().unwrap();
        handle.mark_listening("127.0.0.1:8080".parse().unwrap());

        // This serve loop only stops once it is told to force-close
        let serve = handle.clone();
        let mut rx = serve.subscribe();
        let serve_loop = tokio::spawn(async move {
            let _ = rx.wait_for(|s| *s == ServerState::Closing).await;
            serve.set_state(ServerState::Stopped);
        });

        let outcome = handle.shutdown(Duration::from_millis(50)).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Forced);
        serve_loop.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_addr_is_none_after_stop() {
        let handle = ServerHandle::new();
        handle.set_state(ServerState::Stopped);
        assert_eq!(handle.local_addr().await, None);
    }

    #[tokio::test]
    async fn test_manual_trigger_remembers_fire() {
        let trigger = ManualTrigger::new();
        trigger.clone().fire();
        tokio::time::timeout(Duration::from_secs(1), trigger.wait())
            .await
            .expect("trigger should already have fired");
    }

    #[tokio::test]
    async fn test_graceful_strategy_with_immediate_trigger() {
        let handle = ServerHandle::new();
        let strategy = ShutdownStrategy::graceful(Immediate, Duration::from_secs(5));
        strategy.run(handle.clone()).await.unwrap();
        assert_eq!(handle.state(), ServerState::Stopped);
    }
}
