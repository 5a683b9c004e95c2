//! HTTP server implementation.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::parser::HttpRequest;
use crate::server::config::ServerConfig;
use crate::server::connection::{serve_connection, ConnectionLimits};
use crate::server::error::Error;
use crate::server::response::{HttpResponse, StatusCode};
use crate::server::router::Router;
use crate::server::shutdown::{ServerHandle, ServerState, ShutdownStrategy};

/// First pause after a transient accept error; doubles up to the max.
const ACCEPT_PAUSE_MIN: Duration = Duration::from_millis(5);
const ACCEPT_PAUSE_MAX: Duration = Duration::from_secs(1);

// EMFILE, ENFILE, ENOMEM and ENOBUFS (WSAEMFILE, WSAENOBUFS on Windows)
#[cfg(target_os = "linux")]
const RESOURCE_EXHAUSTED: &[i32] = &[24, 23, 12, 105];
#[cfg(all(unix, not(target_os = "linux")))]
const RESOURCE_EXHAUSTED: &[i32] = &[24, 23, 12, 55];
#[cfg(windows)]
const RESOURCE_EXHAUSTED: &[i32] = &[10024, 10055];
#[cfg(not(any(unix, windows)))]
const RESOURCE_EXHAUSTED: &[i32] = &[];

/// An HTTP server.
///
/// Register routes with `&mut self`, then share the server (usually behind
/// an `Arc`) between the task that calls [`HttpServer::start`] and the one
/// that calls [`HttpServer::stop`].
pub struct HttpServer {
    /// The server configuration.
    pub config: ServerConfig,
    router: Router,
    handle: ServerHandle,
    shutdown_strategy: ShutdownStrategy,
}

/// Settles the lifecycle however `start` exits, so shutdown waiters are
/// never left hanging if the serving future is dropped.
struct ReleaseOnDrop(ServerHandle);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.set_active_connections(0);
        self.0.release();
    }
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    ///
    /// Without a configured shutdown strategy the server stops on SIGINT or
    /// SIGTERM, giving in-flight requests `config.grace_period` to finish.
    pub fn new(config: ServerConfig) -> Self {
        let shutdown_strategy = config
            .shutdown_strategy
            .clone()
            .unwrap_or_else(|| ShutdownStrategy::os_signals(config.grace_period));

        Self {
            config,
            router: Router::new(),
            handle: ServerHandle::new(),
            shutdown_strategy,
        }
    }

    /// Register a handler for an exact method and path.
    pub fn register<F, Fut>(&mut self, method: impl Into<String>, path: impl Into<String>, handler: F)
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, Error>> + Send + 'static,
    {
        self.router.register(method, path, handler);
    }

    pub fn get<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, Error>> + Send + 'static,
    {
        self.router.get(path, handler);
    }

    pub fn post<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, Error>> + Send + 'static,
    {
        self.router.post(path, handler);
    }

    pub fn delete<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, Error>> + Send + 'static,
    {
        self.router.delete(path, handler);
    }

    /// The route table.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// A handle for observing and shutting down this server.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Run the configured shutdown strategy and return its result.
    ///
    /// With the default strategy this blocks until the process receives
    /// SIGINT or SIGTERM.
    pub async fn stop(&self) -> Result<(), Error> {
        self.shutdown_strategy.run(self.handle.clone()).await
    }

    /// Display the registered endpoints.
    fn display_server_info(&self) {
        info!("Registered endpoints:");
        for key in self.router.routes() {
            info!("  {key}");
        }
    }

    /// Bind the listener and move to `Listening`.
    ///
    /// A failed bind leaves the state to the caller's [`ReleaseOnDrop`].
    async fn setup_listener(&self, addr: &str) -> Result<TcpListener, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        if !self.handle.mark_listening(local) {
            // Shutdown arrived while we were binding
            self.handle.set_state(ServerState::Stopped);
            return Err(Error::ServerClosed);
        }

        info!("Server listening on http://{local}");
        Ok(listener)
    }

    /// Start the server on `addr` and serve until it is shut down.
    ///
    /// `addr` is `host:port`, or `:port` for all interfaces. Returns
    /// [`Error::ServerClosed`] after a shutdown; any other error means the
    /// listener could not be bound or failed while accepting.
    pub async fn start(&self, addr: &str) -> Result<(), Error> {
        let addr = normalize_addr(addr)?;
        self.handle.claim()?;
        let _release = ReleaseOnDrop(self.handle.clone());

        self.display_server_info();
        let listener = self.setup_listener(&addr).await?;

        let router = Arc::new(self.router.clone());
        let limits = ConnectionLimits::from(&self.config);
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        let mut state = self.handle.subscribe();
        let mut tasks = JoinSet::new();

        let mut accept_pause: Option<Duration> = None;

        let accept_error = loop {
            tokio::select! {
                _ = wait_for_drain(&mut state) => {
                    info!("Shutting down server...");
                    break None;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked: {e}");
                        }
                    }
                    self.handle.set_active_connections(tasks.len());
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((socket, addr)) => {
                            accept_pause = None;
                            self.handle_new_connection(socket, addr, &semaphore, &router, limits, &mut tasks);
                            self.handle.set_active_connections(tasks.len());
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            let pause = next_accept_pause(accept_pause);
                            warn!("Error accepting connection: {e}; retrying in {pause:?}");
                            accept_pause = Some(pause);
                            tokio::time::sleep(pause).await;
                        }
                        Err(e) => {
                            error!("Error accepting connection, shutting down: {e}");
                            self.handle.set_state(ServerState::Draining);
                            break Some(e);
                        }
                    }
                }
            }
        };

        // Stop accepting before waiting on connections
        drop(listener);

        let deadline = accept_error.as_ref().map(|_| self.config.grace_period);
        Self::perform_shutdown(&mut tasks, &mut state, deadline).await;
        self.handle.set_state(ServerState::Stopped);

        match accept_error {
            Some(e) => Err(Error::IoError(e)),
            None => Err(Error::ServerClosed),
        }
    }

    /// Spawn a task for a newly accepted connection.
    fn handle_new_connection(
        &self,
        mut socket: TcpStream,
        addr: SocketAddr,
        semaphore: &Arc<Semaphore>,
        router: &Arc<Router>,
        limits: ConnectionLimits,
        tasks: &mut JoinSet<()>,
    ) {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Connection limit reached, rejecting connection from {addr}");
                tasks.spawn(async move {
                    let response = HttpResponse::text(
                        StatusCode::ServiceUnavailable,
                        "Server is at capacity, please try again later",
                    )
                    .with_header("Connection", "close");
                    let _ = socket.write_all(&response.to_bytes()).await;
                });
                return;
            }
        };

        let router = router.clone();
        let state = self.handle.subscribe();

        tasks.spawn(async move {
            // The permit is dropped when the task completes, releasing the semaphore slot
            let _permit = permit;
            debug!("Connection from: {addr}");

            if let Err(e) = serve_connection(&mut socket, &router, limits, state).await {
                error!("Error handling connection from {addr}: {e}");
            }
        });
    }

    /// Wait for connection tasks to finish.
    ///
    /// With a `deadline`, stragglers are aborted once it passes. Without one,
    /// they are aborted when the shutdown caller moves the state to
    /// `Closing`.
    async fn perform_shutdown(
        tasks: &mut JoinSet<()>,
        state: &mut watch::Receiver<ServerState>,
        deadline: Option<Duration>,
    ) {
        info!("Waiting for {len} active connections to complete...", len = tasks.len());

        let force_close = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => {
                    let _ = state
                        .wait_for(|s| matches!(s, ServerState::Closing | ServerState::Stopped))
                        .await;
                }
            }
        };
        tokio::pin!(force_close);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Err(e)) if e.is_panic() => error!("Connection task panicked: {e}"),
                    Some(_) => {}
                },

                _ = &mut force_close => {
                    warn!("Force-closing {len} connections still open", len = tasks.len());
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        info!("Server shutdown complete");
    }
}

async fn wait_for_drain(state: &mut watch::Receiver<ServerState>) {
    let _ = state
        .wait_for(|s| !matches!(s, ServerState::Starting | ServerState::Listening(_)))
        .await;
}

/// Accept errors that concern a single connection or a passing shortage of
/// resources, not the listener itself.
pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    if e.raw_os_error().is_some_and(|code| RESOURCE_EXHAUSTED.contains(&code)) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

pub(crate) fn next_accept_pause(previous: Option<Duration>) -> Duration {
    match previous {
        Some(pause) => (pause * 2).min(ACCEPT_PAUSE_MAX),
        None => ACCEPT_PAUSE_MIN,
    }
}

/// Turn a listen address into something `TcpListener::bind` accepts.
///
/// `:8080` means every interface.
pub(crate) fn normalize_addr(addr: &str) -> Result<String, Error> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(Error::InvalidAddress("empty address".to_string()));
    }
    if addr.starts_with(':') {
        return Ok(format!("0.0.0.0{addr}"));
    }
    if !addr.contains(':') {
        return Err(Error::InvalidAddress(format!("missing port in {addr}")));
    }
    Ok(addr.to_string())
}
