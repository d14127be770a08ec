//! The serving loop with graceful stop and reload.
//!
//! A reload re-executes the running binary with the listening socket placed at
//! [`INHERITED_LISTEN_FD`] and the [`GRACEFUL_FLAG`] appended to its arguments. As soon as the
//! successor was spawned, this process stops accepting and drains its connections, while the
//! successor keeps accepting on the very same socket, so no pending connection is lost.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::fd::{dup_cloexec, place_for_exec};
use crate::handler::{BoxedClientStream, Connection, ConnectionHandler, ShutdownSignal};
use crate::listener::{acquire_listener, AcceptOptions, Listener, INHERITED_LISTEN_FD};
use crate::signal::{default_signal_table, Signal, SignalTable};
use crate::{Error, ServerConfig};

/// Argument marking a process as the successor of a reloaded one.
pub const GRACEFUL_FLAG: &str = "--graceful";

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Returns true if `args` (including the program name) carry the [`GRACEFUL_FLAG`].
pub fn is_successor<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter()
        .skip(1)
        .any(|arg| arg.as_ref() == OsStr::new(GRACEFUL_FLAG))
}

/// The argument list for a successor: `args` with the [`GRACEFUL_FLAG`] appended once.
pub fn successor_args(mut args: Vec<OsString>) -> Vec<OsString> {
    if !is_successor(&args) {
        args.push(GRACEFUL_FLAG.into());
    }
    args
}

/// Lifecycle of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Created,
    Serving,
    Draining,
    Terminated,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerState::Created => "created",
            ServerState::Serving => "serving",
            ServerState::Draining => "draining",
            ServerState::Terminated => "terminated",
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// State shared between the accept loop, connections, signal handlers and server handles.
struct Control {
    shutdown_timeout: Duration,
    configured_executable: Option<PathBuf>,

    state: watch::Sender<ServerState>,
    shutdown: watch::Sender<bool>,
    drain_deadline: OnceLock<Instant>,
    // outcome of the drain, for the `stop` call which started it
    drain_result: Mutex<Option<Result<(), Error>>>,

    connections: TaskTracker,
    force_close: CancellationToken,

    inherited: OnceLock<bool>,
    executable: OnceLock<PathBuf>,
    listener_kind: OnceLock<&'static str>,
    local_addr: OnceLock<Option<SocketAddr>>,

    // duplicate of the listening socket, kept until the drain starts
    reload_fd: Mutex<Option<OwnedFd>>,
    reloading: tokio::sync::Mutex<()>,
}

impl Control {
    fn new(config: &ServerConfig) -> Self {
        Self {
            shutdown_timeout: config.shutdown_timeout,
            configured_executable: config.executable.clone(),
            state: watch::channel(ServerState::Created).0,
            shutdown: watch::channel(false).0,
            drain_deadline: OnceLock::new(),
            drain_result: Mutex::new(None),
            connections: TaskTracker::new(),
            force_close: CancellationToken::new(),
            inherited: OnceLock::new(),
            executable: OnceLock::new(),
            listener_kind: OnceLock::new(),
            local_addr: OnceLock::new(),
            reload_fd: Mutex::new(None),
            reloading: tokio::sync::Mutex::new(()),
        }
    }

    fn attach_listener(&self, listener: &dyn Listener) -> Result<(), Error> {
        let _ = self.listener_kind.set(listener.kind());
        let _ = self.local_addr.set(listener.local_addr());

        if let Some(fd) = listener.reload_fd() {
            let fd = dup_cloexec(&fd).map_err(|err| Error::Inherit {
                fd: fd.as_raw_fd(),
                reason: format!("unable to duplicate listening socket - {err}"),
            })?;
            *lock(&self.reload_fd) = Some(fd);
        }

        let executable = match &self.configured_executable {
            Some(executable) => Some(executable.clone()),
            // resolved now, the binary may be replaced on disk before a reload
            None => match std::env::current_exe() {
                Ok(executable) => Some(executable),
                Err(err) => {
                    log::warn!("unable to determine own executable, reload will fail - {err}");
                    None
                }
            },
        };
        if let Some(executable) = executable {
            let _ = self.executable.set(executable);
        }

        Ok(())
    }

    /// Switch from serving to draining.
    ///
    /// Returns `Ok(false)` if a drain is already running or done, and the current state if the
    /// server never started serving.
    fn begin_drain(&self) -> Result<bool, ServerState> {
        let mut previous = ServerState::Created;
        let begin = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == ServerState::Serving {
                *state = ServerState::Draining;
                true
            } else {
                false
            }
        });

        if !begin {
            return match previous {
                ServerState::Draining | ServerState::Terminated => Ok(false),
                state => Err(state),
            };
        }

        let timeout = self.shutdown_timeout;
        let _ = self.drain_deadline.set(Instant::now() + timeout);
        log::info!("stopping server, waiting up to {timeout:?} for open connections");

        // the listener must not stay open in this process through the duplicate
        drop(lock(&self.reload_fd).take());
        self.shutdown.send_replace(true);

        Ok(true)
    }

    /// Wait for open connections until the drain deadline, then close the remaining ones.
    async fn drain(&self, close_result: io::Result<()>) -> Result<(), Error> {
        let timeout = self.shutdown_timeout;
        let deadline = match self.drain_deadline.get() {
            Some(deadline) => *deadline,
            None => Instant::now() + timeout,
        };

        self.connections.close();

        let mut result = Ok(());
        if tokio::time::timeout_at(deadline, self.connections.wait())
            .await
            .is_err()
        {
            let remaining = self.connections.len();
            self.force_close.cancel();
            self.connections.wait().await;
            result = Err(Error::DrainTimeout { remaining, timeout });
        }

        if let Err(err) = close_result {
            match result {
                Ok(()) => result = Err(Error::Shutdown(err)),
                Err(_) => log::error!("failed to close listening socket - {err}"),
            }
        }

        result
    }

    fn spawn_connection(
        &self,
        handler: &Arc<dyn ConnectionHandler>,
        stream: BoxedClientStream,
        peer: Option<SocketAddr>,
    ) {
        let peer_name = match peer {
            Some(peer) => peer.to_string(),
            None => "unknown peer".to_string(),
        };

        let conn = Connection {
            stream,
            peer,
            shutdown: ShutdownSignal::new(self.shutdown.subscribe()),
        };

        let future = handler.handle(conn);
        let force_close = self.force_close.clone();

        self.connections.spawn(async move {
            tokio::select! {
                res = future => if let Err(err) = res {
                    log::warn!("[{peer_name}] connection error - {err:#}");
                },
                _ = force_close.cancelled() => {
                    log::warn!("[{peer_name}] closing connection, shutdown timeout reached");
                }
            }
        });
    }

    async fn accept_loop(
        &self,
        listener: &dyn Listener,
        handler: &Arc<dyn ConnectionHandler>,
        options: &AcceptOptions,
    ) -> Result<(), Error> {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff: Option<Duration> = None;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = wait_for_true(&mut shutdown) => return Ok(()),
                res = listener.accept(options) => res,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => {
                    backoff = None;
                    accepted
                }
                Err(err) => match classify_accept_error(&err) {
                    AcceptError::Fatal => return Err(Error::Accept(err)),
                    AcceptError::Exhausted => {
                        let delay = match backoff {
                            Some(delay) => (delay * 2).min(ACCEPT_BACKOFF_MAX),
                            None => ACCEPT_BACKOFF_MIN,
                        };
                        backoff = Some(delay);
                        log::error!("accept error - {err}, retrying in {delay:?}");

                        tokio::select! {
                            _ = wait_for_true(&mut shutdown) => return Ok(()),
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                    AcceptError::Connection => {
                        log::debug!("failed to accept connection - {err}");
                        continue;
                    }
                },
            };

            self.spawn_connection(handler, stream, peer);
        }
    }
}

async fn wait_for_true(receiver: &mut watch::Receiver<bool>) {
    let _ = receiver.wait_for(|&v| v).await;
}

enum AcceptError {
    /// The listening socket itself is unusable.
    Fatal,
    /// Out of descriptors or memory, retry after a delay.
    Exhausted,
    /// Only the connection to accept failed.
    Connection,
}

fn classify_accept_error(err: &io::Error) -> AcceptError {
    let errno = match err.raw_os_error() {
        Some(errno) => errno,
        None => return AcceptError::Connection,
    };

    if [Errno::EBADF, Errno::EINVAL, Errno::ENOTSOCK, Errno::EFAULT]
        .iter()
        .any(|&fatal| fatal as i32 == errno)
    {
        AcceptError::Fatal
    } else if [Errno::EMFILE, Errno::ENFILE, Errno::ENOBUFS, Errno::ENOMEM]
        .iter()
        .any(|&exhausted| exhausted as i32 == errno)
    {
        AcceptError::Exhausted
    } else {
        AcceptError::Connection
    }
}

/// Spawn `executable` with our own arguments plus the [`GRACEFUL_FLAG`], passing `listen_fd` as
/// [`INHERITED_LISTEN_FD`]. Standard input and output streams are shared with the successor.
fn spawn_successor(executable: &Path, listen_fd: RawFd) -> Result<Child, Error> {
    let args = successor_args(std::env::args_os().collect());

    let mut command = Command::new(executable);
    command
        .args(args.iter().skip(1))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    unsafe {
        command.pre_exec(move || place_for_exec(listen_fd, INHERITED_LISTEN_FD));
    }

    command.spawn().map_err(Error::Spawn)
}

/// A server accepting connections on a single listening socket until it is stopped or
/// reloaded.
///
/// ```no_run
/// # use proxmox_graceful::{Connection, ServerProcess};
/// # async fn serve() -> Result<(), proxmox_graceful::Error> {
/// let server = ServerProcess::with_handler(|conn: Connection| async move {
///     drop(conn);
///     Ok::<_, anyhow::Error>(())
/// });
/// // SIGINT/SIGTERM stop the server, SIGUSR2 hands the socket over to a new instance
/// server.run().await
/// # }
/// ```
pub struct ServerProcess {
    address: String,
    accept_options: AcceptOptions,
    handler: Arc<dyn ConnectionHandler>,
    listener: Option<Box<dyn Listener>>,
    signals: SignalTable,
    graceful: Option<bool>,
    control: Arc<Control>,
}

impl ServerProcess {
    pub fn new<H: ConnectionHandler>(config: ServerConfig, handler: H) -> Self {
        Self {
            address: config.address.clone(),
            accept_options: config.accept_options(),
            handler: Arc::new(handler),
            listener: None,
            signals: SignalTable::new(),
            graceful: None,
            control: Arc::new(Control::new(&config)),
        }
    }

    /// A server with the default configuration.
    pub fn with_handler<H: ConnectionHandler>(handler: H) -> Self {
        Self::new(ServerConfig::default(), handler)
    }

    /// A server using an already set up listener instead of acquiring one on [`run`].
    ///
    /// The configured address is not used in this case.
    ///
    /// [`run`]: ServerProcess::run
    pub fn with_listener<L, H>(config: ServerConfig, listener: L, handler: H) -> Self
    where
        L: Listener,
        H: ConnectionHandler,
    {
        let mut this = Self::new(config, handler);
        this.listener = Some(Box::new(listener));
        this
    }

    /// Register `handler` for `signals`, replacing earlier registrations for the same signals.
    ///
    /// If no handler is registered at all, [`default_signal_table`] is used.
    pub fn handle_signal<F, R>(&mut self, handler: F, signals: &[Signal]) -> &mut Self
    where
        F: Fn(ServerHandle) -> R + Send + Sync + 'static,
        R: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.signals.register(handler, signals);
        self
    }

    /// Override whether the listening socket is inherited, instead of looking for the
    /// [`GRACEFUL_FLAG`] in the process arguments.
    pub fn graceful(mut self, inherited: bool) -> Self {
        self.graceful = Some(inherited);
        self
    }

    pub fn signal_table(&self) -> &SignalTable {
        &self.signals
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Serve until stopped.
    ///
    /// Returns once the server was stopped and drained, or with the error which made it
    /// impossible to keep accepting connections. Errors of the drain itself are logged and
    /// reported to the caller of [`ServerHandle::stop`] which started it.
    pub async fn run(self) -> Result<(), Error> {
        let ServerProcess {
            address,
            accept_options,
            handler,
            listener,
            signals,
            graceful,
            control,
        } = self;

        let inherited = *control
            .inherited
            .get_or_init(|| graceful.unwrap_or_else(|| is_successor(std::env::args_os())));

        let listener: Box<dyn Listener> = match listener {
            Some(listener) => listener,
            None => Box::new(acquire_listener(&address, inherited).await?),
        };
        control.attach_listener(listener.as_ref())?;

        let signals = if signals.is_empty() {
            default_signal_table()
        } else {
            signals
        };
        let dispatcher = signals.subscribe()?;

        let dispatch_task = tokio::spawn(dispatcher.run(ServerHandle {
            control: Arc::clone(&control),
        }));

        control.state.send_replace(ServerState::Serving);
        match listener.local_addr() {
            Some(addr) => log::info!(
                "server is running at pid {} on {addr}{}",
                std::process::id(),
                if inherited { " (inherited socket)" } else { "" },
            ),
            None => log::info!("server is running at pid {}", std::process::id()),
        }

        let result = control
            .accept_loop(listener.as_ref(), &handler, &accept_options)
            .await;

        let close_result = listener.close();

        if let Err(err) = &result {
            log::error!("stopped accepting connections - {err}");
            if let Err(state) = control.begin_drain() {
                log::error!("unable to drain connections in state {state}");
            }
        }

        // drained here rather than in `stop`, whose future may be dropped at any time
        let drained = control.drain(close_result).await;
        if let Err(err) = &drained {
            log::warn!("shutdown incomplete - {err}");
        }
        *lock(&control.drain_result) = Some(drained);
        control.state.send_replace(ServerState::Terminated);

        if let Err(err) = dispatch_task.await {
            log::error!("signal dispatcher failed - {err}");
        }

        log::info!("server at pid {} shut down", std::process::id());
        result
    }
}

/// Controls a [`ServerProcess`] from signal handlers or other tasks.
#[derive(Clone)]
pub struct ServerHandle {
    control: Arc<Control>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        *self.control.state.borrow()
    }

    /// Wait until the server reached at least `state`.
    pub async fn wait_for_state(&self, state: ServerState) {
        let _ = self
            .control
            .state
            .subscribe()
            .wait_for(|current| *current >= state)
            .await;
    }

    /// Whether the listening socket was inherited from a predecessor, `None` before running.
    pub fn is_inherited(&self) -> Option<bool> {
        self.control.inherited.get().copied()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.control.local_addr.get().copied().flatten()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.control.shutdown_timeout
    }

    /// Stop accepting connections and wait for the open ones to finish.
    ///
    /// Connections still open after the shutdown timeout are closed and reported as
    /// [`Error::DrainTimeout`]. Stopping a server which is already shutting down waits for that
    /// shutdown and returns `Ok`.
    ///
    /// The drain itself is driven by [`ServerProcess::run`], dropping this future does not
    /// interrupt it.
    pub async fn stop(&self) -> Result<(), Error> {
        let started = self.control.begin_drain().map_err(Error::NotServing)?;

        self.wait_for_state(ServerState::Terminated).await;

        if started {
            lock(&self.control.drain_result).take().unwrap_or(Ok(()))
        } else {
            Ok(())
        }
    }

    /// Hand the listening socket over to a new instance of this program, then [`stop`].
    ///
    /// If the successor cannot be spawned, this server keeps serving and the error is returned.
    ///
    /// [`stop`]: ServerHandle::stop
    pub async fn reload(&self) -> Result<(), Error> {
        let control = &self.control;
        let _reloading = control.reloading.lock().await;

        let child = {
            // checked under the lock, a concurrent stop drops the descriptor after the state change
            let reload_fd = lock(&control.reload_fd);
            let state = self.state();
            if state != ServerState::Serving {
                return Err(Error::NotServing(state));
            }

            let fd = reload_fd.as_ref().ok_or_else(|| Error::UnsupportedListener {
                kind: control.listener_kind.get().copied().unwrap_or("unknown"),
            })?;

            let executable = control.executable.get().ok_or_else(|| {
                Error::Spawn(io::Error::new(
                    io::ErrorKind::NotFound,
                    "executable of this process is unknown",
                ))
            })?;

            spawn_successor(executable, fd.as_raw_fd())?
        };

        log::info!(
            "started successor process {} for pid {}",
            child.id(),
            std::process::id()
        );

        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_args(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn successor_marker() {
        assert!(!is_successor(["server", "--port", "80"]));
        assert!(is_successor(["server", "--port", "80", GRACEFUL_FLAG]));
        // the program name is not an argument
        assert!(!is_successor([GRACEFUL_FLAG]));
    }

    #[test]
    fn marker_is_appended_once() {
        let first = successor_args(os_args(&["server", "-v"]));
        assert_eq!(first, os_args(&["server", "-v", GRACEFUL_FLAG]));

        let second = successor_args(first.clone());
        assert_eq!(second, first);
    }

    #[test]
    fn accept_error_classes() {
        let fatal = io::Error::from_raw_os_error(Errno::EBADF as i32);
        assert!(matches!(classify_accept_error(&fatal), AcceptError::Fatal));

        let exhausted = io::Error::from_raw_os_error(Errno::EMFILE as i32);
        assert!(matches!(
            classify_accept_error(&exhausted),
            AcceptError::Exhausted
        ));

        let aborted = io::Error::from_raw_os_error(Errno::ECONNABORTED as i32);
        assert!(matches!(
            classify_accept_error(&aborted),
            AcceptError::Connection
        ));
        let custom = io::Error::new(io::ErrorKind::Other, "no errno");
        assert!(matches!(
            classify_accept_error(&custom),
            AcceptError::Connection
        ));
    }

    #[test]
    fn states_are_ordered() {
        assert!(ServerState::Created < ServerState::Serving);
        assert!(ServerState::Serving < ServerState::Draining);
        assert!(ServerState::Draining < ServerState::Terminated);
        assert_eq!(ServerState::Draining.to_string(), "draining");
    }

    #[tokio::test]
    async fn stop_before_run_fails() {
        let server = ServerProcess::with_handler(|_conn: Connection| async {
            Ok::<_, anyhow::Error>(())
        });
        let handle = server.handle();

        assert!(matches!(
            handle.stop().await,
            Err(Error::NotServing(ServerState::Created))
        ));
        assert!(matches!(
            handle.reload().await,
            Err(Error::NotServing(ServerState::Created))
        ));
        assert_eq!(handle.is_inherited(), None);
    }

    #[tokio::test]
    async fn reload_racing_stop_is_not_serving() {
        let config = ServerConfig::new()
            .address("127.0.0.1:0")
            .executable("/nonexistent/graceful-successor");
        let server = ServerProcess::new(config, |_conn: Connection| async {
            Ok::<_, anyhow::Error>(())
        })
        .graceful(false);
        let handle = server.handle();
        let run = tokio::spawn(server.run());
        handle.wait_for_state(ServerState::Serving).await;

        // stop is polled first and drops the listener duplicate before reload looks at it
        let (stopped, reloaded) = tokio::join!(handle.stop(), handle.reload());
        stopped.unwrap();
        assert!(
            matches!(reloaded, Err(Error::NotServing(ServerState::Draining))),
            "{reloaded:?}"
        );

        run.await.unwrap().unwrap();
    }
}
