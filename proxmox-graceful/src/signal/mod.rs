//! Per-server signal dispatch table.
//!
//! Handlers are registered before the server runs. Once running, a single dispatcher task
//! receives the subscribed signals and awaits the matching handler for each delivery, so
//! handlers never run concurrently with each other.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, SelectAll};
use futures::{FutureExt, StreamExt};

use crate::{Error, ServerHandle, ServerState};

mod defaults;
pub use defaults::default_signal_table;

/// Signals a handler can be registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
    User1,
    User2,
}

impl Signal {
    /// The conventional name, e.g. `SIGUSR2`.
    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Hangup => "SIGHUP",
            Signal::Quit => "SIGQUIT",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
        }
    }

    #[cfg(unix)]
    fn kind(self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;

        match self {
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Terminate => SignalKind::terminate(),
            Signal::Hangup => SignalKind::hangup(),
            Signal::Quit => SignalKind::quit(),
            Signal::User1 => SignalKind::user_defined1(),
            Signal::User2 => SignalKind::user_defined2(),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A registered signal handler, called with a handle to the server which received the signal.
pub type SignalHandler =
    Arc<dyn Fn(ServerHandle) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

/// Maps signals to handlers.
///
/// Registering a handler for a signal which already has one replaces the old handler. Signals
/// are subscribed in the order they were first registered.
#[derive(Clone, Default)]
pub struct SignalTable {
    handlers: HashMap<Signal, SignalHandler>,
    order: Vec<Signal>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for each of `signals`.
    pub fn register<F, R>(&mut self, handler: F, signals: &[Signal])
    where
        F: Fn(ServerHandle) -> R + Send + Sync + 'static,
        R: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let handler: SignalHandler = Arc::new(
            move |server: ServerHandle| -> BoxFuture<'static, Result<(), anyhow::Error>> {
                Box::pin(handler(server))
            },
        );

        for &signal in signals {
            if self.handlers.insert(signal, Arc::clone(&handler)).is_none() {
                self.order.push(signal);
            }
        }
    }

    pub fn get(&self, signal: Signal) -> Option<&SignalHandler> {
        self.handlers.get(&signal)
    }

    /// Registered signals in order of their first registration.
    pub fn signals(&self) -> &[Signal] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Subscribe to all registered signals.
    ///
    /// Signals delivered after this returns are queued for the dispatcher, even if it was not
    /// started yet.
    #[cfg(unix)]
    pub fn subscribe(self) -> Result<Dispatcher, Error> {
        use tokio_stream::wrappers::SignalStream;

        let mut deliveries = SelectAll::new();
        for &signal in &self.order {
            let stream = tokio::signal::unix::signal(signal.kind())
                .map_err(|source| Error::Signal { signal, source })?;
            deliveries.push(SignalStream::new(stream).map(move |()| signal).boxed());
        }

        Ok(Dispatcher {
            table: self,
            deliveries,
        })
    }

    #[cfg(not(unix))]
    pub fn subscribe(self) -> Result<Dispatcher, Error> {
        if !self.is_empty() {
            log::warn!("signal handling is not supported on this platform, ignoring handlers");
        }
        Ok(Dispatcher {
            table: self,
            deliveries: SelectAll::new(),
        })
    }
}

impl fmt::Debug for SignalTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalTable")
            .field("signals", &self.order)
            .finish_non_exhaustive()
    }
}

/// Receives subscribed signals and calls their handlers one at a time.
pub struct Dispatcher {
    table: SignalTable,
    deliveries: SelectAll<BoxStream<'static, Signal>>,
}

impl Dispatcher {
    /// The dispatch loop.
    ///
    /// Runs until the server is terminated. Termination is only noticed between deliveries, a
    /// running handler is always awaited to completion.
    pub async fn run(self, server: ServerHandle) {
        // the streams are not `Sync`, only the table may be borrowed across awaits
        let Dispatcher {
            table,
            mut deliveries,
        } = self;

        loop {
            let signal = tokio::select! {
                signal = deliveries.next() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
                _ = server.wait_for_state(ServerState::Terminated) => break,
            };

            table.dispatch(signal, &server).await;
        }
    }

    /// Call the handler for `signal`, see [`SignalTable::dispatch`].
    pub async fn dispatch(&self, signal: Signal, server: &ServerHandle) {
        self.table.dispatch(signal, server).await
    }
}

impl SignalTable {
    /// Call the handler for `signal`, logging errors and panics instead of propagating them.
    pub async fn dispatch(&self, signal: Signal, server: &ServerHandle) {
        let handler = match self.get(signal) {
            Some(handler) => Arc::clone(handler),
            None => return,
        };

        log::debug!("got signal {signal}");

        let server = server.clone();
        let result = AssertUnwindSafe(async move { handler(server).await })
            .catch_unwind()
            .await;

        let pid = std::process::id();
        match result {
            Ok(Ok(())) => (),
            Ok(Err(err)) => log::error!("handler for {signal} failed (pid {pid}) - {err:#}"),
            Err(_) => log::error!("handler for {signal} panicked (pid {pid})"),
        }
    }
}
