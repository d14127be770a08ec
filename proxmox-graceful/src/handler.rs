//! The per-connection handler seam.

use std::future::Future;
use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

/// A byte stream of an accepted client connection.
pub trait ClientStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ClientStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedClientStream = Box<dyn ClientStream>;

/// Notifies connections that the server started draining.
///
/// Long-lived connections should finish their current work and close once this fires, anything
/// still open when the shutdown timeout elapses is closed forcefully.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub(crate) fn new(receiver: watch::Receiver<bool>) -> Self {
        Self { receiver }
    }

    /// Returns true once a shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        *self.receiver.borrow()
    }

    /// This future finishes once a shutdown has been requested.
    pub async fn wait(&self) {
        let _ = { self.receiver.clone() }.wait_for(|&v| v).await;
    }
}

/// An accepted connection as passed to a [`ConnectionHandler`].
pub struct Connection {
    pub stream: BoxedClientStream,
    pub peer: Option<SocketAddr>,
    pub shutdown: ShutdownSignal,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("shutdown", &self.shutdown.is_requested())
            .finish_non_exhaustive()
    }
}

/// Serves a single accepted connection.
///
/// The returned future must complete once the connection is done, this is what the server
/// waits for while draining.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, conn: Connection) -> BoxFuture<'static, Result<(), anyhow::Error>>;
}

impl<F, R> ConnectionHandler for F
where
    F: Fn(Connection) -> R + Send + Sync + 'static,
    R: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    fn handle(&self, conn: Connection) -> BoxFuture<'static, Result<(), anyhow::Error>> {
        Box::pin((self)(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_fires_once_requested() {
        let (sender, receiver) = watch::channel(false);
        let signal = ShutdownSignal::new(receiver);
        assert!(!signal.is_requested());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });

        sender.send(true).unwrap();
        waiter.await.unwrap();
        assert!(signal.is_requested());
    }
}
