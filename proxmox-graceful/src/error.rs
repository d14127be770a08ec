use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors of the listener hand-over and shutdown machinery.
#[derive(Error, Debug)]
pub enum Error {
    /// Fresh bind failed (malformed address, address in use, permission denied).
    #[error("unable to listen on '{address}' - {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The inherited descriptor is missing or is not a listening socket.
    #[error("unable to use inherited listening socket (fd {fd}) - {reason}")]
    Inherit { fd: i32, reason: String },

    /// The listener cannot expose a descriptor which could be handed to a successor.
    #[error("listener type '{kind}' does not support reloading, only tcp listeners can be passed on")]
    UnsupportedListener { kind: &'static str },

    /// The successor process could not be started.
    #[error("failed to spawn successor process - {0}")]
    Spawn(#[source] io::Error),

    /// Connections were still open when the shutdown timeout elapsed and have been closed.
    #[error("{remaining} connection(s) force-closed after shutdown timeout of {timeout:?}")]
    DrainTimeout { remaining: usize, timeout: Duration },

    /// Closing the listening socket failed.
    #[error("failed to close listening socket - {0}")]
    Shutdown(#[source] io::Error),

    /// Subscribing to an OS signal failed.
    #[error("unable to subscribe to signal {signal} - {source}")]
    Signal {
        signal: crate::Signal,
        #[source]
        source: io::Error,
    },

    /// Unrecoverable accept error which terminated the accept loop.
    #[error("accept failed - {0}")]
    Accept(#[source] io::Error),

    #[error("server is not serving (state: {0})")]
    NotServing(crate::ServerState),
}

impl Error {
    /// Whether the error only reports a degraded shutdown rather than a failure to serve.
    pub fn is_shutdown_report(&self) -> bool {
        matches!(self, Error::DrainTimeout { .. } | Error::Shutdown(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let err = Error::UnsupportedListener { kind: "memory" };
        assert_eq!(
            err.to_string(),
            "listener type 'memory' does not support reloading, only tcp listeners can be passed on"
        );

        let err = Error::DrainTimeout {
            remaining: 2,
            timeout: Duration::from_millis(100),
        };
        assert_eq!(
            err.to_string(),
            "2 connection(s) force-closed after shutdown timeout of 100ms"
        );
        assert!(err.is_shutdown_report());
        assert!(!Error::NotServing(crate::ServerState::Created).is_shutdown_report());
    }
}
