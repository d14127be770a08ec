//! Graceful restart for daemons serving a single listening socket.
//!
//! A [`ServerProcess`] accepts connections and hands them to a [`ConnectionHandler`]. Signals
//! are dispatched to handlers registered per server, by default `SIGINT`/`SIGTERM` stop the
//! server and `SIGUSR2` reloads it:
//!
//! * **stop**: stop accepting, wait up to the shutdown timeout for open connections, close the
//!   rest.
//! * **reload**: re-execute the binary with the listening socket passed on as file descriptor
//!   3 and `--graceful` appended to the arguments, then stop. The new instance finds the
//!   `--graceful` flag and takes over the socket instead of binding a new one, so pending
//!   connections are never refused.

#![deny(unsafe_op_in_unsafe_fn)]

mod config;
mod error;
pub mod fd;
mod handler;
pub mod http;
pub mod listener;
mod server;
pub mod signal;

pub use config::ServerConfig;
pub use error::Error;
pub use handler::{BoxedClientStream, ClientStream, Connection, ConnectionHandler, ShutdownSignal};
pub use listener::{acquire_listener, Listener, INHERITED_LISTEN_FD};
pub use server::{is_successor, successor_args, ServerHandle, ServerProcess, ServerState};
pub use server::GRACEFUL_FLAG;
pub use signal::{Signal, SignalTable};
