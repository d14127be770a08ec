//! Handlers installed when a server runs without any registered signal handler.

use super::SignalTable;

#[cfg(unix)]
use super::Signal;
#[cfg(unix)]
use crate::ServerHandle;

/// `SIGINT` and `SIGTERM` stop the server, `SIGUSR2` reloads it.
#[cfg(unix)]
pub fn default_signal_table() -> SignalTable {
    let mut table = SignalTable::new();
    table.register(shutdown, &[Signal::Interrupt, Signal::Terminate]);
    table.register(reload, &[Signal::User2]);
    table
}

/// Without OS signals there are no defaults, handlers have to be registered explicitly.
#[cfg(not(unix))]
pub fn default_signal_table() -> SignalTable {
    log::warn!("no default signal handlers on this platform");
    SignalTable::new()
}

#[cfg(unix)]
async fn shutdown(server: ServerHandle) -> Result<(), anyhow::Error> {
    log::info!("server is shutting down, pid {}", std::process::id());
    server.stop().await?;
    Ok(())
}

// reload failures are only logged, the server keeps running
#[cfg(unix)]
async fn reload(server: ServerHandle) -> Result<(), anyhow::Error> {
    let pid = std::process::id();
    match server.reload().await {
        Ok(()) => log::info!("server reloaded, pid {pid}"),
        Err(err) => log::error!("server reload, pid {pid} - {err}"),
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let table = default_signal_table();
        assert_eq!(
            table.signals(),
            &[Signal::Interrupt, Signal::Terminate, Signal::User2]
        );
        assert!(table.get(Signal::Hangup).is_none());
    }
}
