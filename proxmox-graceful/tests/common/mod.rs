#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

use proxmox_graceful::listener::AcceptOptions;
use proxmox_graceful::{BoxedClientStream, Listener, ServerConfig};

/// In-memory listener, which has no descriptor to pass on and therefore cannot be reloaded.
pub struct MemoryListener {
    incoming: Mutex<mpsc::Receiver<DuplexStream>>,
}

pub struct MemoryConnector {
    sender: mpsc::Sender<DuplexStream>,
}

pub fn memory_listener() -> (MemoryListener, MemoryConnector) {
    let (sender, receiver) = mpsc::channel(16);
    (
        MemoryListener {
            incoming: Mutex::new(receiver),
        },
        MemoryConnector { sender },
    )
}

impl MemoryConnector {
    pub async fn connect(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(1024);
        self.sender
            .send(server)
            .await
            .expect("listener dropped before connecting");
        client
    }
}

impl Listener for MemoryListener {
    fn accept<'a>(
        &'a self,
        _options: &'a AcceptOptions,
    ) -> BoxFuture<'a, io::Result<(BoxedClientStream, Option<SocketAddr>)>> {
        Box::pin(async move {
            match self.incoming.lock().await.recv().await {
                Some(stream) => Ok((Box::new(stream) as BoxedClientStream, None)),
                None => std::future::pending().await,
            }
        })
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

pub fn config(shutdown_timeout: Duration) -> ServerConfig {
    ServerConfig::new()
        .address("127.0.0.1:0")
        .shutdown_timeout(shutdown_timeout)
}

/// Poll `check` until it returns true, failing the test after a few seconds.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
