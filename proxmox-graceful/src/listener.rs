//! Acquiring the listening socket, either freshly bound or inherited from a predecessor.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use nix::fcntl::{fcntl, F_GETFD};
use nix::sys::socket::setsockopt;
use nix::sys::socket::sockopt::KeepAlive;
use tokio::net::{TcpListener, TcpStream};

use crate::fd::{change_cloexec, check_listening_socket};
use crate::handler::BoxedClientStream;
use crate::Error;

/// Descriptor number at which a successor finds the listening socket of its predecessor.
///
/// This is the first descriptor after stdin, stdout and stderr.
pub const INHERITED_LISTEN_FD: RawFd = 3;

static INHERITED_FD_TAKEN: AtomicBool = AtomicBool::new(false);

/// Per-connection socket setup done right after `accept()`.
#[derive(Clone, Debug)]
pub struct AcceptOptions {
    pub tcp_nodelay: bool,
    /// Keepalive idle time in seconds, `None` leaves the system default.
    pub tcp_keepalive_time: Option<u32>,
}

impl Default for AcceptOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive_time: Some(120),
        }
    }
}

impl AcceptOptions {
    fn setup_socket(&self, socket: &TcpStream, peer: SocketAddr) {
        if self.tcp_nodelay {
            if let Err(err) = socket.set_nodelay(true) {
                log::warn!("[{peer}] error while setting TCP_NODELAY on socket - {err}");
            }
        }

        if let Some(time) = self.tcp_keepalive_time {
            if let Err(err) = set_tcp_keepalive(&socket.as_fd(), time) {
                log::warn!("[{peer}] error while setting SO_KEEPALIVE on socket - {err}");
            }
        }
    }
}

fn set_tcp_keepalive<F: AsFd>(socket_fd: &F, tcp_keepalive_time: u32) -> nix::Result<()> {
    setsockopt(socket_fd, KeepAlive, &true)?;

    #[cfg(target_os = "linux")]
    setsockopt(
        socket_fd,
        nix::sys::socket::sockopt::TcpKeepIdle,
        &tcp_keepalive_time,
    )?;
    #[cfg(not(target_os = "linux"))]
    let _ = tcp_keepalive_time;

    Ok(())
}

/// A listening socket the server accepts connections from.
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next client connection.
    fn accept<'a>(
        &'a self,
        options: &'a AcceptOptions,
    ) -> BoxFuture<'a, io::Result<(BoxedClientStream, Option<SocketAddr>)>>;

    /// Short name of the listener type, used in log and error messages.
    fn kind(&self) -> &'static str;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// The descriptor to pass on to a successor process.
    ///
    /// Listeners returning `None` cannot be used for a reload.
    fn reload_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    /// Close the socket, reporting errors the implicit close on drop would swallow.
    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

impl Listener for TcpListener {
    fn accept<'a>(
        &'a self,
        options: &'a AcceptOptions,
    ) -> BoxFuture<'a, io::Result<(BoxedClientStream, Option<SocketAddr>)>> {
        Box::pin(async move {
            let (socket, peer) = TcpListener::accept(self).await?;
            options.setup_socket(&socket, peer);
            Ok((Box::new(socket) as BoxedClientStream, Some(peer)))
        })
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpListener::local_addr(self).ok()
    }

    fn reload_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let listener: OwnedFd = (*self).into_std()?.into();
        nix::unistd::close(listener.into_raw_fd())?;
        Ok(())
    }
}

/// Turn a go-style `":port"` address into one listening on all IPv4 interfaces.
pub fn normalize_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

/// Get the listening socket for this process.
///
/// A fresh socket is bound to `address` unless `inherited` is set, in which case the socket a
/// predecessor left at [`INHERITED_LISTEN_FD`] is used.
pub async fn acquire_listener(address: &str, inherited: bool) -> Result<TcpListener, Error> {
    if inherited {
        return inherit_listener();
    }

    TcpListener::bind(normalize_address(address))
        .await
        .map_err(|source| Error::Bind {
            address: address.to_string(),
            source,
        })
}

/// Take over the listening socket at [`INHERITED_LISTEN_FD`].
///
/// This can only succeed once per process, as the descriptor is owned by the returned listener.
/// Must be called from within a tokio runtime.
pub fn inherit_listener() -> Result<TcpListener, Error> {
    let inherit_error = |reason: String| Error::Inherit {
        fd: INHERITED_LISTEN_FD,
        reason,
    };

    if INHERITED_FD_TAKEN.load(Ordering::Acquire) {
        return Err(inherit_error("already taken over by this process".into()));
    }

    fcntl(INHERITED_LISTEN_FD, F_GETFD)
        .map_err(|err| inherit_error(format!("descriptor not open ({err})")))?;

    // validate before taking ownership, a foreign descriptor at this slot must stay open
    check_listening_socket(unsafe { BorrowedFd::borrow_raw(INHERITED_LISTEN_FD) })
        .map_err(|err| inherit_error(err.to_string()))?;

    if INHERITED_FD_TAKEN.swap(true, Ordering::AcqRel) {
        return Err(inherit_error("already taken over by this process".into()));
    }

    listener_from_fd(unsafe { OwnedFd::from_raw_fd(INHERITED_LISTEN_FD) })
}

/// Adopt an already listening socket.
///
/// The descriptor is marked close-on-exec again, since the successor only gets it explicitly
/// placed at [`INHERITED_LISTEN_FD`]. Must be called from within a tokio runtime.
pub fn listener_from_fd(fd: OwnedFd) -> Result<TcpListener, Error> {
    let raw = fd.as_raw_fd();
    let inherit_error = |reason: String| Error::Inherit { fd: raw, reason };

    check_listening_socket(fd.as_fd()).map_err(|err| inherit_error(err.to_string()))?;
    change_cloexec(raw, true).map_err(|err| inherit_error(format!("fcntl failed - {err}")))?;

    let listener = std::net::TcpListener::from(fd);
    listener
        .set_nonblocking(true)
        .map_err(|err| inherit_error(format!("unable to set non-blocking mode - {err}")))?;

    TcpListener::from_std(listener).map_err(|err| inherit_error(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fd::dup_cloexec;

    #[test]
    fn go_style_addresses() {
        assert_eq!(normalize_address(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_address("127.0.0.1:80"), "127.0.0.1:80");
        assert_eq!(normalize_address("[::1]:80"), "[::1]:80");
        assert_eq!(normalize_address("localhost:80"), "localhost:80");
    }

    #[tokio::test]
    async fn second_bind_fails() {
        let first = acquire_listener("127.0.0.1:0", false).await.unwrap();
        let address = first.local_addr().unwrap().to_string();

        match acquire_listener(&address, false).await {
            Err(Error::Bind { address: failed, .. }) => assert_eq!(failed, address),
            other => panic!("expected bind error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_address_is_bind_error() {
        let err = acquire_listener("not an address", false).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn adopt_duplicated_listener() {
        let original = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = original.local_addr().unwrap();

        let adopted = listener_from_fd(dup_cloexec(&original).unwrap()).unwrap();
        assert_eq!(adopted.local_addr().unwrap(), address);
        drop(original);

        let client = tokio::spawn(async move { TcpStream::connect(address).await });
        let (_socket, peer) = Listener::accept(&adopted, &AcceptOptions::default())
            .await
            .unwrap();
        let client = client.await.unwrap().unwrap();
        assert_eq!(peer, Some(client.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn adopt_rejects_non_listening_socket() {
        let datagram = std::os::unix::net::UnixDatagram::unbound().unwrap();
        let err = listener_from_fd(datagram.into()).unwrap_err();
        assert!(matches!(err, Error::Inherit { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn tcp_listener_is_reloadable_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        assert_eq!(Listener::kind(&listener), "tcp");
        assert!(listener.reload_fd().is_some());

        Box::new(listener).close().unwrap();
        assert!(TcpStream::connect(address).await.is_err());
    }
}
