//! Raw file descriptor helpers for passing a listening socket to a successor.

use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, F_GETFD, F_SETFD};
use nix::sys::socket::{getsockopt, sockopt, SockType};

/// Change the `O_CLOEXEC` flag of an existing file descriptor.
pub fn change_cloexec(fd: RawFd, on: bool) -> Result<(), nix::Error> {
    let mut flags = FdFlag::from_bits_retain(fcntl(fd, F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, on);
    fcntl(fd, F_SETFD(flags))?;
    Ok(())
}

/// Duplicate a file descriptor with `O_CLOEXEC` set on the copy.
///
/// The copy does not leak into child processes unless explicitly placed there.
pub fn dup_cloexec<F: AsFd>(fd: &F) -> Result<OwnedFd, nix::Error> {
    use std::os::unix::io::AsRawFd;

    let raw = fcntl(fd.as_fd().as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(0))?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Make sure `fd` refers to an open stream socket in listening state.
///
/// The listening state can only be queried on Linux, elsewhere only the socket type is checked.
pub fn check_listening_socket(fd: BorrowedFd<'_>) -> Result<(), io::Error> {
    let sock_type = getsockopt(&fd, sockopt::SockType).map_err(io::Error::from)?;
    if sock_type != SockType::Stream {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a stream socket ({sock_type:?})"),
        ));
    }

    #[cfg(target_os = "linux")]
    if !getsockopt(&fd, sockopt::AcceptConn).map_err(io::Error::from)? {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket is not listening",
        ));
    }

    Ok(())
}

/// Place `fd` at descriptor number `target` for an `exec`, clearing `O_CLOEXEC` on it.
///
/// Only async-signal-safe calls are made, so this may run between `fork` and `exec`.
pub(crate) fn place_for_exec(fd: RawFd, target: RawFd) -> Result<(), io::Error> {
    if fd == target {
        // dup2 on identical descriptors is a no-op and would keep the flag
        change_cloexec(fd, false)?;
    } else {
        nix::unistd::dup2(fd, target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixDatagram;

    fn is_cloexec(fd: RawFd) -> bool {
        FdFlag::from_bits_retain(fcntl(fd, F_GETFD).unwrap()).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn cloexec_flag_toggles() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();

        change_cloexec(fd, false).unwrap();
        assert!(!is_cloexec(fd));
        change_cloexec(fd, true).unwrap();
        assert!(is_cloexec(fd));
    }

    #[test]
    fn duplicate_is_cloexec() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        change_cloexec(listener.as_raw_fd(), false).unwrap();

        let dup = dup_cloexec(&listener).unwrap();
        assert_ne!(dup.as_raw_fd(), listener.as_raw_fd());
        assert!(is_cloexec(dup.as_raw_fd()));
    }

    #[test]
    fn listening_socket_check() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        check_listening_socket(listener.as_fd()).unwrap();

        let datagram = UnixDatagram::unbound().unwrap();
        assert!(check_listening_socket(datagram.as_fd()).is_err());

        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        #[cfg(target_os = "linux")]
        assert!(check_listening_socket(stream.as_fd()).is_err());
        drop(stream);

        let file = std::fs::File::open("/dev/null").unwrap();
        assert!(check_listening_socket(file.as_fd()).is_err());
    }
}
