//! Bounded waits on std sockets.
//!
//! std sockets can either block with a read timeout or not block at all, but a zero read timeout
//! is rejected. [`TimedSocket::with_wait`] hides that difference: a zero wait switches the socket
//! to non-blocking mode for the duration of one operation.

use std::{
    io::{self, Read},
    net::{TcpStream, UdpSocket},
    time::Duration,
};

use crate::reader::{Framing, Receive, Received};

pub(crate) trait TimedSocket {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Run `op` with the socket configured to wait at most `wait`.
    fn with_wait<T>(&self, wait: Duration, op: impl FnOnce(&Self) -> io::Result<T>) -> io::Result<T> {
        if wait.is_zero() {
            self.set_nonblocking(true)?;
            let result = op(self);
            self.set_nonblocking(false)?;
            result
        } else {
            self.set_read_timeout(Some(wait))?;
            op(self)
        }
    }
}

impl TimedSocket for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

impl TimedSocket for UdpSocket {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UdpSocket::set_nonblocking(self, nonblocking)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, timeout)
    }
}

/// Whether an error only says that the wait elapsed.
pub(crate) fn is_wait_elapsed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(unix)]
nix::ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);

/// Bytes queued on the socket, as reported by `FIONREAD`.
///
/// For UDP sockets on Linux this is the size of the next datagram.
#[cfg(unix)]
pub(crate) fn queued_bytes<S: std::os::fd::AsRawFd>(socket: &S) -> io::Result<usize> {
    let mut count: libc::c_int = 0;
    // SAFETY: the descriptor is borrowed from a live socket and `count` outlives the call.
    unsafe { fionread(socket.as_raw_fd(), &mut count) }?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// Queued byte counts are not available here; callers fall back to their defaults.
#[cfg(not(unix))]
pub(crate) fn queued_bytes<S>(_socket: &S) -> io::Result<usize> {
    Ok(0)
}

impl Receive for TcpStream {
    fn framing(&self) -> Framing {
        Framing::Stream
    }

    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Received> {
        let result = self.with_wait(wait, |mut stream| stream.read(buf));
        match result {
            Ok(0) => Ok(Received::Closed),
            Ok(n) => Ok(Received::Data(n)),
            Err(err) if is_wait_elapsed(&err) => Ok(Received::TimedOut),
            Err(err) => Err(err),
        }
    }

    fn bytes_ready(&self) -> usize {
        queued_bytes(self).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, net::TcpListener};

    use super::*;

    #[test]
    fn test_stream_poll_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(
            client.raw_receive(&mut buf, Duration::ZERO).unwrap(),
            Received::TimedOut
        );

        server.write_all(b"abc").unwrap();
        drop(server);
        let got = client.raw_receive(&mut buf, Duration::from_secs(2)).unwrap();
        assert_eq!(got, Received::Data(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(
            client.raw_receive(&mut buf, Duration::from_secs(2)).unwrap(),
            Received::Closed
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_queued_bytes_counts_pending_data() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert_eq!(queued_bytes(&receiver).unwrap(), 0);

        sender.send_to(b"hello", receiver.local_addr().unwrap()).unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut head = [0u8; 5];
        receiver.peek_from(&mut head).unwrap();
        assert_eq!(queued_bytes(&receiver).unwrap(), 5);
    }
}
