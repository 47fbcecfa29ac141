//! InstrumentLink: timeout-bounded reads from your (scientific) equipment in Rust
//!
//! Instruments talk over very different links: TCP sockets, UDP datagrams, serial ports. The
//! InstrumentLink library gives all of them one handle contract, [`DeviceHandle`], and one read
//! loop, [`TimedReader`], that turns a single bounded receive into "read exactly N bytes or time
//! out". The read loop:
//!
//! - never issues an unbounded wait, so a read can always be interrupted through the handle's
//!   [`CancelToken`] within one wait slice,
//! - treats a timeout or an orderly close as a short read, not as an error,
//! - keeps the unread rest of a datagram in a [`PendingBuffer`] and hands it out, in order, on the
//!   next read.
//!
//! # Currently implemented links are:
//! - TCP/IP client ([`TcpClient`]) and single-client server ([`TcpServer`])
//! - UDP, including broadcast and IPv4 multicast ([`UdpPort`])
//! - Serial (blocking) using the [`serialport`] crate ([`SerialDevice`], feature `serial`)
//! - A scripted loopback ([`LoopbackDevice`]) for testing drivers without hardware
//!
//! # Example
//!
//! ```no_run
//! use instrumentlink::{DeviceHandle, TcpClient, TcpClientConfig, Timeout};
//!
//! let mut inst = TcpClient::open("192.168.10.1:8000", TcpClientConfig::default()).unwrap();
//! inst.write_line("*IDN?").unwrap();
//! let mut buf = [0u8; 64];
//! let n = inst.read_with_timeout(&mut buf, Timeout::from_secs_f64(0.5).unwrap()).unwrap();
//! println!("{:?}", &buf[..n]);
//! ```
//!
//! # License
//!
//!
//! Licensed under either of
//!
//! - Apache License, Version 2.0 ([LICENSE-APACHE](http://www.apache.org/licenses/LICENSE-2.0))
//! - MIT license ([LICENSE-MIT](http://opensource.org/licenses/MIT))
//!
//! at your option.
//!
//! # Contribution
//!
//! Unless you explicitly state otherwise, any contribution intentionally submitted
//! for inclusion in the work by you, as defined in the Apache-2.0 license, shall be
//! dual licensed as above, without any additional terms or conditions.

#![warn(missing_docs)]

mod interrupt;
mod loopback;
mod pending;
mod properties;
mod reader;
mod runtime;
#[cfg(feature = "serial")]
mod serial;
mod socket;
mod tcp_client;
mod tcp_server;
mod timeout;
mod udp;

pub use interrupt::{CancelToken, Interrupt, NeverInterrupt};
pub use loopback::{LoopbackDevice, Script, ScriptEvent};
pub use pending::{DEFAULT_PENDING_CAPACITY, PENDING_BUCKET, PendingBuffer};
pub use properties::{Access, Properties, Property, PropertyValue};
pub use reader::{Framing, Receive, Received, TimedReader};
pub use runtime::{HandleToken, Runtime, runtime};
#[cfg(feature = "serial")]
pub use serial::{SerialConfig, SerialDevice};
pub use tcp_client::{TcpClient, TcpClientConfig};
pub use tcp_server::{TcpServer, TcpServerConfig};
pub use timeout::{DEFAULT_TIMEOUT, DEFAULT_WAIT_SLICE, Deadline, Timeout, TimeoutBudget};
pub use udp::{UdpConfig, UdpPort};

use std::{io, time::Duration};

use thiserror::Error;

/// The default line terminator for [`DeviceHandle::write_line`] and [`DeviceHandle::read_line`].
pub const DEFAULT_TERMINATOR: &str = "\n";

/// The error enum for all handles.
///
/// Note that a read that times out or hits an orderly close is not an error: it returns the
/// number of bytes that did arrive. Only the line helpers, which need a complete line, report
/// timeouts as errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeviceError {
    /// The handle could not be opened. Contains the target and the underlying OS error.
    #[error("Could not open {target}: {source}")]
    Open {
        /// The address or path that was opened.
        target: String,
        /// The underlying OS error.
        source: io::Error,
    },
    /// Error when reading from/writing to a link. See [`std::io::Error`] for more details.
    #[error(transparent)]
    Io(#[from] io::Error),
    #[cfg(feature = "serial")]
    /// Serial port errors can occur when opening or configuring a serial port. See the
    /// [`serialport::Error`] documentation for more information.
    #[error(transparent)]
    Serialport(#[from] serialport::Error),
    /// The operation needs an open handle, but the handle is closed.
    #[error("The handle is not open.")]
    NotOpen,
    /// The operation needs a connected client, but none has been accepted yet.
    #[error("No client is connected.")]
    NotConnected,
    /// The read was interrupted through the handle's cancel token. Contains the bytes that were
    /// already delivered to the caller's buffer.
    #[error("Read was interrupted after {bytes_read} bytes.")]
    Interrupted {
        /// Number of bytes written to the caller's buffer before the interruption.
        bytes_read: usize,
    },
    /// Timeout occurred while waiting for a complete line. The error contains the timeout that
    /// was exceeded.
    #[error("Timeout occured while waiting for a response. Timeout was set to {0:?}.")]
    Timeout(Timeout),
    /// Timeout occurred while waiting for a response to a query. The error contains the query
    /// that was sent and the timeout that was exceeded.
    #[error(
        "Timeout occured while waiting for a response to query: {query}. Timeout was set to {timeout:?}."
    )]
    TimeoutQuery {
        /// The query that timed out.
        query: String,
        /// The timeout that was set.
        timeout: Timeout,
    },
    /// Error when an invalid argument is passed to a function. It is intended for the user.
    #[error("{0}")]
    InvalidArgument(String),
    /// No property with this name exists on the handle.
    #[error("Unknown property: {0}")]
    UnknownProperty(String),
    /// The property exists but can only be read.
    #[error("Property {0} is read-only.")]
    ReadOnlyProperty(String),
    /// A property was set with a value of the wrong type.
    #[error("Property {name} expects a value of type {expected}.")]
    PropertyType {
        /// Name of the property.
        name: &'static str,
        /// The type the property accepts.
        expected: &'static str,
    },
}

impl DeviceError {
    /// Whether this error means the OS descriptor itself is no longer valid.
    ///
    /// Handles close themselves after such an error, so that [`DeviceHandle::is_open`] reports
    /// `false` afterwards.
    pub fn invalidates_handle(&self) -> bool {
        match self {
            DeviceError::Io(err) => descriptor_gone(err),
            _ => false,
        }
    }
}

fn descriptor_gone(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EBADF) {
        return true;
    }
    err.kind() == io::ErrorKind::NotConnected
}

/// The lifecycle and I/O contract every link implements.
///
/// A handle is either fully open (descriptor valid, configuration applied) or fully closed. It is
/// created open by [`DeviceHandle::open`]; [`DeviceHandle::close`] releases everything and may be
/// called any number of times.
pub trait DeviceHandle {
    /// What `open` connects to, e.g., a socket address or a device path.
    type Target: ?Sized;
    /// Link specific configuration applied while opening.
    type Config;

    /// Open the link and apply the whole configuration.
    ///
    /// Either everything succeeds or an error is returned and nothing is left allocated.
    fn open(target: &Self::Target, config: Self::Config) -> Result<Self, DeviceError>
    where
        Self: Sized;

    /// Release the OS resource and any buffered data. Closing a closed handle does nothing.
    fn close(&mut self);

    /// Whether the handle is open.
    fn is_open(&self) -> bool;

    /// Perform exactly one receive, waiting at most `wait`.
    ///
    /// This bypasses the pending buffer of message links; prefer [`DeviceHandle::read`].
    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> Result<Received, DeviceError>;

    /// Best-effort count of bytes that can be received without blocking.
    fn bytes_ready(&self) -> usize;

    /// The default timeout for reads.
    fn timeout(&self) -> Timeout;

    /// Set the default timeout for reads.
    fn set_timeout(&mut self, timeout: Timeout);

    /// A token that interrupts reads on this handle when cancelled.
    fn interrupt_token(&self) -> CancelToken;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns the number of bytes read. A short count means the timeout expired or the peer
    /// closed the connection. See [`TimedReader::read`] for the error semantics.
    fn read_with_timeout(&mut self, buf: &mut [u8], timeout: Timeout)
    -> Result<usize, DeviceError>;

    /// Read up to `buf.len()` bytes with the handle's default timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let timeout = self.timeout();
        self.read_with_timeout(buf, timeout)
    }

    /// Write all of `data` and flush. Returns the number of bytes written.
    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError>;

    /// Bytes that a read could return without waiting, including buffered ones.
    fn bytes_available(&self) -> usize {
        self.bytes_ready()
    }

    /// Discard everything that is buffered or immediately readable.
    fn flush_input(&mut self) -> Result<(), DeviceError> {
        let mut scratch = [0u8; 1024];
        while self.read_with_timeout(&mut scratch, Timeout::Immediate)? > 0 {}
        Ok(())
    }

    /// The line terminator used by the line helpers.
    fn terminator(&self) -> &str;

    /// Set the line terminator used by the line helpers.
    fn set_terminator(&mut self, terminator: &str);

    /// Send a command to the instrument.
    ///
    /// This function takes the command, appends the terminator, and writes it to the link.
    fn write_line(&mut self, cmd: &str) -> Result<(), DeviceError> {
        let line = format!("{cmd}{}", self.terminator());
        self.write(line.as_bytes())?;
        Ok(())
    }

    /// Read one line, without its terminator.
    ///
    /// The handle's timeout bounds the whole line, not each byte. Bytes that are not valid UTF-8
    /// are replaced.
    fn read_line(&mut self) -> Result<String, DeviceError> {
        let terminator = self.terminator().as_bytes().to_vec();
        if terminator.is_empty() {
            return Err(DeviceError::InvalidArgument(
                "Reading a line requires a non-empty terminator.".to_string(),
            ));
        }
        let timeout = self.timeout();
        let deadline = Deadline::start(timeout);
        let mut line = Vec::new();
        let mut byte = [0u8];
        loop {
            let Some(remaining) = deadline.remaining() else {
                return Err(DeviceError::Timeout(timeout));
            };
            if self.read_with_timeout(&mut byte, remaining)? == 0 {
                return Err(DeviceError::Timeout(timeout));
            }
            line.push(byte[0]);
            if line.ends_with(&terminator) {
                line.truncate(line.len() - terminator.len());
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
        }
    }

    /// Query the instrument with a command and return the response line.
    fn query(&mut self, cmd: &str) -> Result<String, DeviceError> {
        self.write_line(cmd)?;
        match self.read_line() {
            Err(DeviceError::Timeout(timeout)) => Err(DeviceError::TimeoutQuery {
                query: cmd.to_string(),
                timeout,
            }),
            other => other,
        }
    }
}
