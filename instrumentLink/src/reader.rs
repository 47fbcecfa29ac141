//! The timeout-bounded, buffered read loop shared by all transports.
//!
//! [`TimedReader::read`] turns a single bounded receive primitive ([`Receive::raw_receive`]) into
//! "read up to N bytes within a timeout". It works the same for byte streams (TCP, serial), where
//! any number of bytes may arrive per receive, and for message transports (UDP), where every
//! receive yields one whole datagram that is queued in a [`PendingBuffer`] and handed out in order
//! across calls.

use std::{io, time::Duration};

use log::trace;

use crate::{
    DeviceError,
    interrupt::{Interrupt, NeverInterrupt},
    pending::PendingBuffer,
    timeout::{DEFAULT_WAIT_SLICE, Timeout, TimeoutBudget},
};

/// The shortest wait slice a reader accepts.
const MIN_WAIT_SLICE: Duration = Duration::from_millis(1);

/// How a transport delimits the data it delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No boundaries; a receive may return any number of bytes (TCP, serial).
    Stream,
    /// Every receive returns exactly one whole datagram (UDP).
    Message,
}

/// Outcome of a single bounded receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// This many bytes were written to the start of the buffer.
    Data(usize),
    /// The wait elapsed without data.
    TimedOut,
    /// The peer shut the connection down in an orderly way. Byte streams only.
    Closed,
    /// The next datagram is larger than the buffer offered. Nothing was consumed; retry with a
    /// buffer of at least this many bytes.
    Oversized(usize),
}

/// The receive capability a [`TimedReader`] consumes.
///
/// Implementations attempt exactly one underlying receive per call and never block longer than the
/// requested wait. A zero wait means poll without blocking.
pub trait Receive {
    /// How the transport delimits data.
    fn framing(&self) -> Framing;

    /// Perform one receive into `buf`, waiting at most `wait`.
    ///
    /// Message transports must never truncate a datagram: if it does not fit, return
    /// [`Received::Oversized`] and leave it queued.
    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Received>;

    /// Best-effort count of bytes that can be received without blocking. Zero is always valid.
    fn bytes_ready(&self) -> usize {
        0
    }
}

impl<R: Receive + ?Sized> Receive for &mut R {
    fn framing(&self) -> Framing {
        (**self).framing()
    }

    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Received> {
        (**self).raw_receive(buf, wait)
    }

    fn bytes_ready(&self) -> usize {
        (**self).bytes_ready()
    }
}

/// Reads a requested number of bytes through repeated bounded waits.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use instrumentlink::{PendingBuffer, Script, TimedReader, Timeout};
///
/// let mut script = Script::message().data(b"hello").data(b"world");
/// let mut pending = PendingBuffer::new();
/// let reader = TimedReader::new().with_wait_slice(Duration::from_millis(100));
///
/// let mut first = [0u8; 3];
/// let n = reader
///     .read(&mut script, &mut first, Timeout::Forever, Some(&mut pending))
///     .unwrap();
/// assert_eq!(&first[..n], b"hel");
///
/// let mut second = [0u8; 7];
/// let n = reader
///     .read(&mut script, &mut second, Timeout::Forever, Some(&mut pending))
///     .unwrap();
/// assert_eq!(&second[..n], b"loworld");
/// ```
#[derive(Clone, Copy)]
pub struct TimedReader<'a> {
    slice: Duration,
    interrupt: &'a dyn Interrupt,
}

impl std::fmt::Debug for TimedReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedReader")
            .field("slice", &self.slice)
            .finish_non_exhaustive()
    }
}

impl Default for TimedReader<'static> {
    fn default() -> Self {
        TimedReader {
            slice: DEFAULT_WAIT_SLICE,
            interrupt: &NeverInterrupt,
        }
    }
}

impl TimedReader<'static> {
    /// Create a reader with the default wait slice that is never interrupted.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a> TimedReader<'a> {
    /// Poll `interrupt` before every wait.
    pub fn with_interrupt<'b>(self, interrupt: &'b dyn Interrupt) -> TimedReader<'b> {
        TimedReader {
            slice: self.slice,
            interrupt,
        }
    }

    /// Bound every single wait by `slice`. Values below one millisecond are raised to it.
    pub fn with_wait_slice(mut self, slice: Duration) -> Self {
        self.slice = slice.max(MIN_WAIT_SLICE);
        self
    }

    /// The longest single wait this reader issues.
    pub fn wait_slice(&self) -> Duration {
        self.slice
    }

    /// Read up to `dest.len()` bytes from `source` within `timeout`.
    ///
    /// Returns the number of bytes written to the start of `dest`. Fewer bytes than requested is
    /// not an error: it means the timeout expired or, on byte streams, the peer closed.
    ///
    /// Byte streams must be read with `pending = None`, message transports with the handle's
    /// pending buffer. Bytes of a datagram that do not fit stay in `pending` for the next call.
    ///
    /// # Errors
    /// - [`DeviceError::Io`] if a receive fails. It is never retried.
    /// - [`DeviceError::Interrupted`] if the interrupt fired. On byte streams the bytes already
    ///   copied are reported; on message transports nothing is delivered and `pending` is left
    ///   exactly as before the call.
    /// - [`DeviceError::InvalidArgument`] if a message transport is read without a pending buffer.
    pub fn read<R: Receive + ?Sized>(
        &self,
        source: &mut R,
        dest: &mut [u8],
        timeout: Timeout,
        pending: Option<&mut PendingBuffer>,
    ) -> Result<usize, DeviceError> {
        if dest.is_empty() {
            return Ok(0);
        }
        let mut budget = TimeoutBudget::new(timeout, self.slice);
        match (source.framing(), pending) {
            (Framing::Stream, _) => self.read_stream(source, dest, &mut budget),
            (Framing::Message, Some(pending)) => {
                self.read_message(source, dest, &mut budget, pending)
            }
            (Framing::Message, None) => Err(DeviceError::InvalidArgument(
                "Message transports must be read with a pending buffer.".to_string(),
            )),
        }
    }

    fn read_stream<R: Receive + ?Sized>(
        &self,
        source: &mut R,
        dest: &mut [u8],
        budget: &mut TimeoutBudget,
    ) -> Result<usize, DeviceError> {
        let mut written = 0;
        while written < dest.len() {
            if self.interrupt.is_interrupted() {
                return Err(DeviceError::Interrupted {
                    bytes_read: written,
                });
            }
            let Some(wait) = budget.next_wait() else {
                break;
            };
            let received = source.raw_receive(&mut dest[written..], wait)?;
            trace!("stream receive (wait {wait:?}): {received:?}");
            match received {
                Received::Data(n) => {
                    written += n.min(dest.len() - written);
                    budget.deliver();
                }
                Received::TimedOut => budget.charge(wait),
                Received::Closed => break,
                Received::Oversized(_) => {
                    return Err(DeviceError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Byte stream reported an oversized message.",
                    )));
                }
            }
        }
        Ok(written)
    }

    fn read_message<R: Receive + ?Sized>(
        &self,
        source: &mut R,
        dest: &mut [u8],
        budget: &mut TimeoutBudget,
        pending: &mut PendingBuffer,
    ) -> Result<usize, DeviceError> {
        // Delivery from `pending` is committed only once the call completes.
        let mut taken = 0;
        while taken < dest.len() {
            if self.interrupt.is_interrupted() {
                return Err(DeviceError::Interrupted { bytes_read: 0 });
            }
            if pending.available() > taken {
                taken += pending.peek_into(taken, &mut dest[taken..]);
                continue;
            }
            let Some(wait) = budget.next_wait() else {
                break;
            };
            let hint = source.bytes_ready();
            let received = pending.receive_with(hint, |window| source.raw_receive(window, wait))?;
            trace!("message receive (wait {wait:?}, hint {hint}): {received:?}");
            match received {
                Received::Data(_) => budget.deliver(),
                Received::TimedOut => budget.charge(wait),
                Received::Closed => break,
                Received::Oversized(len) if len > pending.capacity() => pending.reserve(len),
                Received::Oversized(len) => {
                    return Err(DeviceError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Datagram of {len} bytes reported as oversized for a larger window."),
                    )));
                }
            }
        }
        pending.consume(taken);
        Ok(taken)
    }
}
