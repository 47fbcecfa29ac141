//! Scripted loopback link for testing drivers and the read loop without hardware.
//!
//! A [`Script`] replays a fixed sequence of receive outcomes ([`ScriptEvent`]) and checks every
//! write against a list of expected writes. It can be read directly through a [`TimedReader`] or
//! wrapped in a [`LoopbackDevice`], which implements the full [`DeviceHandle`] contract.
//!
//! When a [`Script`] is dropped, `finalize` is called, which panics if scripted events or expected
//! writes were left unused. Writing something that was not expected panics as well. This way,
//! tests can easily ensure that the exchange happened exactly as scripted.

use std::{collections::VecDeque, io, thread, time::Duration};

use log::{debug, info, warn};

use crate::{
    CancelToken, DEFAULT_TERMINATOR, DeviceError, DeviceHandle, Timeout,
    pending::PendingBuffer,
    properties::{Properties, Property, PropertyValue, count_value},
    reader::{Framing, Receive, Received, TimedReader},
    runtime::{HandleToken, runtime},
    timeout::DEFAULT_WAIT_SLICE,
};

/// One scripted outcome of a receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    /// Bytes arrive. On a stream script they may be split over several receives; on a message
    /// script they form exactly one datagram.
    Data(Vec<u8>),
    /// The wait elapses without data.
    TimedOut,
    /// The peer closes the connection.
    Closed,
    /// The receive fails with an error of this kind.
    Error(io::ErrorKind),
}

/// A scripted transport.
///
/// # Example
///
/// ```
/// use instrumentlink::{Script, TimedReader, Timeout};
///
/// let mut script = Script::stream().data(b"ab").timed_out().data(b"cde");
/// let mut buf = [0u8; 5];
/// let n = TimedReader::new()
///     .read(&mut script, &mut buf, Timeout::Forever, None)
///     .unwrap();
/// assert_eq!(&buf[..n], b"abcde");
/// assert_eq!(script.receive_count(), 3);
/// ```
#[derive(Debug)]
pub struct Script {
    framing: Framing,
    events: VecDeque<ScriptEvent>,
    writes: VecDeque<Vec<u8>>,
    realtime: bool,
    hide_ready: bool,
    waits: Vec<Duration>,
}

impl Script {
    fn new(framing: Framing) -> Self {
        Script {
            framing,
            events: VecDeque::new(),
            writes: VecDeque::new(),
            realtime: false,
            hide_ready: false,
            waits: Vec::new(),
        }
    }

    /// An empty script for a byte-stream transport.
    pub fn stream() -> Self {
        Self::new(Framing::Stream)
    }

    /// An empty script for a message transport.
    pub fn message() -> Self {
        Self::new(Framing::Message)
    }

    /// Append an event.
    pub fn event(mut self, event: ScriptEvent) -> Self {
        self.events.push_back(event);
        self
    }

    /// Append arriving bytes.
    pub fn data(self, bytes: &[u8]) -> Self {
        self.event(ScriptEvent::Data(bytes.to_vec()))
    }

    /// Append a wait that elapses without data.
    pub fn timed_out(self) -> Self {
        self.event(ScriptEvent::TimedOut)
    }

    /// Append an orderly close.
    pub fn closed(self) -> Self {
        self.event(ScriptEvent::Closed)
    }

    /// Append a failing receive.
    pub fn fail(self, kind: io::ErrorKind) -> Self {
        self.event(ScriptEvent::Error(kind))
    }

    /// Expect the host to write exactly these bytes next.
    pub fn expect_write(mut self, bytes: &[u8]) -> Self {
        self.writes.push_back(bytes.to_vec());
        self
    }

    /// Really sleep for the requested wait when a receive times out or the script is exhausted.
    ///
    /// Without this, timed-out receives return at once, which keeps tests fast.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Report zero ready bytes, like transports that cannot tell.
    pub fn hide_ready(mut self) -> Self {
        self.hide_ready = true;
        self
    }

    /// The wait of every receive so far, in order.
    pub fn waits(&self) -> &[Duration] {
        &self.waits
    }

    /// Number of receives so far.
    pub fn receive_count(&self) -> usize {
        self.waits.len()
    }

    /// Check a write against the next expected write.
    ///
    /// # Panics
    /// If no write is expected or the bytes differ.
    pub fn check_write(&mut self, data: &[u8]) {
        let Some(expected) = self.writes.pop_front() else {
            panic!(
                "No more writes were expected, got {:?}",
                String::from_utf8_lossy(data)
            );
        };
        assert_eq!(
            expected,
            data,
            "Expected write {:?}, got {:?}",
            String::from_utf8_lossy(&expected),
            String::from_utf8_lossy(data)
        );
    }

    /// This function panics if not all events and expected writes of the [`Script`] have been
    /// used.
    ///
    /// It is automatically called when the [`Script`] is dropped, but you can also call it
    /// manually.
    pub fn finalize(&mut self) {
        if let Some(event) = self.events.front() {
            panic!("Leftover scripted events, next one: {event:?}");
        }
        if let Some(write) = self.writes.front() {
            panic!(
                "Leftover expected writes, next one: {:?}",
                String::from_utf8_lossy(write)
            );
        }
    }

    fn idle(&self, wait: Duration) -> Received {
        if self.realtime {
            thread::sleep(wait);
        }
        Received::TimedOut
    }
}

impl Receive for Script {
    fn framing(&self) -> Framing {
        self.framing
    }

    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Received> {
        self.waits.push(wait);
        let Some(event) = self.events.pop_front() else {
            return Ok(self.idle(wait));
        };
        match event {
            ScriptEvent::TimedOut => Ok(self.idle(wait)),
            ScriptEvent::Closed => Ok(Received::Closed),
            ScriptEvent::Error(kind) => Err(io::Error::new(kind, "scripted receive failure")),
            ScriptEvent::Data(bytes) if self.framing == Framing::Message => {
                if bytes.len() > buf.len() {
                    let len = bytes.len();
                    self.events.push_front(ScriptEvent::Data(bytes));
                    return Ok(Received::Oversized(len));
                }
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(Received::Data(bytes.len()))
            }
            ScriptEvent::Data(mut bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.events.push_front(ScriptEvent::Data(bytes.split_off(n)));
                }
                Ok(Received::Data(n))
            }
        }
    }

    fn bytes_ready(&self) -> usize {
        match self.events.front() {
            Some(ScriptEvent::Data(bytes)) if !self.hide_ready => bytes.len(),
            _ => 0,
        }
    }
}

impl Drop for Script {
    fn drop(&mut self) {
        if !thread::panicking() {
            self.finalize();
        }
    }
}

#[derive(Debug)]
struct LoopbackLink {
    script: Script,
    pending: PendingBuffer,
    _token: HandleToken,
}

/// A [`DeviceHandle`] that runs on a [`Script`].
///
/// # Example
///
/// ```
/// use instrumentlink::{DeviceHandle, LoopbackDevice, Script};
///
/// let script = Script::stream()
///     .expect_write(b"*IDN?\n")
///     .data(b"MyInstrument,1.0,1234\n");
/// let mut inst = LoopbackDevice::open("bench", script).unwrap();
/// assert_eq!(inst.query("*IDN?").unwrap(), "MyInstrument,1.0,1234");
/// ```
///
/// # Panics
/// Closing the device drops its script, so [`DeviceHandle::close`] (and an error that closes the
/// device, or dropping it) panics if scripted events or expected writes are left. See
/// [`Script::finalize`].
#[derive(Debug)]
pub struct LoopbackDevice {
    link: Option<LoopbackLink>,
    name: String,
    timeout: Timeout,
    terminator: String,
    wait_slice: Duration,
    interrupt: CancelToken,
}

impl LoopbackDevice {
    /// The name the device was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The script, while the device is open.
    pub fn script(&self) -> Option<&Script> {
        self.link.as_ref().map(|link| &link.script)
    }

    /// Receive window of the pending buffer, `0` when closed.
    pub fn pending_capacity(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.pending.capacity())
    }

    /// Set the longest single wait of a read. See [`TimedReader::with_wait_slice`].
    pub fn set_wait_slice(&mut self, slice: Duration) {
        self.wait_slice = slice;
    }

    fn settle<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, DeviceError> {
        if let Err(err) = &result {
            if err.invalidates_handle() {
                warn!("Loopback {} is no longer valid: {err}", self.name);
                self.close();
            }
        }
        result
    }
}

impl DeviceHandle for LoopbackDevice {
    type Target = str;
    type Config = Script;

    fn open(target: &str, config: Script) -> Result<Self, DeviceError> {
        debug!("Loopback {target} opened with {:?} framing.", config.framing);
        Ok(LoopbackDevice {
            link: Some(LoopbackLink {
                script: config,
                pending: PendingBuffer::new(),
                _token: runtime().register("loopback"),
            }),
            name: target.to_string(),
            timeout: Timeout::default(),
            terminator: DEFAULT_TERMINATOR.to_string(),
            wait_slice: DEFAULT_WAIT_SLICE,
            interrupt: CancelToken::new(),
        })
    }

    /// Close the device and drop its script.
    ///
    /// # Panics
    /// If the script still holds events or expected writes, unless the thread is already
    /// panicking.
    fn close(&mut self) {
        if self.link.take().is_some() {
            info!("Closed loopback {}.", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> Result<Received, DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        let result = link.script.raw_receive(buf, wait).map_err(DeviceError::from);
        self.settle(result)
    }

    fn bytes_ready(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.script.bytes_ready())
    }

    fn timeout(&self) -> Timeout {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }

    fn interrupt_token(&self) -> CancelToken {
        self.interrupt.clone()
    }

    fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Timeout,
    ) -> Result<usize, DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        let pending = match link.script.framing {
            Framing::Stream => None,
            Framing::Message => Some(&mut link.pending),
        };
        let result = TimedReader::new()
            .with_wait_slice(self.wait_slice)
            .with_interrupt(&self.interrupt)
            .read(&mut link.script, buf, timeout, pending);
        self.settle(result)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        link.script.check_write(data);
        Ok(data.len())
    }

    fn bytes_available(&self) -> usize {
        self.link
            .as_ref()
            .map_or(0, |link| link.pending.available() + link.script.bytes_ready())
    }

    fn terminator(&self) -> &str {
        self.terminator.as_str()
    }

    fn set_terminator(&mut self, terminator: &str) {
        self.terminator = terminator.to_string();
    }
}

impl Properties for LoopbackDevice {
    const PROPERTIES: &'static [Property<Self>] = &[
        Property {
            name: "Name",
            getter: |d| PropertyValue::Text(d.name.clone()),
            setter: None,
        },
        Property {
            name: "Status",
            getter: |d| PropertyValue::Text(if d.is_open() { "open" } else { "closed" }.into()),
            setter: None,
        },
        Property {
            name: "Timeout",
            getter: |d| PropertyValue::Timeout(d.timeout),
            setter: Some(|d, v| {
                d.set_timeout(v.into_timeout("Timeout")?);
                Ok(())
            }),
        },
        Property {
            name: "Terminator",
            getter: |d| PropertyValue::Text(d.terminator.clone()),
            setter: Some(|d, v| {
                d.set_terminator(&v.into_text("Terminator")?);
                Ok(())
            }),
        },
        Property {
            name: "NumBytesAvailable",
            getter: |d| count_value(d.bytes_available()),
            setter: None,
        },
    ];
}
