//! This module provides a TCP/IP server link that talks to one client at a time.
//!
//! Some instruments connect to the host instead of the other way round. [`TcpServer`] listens on a
//! local address, accepts a client with [`TcpServer::accept`], and then behaves like any other
//! byte-stream link.

use std::{
    io::Write,
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    CancelToken, DEFAULT_TERMINATOR, DeviceError, DeviceHandle, Timeout,
    interrupt::Interrupt,
    properties::{Properties, Property, PropertyValue, count_value},
    reader::{Receive, Received, TimedReader},
    runtime::{HandleToken, runtime},
    socket::is_wait_elapsed,
    timeout::{DEFAULT_WAIT_SLICE, Deadline},
};

/// Interval between two accept polls.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Configuration for [`TcpServer::open`].
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Default timeout for reads and writes on the accepted client.
    pub timeout: Timeout,
    /// Disable Nagle's algorithm on accepted clients.
    pub no_delay: bool,
    /// Line terminator for the line helpers.
    pub terminator: String,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        TcpServerConfig {
            timeout: Timeout::default(),
            no_delay: false,
            terminator: DEFAULT_TERMINATOR.to_string(),
        }
    }
}

impl TcpServerConfig {
    /// Set the default read/write timeout.
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable `TCP_NODELAY` on accepted clients.
    pub fn no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Set the line terminator.
    pub fn terminator(mut self, terminator: &str) -> Self {
        self.terminator = terminator.to_string();
        self
    }
}

#[derive(Debug)]
struct Client {
    stream: TcpStream,
    addr: SocketAddr,
}

#[derive(Debug)]
struct ServerLink {
    listener: TcpListener,
    client: Option<Client>,
    _token: HandleToken,
}

/// A blocking TCP/IP server link with at most one connected client.
///
/// # Example
///
/// ```no_run
/// use instrumentlink::{DeviceHandle, TcpServer, TcpServerConfig, Timeout};
///
/// let mut server = TcpServer::open("0.0.0.0:5025", TcpServerConfig::default()).unwrap();
/// if let Some(addr) = server.accept(Timeout::Forever).unwrap() {
///     println!("{addr} says: {}", server.read_line().unwrap());
/// }
/// ```
#[derive(Debug)]
pub struct TcpServer {
    link: Option<ServerLink>,
    local: SocketAddr,
    timeout: Timeout,
    no_delay: bool,
    terminator: String,
    wait_slice: Duration,
    interrupt: CancelToken,
}

impl TcpServer {
    /// The address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// The address of the connected client, if any.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.link
            .as_ref()
            .and_then(|link| link.client.as_ref())
            .map(|client| client.addr)
    }

    /// Whether a client is connected.
    pub fn is_connected(&self) -> bool {
        self.client_addr().is_some()
    }

    /// Drop the current client, keeping the listener open.
    pub fn disconnect(&mut self) {
        if let Some(client) = self.link.as_mut().and_then(|link| link.client.take()) {
            info!("Disconnected client {}.", client.addr);
        }
    }

    /// Set the longest single wait of reads and accepts. See [`TimedReader::with_wait_slice`].
    pub fn set_wait_slice(&mut self, slice: Duration) {
        self.wait_slice = slice;
    }

    /// Wait for a client to connect.
    ///
    /// Returns the client's address, or `None` if `timeout` expired first. A newly accepted client
    /// replaces the current one.
    ///
    /// # Errors
    /// - [`DeviceError::Interrupted`] if the handle's cancel token fired while waiting.
    pub fn accept(&mut self, timeout: Timeout) -> Result<Option<SocketAddr>, DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        let deadline = Deadline::start(timeout);
        link.listener.set_nonblocking(true)?;
        let result = loop {
            if self.interrupt.is_interrupted() {
                break Err(DeviceError::Interrupted { bytes_read: 0 });
            }
            match link.listener.accept() {
                Ok(accepted) => break Ok(Some(accepted)),
                Err(err) if is_wait_elapsed(&err) => {}
                Err(err) => break Err(err.into()),
            }
            match deadline.remaining() {
                Some(Timeout::Immediate) | None => break Ok(None),
                Some(Timeout::After(left)) => thread::sleep(left.min(ACCEPT_POLL)),
                Some(Timeout::Forever) => thread::sleep(ACCEPT_POLL),
            }
        };
        link.listener.set_nonblocking(false)?;

        let Some((stream, addr)) = result? else {
            return Ok(None);
        };
        stream.set_nonblocking(false)?;
        stream.set_nodelay(self.no_delay)?;
        stream.set_write_timeout(self.timeout.write_timeout())?;
        if let Some(previous) = link.client.replace(Client { stream, addr }) {
            debug!("Client {} replaced by {addr}.", previous.addr);
        }
        info!("Accepted client {addr} on {}.", self.local);
        Ok(Some(addr))
    }

    fn client_mut(&mut self) -> Result<&mut Client, DeviceError> {
        self.link
            .as_mut()
            .ok_or(DeviceError::NotOpen)?
            .client
            .as_mut()
            .ok_or(DeviceError::NotConnected)
    }

    /// Drop the client if `result` says its descriptor is gone.
    fn settle<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, DeviceError> {
        if let Err(err) = &result {
            if err.invalidates_handle() {
                warn!("Client connection is no longer valid: {err}");
                self.disconnect();
            }
        }
        result
    }
}

impl DeviceHandle for TcpServer {
    type Target = str;
    type Config = TcpServerConfig;

    fn open(target: &str, config: TcpServerConfig) -> Result<Self, DeviceError> {
        let open_err = |source| DeviceError::Open {
            target: target.to_string(),
            source,
        };
        let listener = TcpListener::bind(target).map_err(open_err)?;
        let local = listener.local_addr().map_err(open_err)?;
        info!("Listening on {local}.");
        Ok(TcpServer {
            link: Some(ServerLink {
                listener,
                client: None,
                _token: runtime().register("tcpserver"),
            }),
            local,
            timeout: config.timeout,
            no_delay: config.no_delay,
            terminator: config.terminator,
            wait_slice: DEFAULT_WAIT_SLICE,
            interrupt: CancelToken::new(),
        })
    }

    fn close(&mut self) {
        if self.link.take().is_some() {
            info!("Stopped listening on {}.", self.local);
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> Result<Received, DeviceError> {
        let client = self.client_mut()?;
        let result = client.stream.raw_receive(buf, wait).map_err(DeviceError::from);
        self.settle(result)
    }

    fn bytes_ready(&self) -> usize {
        self.link
            .as_ref()
            .and_then(|link| link.client.as_ref())
            .map_or(0, |client| client.stream.bytes_ready())
    }

    fn timeout(&self) -> Timeout {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Timeout) {
        if let Ok(client) = self.client_mut() {
            if let Err(err) = client.stream.set_write_timeout(timeout.write_timeout()) {
                debug!("Could not update write timeout of client: {err}");
            }
        }
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
        let reader = TimedReader::new().with_wait_slice(self.wait_slice);
        let interrupt = self.interrupt.clone();
        let client = self.client_mut()?;
        let result = reader
            .with_interrupt(&interrupt)
            .read(&mut client.stream, buf, timeout, None);
        self.settle(result)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let client = self.client_mut()?;
        let result = client
            .stream
            .write_all(data)
            .and_then(|()| client.stream.flush())
            .map(|()| data.len())
            .map_err(DeviceError::from);
        self.settle(result)
    }

    fn terminator(&self) -> &str {
        self.terminator.as_str()
    }

    fn set_terminator(&mut self, terminator: &str) {
        self.terminator = terminator.to_string();
    }
}

impl Properties for TcpServer {
    const PROPERTIES: &'static [Property<Self>] = &[
        Property {
            name: "ServerAddress",
            getter: |s| PropertyValue::Text(s.local.ip().to_string()),
            setter: None,
        },
        Property {
            name: "ServerPort",
            getter: |s| PropertyValue::Int(i64::from(s.local.port())),
            setter: None,
        },
        Property {
            name: "Connected",
            getter: |s| PropertyValue::Bool(s.is_connected()),
            setter: None,
        },
        Property {
            name: "ClientAddress",
            getter: |s| {
                PropertyValue::Text(s.client_addr().map(|a| a.ip().to_string()).unwrap_or_default())
            },
            setter: None,
        },
        Property {
            name: "ClientPort",
            getter: |s| PropertyValue::Int(s.client_addr().map_or(0, |a| i64::from(a.port()))),
            setter: None,
        },
        Property {
            name: "Timeout",
            getter: |s| PropertyValue::Timeout(s.timeout),
            setter: Some(|s, v| {
                s.set_timeout(v.into_timeout("Timeout")?);
                Ok(())
            }),
        },
        Property {
            name: "Terminator",
            getter: |s| PropertyValue::Text(s.terminator.clone()),
            setter: Some(|s, v| {
                s.set_terminator(&v.into_text("Terminator")?);
                Ok(())
            }),
        },
        Property {
            name: "NumBytesAvailable",
            getter: |s| count_value(s.bytes_available()),
            setter: None,
        },
    ];
}
