//! This module provides the implementation for an instrument link via a TCP/IP client.
//!
//! It includes a blocking implementation of the [`DeviceHandle`] trait using the
//! [`std::net::TcpStream`] struct.

use std::{
    io::Write,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    CancelToken, DEFAULT_TERMINATOR, DeviceError, DeviceHandle, Timeout,
    properties::{Properties, Property, PropertyValue, count_value},
    reader::{Receive, Received, TimedReader},
    runtime::{HandleToken, runtime},
    timeout::DEFAULT_WAIT_SLICE,
};

/// Configuration for [`TcpClient::open`].
#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    /// Give up connecting after this long. `None` uses the OS default.
    pub connect_timeout: Option<Duration>,
    /// Default timeout for reads and writes.
    pub timeout: Timeout,
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Line terminator for the line helpers.
    pub terminator: String,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        TcpClientConfig {
            connect_timeout: None,
            timeout: Timeout::default(),
            no_delay: false,
            terminator: DEFAULT_TERMINATOR.to_string(),
        }
    }
}

impl TcpClientConfig {
    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the default read/write timeout.
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
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
struct TcpLink {
    stream: TcpStream,
    _token: HandleToken,
}

/// A blocking TCP/IP client link.
///
/// # Example
///
/// ```no_run
/// use instrumentlink::{DeviceHandle, TcpClient, TcpClientConfig};
///
/// let mut inst = TcpClient::open("192.168.10.1:8000", TcpClientConfig::default()).unwrap();
/// println!("Instrument name: {}", inst.query("*IDN?").unwrap());
/// ```
#[derive(Debug)]
pub struct TcpClient {
    link: Option<TcpLink>,
    remote: SocketAddr,
    timeout: Timeout,
    no_delay: bool,
    terminator: String,
    wait_slice: Duration,
    interrupt: CancelToken,
}

impl TcpClient {
    /// The address of the peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// The local address of the connection.
    pub fn local_addr(&self) -> Result<SocketAddr, DeviceError> {
        let link = self.link.as_ref().ok_or(DeviceError::NotOpen)?;
        Ok(link.stream.local_addr()?)
    }

    /// Whether `TCP_NODELAY` is enabled.
    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    /// Enable or disable `TCP_NODELAY` on the open connection.
    pub fn set_no_delay(&mut self, no_delay: bool) -> Result<(), DeviceError> {
        if let Some(link) = &self.link {
            link.stream.set_nodelay(no_delay)?;
        }
        self.no_delay = no_delay;
        Ok(())
    }

    /// Set the longest single wait of a read. See [`TimedReader::with_wait_slice`].
    pub fn set_wait_slice(&mut self, slice: Duration) {
        self.wait_slice = slice;
    }

    /// Close the handle if `result` says the descriptor is gone.
    fn settle<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, DeviceError> {
        if let Err(err) = &result {
            if err.invalidates_handle() {
                warn!("Connection to {} is no longer valid: {err}", self.remote);
                self.close();
            }
        }
        result
    }
}

/// Connect to the first address `target` resolves to that accepts the connection.
fn connect(target: &str, timeout: Option<Duration>) -> std::io::Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in target.to_socket_addrs()? {
        let result = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match result {
            Ok(stream) => return Ok((stream, addr)),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Address did not resolve to any socket address.",
        )
    }))
}

impl DeviceHandle for TcpClient {
    type Target = str;
    type Config = TcpClientConfig;

    fn open(target: &str, config: TcpClientConfig) -> Result<Self, DeviceError> {
        let open_err = |source| DeviceError::Open {
            target: target.to_string(),
            source,
        };
        let (stream, remote) = connect(target, config.connect_timeout).map_err(open_err)?;
        stream.set_nodelay(config.no_delay).map_err(open_err)?;
        stream
            .set_write_timeout(config.timeout.write_timeout())
            .map_err(open_err)?;
        info!("Connected to {remote}.");
        Ok(TcpClient {
            link: Some(TcpLink {
                stream,
                _token: runtime().register("tcpclient"),
            }),
            remote,
            timeout: config.timeout,
            no_delay: config.no_delay,
            terminator: config.terminator,
            wait_slice: DEFAULT_WAIT_SLICE,
            interrupt: CancelToken::new(),
        })
    }

    fn close(&mut self) {
        if self.link.take().is_some() {
            info!("Closed connection to {}.", self.remote);
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> Result<Received, DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        let result = link.stream.raw_receive(buf, wait).map_err(DeviceError::from);
        self.settle(result)
    }

    fn bytes_ready(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.stream.bytes_ready())
    }

    fn timeout(&self) -> Timeout {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Timeout) {
        if let Some(link) = &self.link {
            if let Err(err) = link.stream.set_write_timeout(timeout.write_timeout()) {
                debug!("Could not update write timeout of {}: {err}", self.remote);
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
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        let result = TimedReader::new()
            .with_wait_slice(self.wait_slice)
            .with_interrupt(&self.interrupt)
            .read(&mut link.stream, buf, timeout, None);
        self.settle(result)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        let result = link
            .stream
            .write_all(data)
            .and_then(|()| link.stream.flush())
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

impl Properties for TcpClient {
    const PROPERTIES: &'static [Property<Self>] = &[
        Property {
            name: "Address",
            getter: |c| PropertyValue::Text(c.remote.ip().to_string()),
            setter: None,
        },
        Property {
            name: "Port",
            getter: |c| PropertyValue::Int(i64::from(c.remote.port())),
            setter: None,
        },
        Property {
            name: "Status",
            getter: |c| PropertyValue::Text(if c.is_open() { "open" } else { "closed" }.into()),
            setter: None,
        },
        Property {
            name: "Timeout",
            getter: |c| PropertyValue::Timeout(c.timeout),
            setter: Some(|c, v| {
                c.set_timeout(v.into_timeout("Timeout")?);
                Ok(())
            }),
        },
        Property {
            name: "NoDelay",
            getter: |c| PropertyValue::Bool(c.no_delay),
            setter: Some(|c, v| c.set_no_delay(v.into_bool("NoDelay")?)),
        },
        Property {
            name: "Terminator",
            getter: |c| PropertyValue::Text(c.terminator.clone()),
            setter: Some(|c, v| {
                c.set_terminator(&v.into_text("Terminator")?);
                Ok(())
            }),
        },
        Property {
            name: "NumBytesAvailable",
            getter: |c| count_value(c.bytes_available()),
            setter: None,
        },
    ];
}
