//! This module provides the implementation for an instrument link via UDP datagrams.
//!
//! UDP is a message transport: every receive returns one whole datagram. Reads still look like
//! byte reads to the caller. Whatever part of a datagram the caller did not ask for is kept in the
//! port's [`PendingBuffer`] and returned first by the next read.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    CancelToken, DEFAULT_TERMINATOR, DeviceError, DeviceHandle, Timeout,
    pending::{DEFAULT_PENDING_CAPACITY, PendingBuffer},
    properties::{Properties, Property, PropertyValue, count_value},
    reader::{Framing, Receive, Received, TimedReader},
    runtime::{HandleToken, runtime},
    socket::{TimedSocket, is_wait_elapsed, queued_bytes},
    timeout::DEFAULT_WAIT_SLICE,
};

/// Largest payload of a UDP datagram over IPv4.
const MAX_DATAGRAM: usize = 65_507;

/// Configuration for [`UdpPort::open`].
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Default destination for [`DeviceHandle::write`].
    pub remote: Option<SocketAddr>,
    /// Allow sending to broadcast addresses.
    pub broadcast: bool,
    /// IPv4 multicast groups to join on the default interface.
    pub multicast: Vec<Ipv4Addr>,
    /// Receive our own multicast datagrams.
    pub multicast_loopback: bool,
    /// Time-to-live of outgoing datagrams. `None` keeps the OS default.
    pub ttl: Option<u32>,
    /// Initial receive window of the pending buffer. It grows for larger datagrams.
    pub input_buffer_size: usize,
    /// Default timeout for reads.
    pub timeout: Timeout,
    /// Line terminator for the line helpers.
    pub terminator: String,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            remote: None,
            broadcast: false,
            multicast: Vec::new(),
            multicast_loopback: true,
            ttl: None,
            input_buffer_size: DEFAULT_PENDING_CAPACITY,
            timeout: Timeout::default(),
            terminator: DEFAULT_TERMINATOR.to_string(),
        }
    }
}

impl UdpConfig {
    /// Set the default destination.
    pub fn remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Allow or forbid broadcast.
    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Join an IPv4 multicast group when opening.
    pub fn join_multicast(mut self, group: Ipv4Addr) -> Self {
        self.multicast.push(group);
        self
    }

    /// Receive or ignore our own multicast datagrams.
    pub fn multicast_loopback(mut self, enabled: bool) -> Self {
        self.multicast_loopback = enabled;
        self
    }

    /// Set the time-to-live of outgoing datagrams.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the initial receive window.
    pub fn input_buffer_size(mut self, size: usize) -> Self {
        self.input_buffer_size = size;
        self
    }

    /// Set the default read timeout.
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the line terminator.
    pub fn terminator(mut self, terminator: &str) -> Self {
        self.terminator = terminator.to_string();
        self
    }
}

/// The receiving side of the socket, as consumed by the [`TimedReader`].
#[derive(Debug)]
struct Datagrams {
    socket: UdpSocket,
    last_sender: Option<SocketAddr>,
}

/// Whether a peek failed only because the peek buffer was smaller than the datagram.
fn is_truncated(err: &io::Error) -> bool {
    #[cfg(windows)]
    if err.raw_os_error() == Some(10040) {
        return true;
    }
    let _ = err;
    false
}

/// Size of the next datagram, or an upper bound for it.
fn next_datagram_len(socket: &UdpSocket) -> io::Result<usize> {
    if cfg!(unix) {
        queued_bytes(socket)
    } else {
        Ok(MAX_DATAGRAM)
    }
}

impl Receive for Datagrams {
    fn framing(&self) -> Framing {
        Framing::Message
    }

    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Received> {
        let mut sender = None;
        let result = self.socket.with_wait(wait, |socket| {
            let mut head = [0u8; 1];
            match socket.peek_from(&mut head) {
                Ok(_) => {}
                Err(err) if is_truncated(&err) => {}
                Err(err) if is_wait_elapsed(&err) => return Ok(Received::TimedOut),
                Err(err) => return Err(err),
            }
            let len = next_datagram_len(socket)?;
            if len > buf.len() {
                return Ok(Received::Oversized(len));
            }
            let (n, from) = socket.recv_from(buf)?;
            sender = Some(from);
            Ok(Received::Data(n))
        });
        if sender.is_some() {
            self.last_sender = sender;
        }
        result
    }

    fn bytes_ready(&self) -> usize {
        queued_bytes(&self.socket).unwrap_or(0)
    }
}

#[derive(Debug)]
struct UdpLink {
    rx: Datagrams,
    pending: PendingBuffer,
    _token: HandleToken,
}

/// A UDP link bound to a local address.
///
/// # Example
///
/// ```no_run
/// use instrumentlink::{DeviceHandle, UdpConfig, UdpPort};
///
/// let config = UdpConfig::default().remote("192.168.10.1:5000".parse().unwrap());
/// let mut port = UdpPort::open("0.0.0.0:0", config).unwrap();
/// port.write(b"MEAS?").unwrap();
/// let mut buf = [0u8; 16];
/// let n = port.read(&mut buf).unwrap();
/// println!("{:?} from {:?}", &buf[..n], port.last_sender());
/// ```
#[derive(Debug)]
pub struct UdpPort {
    link: Option<UdpLink>,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    broadcast: bool,
    groups: Vec<Ipv4Addr>,
    timeout: Timeout,
    terminator: String,
    wait_slice: Duration,
    interrupt: CancelToken,
}

impl UdpPort {
    /// The address the port is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// The default destination of [`DeviceHandle::write`].
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Set or clear the default destination.
    pub fn set_remote(&mut self, remote: Option<SocketAddr>) {
        debug!("Remote of {} set to {remote:?}.", self.local);
        self.remote = remote;
    }

    /// The sender of the most recently received datagram.
    pub fn last_sender(&self) -> Option<SocketAddr> {
        self.link.as_ref().and_then(|link| link.rx.last_sender)
    }

    /// Whether sending to broadcast addresses is allowed.
    pub fn broadcast(&self) -> bool {
        self.broadcast
    }

    /// Allow or forbid sending to broadcast addresses.
    pub fn set_broadcast(&mut self, broadcast: bool) -> Result<(), DeviceError> {
        self.link_ref()?.rx.socket.set_broadcast(broadcast)?;
        self.broadcast = broadcast;
        Ok(())
    }

    /// The multicast groups that were joined.
    pub fn multicast_groups(&self) -> &[Ipv4Addr] {
        &self.groups
    }

    /// Join an IPv4 multicast group on the default interface.
    pub fn join_multicast(&mut self, group: Ipv4Addr) -> Result<(), DeviceError> {
        self.link_ref()?
            .rx
            .socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        debug!("{} joined multicast group {group}.", self.local);
        self.groups.push(group);
        Ok(())
    }

    /// Leave an IPv4 multicast group.
    pub fn leave_multicast(&mut self, group: Ipv4Addr) -> Result<(), DeviceError> {
        self.link_ref()?
            .rx
            .socket
            .leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        debug!("{} left multicast group {group}.", self.local);
        self.groups.retain(|g| *g != group);
        Ok(())
    }

    /// Current receive window of the pending buffer.
    pub fn input_buffer_capacity(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.pending.capacity())
    }

    /// Send one datagram to `addr`.
    pub fn write_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, DeviceError> {
        let sent = self.link_ref()?.rx.socket.send_to(data, addr);
        self.settle(sent.map_err(DeviceError::from))
    }

    /// Set the longest single wait of a read. See [`TimedReader::with_wait_slice`].
    pub fn set_wait_slice(&mut self, slice: Duration) {
        self.wait_slice = slice;
    }

    fn link_ref(&self) -> Result<&UdpLink, DeviceError> {
        self.link.as_ref().ok_or(DeviceError::NotOpen)
    }

    /// Close the handle if `result` says the descriptor is gone.
    fn settle<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, DeviceError> {
        if let Err(err) = &result {
            if err.invalidates_handle() {
                warn!("Socket bound to {} is no longer valid: {err}", self.local);
                self.close();
            }
        }
        result
    }
}

impl DeviceHandle for UdpPort {
    type Target = str;
    type Config = UdpConfig;

    fn open(target: &str, config: UdpConfig) -> Result<Self, DeviceError> {
        let open_err = |source| DeviceError::Open {
            target: target.to_string(),
            source,
        };
        let socket = UdpSocket::bind(target).map_err(open_err)?;
        socket.set_broadcast(config.broadcast).map_err(open_err)?;
        for group in &config.multicast {
            socket
                .join_multicast_v4(group, &Ipv4Addr::UNSPECIFIED)
                .map_err(open_err)?;
        }
        if !config.multicast.is_empty() {
            socket
                .set_multicast_loop_v4(config.multicast_loopback)
                .map_err(open_err)?;
        }
        if let Some(ttl) = config.ttl {
            socket.set_ttl(ttl).map_err(open_err)?;
        }
        let local = socket.local_addr().map_err(open_err)?;
        info!("Bound UDP port {local}.");
        Ok(UdpPort {
            link: Some(UdpLink {
                rx: Datagrams {
                    socket,
                    last_sender: None,
                },
                pending: PendingBuffer::with_capacity(config.input_buffer_size),
                _token: runtime().register("udp"),
            }),
            local,
            remote: config.remote,
            broadcast: config.broadcast,
            groups: config.multicast,
            timeout: config.timeout,
            terminator: config.terminator,
            wait_slice: DEFAULT_WAIT_SLICE,
            interrupt: CancelToken::new(),
        })
    }

    fn close(&mut self) {
        if self.link.take().is_some() {
            info!("Closed UDP port {}.", self.local);
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> Result<Received, DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        let result = link.rx.raw_receive(buf, wait).map_err(DeviceError::from);
        self.settle(result)
    }

    fn bytes_ready(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.rx.bytes_ready())
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
        let result = TimedReader::new()
            .with_wait_slice(self.wait_slice)
            .with_interrupt(&self.interrupt)
            .read(&mut link.rx, buf, timeout, Some(&mut link.pending));
        self.settle(result)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let remote = self.remote.ok_or_else(|| {
            DeviceError::InvalidArgument(
                "No remote address is configured, use `write_to` instead.".to_string(),
            )
        })?;
        self.write_to(data, remote)
    }

    fn bytes_available(&self) -> usize {
        self.link
            .as_ref()
            .map_or(0, |link| link.pending.available() + link.rx.bytes_ready())
    }

    fn flush_input(&mut self) -> Result<(), DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        link.pending.clear();
        let mut scratch = [0u8; 1024];
        while self.read_with_timeout(&mut scratch, Timeout::Immediate)? > 0 {}
        Ok(())
    }

    fn terminator(&self) -> &str {
        self.terminator.as_str()
    }

    fn set_terminator(&mut self, terminator: &str) {
        self.terminator = terminator.to_string();
    }
}

impl Properties for UdpPort {
    const PROPERTIES: &'static [Property<Self>] = &[
        Property {
            name: "LocalHost",
            getter: |p| PropertyValue::Text(p.local.ip().to_string()),
            setter: None,
        },
        Property {
            name: "LocalPort",
            getter: |p| PropertyValue::Int(i64::from(p.local.port())),
            setter: None,
        },
        Property {
            name: "Remote",
            getter: |p| PropertyValue::Text(p.remote.map(|a| a.to_string()).unwrap_or_default()),
            setter: Some(|p, v| {
                let text = v.into_text("Remote")?;
                let remote = if text.is_empty() {
                    None
                } else {
                    Some(text.parse().map_err(|_| {
                        DeviceError::InvalidArgument(format!("Not a socket address: {text}"))
                    })?)
                };
                p.set_remote(remote);
                Ok(())
            }),
        },
        Property {
            name: "Broadcast",
            getter: |p| PropertyValue::Bool(p.broadcast),
            setter: Some(|p, v| p.set_broadcast(v.into_bool("Broadcast")?)),
        },
        Property {
            name: "MulticastGroups",
            getter: |p| {
                let groups: Vec<String> = p.groups.iter().map(|g| g.to_string()).collect();
                PropertyValue::Text(groups.join(","))
            },
            setter: None,
        },
        Property {
            name: "Timeout",
            getter: |p| PropertyValue::Timeout(p.timeout),
            setter: Some(|p, v| {
                p.set_timeout(v.into_timeout("Timeout")?);
                Ok(())
            }),
        },
        Property {
            name: "Terminator",
            getter: |p| PropertyValue::Text(p.terminator.clone()),
            setter: Some(|p, v| {
                p.set_terminator(&v.into_text("Terminator")?);
                Ok(())
            }),
        },
        Property {
            name: "InputBufferSize",
            getter: |p| count_value(p.input_buffer_capacity()),
            setter: None,
        },
        Property {
            name: "NumBytesAvailable",
            getter: |p| count_value(p.bytes_available()),
            setter: None,
        },
    ];
}
