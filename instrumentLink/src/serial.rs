//! This module provides the implementation for an instrument link via a serial port.
//!
//! It includes a blocking implementation of the [`DeviceHandle`] trait using the `serialport`
//! crate. The port's own timeout is set to each bounded wait of the read loop, so reads stay
//! interruptible even under [`Timeout::Forever`].

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use log::{debug, info, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{
    CancelToken, DEFAULT_TERMINATOR, DeviceError, DeviceHandle, Timeout,
    properties::{Properties, Property, PropertyValue, count_value},
    reader::{Framing, Receive, Received, TimedReader},
    runtime::{HandleToken, runtime},
    socket::is_wait_elapsed,
    timeout::DEFAULT_WAIT_SLICE,
};

/// Write wait used when the handle's timeout is infinite.
const WRITE_FOREVER: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for [`SerialDevice::open`].
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Baud rate.
    pub baud_rate: u32,
    /// Number of data bits per character.
    pub data_bits: DataBits,
    /// Parity checking.
    pub parity: Parity,
    /// Number of stop bits.
    pub stop_bits: StopBits,
    /// Flow control.
    pub flow_control: FlowControl,
    /// Default timeout for reads and writes.
    pub timeout: Timeout,
    /// Line terminator for the line helpers.
    pub terminator: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            timeout: Timeout::default(),
            terminator: DEFAULT_TERMINATOR.to_string(),
        }
    }
}

impl SerialConfig {
    /// Set the baud rate.
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the number of data bits.
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Set the parity.
    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the number of stop bits.
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Set the flow control.
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Set the default timeout.
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

/// The open port, as consumed by the [`TimedReader`].
#[derive(Debug)]
struct SerialLink {
    port: Box<dyn SerialPort>,
    _token: HandleToken,
}

impl Receive for SerialLink {
    fn framing(&self) -> Framing {
        Framing::Stream
    }

    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Received> {
        self.port.set_timeout(wait).map_err(io::Error::from)?;
        match self.port.read(buf) {
            Ok(0) => Ok(Received::Closed),
            Ok(n) => Ok(Received::Data(n)),
            Err(err) if is_wait_elapsed(&err) => Ok(Received::TimedOut),
            Err(err) => Err(err),
        }
    }

    fn bytes_ready(&self) -> usize {
        self.port
            .bytes_to_read()
            .map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX))
    }
}

/// A blocking serial port link.
///
/// # Example
///
/// ```no_run
/// use instrumentlink::{DeviceHandle, SerialConfig, SerialDevice};
///
/// let config = SerialConfig::default().baud_rate(115_200).terminator("\r\n");
/// let mut inst = SerialDevice::open("/dev/ttyUSB0", config).unwrap();
/// println!("Instrument name: {}", inst.query("*IDN?").unwrap());
/// ```
#[derive(Debug)]
pub struct SerialDevice {
    link: Option<SerialLink>,
    path: String,
    config: SerialConfig,
    wait_slice: Duration,
    interrupt: CancelToken,
}

fn open_port(path: &str, config: &SerialConfig) -> Result<Box<dyn SerialPort>, serialport::Error> {
    serialport::new(path, config.baud_rate)
        .data_bits(config.data_bits)
        .parity(config.parity)
        .stop_bits(config.stop_bits)
        .flow_control(config.flow_control)
        .timeout(config.timeout.duration().unwrap_or(WRITE_FOREVER))
        .open()
}

impl SerialDevice {
    /// The device path, e.g., `/dev/ttyUSB0` or `COM3`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The configuration currently applied.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Close and open the port again with the current configuration.
    pub fn reopen(&mut self) -> Result<(), DeviceError> {
        self.close();
        let port = open_port(&self.path, &self.config).map_err(|err| DeviceError::Open {
            target: self.path.clone(),
            source: err.into(),
        })?;
        self.link = Some(SerialLink {
            port,
            _token: runtime().register("serial"),
        });
        info!("Reopened serial port {}.", self.path);
        Ok(())
    }

    /// Set the baud rate.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), DeviceError> {
        if let Some(link) = &mut self.link {
            link.port.set_baud_rate(baud_rate)?;
        }
        debug!("Baud rate of {} set to {baud_rate}.", self.path);
        self.config.baud_rate = baud_rate;
        Ok(())
    }

    /// Set the number of data bits.
    pub fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), DeviceError> {
        if let Some(link) = &mut self.link {
            link.port.set_data_bits(data_bits)?;
        }
        self.config.data_bits = data_bits;
        Ok(())
    }

    /// Set the parity.
    pub fn set_parity(&mut self, parity: Parity) -> Result<(), DeviceError> {
        if let Some(link) = &mut self.link {
            link.port.set_parity(parity)?;
        }
        self.config.parity = parity;
        Ok(())
    }

    /// Set the number of stop bits.
    pub fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), DeviceError> {
        if let Some(link) = &mut self.link {
            link.port.set_stop_bits(stop_bits)?;
        }
        self.config.stop_bits = stop_bits;
        Ok(())
    }

    /// Set the flow control.
    pub fn set_flow_control(&mut self, flow_control: FlowControl) -> Result<(), DeviceError> {
        if let Some(link) = &mut self.link {
            link.port.set_flow_control(flow_control)?;
        }
        self.config.flow_control = flow_control;
        Ok(())
    }

    /// Start transmitting a break.
    pub fn set_break(&mut self) -> Result<(), DeviceError> {
        Ok(self.link_mut()?.port.set_break()?)
    }

    /// Stop transmitting a break.
    pub fn clear_break(&mut self) -> Result<(), DeviceError> {
        Ok(self.link_mut()?.port.clear_break()?)
    }

    /// Set the RTS line.
    pub fn write_request_to_send(&mut self, level: bool) -> Result<(), DeviceError> {
        Ok(self.link_mut()?.port.write_request_to_send(level)?)
    }

    /// Set the DTR line.
    pub fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), DeviceError> {
        Ok(self.link_mut()?.port.write_data_terminal_ready(level)?)
    }

    /// Set the longest single wait of a read. See [`TimedReader::with_wait_slice`].
    pub fn set_wait_slice(&mut self, slice: Duration) {
        self.wait_slice = slice;
    }

    fn link_mut(&mut self) -> Result<&mut SerialLink, DeviceError> {
        self.link.as_mut().ok_or(DeviceError::NotOpen)
    }

    /// Close the handle if `result` says the descriptor is gone.
    fn settle<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, DeviceError> {
        if let Err(err) = &result {
            if err.invalidates_handle() {
                warn!("Serial port {} is no longer valid: {err}", self.path);
                self.close();
            }
        }
        result
    }
}

impl DeviceHandle for SerialDevice {
    type Target = str;
    type Config = SerialConfig;

    fn open(target: &str, config: SerialConfig) -> Result<Self, DeviceError> {
        let port = open_port(target, &config).map_err(|err| DeviceError::Open {
            target: target.to_string(),
            source: err.into(),
        })?;
        info!("Opened serial port {target} at {} baud.", config.baud_rate);
        debug!("Serial configuration of {target}: {config:?}");
        Ok(SerialDevice {
            link: Some(SerialLink {
                port,
                _token: runtime().register("serial"),
            }),
            path: target.to_string(),
            config,
            wait_slice: DEFAULT_WAIT_SLICE,
            interrupt: CancelToken::new(),
        })
    }

    fn close(&mut self) {
        if self.link.take().is_some() {
            info!("Closed serial port {}.", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn raw_receive(&mut self, buf: &mut [u8], wait: Duration) -> Result<Received, DeviceError> {
        let link = self.link_mut()?;
        let result = link.raw_receive(buf, wait).map_err(DeviceError::from);
        self.settle(result)
    }

    fn bytes_ready(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.bytes_ready())
    }

    fn timeout(&self) -> Timeout {
        self.config.timeout
    }

    fn set_timeout(&mut self, timeout: Timeout) {
        self.config.timeout = timeout;
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
            .read(link, buf, timeout, None);
        self.settle(result)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let wait = self.config.timeout.write_timeout().unwrap_or(WRITE_FOREVER);
        let link = self.link_mut()?;
        let result = link
            .port
            .set_timeout(wait)
            .map_err(io::Error::from)
            .and_then(|()| link.port.write_all(data))
            .and_then(|()| link.port.flush())
            .map(|()| data.len())
            .map_err(DeviceError::from);
        self.settle(result)
    }

    fn flush_input(&mut self) -> Result<(), DeviceError> {
        Ok(self.link_mut()?.port.clear(ClearBuffer::Input)?)
    }

    fn terminator(&self) -> &str {
        self.config.terminator.as_str()
    }

    fn set_terminator(&mut self, terminator: &str) {
        self.config.terminator = terminator.to_string();
    }
}

fn parity_name(parity: Parity) -> &'static str {
    match parity {
        Parity::None => "none",
        Parity::Odd => "odd",
        Parity::Even => "even",
    }
}

fn parse_parity(name: &str) -> Result<Parity, DeviceError> {
    match name.to_ascii_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(DeviceError::InvalidArgument(format!(
            "Parity must be one of none, odd, even; got {name}."
        ))),
    }
}

fn flow_control_name(flow_control: FlowControl) -> &'static str {
    match flow_control {
        FlowControl::None => "none",
        FlowControl::Software => "software",
        FlowControl::Hardware => "hardware",
    }
}

fn parse_flow_control(name: &str) -> Result<FlowControl, DeviceError> {
    match name.to_ascii_lowercase().as_str() {
        "none" => Ok(FlowControl::None),
        "software" => Ok(FlowControl::Software),
        "hardware" => Ok(FlowControl::Hardware),
        _ => Err(DeviceError::InvalidArgument(format!(
            "Flow control must be one of none, software, hardware; got {name}."
        ))),
    }
}

fn data_bits_count(data_bits: DataBits) -> i64 {
    match data_bits {
        DataBits::Five => 5,
        DataBits::Six => 6,
        DataBits::Seven => 7,
        DataBits::Eight => 8,
    }
}

fn parse_data_bits(count: i64) -> Result<DataBits, DeviceError> {
    match count {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(DeviceError::InvalidArgument(format!(
            "Data bits must be between 5 and 8, got {count}."
        ))),
    }
}

fn parse_stop_bits(count: f64) -> Result<StopBits, DeviceError> {
    if count == 1.0 {
        Ok(StopBits::One)
    } else if count == 2.0 {
        Ok(StopBits::Two)
    } else {
        Err(DeviceError::InvalidArgument(format!(
            "Stop bits must be 1 or 2, got {count}."
        )))
    }
}

impl Properties for SerialDevice {
    const PROPERTIES: &'static [Property<Self>] = &[
        Property {
            name: "Port",
            getter: |s| PropertyValue::Text(s.path.clone()),
            setter: None,
        },
        Property {
            name: "Status",
            getter: |s| PropertyValue::Text(if s.is_open() { "open" } else { "closed" }.into()),
            setter: None,
        },
        Property {
            name: "BaudRate",
            getter: |s| PropertyValue::Int(i64::from(s.config.baud_rate)),
            setter: Some(|s, v| {
                let rate = v.into_int("BaudRate")?;
                let rate = u32::try_from(rate).map_err(|_| {
                    DeviceError::InvalidArgument(format!("Invalid baud rate: {rate}"))
                })?;
                s.set_baud_rate(rate)
            }),
        },
        Property {
            name: "DataBits",
            getter: |s| PropertyValue::Int(data_bits_count(s.config.data_bits)),
            setter: Some(|s, v| s.set_data_bits(parse_data_bits(v.into_int("DataBits")?)?)),
        },
        Property {
            name: "Parity",
            getter: |s| PropertyValue::Text(parity_name(s.config.parity).into()),
            setter: Some(|s, v| s.set_parity(parse_parity(&v.into_text("Parity")?)?)),
        },
        Property {
            name: "StopBits",
            getter: |s| {
                PropertyValue::Float(match s.config.stop_bits {
                    StopBits::One => 1.0,
                    StopBits::Two => 2.0,
                })
            },
            setter: Some(|s, v| s.set_stop_bits(parse_stop_bits(v.into_float("StopBits")?)?)),
        },
        Property {
            name: "FlowControl",
            getter: |s| PropertyValue::Text(flow_control_name(s.config.flow_control).into()),
            setter: Some(|s, v| {
                s.set_flow_control(parse_flow_control(&v.into_text("FlowControl")?)?)
            }),
        },
        Property {
            name: "Timeout",
            getter: |s| PropertyValue::Timeout(s.config.timeout),
            setter: Some(|s, v| {
                s.set_timeout(v.into_timeout("Timeout")?);
                Ok(())
            }),
        },
        Property {
            name: "Terminator",
            getter: |s| PropertyValue::Text(s.config.terminator.clone()),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_names_round_trip() {
        for parity in [Parity::None, Parity::Odd, Parity::Even] {
            assert_eq!(parse_parity(parity_name(parity)).unwrap(), parity);
        }
        for flow in [FlowControl::None, FlowControl::Software, FlowControl::Hardware] {
            assert_eq!(parse_flow_control(flow_control_name(flow)).unwrap(), flow);
        }
        assert_eq!(parse_parity("EVEN").unwrap(), Parity::Even);
        assert!(parse_data_bits(9).is_err());
        assert_eq!(parse_data_bits(7).unwrap(), DataBits::Seven);
        assert!(parse_stop_bits(1.5).is_err());
    }

    #[test]
    fn test_open_missing_port() {
        let err = SerialDevice::open("/dev/does-not-exist-42", SerialConfig::default()).unwrap_err();
        assert!(matches!(err, DeviceError::Open { .. }));
    }
}
