//! Test cases for the loopback device and the default methods of the handle contract.

use std::{io::ErrorKind, time::Duration};

use rstest::*;

use instrumentlink::{
    Access, DeviceError, DeviceHandle, LoopbackDevice, Properties, PropertyValue, Received, Script,
    Timeout,
};

/// Open a loopback device on the given script.
fn crt_dev(script: Script) -> LoopbackDevice {
    LoopbackDevice::open("bench", script).unwrap()
}

/// A loopback device on an empty stream script.
#[fixture]
fn emp_dev() -> LoopbackDevice {
    crt_dev(Script::stream())
}

/// Ensure `finalize` passes on a script that was used up.
#[rstest]
fn finalize_empty() {
    let mut script = Script::stream();
    script.finalize();
}

/// Ensure `finalize` panics if events or writes are left.
#[rstest]
#[case(Script::stream().data(b"resp"))]
#[case(Script::stream().expect_write(b"cmd"))]
#[case(Script::message().closed())]
#[should_panic]
fn finalize_panics(#[case] mut script: Script) {
    script.finalize();
}

/// Writing something that is not expected panics.
#[rstest]
#[should_panic]
fn unexpected_write(mut emp_dev: LoopbackDevice) {
    emp_dev.write(b"*RST\n").unwrap();
}

/// Writing something other than expected panics.
#[rstest]
#[should_panic]
fn wrong_write() {
    let mut dev = crt_dev(Script::stream().expect_write(b"*IDN?\n"));
    dev.write_line("*IDX?").unwrap();
}

/// A peer close in the middle of a read is a short read and leaves the handle open.
#[rstest]
fn closed_mid_read() {
    let mut dev = crt_dev(Script::stream().data(b"abc").closed());
    let mut buf = [0u8; 10];
    assert_eq!(dev.read_with_timeout(&mut buf, Timeout::Forever).unwrap(), 3);
    assert_eq!(&buf[..3], b"abc");
    assert!(dev.is_open());
}

/// An error that invalidates the descriptor closes the handle.
#[rstest]
fn not_connected_closes() {
    let mut dev = crt_dev(Script::stream().data(b"ab").fail(ErrorKind::NotConnected));
    let mut buf = [0u8; 10];
    let err = dev.read_with_timeout(&mut buf, Timeout::Forever).unwrap_err();
    assert!(err.invalidates_handle());
    assert!(!dev.is_open());
    assert!(matches!(dev.read(&mut buf), Err(DeviceError::NotOpen)));
}

/// Any other error leaves the handle open.
#[rstest]
fn other_error_keeps_open() {
    let mut dev = crt_dev(Script::stream().fail(ErrorKind::ConnectionReset).data(b"x"));
    let mut buf = [0u8; 1];
    assert!(matches!(dev.read(&mut buf), Err(DeviceError::Io(_))));
    assert!(dev.is_open());
    assert_eq!(dev.read(&mut buf).unwrap(), 1);
}

/// Closing twice is fine, and the handle reports closed after either call.
#[rstest]
fn idempotent_close(mut emp_dev: LoopbackDevice) {
    assert!(emp_dev.is_open());
    emp_dev.close();
    assert!(!emp_dev.is_open());
    emp_dev.close();
    assert!(!emp_dev.is_open());
    assert!(matches!(emp_dev.write(b"x"), Err(DeviceError::NotOpen)));
    assert_eq!(emp_dev.bytes_available(), 0);
}

/// Closing a device whose script was not used up panics.
#[rstest]
#[should_panic(expected = "Leftover scripted events")]
fn close_with_leftover_events() {
    let mut dev = crt_dev(Script::stream().data(b"unread"));
    dev.close();
}

/// A single receive on the handle reports what the transport did, without the read loop.
#[rstest]
fn raw_receive_outcomes() {
    let mut dev = crt_dev(Script::stream().timed_out().data(b"abc").closed());
    let mut buf = [0u8; 8];
    assert_eq!(dev.bytes_ready(), 0);
    assert_eq!(dev.raw_receive(&mut buf, Duration::ZERO).unwrap(), Received::TimedOut);
    assert_eq!(dev.bytes_ready(), 3);
    assert_eq!(
        dev.raw_receive(&mut buf, Duration::from_millis(10)).unwrap(),
        Received::Data(3)
    );
    assert_eq!(&buf[..3], b"abc");
    assert_eq!(dev.raw_receive(&mut buf, Duration::ZERO).unwrap(), Received::Closed);
    assert!(dev.is_open());

    dev.close();
    assert!(matches!(
        dev.raw_receive(&mut buf, Duration::ZERO),
        Err(DeviceError::NotOpen)
    ));
    assert_eq!(dev.bytes_ready(), 0);
}

/// An invalidating error from a single receive closes the handle as well.
#[rstest]
fn raw_receive_not_connected_closes() {
    let mut dev = crt_dev(Script::stream().fail(ErrorKind::NotConnected));
    let mut buf = [0u8; 4];
    let err = dev.raw_receive(&mut buf, Duration::ZERO).unwrap_err();
    assert!(err.invalidates_handle());
    assert!(!dev.is_open());
    assert!(matches!(
        dev.raw_receive(&mut buf, Duration::ZERO),
        Err(DeviceError::NotOpen)
    ));
}

/// Datagram order is kept through the device's own pending buffer.
#[rstest]
fn message_device_fifo() {
    let mut dev = crt_dev(Script::message().data(b"hello").data(b"world"));
    let mut first = [0u8; 3];
    let mut second = [0u8; 7];
    assert_eq!(dev.read(&mut first).unwrap(), 3);
    assert_eq!(dev.bytes_available(), 2 + 5);
    assert_eq!(dev.read(&mut second).unwrap(), 7);
    assert_eq!(&first, b"hel");
    assert_eq!(&second, b"loworld");
}

/// The device's pending buffer grows for an oversized datagram.
#[rstest]
fn message_device_grows() {
    let mut dev = crt_dev(Script::message().hide_ready().data(&[9u8; 2000]));
    assert_eq!(dev.pending_capacity(), 1024);
    let mut buf = [0u8; 2000];
    assert_eq!(dev.read(&mut buf).unwrap(), 2000);
    assert_eq!(dev.pending_capacity(), 2048);
}

/// Flushing discards buffered and immediately readable bytes.
#[rstest]
fn flush_input() {
    let mut dev = crt_dev(Script::message().data(b"stale").data(b"older"));
    let mut buf = [0u8; 1];
    dev.read(&mut buf).unwrap();
    dev.flush_input().unwrap();
    assert_eq!(dev.bytes_available(), 0);
}

/// Query writes the command with terminator and strips the terminator from the answer.
#[rstest]
#[case("\n")]
#[case("\r\n")]
fn query(#[case] terminator: &str) {
    let script = Script::stream()
        .expect_write(format!("*IDN?{terminator}").as_bytes())
        .data(format!("Loopback,1.0{terminator}").as_bytes());
    let mut dev = crt_dev(script);
    dev.set_terminator(terminator);
    assert_eq!(dev.query("*IDN?").unwrap(), "Loopback,1.0");
}

/// A line spread over several receives is assembled.
#[rstest]
fn read_line_over_chunks() {
    let mut dev = crt_dev(Script::stream().data(b"12.").timed_out().data(b"5\nnext\n"));
    assert_eq!(dev.read_line().unwrap(), "12.5");
    assert_eq!(dev.read_line().unwrap(), "next");
}

/// A query without answer reports the query and the timeout.
#[rstest]
fn query_timeout() {
    let mut dev = crt_dev(Script::stream().expect_write(b"MEAS?\n").data(b"1."));
    dev.set_timeout(Timeout::Immediate);
    match dev.query("MEAS?") {
        Err(DeviceError::TimeoutQuery { query, timeout }) => {
            assert_eq!(query, "MEAS?");
            assert_eq!(timeout, Timeout::Immediate);
        }
        other => panic!("Expected a query timeout, got {other:?}"),
    }
}

/// A line needs a terminator.
#[rstest]
fn read_line_empty_terminator(mut emp_dev: LoopbackDevice) {
    emp_dev.set_terminator("");
    assert!(matches!(emp_dev.read_line(), Err(DeviceError::InvalidArgument(_))));
}

/// Properties can be listed, read, and written by name.
#[rstest]
fn properties(mut emp_dev: LoopbackDevice) {
    assert_eq!(
        LoopbackDevice::property_names(),
        vec!["Name", "Status", "Timeout", "Terminator", "NumBytesAvailable"]
    );
    assert_eq!(
        emp_dev.get_property("name").unwrap(),
        PropertyValue::Text("bench".to_string())
    );
    emp_dev
        .set_property("Timeout", PropertyValue::Float(0.5))
        .unwrap();
    assert_eq!(
        emp_dev.timeout(),
        Timeout::After(Duration::from_millis(500))
    );
    emp_dev
        .set_property("Timeout", PropertyValue::Float(f64::INFINITY))
        .unwrap();
    assert_eq!(emp_dev.timeout(), Timeout::Forever);
    assert!(matches!(
        emp_dev.set_property("Timeout", PropertyValue::Float(-1.0)),
        Err(DeviceError::InvalidArgument(_))
    ));
    assert!(matches!(
        emp_dev.set_property("Status", PropertyValue::Text("x".into())),
        Err(DeviceError::ReadOnlyProperty(_))
    ));
    assert_eq!(
        LoopbackDevice::find_property("NumBytesAvailable").unwrap().access(),
        Access::ReadOnly
    );
}
