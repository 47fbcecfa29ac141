//! Test cases for the timed read loop, driven by scripted transports.

use std::{
    cell::Cell,
    io,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use rstest::*;

use instrumentlink::{
    DeviceError, DeviceHandle, Framing, Interrupt, LoopbackDevice, PendingBuffer, Receive, Received,
    Script, TimedReader, Timeout,
};

const SLICE: Duration = Duration::from_millis(50);

/// A reader with a short wait slice.
#[fixture]
fn reader() -> TimedReader<'static> {
    TimedReader::new().with_wait_slice(SLICE)
}

/// A device that never delivers anything, and really waits while doing so.
#[fixture]
fn idle_dev() -> LoopbackDevice {
    let mut dev = LoopbackDevice::open("idle", Script::stream().realtime(true)).unwrap();
    dev.set_wait_slice(SLICE);
    dev
}

/// An interrupt ends a read within one slice, even if the timeout is long or infinite.
#[rstest]
#[case(Timeout::Forever)]
#[case(Timeout::After(Duration::from_secs(60)))]
fn interrupt_within_one_slice(mut idle_dev: LoopbackDevice, #[case] timeout: Timeout) {
    let token = idle_dev.interrupt_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        token.cancel();
    });

    let tic = Instant::now();
    let mut buf = [0u8; 4];
    let err = idle_dev.read_with_timeout(&mut buf, timeout).unwrap_err();
    let elapsed = tic.elapsed();
    canceller.join().unwrap();

    assert!(matches!(err, DeviceError::Interrupted { bytes_read: 0 }));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(200) + SLICE + Duration::from_millis(200));
}

/// Cancelling is sticky until the token is reset.
#[rstest]
fn interrupt_is_sticky(mut idle_dev: LoopbackDevice) {
    let token = idle_dev.interrupt_token();
    token.cancel();
    let mut buf = [0u8; 1];
    assert!(matches!(
        idle_dev.read_with_timeout(&mut buf, Timeout::Immediate),
        Err(DeviceError::Interrupted { .. })
    ));
    assert!(idle_dev.read_with_timeout(&mut buf, Timeout::Immediate).is_err());
    token.reset();
    assert_eq!(idle_dev.read_with_timeout(&mut buf, Timeout::Immediate).unwrap(), 0);
}

/// Fires on the given check, counting from one.
struct FireOnCheck {
    checks: Cell<usize>,
    fire_on: usize,
}

impl Interrupt for FireOnCheck {
    fn is_interrupted(&self) -> bool {
        self.checks.set(self.checks.get() + 1);
        self.checks.get() >= self.fire_on
    }
}

/// A stream interrupted midway reports what was already copied.
#[rstest]
fn interrupt_reports_partial_stream(reader: TimedReader<'static>) {
    let interrupt = FireOnCheck {
        checks: Cell::new(0),
        fire_on: 2,
    };
    let mut script = Script::stream().data(b"ab").data(b"cd");
    let mut buf = [0u8; 8];

    let err = reader
        .with_interrupt(&interrupt)
        .read(&mut script, &mut buf, Timeout::Forever, None)
        .unwrap_err();
    assert!(matches!(err, DeviceError::Interrupted { bytes_read: 2 }));
    assert_eq!(&buf[..2], b"ab");

    let n = reader
        .read(&mut script, &mut buf, Timeout::Immediate, None)
        .unwrap();
    assert_eq!(&buf[..n], b"cd");
}

/// An interrupt that is already set stops the read before any receive.
#[rstest]
fn interrupt_before_first_wait(reader: TimedReader<'static>) {
    let flag = AtomicBool::new(true);
    let mut script = Script::stream();
    let mut buf = [0u8; 8];
    let err = reader
        .with_interrupt(&flag)
        .read(&mut script, &mut buf, Timeout::Forever, None)
        .unwrap_err();
    assert!(matches!(err, DeviceError::Interrupted { bytes_read: 0 }));
    assert_eq!(script.receive_count(), 0);
    flag.store(false, Ordering::SeqCst);
}

/// A message read that is interrupted leaves the pending buffer untouched.
#[rstest]
fn interrupt_keeps_pending(reader: TimedReader<'static>) {
    let mut script = Script::message().data(b"hello");
    let mut pending = PendingBuffer::new();
    let mut buf = [0u8; 2];
    reader
        .read(&mut script, &mut buf, Timeout::Forever, Some(&mut pending))
        .unwrap();
    assert_eq!(pending.available(), 3);

    let flag = AtomicBool::new(true);
    let mut big = [0u8; 8];
    assert!(
        reader
            .with_interrupt(&flag)
            .read(&mut script, &mut big, Timeout::Forever, Some(&mut pending))
            .is_err()
    );
    assert_eq!(pending.available(), 3);

    let n = reader
        .read(&mut script, &mut big[..3], Timeout::Immediate, Some(&mut pending))
        .unwrap();
    assert_eq!(&big[..n], b"llo");
}

/// Whenever the transport can supply all bytes, the read returns all of them.
#[rstest]
#[case(Timeout::After(Duration::from_nanos(1)))]
#[case(Timeout::After(Duration::from_millis(1)))]
#[case(Timeout::After(Duration::from_secs(1)))]
#[case(Timeout::Forever)]
fn exact_count(reader: TimedReader<'static>, #[case] timeout: Timeout) {
    let mut script = Script::stream().data(b"01234").data(b"567").data(b"89");
    let mut buf = [0u8; 10];
    let n = reader.read(&mut script, &mut buf, timeout, None).unwrap();
    assert_eq!(n, 10);
    assert_eq!(&buf, b"0123456789");

    let mut script = Script::stream()
        .data(b"0")
        .data(b"1")
        .data(b"2")
        .data(b"3")
        .data(b"4");
    let mut buf = [0u8; 5];
    let n = reader.read(&mut script, &mut buf, timeout, None).unwrap();
    assert_eq!(n, 5);
    assert_eq!(script.receive_count(), 5);
}

/// A stream that always has one byte ready, but takes a while to hand it over.
struct SlowStream {
    delay: Duration,
    sent: u8,
}

impl Receive for SlowStream {
    fn framing(&self) -> Framing {
        Framing::Stream
    }

    fn raw_receive(&mut self, buf: &mut [u8], _wait: Duration) -> io::Result<Received> {
        thread::sleep(self.delay);
        if buf.is_empty() {
            return Ok(Received::Data(0));
        }
        buf[0] = self.sent;
        self.sent = self.sent.wrapping_add(1);
        Ok(Received::Data(1))
    }
}

/// Time spent delivering data does not count against the timeout.
#[rstest]
fn exact_count_slow_source(reader: TimedReader<'static>) {
    let mut source = SlowStream {
        delay: Duration::from_millis(2),
        sent: 0,
    };
    let mut buf = [0u8; 20];
    let n = reader
        .read(&mut source, &mut buf, Timeout::After(Duration::from_millis(10)), None)
        .unwrap();
    assert_eq!(n, 20);
    assert_eq!(buf[19], 19);
}

/// A stream chunk longer than requested is delivered over several reads.
#[rstest]
fn stream_chunk_is_split(reader: TimedReader<'static>) {
    let mut script = Script::stream().data(b"abcdef");
    let mut buf = [0u8; 4];
    assert_eq!(reader.read(&mut script, &mut buf, Timeout::Forever, None).unwrap(), 4);
    assert_eq!(&buf, b"abcd");
    assert_eq!(reader.read(&mut script, &mut buf[..2], Timeout::Forever, None).unwrap(), 2);
    assert_eq!(&buf[..2], b"ef");
}

/// Datagrams are handed out in order, across datagram boundaries, without loss.
#[rstest]
fn datagram_fifo(reader: TimedReader<'static>) {
    let mut script = Script::message().data(b"hello").data(b"world");
    let mut pending = PendingBuffer::new();

    let mut first = [0u8; 3];
    let n = reader
        .read(&mut script, &mut first, Timeout::Forever, Some(&mut pending))
        .unwrap();
    assert_eq!(&first[..n], b"hel");

    let mut second = [0u8; 7];
    let n = reader
        .read(&mut script, &mut second, Timeout::Forever, Some(&mut pending))
        .unwrap();
    assert_eq!(&second[..n], b"loworld");
    assert!(pending.is_empty());
}

/// An empty datagram is consumed and reading continues with the next one.
#[rstest]
fn empty_datagram_is_skipped(reader: TimedReader<'static>) {
    let mut script = Script::message().data(b"").data(b"xy");
    let mut pending = PendingBuffer::new();
    let mut buf = [0u8; 2];
    let n = reader
        .read(&mut script, &mut buf, Timeout::Forever, Some(&mut pending))
        .unwrap();
    assert_eq!(&buf[..n], b"xy");
    assert_eq!(script.receive_count(), 2);
}

/// A zero-length request returns at once without receiving.
#[rstest]
#[case(Timeout::Immediate)]
#[case(Timeout::Forever)]
fn zero_length_request(reader: TimedReader<'static>, #[case] timeout: Timeout) {
    let mut script = Script::stream().data(b"x");
    let mut buf = [0u8; 1];
    assert_eq!(reader.read(&mut script, &mut buf[..0], timeout, None).unwrap(), 0);
    assert_eq!(script.receive_count(), 0);
    assert_eq!(reader.read(&mut script, &mut buf, timeout, None).unwrap(), 1);
}

/// Two bytes, one timed-out slice, then the last three bytes: all five arrive within budget.
#[rstest]
fn partial_then_complete() {
    let mut script = Script::stream()
        .realtime(true)
        .data(b"ab")
        .timed_out()
        .data(b"cde");
    let reader = TimedReader::new().with_wait_slice(Duration::from_secs(1));
    let mut buf = [0u8; 5];

    let tic = Instant::now();
    let n = reader
        .read(&mut script, &mut buf, Timeout::After(Duration::from_secs(2)), None)
        .unwrap();
    let elapsed = tic.elapsed();

    assert_eq!(n, 5);
    assert_eq!(&buf, b"abcde");
    assert!(elapsed >= Duration::from_millis(990));
    assert!(elapsed <= Duration::from_millis(2100));
    assert_eq!(script.waits()[0], Duration::from_secs(1));
    assert!(script.waits()[2] <= Duration::from_secs(1));
    assert_eq!(script.receive_count(), 3);
}

/// A timeout is a short read, not an error.
#[rstest]
fn timeout_returns_partial(reader: TimedReader<'static>) {
    let mut script = Script::stream().data(b"ab").timed_out().timed_out();
    let mut buf = [0u8; 5];
    let n = reader
        .read(&mut script, &mut buf, Timeout::After(SLICE * 2), None)
        .unwrap();
    assert_eq!(n, 2);
    assert_eq!(script.receive_count(), 3);
    assert_eq!(script.waits()[1], SLICE);
}

/// A forever timeout still never issues a wait longer than the slice.
#[rstest]
fn forever_is_sliced(reader: TimedReader<'static>) {
    let mut script = Script::stream().timed_out().timed_out().timed_out().data(b"z");
    let mut buf = [0u8; 1];
    assert_eq!(reader.read(&mut script, &mut buf, Timeout::Forever, None).unwrap(), 1);
    assert!(script.waits().iter().all(|w| *w == SLICE));
}

/// An immediate timeout polls exactly once.
#[rstest]
fn immediate_polls_once(reader: TimedReader<'static>) {
    let mut script = Script::stream().data(b"abc").data(b"def");
    let mut buf = [0u8; 6];
    assert_eq!(reader.read(&mut script, &mut buf, Timeout::Immediate, None).unwrap(), 3);
    assert_eq!(script.waits(), [Duration::ZERO]);
    assert_eq!(reader.read(&mut script, &mut buf, Timeout::Immediate, None).unwrap(), 3);
    assert_eq!(&buf[..3], b"def");
}

/// A receive error ends the read and is not retried.
#[rstest]
fn error_is_not_retried(reader: TimedReader<'static>) {
    let mut script = Script::stream()
        .data(b"ab")
        .fail(std::io::ErrorKind::ConnectionReset);
    let mut buf = [0u8; 5];
    let err = reader.read(&mut script, &mut buf, Timeout::Forever, None).unwrap_err();
    assert!(matches!(err, DeviceError::Io(ref e) if e.kind() == std::io::ErrorKind::ConnectionReset));
    assert_eq!(script.receive_count(), 2);
}

/// A message transport without a pending buffer is rejected.
#[rstest]
fn message_needs_pending(reader: TimedReader<'static>) {
    let mut script = Script::message();
    let mut buf = [0u8; 5];
    assert!(matches!(
        reader.read(&mut script, &mut buf, Timeout::Immediate, None),
        Err(DeviceError::InvalidArgument(_))
    ));
}

/// A datagram larger than the window grows the window instead of being truncated.
#[rstest]
#[case(false)]
#[case(true)]
fn oversized_datagram_grows_window(reader: TimedReader<'static>, #[case] hide_ready: bool) {
    let payload: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
    let mut script = Script::message().data(&payload);
    if hide_ready {
        script = script.hide_ready();
    }
    let mut pending = PendingBuffer::new();
    assert_eq!(pending.capacity(), 1024);

    let mut buf = vec![0u8; 3000];
    let n = reader
        .read(&mut script, &mut buf, Timeout::Immediate, Some(&mut pending))
        .unwrap();
    assert_eq!(n, 3000);
    assert_eq!(buf, payload);
    assert_eq!(pending.capacity(), 3072);
    assert_eq!(script.receive_count(), if hide_ready { 2 } else { 1 });
}
