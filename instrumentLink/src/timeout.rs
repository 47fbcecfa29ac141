//! Timeouts and the per-call budget that bounds how long a read may wait.
//!
//! A [`Timeout`] is what the caller configures on a handle or passes to a single read. The
//! [`TimeoutBudget`] is created fresh for each read call from that timeout and is decremented
//! across the bounded waits the read issues. A [`Deadline`] is the wall-clock variant used by the
//! helpers that span several reads, e.g., reading a full line.

use std::time::{Duration, Instant};

use crate::DeviceError;

/// The slice a single bounded wait is limited to.
///
/// Even under a long or infinite timeout, no wait is ever longer than this, so that an external
/// interrupt is noticed within one slice.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_secs(1);

/// The default timeout for new handles.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a read may wait for data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Poll once and return whatever is available without blocking.
    Immediate,
    /// Wait at most the given duration. A zero duration behaves like [`Timeout::Immediate`].
    After(Duration),
    /// Block until the request is satisfied, the peer closes, or the read is interrupted.
    Forever,
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::After(DEFAULT_TIMEOUT)
    }
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        if value.is_zero() {
            Timeout::Immediate
        } else {
            Timeout::After(value)
        }
    }
}

impl Timeout {
    /// Create a timeout from a number of seconds.
    ///
    /// `0` maps to [`Timeout::Immediate`] and positive infinity to [`Timeout::Forever`]. Negative
    /// values and NaN are rejected.
    pub fn from_secs_f64(secs: f64) -> Result<Self, DeviceError> {
        if secs.is_nan() || secs < 0.0 {
            return Err(DeviceError::InvalidArgument(format!(
                "Timeout must be a non-negative number of seconds, got {secs}."
            )));
        }
        if secs.is_infinite() {
            return Ok(Timeout::Forever);
        }
        Ok(Duration::from_secs_f64(secs).into())
    }

    /// The timeout in seconds, where [`Timeout::Forever`] is `f64::INFINITY`.
    pub fn as_secs_f64(&self) -> f64 {
        match self {
            Timeout::Immediate => 0.0,
            Timeout::After(d) => d.as_secs_f64(),
            Timeout::Forever => f64::INFINITY,
        }
    }

    /// The finite part of the timeout, `None` if it blocks forever.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Timeout::Immediate => Some(Duration::ZERO),
            Timeout::After(d) => Some(*d),
            Timeout::Forever => None,
        }
    }

    /// A timeout suitable for OS-level write timeouts.
    ///
    /// Sockets do not accept a zero write timeout, so a poll-style timeout is mapped to the
    /// shortest non-zero value.
    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        match self.duration() {
            Some(d) if d.is_zero() => Some(Duration::from_millis(1)),
            other => other,
        }
    }
}

/// The remaining wait allowance of a single read call.
///
/// `remaining` only ever decreases. `None` stands for an infinite allowance, in which case waits
/// are still bounded by the slice.
#[derive(Debug, Clone)]
pub struct TimeoutBudget {
    remaining: Option<Duration>,
    slice: Duration,
    waits: usize,
}

impl TimeoutBudget {
    /// Create a budget for one read call.
    ///
    /// # Arguments
    /// * `timeout` - The overall timeout of the call.
    /// * `slice` - The longest single wait. It must not be zero.
    pub fn new(timeout: Timeout, slice: Duration) -> Self {
        TimeoutBudget {
            remaining: timeout.duration(),
            slice,
            waits: 0,
        }
    }

    /// The wait to use for the next bounded receive, or `None` if the budget is exhausted.
    ///
    /// A zero budget allows exactly one zero-length wait, i.e., a single poll.
    pub fn next_wait(&self) -> Option<Duration> {
        match self.remaining {
            None => Some(self.slice),
            Some(r) if r.is_zero() => (self.waits == 0).then_some(Duration::ZERO),
            Some(r) => Some(r.min(self.slice)),
        }
    }

    /// Account for a wait that ran out without data.
    pub fn charge(&mut self, waited: Duration) {
        self.waits += 1;
        if let Some(r) = self.remaining.as_mut() {
            *r = r.saturating_sub(waited);
        }
    }

    /// Account for a wait that produced data. Only a wait that timed out takes time off the
    /// allowance, so a source that always has data ready fills the whole request.
    pub fn deliver(&mut self) {
        self.waits += 1;
    }

    /// The remaining allowance, `None` if infinite.
    pub fn remaining(&self) -> Option<Duration> {
        self.remaining
    }

    /// Number of waits charged so far.
    pub fn waits(&self) -> usize {
        self.waits
    }

    /// Whether no further wait may be issued.
    pub fn is_exhausted(&self) -> bool {
        self.next_wait().is_none()
    }
}

/// A wall-clock deadline derived from a [`Timeout`].
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    timeout: Timeout,
    end: Option<Instant>,
}

impl Deadline {
    /// Start the clock for `timeout` now.
    pub fn start(timeout: Timeout) -> Self {
        let end = timeout.duration().map(|d| Instant::now() + d);
        Deadline { timeout, end }
    }

    /// The timeout left until the deadline, or `None` once it has passed.
    ///
    /// A poll-style timeout stays a poll for its whole lifetime.
    pub fn remaining(&self) -> Option<Timeout> {
        match (self.timeout, self.end) {
            (Timeout::Forever, _) | (_, None) => Some(Timeout::Forever),
            (Timeout::Immediate, _) => Some(Timeout::Immediate),
            (Timeout::After(d), _) if d.is_zero() => Some(Timeout::Immediate),
            (Timeout::After(_), Some(end)) => {
                let left = end.saturating_duration_since(Instant::now());
                (!left.is_zero()).then_some(Timeout::After(left))
            }
        }
    }

    /// The timeout this deadline was started with.
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_forever_is_sliced() {
        let mut budget = TimeoutBudget::new(Timeout::Forever, Duration::from_millis(250));
        for _ in 0..100 {
            assert_eq!(budget.next_wait(), Some(Duration::from_millis(250)));
            budget.charge(Duration::from_millis(250));
        }
        assert_eq!(budget.remaining(), None);
    }

    #[test]
    fn test_budget_immediate_polls_once() {
        let mut budget = TimeoutBudget::new(Timeout::Immediate, DEFAULT_WAIT_SLICE);
        assert_eq!(budget.next_wait(), Some(Duration::ZERO));
        budget.charge(Duration::ZERO);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_budget_last_wait_is_clamped() {
        let mut budget = TimeoutBudget::new(
            Timeout::After(Duration::from_millis(2500)),
            Duration::from_secs(1),
        );
        budget.charge(Duration::from_secs(1));
        budget.charge(Duration::from_secs(1));
        assert_eq!(budget.next_wait(), Some(Duration::from_millis(500)));
        budget.charge(Duration::from_millis(500));
        assert!(budget.is_exhausted());
        assert_eq!(budget.waits(), 3);
    }

    #[test]
    fn test_budget_delivery_is_free() {
        let tiny = Timeout::After(Duration::from_nanos(1));
        let mut budget = TimeoutBudget::new(tiny, DEFAULT_WAIT_SLICE);
        for _ in 0..5 {
            assert_eq!(budget.next_wait(), Some(Duration::from_nanos(1)));
            budget.deliver();
        }
        assert_eq!(budget.remaining(), Some(Duration::from_nanos(1)));
        assert_eq!(budget.waits(), 5);

        let mut poll = TimeoutBudget::new(Timeout::Immediate, DEFAULT_WAIT_SLICE);
        poll.deliver();
        assert!(poll.is_exhausted());
    }

    #[test]
    fn test_deadline_forever_never_expires() {
        let deadline = Deadline::start(Timeout::Forever);
        assert_eq!(deadline.remaining(), Some(Timeout::Forever));
    }
}
