//! Clock abstraction and the deadlines the state machines arm.

use core::time::Duration;

use crate::errors::TimeoutKind;

/// Abstraction over a monotonic clock.
///
/// ISO-TP needs a monotonically increasing time source to implement deadlines (N_Bs, N_Cr) and
/// pacing (STmin). The state machines never read a clock themselves: the caller passes `now` and
/// the clock is only used for arithmetic on its instants.
pub trait Clock {
    /// Instant type produced by the clock.
    type Instant: Copy + Ord + core::fmt::Debug;

    /// Current instant.
    fn now(&self) -> Self::Instant;
    /// Add a duration to an instant (saturating if needed).
    fn add(&self, instant: Self::Instant, dur: Duration) -> Self::Instant;
}

/// Tokio's clock. Follows paused/advanced time in `start_paused` tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn add(&self, instant: Self::Instant, dur: Duration) -> Self::Instant {
        instant.checked_add(dur).unwrap_or(instant)
    }
}

/// An armed protocol timer: which bound it enforces and when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline<I> {
    pub kind: TimeoutKind,
    pub at: I,
}

impl<I: Copy + Ord> Deadline<I> {
    /// Arm `kind` for `bound` from `now`.
    pub fn arm<C: Clock<Instant = I>>(clock: &C, now: I, kind: TimeoutKind, bound: Duration) -> Self {
        Self {
            kind,
            at: clock.add(now, bound),
        }
    }

    /// True once `now` has reached the deadline.
    pub fn expired(&self, now: I) -> bool {
        now >= self.at
    }
}

/// Earliest instant at which the next Consecutive Frame may go out.
///
/// `guard` is added to the peer's STmin so the measured gap lands strictly above the minimum.
/// A zero STmin means no pacing at all.
pub fn next_emit_at<C: Clock>(
    clock: &C,
    last_emit: C::Instant,
    st_min: Duration,
    guard: Duration,
) -> C::Instant {
    if st_min.is_zero() {
        last_emit
    } else {
        clock.add(last_emit, st_min + guard)
    }
}

/// Earliest of two optional instants.
pub fn earliest<I: Ord>(a: Option<I>, b: Option<I>) -> Option<I> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Microsecond tick clock for unit tests; `now` is always zero, callers pass instants explicitly.
#[cfg(test)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TickClock;

#[cfg(test)]
impl Clock for TickClock {
    type Instant = u64;

    fn now(&self) -> u64 {
        0
    }

    fn add(&self, instant: u64, dur: Duration) -> u64 {
        instant.saturating_add(dur.as_micros() as u64)
    }
}
