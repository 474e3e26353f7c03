//! Time APIs for obtaining the current time and calculating with points in time and durations.
//!
//! These APIs are made for the mesh stack and are not meant to be general-purpose. They have
//! millisecond resolution and use 32-bit arithmetic throughout, which means the underlying counter
//! wraps around after roughly 49 days. All comparisons between instants go through a signed
//! interpretation of the wrapping difference, so deadlines keep working across the wrap as long as
//! two compared instants are less than ~24 days apart.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A duration with millisecond resolution.
///
/// Overflows in arithmetic will result in a panic, but shouldn't happen since the stack doesn't
/// deal with durations anywhere near the 49-day range of the counter.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(u32);

impl Duration {
    /// The zero-length duration.
    pub const ZERO: Self = Duration(0);

    /// Creates a [`Duration`] from a number of milliseconds.
    pub const fn from_millis(millis: u32) -> Self {
        Duration(millis)
    }

    /// Creates a [`Duration`] representing a number of seconds.
    pub const fn from_secs(secs: u32) -> Self {
        Duration(secs * 1000)
    }

    /// Returns the number of milliseconds represented by `self`.
    pub const fn as_millis(&self) -> u32 {
        self.0
    }

    /// Returns the number of whole seconds that fit in `self`.
    pub const fn whole_secs(&self) -> u32 {
        self.0 / 1000
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.checked_add(rhs.0).expect("duration overflow"))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.checked_sub(rhs.0).expect("duration underflow"))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1000 {
            let (secs, submilli) = (self.0 / 1000, self.0 % 1000);
            if submilli == 0 {
                write!(f, "{}s", secs)
            } else {
                write!(f, "{}.{:03}s", secs, submilli)
            }
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// A point in time, relative to an unspecified epoch.
///
/// This has millisecond resolution and wraps around after ~49 days. Apart from the wraparound, it
/// is monotonic.
///
/// `Instant`s are obtained from an implementation of [`Timer`]. `Instant`s created from different
/// [`Timer`] instances (even when using the same implementation) are not compatible, and mixing
/// them in operations causes unspecified results.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Instant(u32);

impl Instant {
    /// Creates an `Instant` from raw milliseconds since an arbitrary implementation-defined
    /// reference point.
    ///
    /// This should only be called from a [`Timer`] implementation.
    pub const fn from_raw_millis(millis: u32) -> Self {
        Instant(millis)
    }

    /// Returns the raw value from which this `Instant` was created.
    ///
    /// This should only be called from a [`Timer`] implementation.
    pub const fn raw_millis(&self) -> u32 {
        self.0
    }

    /// Calculates the duration of time that has passed between `earlier` and `self`.
    ///
    /// The result is computed with wrapping arithmetic; it is correct as long as `earlier` really
    /// does lie in the past of `self` and the two are less than the counter range apart.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.wrapping_sub(earlier.0))
    }

    /// Returns whether `self` lies at or after `other` in time.
    ///
    /// The wrapping difference between the two instants is interpreted as a signed quantity, so
    /// this keeps producing correct answers when the underlying counter wraps around.
    pub fn is_at_or_after(&self, other: Instant) -> bool {
        self.0.wrapping_sub(other.0) as i32 >= 0
    }

    /// Returns whether `self` lies strictly before `other` in time.
    pub fn is_before(&self, other: Instant) -> bool {
        !self.is_at_or_after(other)
    }
}

/// [`Instant`]s can be subtracted, which computes the [`Duration`] between the rhs and lhs using
/// [`Instant::duration_since`].
impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

/// A [`Duration`] can be added to an [`Instant`], moving the [`Instant`] forwards in time.
impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.wrapping_add(d.as_millis()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

/// A [`Duration`] can be subtracted from an [`Instant`], moving the [`Instant`] backwards in time.
impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, d: Duration) -> Self {
        Instant(self.0.wrapping_sub(d.as_millis()))
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, d: Duration) {
        *self = *self - d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1000 {
            write!(f, "{}.{:03}s", self.0 / 1000, self.0 % 1000)
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// Trait for time providers.
///
/// The hardware interface has to provide an implementation of `Timer` to the stack. The
/// implementation must have millisecond accuracy.
///
/// This trait can also be implemented by a mock timer for testing.
pub trait Timer {
    /// Obtain the current time as an [`Instant`].
    ///
    /// The [`Instant`]s returned by this function must never move backwards in time, except when
    /// the underlying value wraps around.
    fn now(&self) -> Instant;
}
