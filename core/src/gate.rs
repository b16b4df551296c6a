//! Claim eligibility: a nightly blackout window with an admin override.
//!
//! Everything here is a pure function of the caller's role and local
//! wall-clock time. Clock access and time-zone conversion live in the runtime
//! crate; callers re-evaluate on their own polling interval.

use chrono::{Duration, NaiveTime, Timelike};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SECONDS_PER_DAY: i64 = 86_400;

/// Role of the caller, as supplied by the identity collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Bypasses the blackout window.
    Admin,
    /// Ordinary dispatcher or driver.
    Driver,
    /// Any other role string; treated like a non-admin.
    Other(String),
}

impl Role {
    /// Whether the blackout window applies to this role.
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "driver" => Self::Driver,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => f.write_str("admin"),
            Self::Driver => f.write_str("driver"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Error for hours outside `0..=24`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Blackout hour out of range (0-24): {0}")]
pub struct InvalidHour(pub u32);

/// Daily window `[start_hour, end_hour)` in local time during which
/// non-admin claiming is disabled.
///
/// - `start < end`: ordinary same-day window, e.g. 19..20
/// - `start > end`: wraps midnight, e.g. 22..6
/// - `start == end`: empty window (blackout disabled)
///
/// Hour 24 is accepted so a window can be disabled with `24..24`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlackoutWindow {
    start_hour: u32,
    end_hour: u32,
}

impl BlackoutWindow {
    /// Build a window.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHour`] if either hour is greater than 24.
    pub const fn new(start_hour: u32, end_hour: u32) -> Result<Self, InvalidHour> {
        if start_hour > 24 {
            return Err(InvalidHour(start_hour));
        }
        if end_hour > 24 {
            return Err(InvalidHour(end_hour));
        }
        Ok(Self {
            start_hour,
            end_hour,
        })
    }

    /// A window that never blocks anyone.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            start_hour: 24,
            end_hour: 24,
        }
    }

    /// First blocked hour.
    #[must_use]
    pub const fn start_hour(self) -> u32 {
        self.start_hour
    }

    /// First unblocked hour after the window.
    #[must_use]
    pub const fn end_hour(self) -> u32 {
        self.end_hour
    }

    /// Whether the window is empty.
    #[must_use]
    pub const fn is_disabled(self) -> bool {
        self.start_hour == self.end_hour
    }

    /// Whether `hour` (0-23) falls inside the window.
    #[must_use]
    pub const fn contains_hour(self, hour: u32) -> bool {
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else if self.start_hour > self.end_hour {
            hour >= self.start_hour || hour < self.end_hour
        } else {
            false
        }
    }

    /// Time left until the window ends, or zero when `now_local` is outside it.
    #[must_use]
    pub fn remaining(self, now_local: &impl Timelike) -> Duration {
        if !self.contains_hour(now_local.hour()) {
            return Duration::zero();
        }
        let now_secs = i64::from(now_local.num_seconds_from_midnight());
        let end_secs = i64::from(self.end_hour) * 3600;
        let diff = if end_secs > now_secs {
            end_secs - now_secs
        } else {
            SECONDS_PER_DAY - now_secs + end_secs
        };
        Duration::seconds(diff)
    }

    /// Local time at which the window opens, if it is enabled.
    #[must_use]
    pub fn starts_at(self) -> Option<NaiveTime> {
        if self.is_disabled() {
            return None;
        }
        NaiveTime::from_hms_opt(self.start_hour % 24, 0, 0)
    }
}

impl Default for BlackoutWindow {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Whether `role` may claim at local time `now_local`.
///
/// Admins always pass. Everyone else is blocked while the local hour is in
/// `[blackout_start_hour, blackout_end_hour)`. Out-of-range hours disable the
/// window rather than blocking everything.
///
/// ```
/// use chrono::NaiveTime;
/// use ride_dispatch_core::gate::{can_claim_now, Role};
///
/// let seven_thirty_pm = NaiveTime::from_hms_opt(19, 30, 0).unwrap();
/// assert!(!can_claim_now(&Role::Driver, &seven_thirty_pm, 19, 20));
/// assert!(can_claim_now(&Role::Admin, &seven_thirty_pm, 19, 20));
/// ```
#[must_use]
pub fn can_claim_now(
    role: &Role,
    now_local: &impl Timelike,
    blackout_start_hour: u32,
    blackout_end_hour: u32,
) -> bool {
    if role.is_admin() {
        return true;
    }
    let window = BlackoutWindow::new(blackout_start_hour, blackout_end_hour)
        .unwrap_or_else(|_| BlackoutWindow::disabled());
    !window.contains_hour(now_local.hour())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
    }

    #[test]
    fn same_day_window_is_half_open() {
        assert!(can_claim_now(&Role::Driver, &at(18, 59), 19, 20));
        assert!(!can_claim_now(&Role::Driver, &at(19, 0), 19, 20));
        assert!(!can_claim_now(&Role::Driver, &at(19, 59), 19, 20));
        assert!(can_claim_now(&Role::Driver, &at(20, 0), 19, 20));
    }

    #[test]
    fn wrapping_window_spans_midnight() {
        let window = BlackoutWindow::new(22, 6).expect("valid window");
        assert!(window.contains_hour(23));
        assert!(window.contains_hour(0));
        assert!(window.contains_hour(5));
        assert!(!window.contains_hour(6));
        assert!(!window.contains_hour(21));
    }

    #[test]
    fn disabled_window_never_blocks() {
        for hour in 0..24 {
            assert!(can_claim_now(&Role::Driver, &at(hour, 0), 24, 24));
        }
        assert!(BlackoutWindow::default().is_disabled());
        assert_eq!(BlackoutWindow::disabled().starts_at(), None);
    }

    #[test]
    fn invalid_hours_are_rejected() {
        assert_eq!(BlackoutWindow::new(25, 3), Err(InvalidHour(25)));
        assert!(can_claim_now(&Role::Driver, &at(3, 0), 25, 4));
    }

    #[test]
    fn remaining_counts_down_to_window_end() {
        let window = BlackoutWindow::new(19, 20).expect("valid window");
        assert_eq!(window.remaining(&at(19, 45)), Duration::minutes(15));
        assert_eq!(window.remaining(&at(21, 0)), Duration::zero());

        let overnight = BlackoutWindow::new(22, 6).expect("valid window");
        assert_eq!(overnight.remaining(&at(23, 0)), Duration::hours(7));
    }

    #[test]
    fn role_parsing() {
        assert_eq!("ADMIN".parse::<Role>(), Ok(Role::Admin));
        assert_eq!("driver".parse::<Role>(), Ok(Role::Driver));
        assert_eq!("Dispatcher".parse::<Role>(), Ok(Role::Other("dispatcher".into())));
    }

    proptest! {
        #[test]
        fn admins_always_pass(h in 0u32..24, m in 0u32..60, s in 0u32..=24, e in 0u32..=24) {
            prop_assert!(can_claim_now(&Role::Admin, &at(h, m), s, e));
        }

        #[test]
        fn non_admin_blocked_iff_inside_window(h in 0u32..24, s in 0u32..=24, e in 0u32..=24) {
            let window = BlackoutWindow::new(s, e).expect("in range");
            prop_assert_eq!(
                can_claim_now(&Role::Driver, &at(h, 0), s, e),
                !window.contains_hour(h)
            );
        }

        #[test]
        fn remaining_is_positive_only_inside(h in 0u32..24, m in 0u32..60, s in 0u32..=24, e in 0u32..=24) {
            let window = BlackoutWindow::new(s, e).expect("in range");
            let remaining = window.remaining(&at(h, m));
            prop_assert_eq!(remaining > Duration::zero(), window.contains_hour(h));
            prop_assert!(remaining <= Duration::hours(24));
        }
    }
}
