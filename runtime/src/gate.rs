//! Eligibility Gate bound to a clock and the dispatch office's time zone.
//!
//! The decision itself is [`ride_dispatch_core::gate::can_claim_now`]; this
//! wrapper supplies "now" in local time. It holds no timers: callers
//! re-evaluate every [`EligibilityGate::poll_interval`].

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::gate::{BlackoutWindow, Role, can_claim_now};
use ride_dispatch_core::{DispatchError, Result};
use std::sync::Arc;

/// Time zone used when none is configured.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Chicago;

/// How often callers re-check the gate by default.
pub const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Whether claiming is open right now, for a given role.
#[derive(Clone)]
pub struct EligibilityGate {
    clock: Arc<dyn Clock>,
    timezone: Tz,
    window: BlackoutWindow,
    poll_interval: std::time::Duration,
}

impl std::fmt::Debug for EligibilityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EligibilityGate")
            .field("timezone", &self.timezone)
            .field("window", &self.window)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl EligibilityGate {
    /// Create a gate in [`DEFAULT_TIMEZONE`].
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, window: BlackoutWindow) -> Self {
        Self {
            clock,
            timezone: DEFAULT_TIMEZONE,
            window,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// A gate that is always open.
    #[must_use]
    pub fn always_open(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, BlackoutWindow::disabled())
    }

    /// Evaluate hours in `timezone`.
    #[must_use]
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Set the re-evaluation interval callers should use.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The configured blackout window.
    #[must_use]
    pub const fn window(&self) -> BlackoutWindow {
        self.window
    }

    /// How often callers should re-evaluate.
    #[must_use]
    pub const fn poll_interval(&self) -> std::time::Duration {
        self.poll_interval
    }

    /// Current local time.
    #[must_use]
    pub fn local_now(&self) -> DateTime<Tz> {
        self.clock.now().with_timezone(&self.timezone)
    }

    /// Whether `role` may claim right now.
    #[must_use]
    pub fn can_claim_now(&self, role: &Role) -> bool {
        can_claim_now(
            role,
            &self.local_now(),
            self.window.start_hour(),
            self.window.end_hour(),
        )
    }

    /// Fail with [`DispatchError::ClaimingClosed`] if `role` may not claim now.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ClaimingClosed`] while the blackout window applies.
    pub fn ensure_open(&self, role: &Role) -> Result<()> {
        if self.can_claim_now(role) {
            Ok(())
        } else {
            tracing::debug!(%role, "Claiming closed by blackout window");
            Err(DispatchError::ClaimingClosed)
        }
    }

    /// Time until the blackout window ends, zero outside it.
    #[must_use]
    pub fn blackout_remaining(&self) -> Duration {
        self.window.remaining(&self.local_now())
    }

    /// The instant the current blackout ends, if one is in effect.
    #[must_use]
    pub fn reopens_at(&self) -> Option<DateTime<Utc>> {
        let remaining = self.blackout_remaining();
        (remaining > Duration::zero()).then(|| self.clock.now() + remaining)
    }
}
