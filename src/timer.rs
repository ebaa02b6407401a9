use chrono::{DateTime, Utc};

/// Cancellable single-shot timer, stored as optional state on its owner.
///
/// Nothing runs in the background: the owner polls [`Timer::fire`] from its
/// `tick` and acts when it returns `true`. Cancelling an idle timer is a no-op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<DateTime<Utc>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm at `at`, replacing any previous deadline.
    pub fn arm(&mut self, at: DateTime<Utc>) {
        self.deadline = Some(at);
    }

    /// Arm only if nothing is pending. Returns whether the timer was armed.
    pub fn arm_if_idle(&mut self, at: DateTime<Utc>) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(at);
        true
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Disarm and return `true` when the deadline has been reached.
    pub fn fire(&mut self, now: DateTime<Utc>) -> bool {
        match self.deadline {
            Some(at) if now >= at => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of a set of optional deadlines.
pub fn earliest<I>(deadlines: I) -> Option<DateTime<Utc>>
where
    I: IntoIterator<Item = Option<DateTime<Utc>>>,
{
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap()
    }

    #[test]
    fn fires_once_at_deadline() {
        let mut timer = Timer::new();
        timer.arm(t0() + TimeDelta::seconds(5));
        assert!(!timer.fire(t0() + TimeDelta::seconds(4)));
        assert!(timer.fire(t0() + TimeDelta::seconds(5)));
        assert!(!timer.fire(t0() + TimeDelta::seconds(6)));
        assert!(!timer.is_armed());
    }

    #[test]
    fn arm_if_idle_keeps_first_deadline() {
        let mut timer = Timer::new();
        assert!(timer.arm_if_idle(t0()));
        assert!(!timer.arm_if_idle(t0() + TimeDelta::seconds(30)));
        assert_eq!(timer.deadline(), Some(t0()));
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut timer = Timer::new();
        timer.cancel();
        timer.arm(t0());
        timer.cancel();
        timer.cancel();
        assert!(!timer.fire(t0()));
    }

    #[test]
    fn earliest_skips_idle_timers() {
        let later = t0() + TimeDelta::minutes(1);
        assert_eq!(earliest([None, Some(later), Some(t0())]), Some(t0()));
        assert_eq!(earliest([None, None]), None);
    }
}
