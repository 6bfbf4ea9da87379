//! Monotonic deadline timer used for hysteresis and anti-chatter logic
//!
//! A `Timer` is either stopped or carries a deadline. All queries take an
//! explicit `now` so control logic can be driven with a synthetic clock in
//! tests.

use std::time::{Duration, Instant};

/// One-shot deadline timer with explicit clock injection.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    /// Create a stopped timer
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm the timer to expire `duration` after `now`
    pub fn start(&mut self, now: Instant, duration: Duration) {
        self.deadline = Some(now + duration);
    }

    /// Disarm the timer
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Arm the timer already expired, so the next check fires immediately
    pub fn force_expire(&mut self, now: Instant) {
        self.deadline = Some(now);
    }

    /// True while the timer is armed (expired or not)
    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// True while the timer is disarmed
    pub fn is_stopped(&self) -> bool {
        self.deadline.is_none()
    }

    /// True once an armed timer's deadline has passed
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Time left until expiry; zero when expired or stopped
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_timer_never_expires() {
        let timer = Timer::new();
        assert!(timer.is_stopped());
        assert!(!timer.is_expired(Instant::now()));
        assert_eq!(timer.remaining(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_start_and_expire() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.start(now, Duration::from_secs(5));

        assert!(timer.is_running());
        assert!(!timer.is_expired(now));
        assert!(!timer.is_expired(now + Duration::from_secs(4)));
        assert!(timer.is_expired(now + Duration::from_secs(5)));
        assert!(timer.is_expired(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_stop_disarms() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.start(now, Duration::from_secs(1));
        timer.stop();
        assert!(timer.is_stopped());
        assert!(!timer.is_expired(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_remaining_saturates() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.start(now, Duration::from_secs(3));
        assert_eq!(timer.remaining(now + Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(timer.remaining(now + Duration::from_secs(9)), Duration::ZERO);
    }

    #[test]
    fn test_force_expire() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.start(now, Duration::from_secs(60));
        timer.force_expire(now);
        assert!(timer.is_running());
        assert!(timer.is_expired(now));
    }

    #[test]
    fn test_restart_moves_deadline() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.start(now, Duration::from_secs(1));
        timer.start(now + Duration::from_secs(1), Duration::from_secs(5));
        assert!(!timer.is_expired(now + Duration::from_secs(2)));
        assert!(timer.is_expired(now + Duration::from_secs(6)));
    }
}
