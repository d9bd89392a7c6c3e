use std::time::{Duration, Instant};

/// Idle-exit timer of the service loop.
#[derive(Copy, Clone, Debug, Default)]
pub struct Scheduler {
    deadline: Option<Instant>,
}

impl Scheduler {
    /// Creates a disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Arms the timer to fire `timeout` from now, replacing any earlier deadline.
    pub fn rearm(&mut self, timeout: Duration) {
        self.rearm_at(Instant::now(), timeout);
    }

    pub fn rearm_at(&mut self, now: Instant, timeout: Duration) {
        self.deadline = Some(now + timeout);
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until the timer fires, `None` if disarmed.
    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}
