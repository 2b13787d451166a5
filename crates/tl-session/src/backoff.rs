//! Backoff schedule for explicit reconnects

use std::time::Duration;

use tl_core::config::BackoffConfig;

/// Exponential delays with jitter, for a bounded number of attempts
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    /// Delay before the next retry, without jitter
    current: Duration,
    /// Upper bound on the delay
    max: Duration,
    /// Growth factor per retry
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
    /// Attempts left, including the first one
    remaining: u32,
    /// Whether the first attempt has been handed out
    started: bool,
}

impl ReconnectSchedule {
    /// Schedule of `attempts` tries paced by `config`
    pub fn from_config(config: &BackoffConfig, attempts: u32) -> Self {
        Self {
            current: config.initial,
            max: config.max,
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            remaining: attempts.max(1),
            started: false,
        }
    }

    /// Delay to wait before the next attempt, or `None` once every attempt
    /// is used. The first attempt starts immediately.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if !self.started {
            self.started = true;
            return Some(Duration::ZERO);
        }

        let delay = self.current;
        let grown = Duration::from_secs_f64(delay.as_secs_f64() * self.multiplier);
        self.current = grown.min(self.max);

        let jitter = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        Some(delay + Duration::from_secs_f64(jitter))
    }

    /// Attempts not yet handed out
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial: u64, max: u64, jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_secs(initial),
            max: Duration::from_secs(max),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_first_attempt_is_immediate_then_doubles() {
        let mut schedule = ReconnectSchedule::from_config(&config(1, 60, 0.0), 4);

        assert_eq!(schedule.next_delay(), Some(Duration::ZERO));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(schedule.next_delay(), None);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut schedule = ReconnectSchedule::from_config(&config(30, 60, 0.0), 4);
        schedule.next_delay();

        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(30)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(60)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut schedule = ReconnectSchedule::from_config(&config(10, 60, 0.5), 2);
        schedule.next_delay();

        let delay = schedule.next_delay().unwrap();
        assert!(delay >= Duration::from_secs(10));
        assert!(delay <= Duration::from_secs(15));
        assert_eq!(schedule.remaining(), 0);
    }
}
