//! Retry delay computation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StatusCode, TransportError};

/// Bounds of a capped exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBackoffPolicyOptions")]
pub struct BackoffPolicyOptions {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

#[derive(Deserialize)]
struct RawBackoffPolicyOptions {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl TryFrom<RawBackoffPolicyOptions> for BackoffPolicyOptions {
    type Error = ConfigError;

    fn try_from(raw: RawBackoffPolicyOptions) -> Result<Self, ConfigError> {
        Self::new(raw.initial, raw.max, raw.multiplier)
    }
}

impl BackoffPolicyOptions {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Result<Self, ConfigError> {
        if max < initial {
            return Err(ConfigError::invalid(
                "backoff max",
                format!("{max:?} is less than the initial backoff {initial:?}"),
            ));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff multiplier",
                format!("{multiplier} must be a finite value greater than or equal to 1"),
            ));
        }
        Ok(Self {
            initial,
            max,
            multiplier,
        })
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// The delay following `current`, always within `[initial, max]`.
    pub fn next(&self, current: Duration) -> Duration {
        if current < self.initial {
            return self.initial;
        }
        if current >= self.max {
            return self.max;
        }
        let scaled = current.as_secs_f64() * self.multiplier;
        if scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled).clamp(self.initial, self.max)
        }
    }
}

impl Default for BackoffPolicyOptions {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Stateful walk through a [`BackoffPolicyOptions`] sequence.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    options: BackoffPolicyOptions,
    current: Option<Duration>,
}

impl BackoffPolicy {
    /// Smallest delay the walk grows from, so a zero initial delay still
    /// backs off.
    pub const MIN_STEP: Duration = Duration::from_millis(10);

    pub fn new(options: BackoffPolicyOptions) -> Self {
        Self {
            options,
            current: None,
        }
    }

    pub fn next(&mut self) -> Duration {
        let next = match self.current {
            None => self.options.initial,
            Some(current) => self.options.next(current.max(Self::MIN_STEP)),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn options(&self) -> &BackoffPolicyOptions {
        &self.options
    }
}

/// Fixed retry delays for stream level failures, picked by status code.
pub struct ScheduleDue;

impl ScheduleDue {
    pub const DEFAULT: Duration = Duration::from_millis(500);
    pub const SLOW: Duration = Duration::from_millis(5000);
    pub const FAST: Duration = Duration::from_millis(50);

    pub fn from_status_code(code: StatusCode) -> Duration {
        match code {
            StatusCode::NotFound
            | StatusCode::PermissionDenied
            | StatusCode::Unimplemented
            | StatusCode::Unauthenticated
            | StatusCode::FailedPrecondition
            | StatusCode::InvalidArgument
            | StatusCode::ResourceExhausted => Self::SLOW,
            StatusCode::Unavailable => Self::FAST,
            _ => Self::DEFAULT,
        }
    }

    pub fn from_error(error: &TransportError) -> Duration {
        Self::from_status_code(error.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn options_reject_inverted_bounds_and_small_multipliers() {
        assert!(BackoffPolicyOptions::new(ms(20), ms(10), 2.0).is_err());
        assert!(BackoffPolicyOptions::new(ms(10), ms(20), 0.5).is_err());
        assert!(BackoffPolicyOptions::new(ms(10), ms(20), f64::NAN).is_err());
        assert!(BackoffPolicyOptions::new(ms(0), ms(0), 1.0).is_ok());
    }

    #[test]
    fn options_next_clamps_into_bounds() {
        let options = BackoffPolicyOptions::new(ms(10), ms(40), 2.0).expect("options");
        assert_eq!(options.next(ms(0)), ms(10));
        assert_eq!(options.next(ms(10)), ms(20));
        assert_eq!(options.next(ms(30)), ms(40));
        assert_eq!(options.next(ms(400)), ms(40));
    }

    #[test]
    fn options_next_is_monotonic_and_bounded() {
        let options = BackoffPolicyOptions::new(ms(3), ms(1000), 1.7).expect("options");
        let mut current = Duration::ZERO;
        for _ in 0..64 {
            let next = options.next(current);
            assert!(next >= current.min(options.max()));
            assert!(next <= options.max());
            assert!(next >= options.initial());
            current = next;
        }
        assert_eq!(current, options.max());
    }

    #[test]
    fn policy_walks_up_to_max_and_stays() {
        let options = BackoffPolicyOptions::new(ms(10), ms(40), 2.0).expect("options");
        let mut policy = BackoffPolicy::new(options);
        assert_eq!(policy.next(), ms(10));
        assert_eq!(policy.next(), ms(20));
        assert_eq!(policy.next(), ms(40));
        assert_eq!(policy.next(), ms(40));
        policy.reset();
        assert_eq!(policy.next(), ms(10));
    }

    #[test]
    fn unit_multiplier_keeps_initial_delay() {
        let options = BackoffPolicyOptions::new(ms(10), ms(40), 1.0).expect("options");
        let mut policy = BackoffPolicy::new(options);
        assert_eq!(policy.next(), ms(10));
        assert_eq!(policy.next(), ms(10));
    }

    #[test]
    fn zero_initial_delay_still_backs_off() {
        let options = BackoffPolicyOptions::new(Duration::ZERO, ms(100), 2.0).expect("options");
        let mut policy = BackoffPolicy::new(options);
        assert_eq!(policy.next(), Duration::ZERO);
        assert_eq!(policy.next(), ms(20));
        assert_eq!(policy.next(), ms(40));
        assert_eq!(policy.next(), ms(80));
        assert_eq!(policy.next(), ms(100));
        policy.reset();
        assert_eq!(policy.next(), Duration::ZERO);
    }

    #[test]
    fn schedule_due_by_status() {
        assert_eq!(ScheduleDue::from_status_code(StatusCode::Unavailable), ms(50));
        assert_eq!(ScheduleDue::from_status_code(StatusCode::PermissionDenied), ms(5000));
        assert_eq!(ScheduleDue::from_status_code(StatusCode::Internal), ms(500));
        assert_eq!(ScheduleDue::from_error(&TransportError::io("reset")), ms(500));
    }

    #[test]
    fn options_deserialize_with_validation() {
        let parsed: Result<BackoffPolicyOptions, _> = toml::from_str(
            "initial = { secs = 0, nanos = 10000000 }\nmax = { secs = 1, nanos = 0 }\nmultiplier = 2.0\n",
        );
        assert_eq!(parsed.map(|o| o.initial()).ok(), Some(ms(10)));

        let rejected: Result<BackoffPolicyOptions, _> = toml::from_str(
            "initial = { secs = 2, nanos = 0 }\nmax = { secs = 1, nanos = 0 }\nmultiplier = 2.0\n",
        );
        assert!(rejected.is_err());
    }
}
