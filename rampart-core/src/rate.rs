//! Route classes and fixed-window rate limit types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::{add_duration, elapsed_between};
use crate::error::ConfigError;

// ============================================================================
// ROUTE CLASS
// ============================================================================

/// Endpoint category used for rate-limit budgeting.
///
/// Each class has its own bucket per client, so a burst on one class cannot
/// starve another for the same client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteClass {
    /// Regular polling reads (schedules, listings).
    General,
    /// Write-heavy submissions such as attendance.
    Submission,
    /// High-frequency lightweight reads (dropdowns, today's schedule).
    Lightweight,
}

impl RouteClass {
    pub const ALL: [RouteClass; 3] = [Self::General, Self::Submission, Self::Lightweight];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Submission => "submission",
            Self::Lightweight => "lightweight",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "general" => Some(Self::General),
            "submission" => Some(Self::Submission),
            "lightweight" => Some(Self::Lightweight),
            _ => None,
        }
    }
}

impl std::fmt::Display for RouteClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

// ============================================================================
// RATE LIMIT SPEC
// ============================================================================

/// `max` requests per `window`, written `"<max>,<decay minutes>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub max: u32,
    pub window: Duration,
}

impl RateLimitSpec {
    pub fn per_minutes(max: u32, minutes: u64) -> Self {
        Self {
            max,
            window: Duration::from_secs(minutes * 60),
        }
    }

    /// Parse the `"60,1"` form. A bare `"60"` means one minute.
    pub fn parse(field: &str, value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = value.split(',').map(str::trim);
        let max = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("expected \"<max>,<minutes>\""))?
            .parse::<u32>()
            .map_err(|_| invalid("max must be a positive integer"))?;
        let minutes = match parts.next() {
            Some(m) => m
                .parse::<u64>()
                .map_err(|_| invalid("minutes must be a positive integer"))?,
            None => 1,
        };
        if parts.next().is_some() {
            return Err(invalid("too many components"));
        }
        if max == 0 {
            return Err(invalid("max must be > 0"));
        }
        if minutes == 0 {
            return Err(invalid("minutes must be > 0"));
        }
        Ok(Self::per_minutes(max, minutes))
    }
}

impl std::fmt::Display for RateLimitSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.max, self.window.as_secs() / 60)
    }
}

// ============================================================================
// RATE BUCKET
// ============================================================================

/// Fixed-window counter for one `(client, route class)` subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBucket {
    pub subject_key: String,
    pub window_start: DateTime<Utc>,
    pub count: u64,
}

impl RateBucket {
    pub fn window_end(&self, window: Duration) -> DateTime<Utc> {
        add_duration(self.window_start, window)
    }

    /// `now` falls outside `[window_start, window_start + window)`.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now < self.window_start || now >= self.window_end(window)
    }

    /// Time until the window resets.
    pub fn retry_after(&self, now: DateTime<Utc>, window: Duration) -> Duration {
        elapsed_between(now, self.window_end(window))
    }
}

/// Outcome of an admitted request, used for `X-RateLimit-*` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub route_class: RouteClass,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_throttle_syntax() {
        let spec = RateLimitSpec::parse("general", "60,1").unwrap();
        assert_eq!(spec.max, 60);
        assert_eq!(spec.window, Duration::from_secs(60));

        let spec = RateLimitSpec::parse("general", " 100 , 5 ").unwrap();
        assert_eq!(spec.max, 100);
        assert_eq!(spec.window, Duration::from_secs(300));

        let spec = RateLimitSpec::parse("general", "80").unwrap();
        assert_eq!(spec.window, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "abc", "0,1", "60,0", "60,1,2", "-5,1", ",1"] {
            assert!(RateLimitSpec::parse("general", bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn test_spec_display_roundtrip() {
        let spec = RateLimitSpec::per_minutes(30, 2);
        assert_eq!(spec.to_string(), "30,2");
        assert_eq!(RateLimitSpec::parse("x", &spec.to_string()).unwrap(), spec);
    }

    #[test]
    fn test_route_class_roundtrip() {
        for class in RouteClass::ALL {
            assert_eq!(RouteClass::from_db_str(class.as_db_str()), Some(class));
        }
        assert_eq!(RouteClass::from_db_str("admin"), None);
    }

    #[test]
    fn test_bucket_window_bounds() {
        let start = Utc::now();
        let bucket = RateBucket {
            subject_key: "abc".to_string(),
            window_start: start,
            count: 3,
        };
        let window = Duration::from_secs(60);

        assert!(!bucket.is_expired(start, window));
        assert!(!bucket.is_expired(add_duration(start, Duration::from_secs(59)), window));
        assert!(bucket.is_expired(add_duration(start, window), window));
        assert_eq!(
            bucket.retry_after(add_duration(start, Duration::from_secs(45)), window),
            Duration::from_secs(15)
        );
    }
}
