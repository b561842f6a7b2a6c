use chrono::{DateTime, Duration, NaiveDateTime, Utc};

/// A simple clock abstraction for deterministic time in services and tests.
#[derive(Debug, Clone, Copy, Default)]
pub enum Clock {
    #[default]
    Default,
    Fixed(DateTime<Utc>),
}

impl Clock {
    /// Returns a clock fixed at the given timestamp.
    #[must_use]
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self::Fixed(at)
    }

    /// Returns the current time according to the clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::Default => Utc::now(),
            Clock::Fixed(t) => *t,
        }
    }

    /// If this is a fixed clock, advance it by the given duration.
    ///
    /// Has no effect on `Clock::Default`.
    pub fn advance(&mut self, delta: Duration) {
        if let Clock::Fixed(t) = self {
            *t += delta;
        }
    }
}

/// Parse a stored timestamp that may or may not carry an offset.
///
/// RFC 3339 values are converted to UTC. Offset-less values (for example
/// `2024-03-01T09:30:00` or `2024-03-01 09:30:00.123`) are taken to be UTC, so
/// every timestamp the engine handles ends up with the same awareness.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(aware) = DateTime::parse_from_rfc3339(raw) {
        return Some(aware.with_timezone(&Utc));
    }
    // sqlx encodes `DateTime<Utc>` for sqlite as `YYYY-MM-DD HH:MM:SS.f+00:00`.
    if let Ok(aware) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(aware.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Seconds from `start` to `now`, never negative.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn elapsed_seconds(start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = now.signed_duration_since(start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

/// Deterministic timestamp for tests and examples (2023-11-14T22:13:20Z).
pub const FIXED_TEST_TIMESTAMP: i64 = 1_700_000_000;

/// Returns a deterministic `DateTime<Utc>` for tests and doc examples.
///
/// # Panics
///
/// Panics if the fixed timestamp cannot be represented.
#[must_use]
pub fn fixed_now() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(FIXED_TEST_TIMESTAMP, 0)
        .expect("fixed timestamp should be valid")
}

/// Returns a `Clock` fixed at the deterministic test timestamp.
#[must_use]
pub fn fixed_clock() -> Clock {
    Clock::fixed(fixed_now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aware_and_naive_timestamps_agree() {
        let aware = parse_timestamp("2023-11-14T22:13:20+00:00").unwrap();
        let naive = parse_timestamp("2023-11-14T22:13:20").unwrap();
        let spaced = parse_timestamp("2023-11-14 22:13:20.000").unwrap();
        assert_eq!(aware, fixed_now());
        assert_eq!(naive, fixed_now());
        assert_eq!(spaced, fixed_now());
    }

    #[test]
    fn offsets_are_converted_to_utc() {
        let shifted = parse_timestamp("2023-11-15T03:43:20+05:30").unwrap();
        assert_eq!(shifted, fixed_now());
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn elapsed_clamps_clock_skew() {
        let start = fixed_now();
        assert_eq!(elapsed_seconds(start, start + Duration::seconds(3)), 3.0);
        assert_eq!(elapsed_seconds(start, start - Duration::seconds(3)), 0.0);
    }

    #[test]
    fn fixed_clock_advances() {
        let mut clock = fixed_clock();
        clock.advance(Duration::minutes(1));
        assert_eq!(clock.now(), fixed_now() + Duration::minutes(1));
    }
}
