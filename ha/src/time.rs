use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

pub type Timestamp = DateTime<Utc>;

/// Wall-clock source used for lease renewal and expiry decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to. Shared between simulated members so
/// every participant observes the same instant.
#[derive(Debug)]
pub struct ManualClock {
    base: Timestamp,
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(base: Timestamp) -> Self {
        Self {
            base,
            offset_ms: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.base + Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> crate::Result<Timestamp> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| crate::Error::Malformed(format!("bad timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::seconds(3));
        assert_eq!(clock.now() - start, Duration::seconds(3));
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn test_timestamp_format_keeps_millis() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let raw = format_timestamp(&ts);
        assert_eq!(raw, "2024-05-01T10:00:00.250Z");
        assert_eq!(parse_timestamp(&raw).unwrap(), ts);
        assert!(parse_timestamp("yesterday").is_err());
    }
}
