//! Write clock.
//!
//! Every write takes a tick from the catalog's clock. Ticks are strictly
//! increasing at the 100ns resolution timestamps are rendered with, so no
//! two writes ever share a Timestamp or an ETag.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use parking_lot::Mutex;
use tablelocal_common::ETag;
use tablelocal_common::entity::format_timestamp;

/// Strictly increasing timestamp source
#[derive(Debug)]
pub struct Clock {
    last: Mutex<DateTime<Utc>>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Next tick: wall-clock time, bumped past the previous tick if needed
    pub fn tick(&self) -> DateTime<Utc> {
        let mut last = self.last.lock();
        let mut now = Utc::now().trunc_subsecs(7);
        if now <= *last {
            now = *last + TimeDelta::nanoseconds(100);
        }
        *last = now;
        now
    }

    /// Make sure future ticks land after `ts` (used when reloading state)
    pub fn observe(&self, ts: DateTime<Utc>) {
        let mut last = self.last.lock();
        if ts > *last {
            *last = ts;
        }
    }
}

/// ETag for an entity written at `ts`: `W/"datetime'<url-encoded ts>'"`
#[must_use]
pub fn etag_for(ts: &DateTime<Utc>) -> ETag {
    ETag::from_raw(format!(
        "W/\"datetime'{}'\"",
        urlencoding::encode(&format_timestamp(ts))
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ticks_strictly_increase() {
        let clock = Clock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            assert_ne!(etag_for(&next), etag_for(&prev));
            prev = next;
        }
    }

    #[test]
    fn test_observe_moves_clock_forward() {
        let clock = Clock::new();
        let future = Utc::now() + TimeDelta::days(1);
        clock.observe(future);
        assert!(clock.tick() > future);
    }

    #[test]
    fn test_etag_format() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(
            etag_for(&ts).as_str(),
            "W/\"datetime'2024-05-01T10%3A00%3A00.0000000Z'\""
        );
    }
}
