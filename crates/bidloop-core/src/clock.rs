//! Wall clock and local schedule
//!
//! Cycle open times and daily jobs are defined in a local timezone with a fixed
//! UTC offset (the platform runs on +05:30). All instants are stored in UTC;
//! [`LocalSchedule`] converts between the two.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use parking_lot::Mutex;

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real time
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Fixed-offset local calendar
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalSchedule {
    offset: FixedOffset,
}

impl LocalSchedule {
    /// Offset in minutes east of UTC; out-of-range values fall back to UTC
    pub fn from_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or(Utc.fix());
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::from_offset_minutes(0)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local calendar date of an instant
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// The UTC instant of `time` on local `date`
    pub fn at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = date.and_time(time);
        match self.offset.from_local_datetime(&local).single() {
            Some(dt) => dt.with_timezone(&Utc),
            // fixed offsets are never ambiguous
            None => Utc.from_utc_datetime(&(local - Duration::seconds(self.offset.local_minus_utc() as i64))),
        }
    }

    /// Next instant at or after `after` whose local time is `time`
    pub fn next_occurrence(&self, after: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
        let today = self.at(self.local_date(after), time);
        if today >= after {
            today
        } else {
            today + Duration::days(1)
        }
    }

    /// Whole days between the local dates of two instants
    pub fn days_between(&self, earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
        (self.local_date(later) - self.local_date(earlier)).num_days()
    }
}

impl Default for LocalSchedule {
    fn default() -> Self {
        Self::utc()
    }
}
