//! Anchored "every N periods" schedules.

use super::Frequency;
use crate::error::ScheduleError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};

/// Occurrences at `anchor + k * N * period` for k >= 0.
///
/// The anchor is the policy start time truncated to the minute, so the
/// minute, hour, weekday and day-of-month of every occurrence match it.
/// Monthly occurrences on months shorter than the anchor day land on the
/// month's last day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalSchedule {
    frequency: Frequency,
    interval: u32,
    anchor: DateTime<Utc>,
}

impl IntervalSchedule {
    pub fn new(
        frequency: Frequency,
        interval: u32,
        start: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        if frequency == Frequency::Custom {
            return Err(ScheduleError::Validation(
                "custom frequency requires a cron expression".into(),
            ));
        }
        if interval == 0 {
            return Err(ScheduleError::InvalidInterval(interval.to_string()));
        }

        let anchor = start
            - Duration::seconds(i64::from(start.second()))
            - Duration::nanoseconds(i64::from(start.nanosecond()));

        Ok(Self {
            frequency,
            interval,
            anchor,
        })
    }

    pub fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    /// First occurrence strictly after `after`.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if after < self.anchor {
            return Some(self.anchor);
        }
        match self.fixed_period() {
            Some(period) => {
                let period_secs = period.num_seconds();
                let elapsed = (after - self.anchor).num_seconds();
                let k = elapsed / period_secs + 1;
                self.anchor.checked_add_signed(Duration::seconds(k * period_secs))
            }
            None => self.next_monthly(after),
        }
    }

    fn fixed_period(&self) -> Option<Duration> {
        let n = i64::from(self.interval);
        match self.frequency {
            Frequency::Minutely => Some(Duration::minutes(n)),
            Frequency::Hourly => Some(Duration::hours(n)),
            Frequency::Daily => Some(Duration::days(n)),
            Frequency::Weekly => Some(Duration::weeks(n)),
            Frequency::Monthly | Frequency::Custom => None,
        }
    }

    fn next_monthly(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let step = self.interval as i32;
        let elapsed_months = month_index(after) - month_index(self.anchor);
        let mut k = elapsed_months.max(0) / step;

        // At most two candidates: the one in `after`'s month may be earlier in the month.
        loop {
            let candidate = self.monthly_occurrence(k * step)?;
            if candidate > after {
                return Some(candidate);
            }
            k += 1;
        }
    }

    fn monthly_occurrence(&self, months_from_anchor: i32) -> Option<DateTime<Utc>> {
        let total = month_index(self.anchor) + months_from_anchor;
        let year = total.div_euclid(12);
        let month = total.rem_euclid(12) as u32 + 1;
        let day = self.anchor.day().min(days_in_month(year, month)?);

        NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_opt(self.anchor.hour(), self.anchor.minute(), 0)
            .map(|naive| naive.and_utc())
    }
}

fn month_index(t: DateTime<Utc>) -> i32 {
    t.year() * 12 + t.month0() as i32
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    first_of_next.pred_opt().map(|d| d.day())
}
