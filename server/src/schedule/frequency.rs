use chrono::{DateTime, Duration, FixedOffset, Months, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    utils::{datetime_to_millis, millis_to_datetime},
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

/// How often a schedule runs, optionally pinned to a wall-clock time in a fixed UTC offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    #[serde(default)]
    pub time_of_day: Option<TimeOfDay>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Recurrence {
    pub fn every(frequency: Frequency) -> Self {
        Self {
            frequency,
            time_of_day: None,
            utc_offset_minutes: 0,
        }
    }

    fn offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            Error::InvalidParameter(format!(
                "UTC offset of {} minutes is out of range",
                self.utc_offset_minutes
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.offset()?;
        if let Some(time) = self.time_of_day {
            if time.hour > 23 || time.minute > 59 {
                return Err(Error::InvalidParameter(format!(
                    "Invalid time of day {:02}:{:02}",
                    time.hour, time.minute
                )));
            }
        }
        Ok(())
    }

    fn advance(&self, from: DateTime<FixedOffset>) -> Result<DateTime<FixedOffset>> {
        let next = match self.frequency {
            Frequency::Hourly => from.checked_add_signed(Duration::hours(1)),
            Frequency::Daily => from.checked_add_signed(Duration::days(1)),
            Frequency::Weekly => from.checked_add_signed(Duration::weeks(1)),
            Frequency::Monthly => from.checked_add_months(Months::new(1)),
        };
        next.ok_or_else(|| Error::InvalidParameter("Next run is out of range".to_owned()))
    }

    /// The pinned slot in the period containing `at`.
    fn slot_in_period(
        &self,
        at: DateTime<FixedOffset>,
        time: TimeOfDay,
    ) -> Result<DateTime<FixedOffset>> {
        let out_of_range = || Error::InvalidParameter("Invalid time of day".to_owned());
        let hour = match self.frequency {
            Frequency::Hourly => at.hour(),
            _ => u32::from(time.hour),
        };
        let naive = at
            .date_naive()
            .and_hms_opt(hour, u32::from(time.minute), 0)
            .ok_or_else(out_of_range)?;
        at.offset()
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(out_of_range)
    }
}

/// The first run of a new schedule.
///
/// Without a pinned time the schedule is due immediately. With one, it runs at the pinned
/// time of the current period, or one period later if that time has already passed.
pub fn first_run_at(recurrence: &Recurrence, now: u64) -> Result<u64> {
    recurrence.validate()?;
    let Some(time) = recurrence.time_of_day else {
        return Ok(now);
    };

    let local = millis_to_datetime(now).with_timezone(&recurrence.offset()?);
    let mut slot = recurrence.slot_in_period(local, time)?;
    if slot.with_timezone(&Utc) <= millis_to_datetime(now) {
        slot = recurrence.advance(slot)?;
    }
    Ok(datetime_to_millis(slot.with_timezone(&Utc)))
}

/// The run after `previous`, rolled forward past `now` so missed periods are skipped rather
/// than replayed back to back.
pub fn next_run_after(recurrence: &Recurrence, previous: u64, now: u64) -> Result<u64> {
    recurrence.validate()?;
    let offset = recurrence.offset()?;
    let mut next = millis_to_datetime(previous).with_timezone(&offset);
    if let Some(time) = recurrence.time_of_day {
        next = recurrence.slot_in_period(next, time)?;
    }

    let now_utc = millis_to_datetime(now);
    loop {
        next = recurrence.advance(next)?;
        if next.with_timezone(&Utc) > now_utc {
            return Ok(datetime_to_millis(next.with_timezone(&Utc)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(text: &str) -> u64 {
        datetime_to_millis(
            DateTime::parse_from_rfc3339(text)
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    fn pinned(frequency: Frequency, hour: u8, minute: u8, offset: i32) -> Recurrence {
        Recurrence {
            frequency,
            time_of_day: Some(TimeOfDay { hour, minute }),
            utc_offset_minutes: offset,
        }
    }

    #[test]
    fn unpinned_schedules_are_due_immediately() {
        let now = millis("2026-03-01T10:15:00Z");
        assert_eq!(first_run_at(&Recurrence::every(Frequency::Daily), now).unwrap(), now);
    }

    #[test]
    fn pinned_time_later_today_runs_today() {
        let now = millis("2026-03-01T10:15:00Z");
        let recurrence = pinned(Frequency::Daily, 14, 30, 0);
        assert_eq!(
            first_run_at(&recurrence, now).unwrap(),
            millis("2026-03-01T14:30:00Z")
        );
    }

    #[test]
    fn elapsed_pinned_time_rolls_to_next_period() {
        let now = millis("2026-03-01T10:15:00Z");
        assert_eq!(
            first_run_at(&pinned(Frequency::Daily, 9, 0, 0), now).unwrap(),
            millis("2026-03-02T09:00:00Z")
        );
        assert_eq!(
            first_run_at(&pinned(Frequency::Weekly, 9, 0, 0), now).unwrap(),
            millis("2026-03-08T09:00:00Z")
        );
        assert_eq!(
            first_run_at(&pinned(Frequency::Hourly, 0, 5, 0), now).unwrap(),
            millis("2026-03-01T11:05:00Z")
        );
    }

    #[test]
    fn pinned_time_respects_the_offset() {
        // 09:00 at UTC+2 is 07:00 UTC, already past at 10:15 UTC.
        let now = millis("2026-03-01T10:15:00Z");
        assert_eq!(
            first_run_at(&pinned(Frequency::Daily, 9, 0, 120), now).unwrap(),
            millis("2026-03-02T07:00:00Z")
        );
    }

    #[test]
    fn next_run_is_deterministic() {
        let recurrence = Recurrence::every(Frequency::Daily);
        let previous = millis("2026-03-01T10:00:00Z");
        let now = millis("2026-03-01T10:00:30Z");
        let first = next_run_after(&recurrence, previous, now).unwrap();
        assert_eq!(first, next_run_after(&recurrence, previous, now).unwrap());
        assert_eq!(first, millis("2026-03-02T10:00:00Z"));
    }

    #[test]
    fn missed_periods_are_skipped() {
        let recurrence = Recurrence::every(Frequency::Hourly);
        let previous = millis("2026-03-01T10:00:00Z");
        let now = millis("2026-03-01T13:30:00Z");
        assert_eq!(
            next_run_after(&recurrence, previous, now).unwrap(),
            millis("2026-03-01T14:00:00Z")
        );
    }

    #[test]
    fn monthly_clamps_to_month_end() {
        let recurrence = Recurrence::every(Frequency::Monthly);
        let previous = millis("2026-01-31T08:00:00Z");
        let now = millis("2026-01-31T08:00:01Z");
        assert_eq!(
            next_run_after(&recurrence, previous, now).unwrap(),
            millis("2026-02-28T08:00:00Z")
        );
    }

    #[test]
    fn invalid_offsets_are_rejected() {
        let recurrence = Recurrence {
            frequency: Frequency::Daily,
            time_of_day: None,
            utc_offset_minutes: 24 * 60,
        };
        assert!(first_run_at(&recurrence, 0).is_err());

        let late = Recurrence {
            frequency: Frequency::Daily,
            time_of_day: Some(TimeOfDay { hour: 25, minute: 0 }),
            utc_offset_minutes: 0,
        };
        assert!(late.validate().is_err());
    }
}
