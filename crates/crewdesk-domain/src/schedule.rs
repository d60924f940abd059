// SPDX-License-Identifier: GPL-3.0-or-later
//! Recurrence definitions and the next-run calculator.
//!
//! The calculator is pure: given a validated schedule and a reference
//! instant it always yields a timestamp strictly in the future. Validation
//! happens at schedule-acceptance time in the report service, never here.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("weekly schedule requires day_of_week")]
    MissingDayOfWeek,
    #[error("monthly schedule requires day_of_month")]
    MissingDayOfMonth,
    #[error("day_of_month must be between 1 and 31, got {0}")]
    DayOfMonthOutOfRange(u32),
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("schedule requires at least one recipient")]
    NoRecipients,
}

/// Recurrence template embedded in the job record that spawned the current
/// cycle. Each completed cycle produces a new job carrying an advanced copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub frequency: Frequency,
    /// Required for weekly schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<Weekday>,
    /// Required for monthly schedules; clamped to the last valid day of
    /// shorter target months.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
    /// Defaults to local midnight when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_of_day: Option<NaiveTime>,
    /// IANA timezone name, e.g. "Europe/Madrid". Defaults to UTC.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl RecurringSchedule {
    pub fn daily(
        time_of_day: Option<NaiveTime>,
        timezone: impl Into<String>,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            frequency: Frequency::Daily,
            day_of_week: None,
            day_of_month: None,
            time_of_day,
            timezone: timezone.into(),
            recipients,
            next_run: None,
            last_run: None,
        }
    }

    pub fn weekly(
        day_of_week: Weekday,
        time_of_day: Option<NaiveTime>,
        timezone: impl Into<String>,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            frequency: Frequency::Weekly,
            day_of_week: Some(day_of_week),
            day_of_month: None,
            time_of_day,
            timezone: timezone.into(),
            recipients,
            next_run: None,
            last_run: None,
        }
    }

    pub fn monthly(
        day_of_month: u32,
        time_of_day: Option<NaiveTime>,
        timezone: impl Into<String>,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            frequency: Frequency::Monthly,
            day_of_week: None,
            day_of_month: Some(day_of_month),
            time_of_day,
            timezone: timezone.into(),
            recipients,
            next_run: None,
            last_run: None,
        }
    }

    /// Frequency-specific field checks, applied at schedule acceptance.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self.frequency {
            Frequency::Daily => {}
            Frequency::Weekly => {
                if self.day_of_week.is_none() {
                    return Err(ScheduleError::MissingDayOfWeek);
                }
            }
            Frequency::Monthly => match self.day_of_month {
                None => return Err(ScheduleError::MissingDayOfMonth),
                Some(day) if !(1..=31).contains(&day) => {
                    return Err(ScheduleError::DayOfMonthOutOfRange(day))
                }
                Some(_) => {}
            },
        }
        if self.timezone.parse::<Tz>().is_err() {
            return Err(ScheduleError::UnknownTimezone(self.timezone.clone()));
        }
        if self.recipients.is_empty() {
            return Err(ScheduleError::NoRecipients);
        }
        Ok(())
    }

    fn tz(&self) -> Tz {
        // Validated at acceptance; an unparseable zone here falls back to UTC
        // rather than failing a running cycle.
        self.timezone.parse::<Tz>().unwrap_or(chrono_tz::UTC)
    }

    /// Next run strictly after `from`.
    ///
    /// Daily advances one day; weekly advances to the next occurrence of the
    /// target weekday, a full week when `from` already falls on it; monthly
    /// moves to the same day next month, clamped to the last valid day.
    pub fn next_run_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let tz = self.tz();
        let local = from.with_timezone(&tz);
        let time = self.time_of_day.unwrap_or(NaiveTime::MIN);

        let date = match self.frequency {
            Frequency::Daily => local.date_naive() + Days::new(1),
            Frequency::Weekly => {
                let target = self.day_of_week.unwrap_or_else(|| local.weekday());
                let ahead = (target.num_days_from_monday() + 7
                    - local.weekday().num_days_from_monday())
                    % 7;
                // Same weekday means a full week ahead, never `from` itself.
                let ahead = if ahead == 0 { 7 } else { ahead };
                local.date_naive() + Days::new(u64::from(ahead))
            }
            Frequency::Monthly => {
                let requested = self.day_of_month.unwrap_or_else(|| local.day());
                let (year, month) = if local.month() == 12 {
                    (local.year() + 1, 1)
                } else {
                    (local.year(), local.month() + 1)
                };
                clamped_date(year, month, requested)
            }
        };

        resolve_local(tz, date, time)
    }

    /// Copy of this template armed for its first cycle: `next_run` freshly
    /// computed, `last_run` untouched since nothing has run yet.
    pub fn armed(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.next_run = Some(self.next_run_after(now));
        next
    }

    /// Copy of this template advanced past a cycle that just ran at `now`:
    /// `last_run = now`, `next_run` freshly computed.
    pub fn advanced(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.armed(now);
        next.last_run = Some(now);
        next
    }
}

/// Day-of-month clamped to the target month's length.
fn clamped_date(year: i32, month: u32, day: u32) -> NaiveDate {
    let day = day.max(1);
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_else(|| last_day_of_month(year, month))
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    // The first of the following month always exists.
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 28).unwrap_or_default())
        - Days::new(1)
}

/// Resolve a local wall-clock instant to UTC. DST gaps shift forward an
/// hour; ambiguous times take the earlier offset.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
        chrono::LocalResult::None => {
            let shifted = naive + chrono::Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
                chrono::LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
                chrono::LocalResult::None => Utc.from_utc_datetime(&naive),
            }
        }
    }
}
