//! Day and month summaries over ledger range queries.
//!
//! Only closed sessions count, each attributed to the local day it started on.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::clock::{days_in_month, local_date};
use crate::types::Session;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDayTotal {
    pub activity_id: i64,
    pub total_ms: i64,
    pub session_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    /// Largest total first.
    pub activities: Vec<ActivityDayTotal>,
    pub total_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayTotal {
    pub date: NaiveDate,
    pub total_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthSummary {
    pub year: i32,
    pub month: u32,
    /// One entry per calendar day, including empty days.
    pub days: Vec<DayTotal>,
    pub total_ms: i64,
    pub previous_month_total_ms: i64,
}

pub fn summarize_day(date: NaiveDate, sessions: &[Session]) -> DaySummary {
    let mut per_activity: BTreeMap<i64, ActivityDayTotal> = BTreeMap::new();
    for (session, duration) in completed_on(sessions, move |day| day == date) {
        let entry = per_activity
            .entry(session.activity_id)
            .or_insert(ActivityDayTotal {
                activity_id: session.activity_id,
                total_ms: 0,
                session_count: 0,
            });
        entry.total_ms += duration;
        entry.session_count += 1;
    }

    let mut activities: Vec<_> = per_activity.into_values().collect();
    activities.sort_by(|a, b| {
        b.total_ms
            .cmp(&a.total_ms)
            .then(a.activity_id.cmp(&b.activity_id))
    });
    DaySummary {
        date,
        total_ms: activities.iter().map(|a| a.total_ms).sum(),
        activities,
    }
}

pub fn summarize_month(
    year: i32,
    month: u32,
    sessions: &[Session],
    previous_month_sessions: &[Session],
) -> MonthSummary {
    let mut days: Vec<DayTotal> = (1..=days_in_month(year, month))
        .filter_map(|day| NaiveDate::from_ymd_opt(year, month, day))
        .map(|date| DayTotal { date, total_ms: 0 })
        .collect();

    let in_month = move |day: NaiveDate| day.year() == year && day.month() == month;
    for (session, duration) in completed_on(sessions, in_month) {
        let index = local_date(session.start_time).day0() as usize;
        if let Some(day) = days.get_mut(index) {
            day.total_ms += duration;
        }
    }

    let (prev_year, prev_month) = crate::clock::previous_month(year, month);
    let previous_month_total_ms = completed_on(previous_month_sessions, move |day| {
        day.year() == prev_year && day.month() == prev_month
    })
    .map(|(_, duration)| duration)
    .sum();

    MonthSummary {
        year,
        month,
        total_ms: days.iter().map(|day| day.total_ms).sum(),
        days,
        previous_month_total_ms,
    }
}

fn completed_on<'a>(
    sessions: &'a [Session],
    keep_day: impl Fn(NaiveDate) -> bool + 'a,
) -> impl Iterator<Item = (&'a Session, i64)> + 'a {
    sessions.iter().filter_map(move |session| {
        let duration = session.duration_ms()?;
        keep_day(local_date(session.start_time)).then_some((session, duration))
    })
}
