//! Plain-text rendering for CLI output.

use std::collections::HashMap;
use std::fmt::Write;

use stint_core::{DashboardSnapshot, DaySummary, EnrichedActivity, MonthSummary, Session};

/// `HH:MM:SS`; hours keep growing past 99 and negative input renders as zero.
pub fn duration(ms: i64) -> String {
    let total_secs = ms.max(0) / 1000;
    format!(
        "{:02}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60
    )
}

pub fn activity_table(activities: &[EnrichedActivity]) -> String {
    if activities.is_empty() {
        return "No activities yet. Create one with `stint add <NAME>`.\n".to_string();
    }
    let name_width = activities
        .iter()
        .map(|entry| entry.activity.name.chars().count())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for entry in activities {
        let marker = if entry.is_running { "▶" } else { " " };
        let line = format!(
            "{} {:>4}  {:<width$}  {}  {}",
            marker,
            entry.activity.id,
            entry.activity.name,
            duration(entry.display_duration_ms),
            entry.activity.color_hex.as_deref().unwrap_or(""),
            width = name_width
        );
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

/// One-line status used by `status` and each `watch` refresh.
pub fn status_line(snapshot: &DashboardSnapshot) -> String {
    let running = snapshot
        .activities
        .iter()
        .find(|entry| entry.is_running)
        .map(|entry| {
            format!(
                "{} {}",
                entry.activity.name,
                duration(entry.display_duration_ms)
            )
        })
        .unwrap_or_else(|| "idle".to_string());
    format!(
        "{}  |  today {}",
        running,
        duration(snapshot.daily_total_ms)
    )
}

pub fn session_line(session: &Session, name: &str) -> String {
    let span = if session.is_open() {
        "running".to_string()
    } else {
        duration(session.duration_ms().unwrap_or(0))
    };
    format!("{}  {:<24}  {}", session.start_time.to_rfc3339(), name, span)
}

pub fn day_summary(summary: &DaySummary, names: &HashMap<i64, String>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}  total {}", summary.date, duration(summary.total_ms));
    for entry in &summary.activities {
        let name = names
            .get(&entry.activity_id)
            .cloned()
            .unwrap_or_else(|| format!("#{}", entry.activity_id));
        let _ = writeln!(
            out,
            "  {:<24}  {}  ({} {})",
            name,
            duration(entry.total_ms),
            entry.session_count,
            if entry.session_count == 1 { "session" } else { "sessions" }
        );
    }
    out
}

pub fn month_summary(summary: &MonthSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:04}-{:02}  total {}  (previous month {}{})",
        summary.year,
        summary.month,
        duration(summary.total_ms),
        duration(summary.previous_month_total_ms),
        change(summary.total_ms, summary.previous_month_total_ms)
            .map(|pct| format!(", {:+}%", pct))
            .unwrap_or_default()
    );
    for day in summary.days.iter().filter(|day| day.total_ms > 0) {
        let _ = writeln!(out, "  {}  {}", day.date, duration(day.total_ms));
    }
    out
}

/// Whole-percent change against the previous period; `None` without a baseline.
fn change(current: i64, previous: i64) -> Option<i64> {
    if previous <= 0 {
        return None;
    }
    Some(((current - previous) as f64 / previous as f64 * 100.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use stint_core::stats::{ActivityDayTotal, DayTotal};
    use stint_core::Activity;

    fn enriched(id: i64, name: &str, display_ms: i64, running: bool) -> EnrichedActivity {
        EnrichedActivity {
            activity: Activity {
                id,
                remote_key: Some(format!("k{}", id)),
                user_id: "u1".to_string(),
                name: name.to_string(),
                color_hex: None,
                created_at: Utc::now(),
                total_duration_ms_today: display_ms,
                running_total_ms: 0,
                is_active: running,
            },
            display_duration_ms: display_ms,
            is_running: running,
        }
    }

    #[test]
    fn duration_pads_and_clamps() {
        assert_eq!(duration(605_000), "00:10:05");
        assert_eq!(duration(3_600_000 * 101 + 59_999), "101:00:59");
        assert_eq!(duration(-5), "00:00:00");
    }

    #[test]
    fn status_line_names_running_activity() {
        let snapshot = DashboardSnapshot {
            live: None,
            activities: vec![
                enriched(1, "Writing", 605_000, true),
                enriched(2, "Reading", 60_000, false),
            ],
            daily_total_ms: 665_000,
        };
        assert_eq!(status_line(&snapshot), "Writing 00:10:05  |  today 00:11:05");

        let idle = DashboardSnapshot::default();
        assert_eq!(status_line(&idle), "idle  |  today 00:00:00");
    }

    #[test]
    fn activity_table_marks_running_row() {
        let table = activity_table(&[
            enriched(1, "Writing", 605_000, true),
            enriched(12, "Go", 0, false),
        ]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("▶    1  Writing  00:10:05"));
        assert!(lines[1].starts_with("    12  Go       00:00:00"));
    }

    #[test]
    fn session_line_marks_open_sessions_running() {
        let open = Session {
            id: 1,
            uid: "01J".to_string(),
            activity_id: 3,
            user_id: "u1".to_string(),
            start_time: Utc.timestamp_millis_opt(0).single().expect("start"),
            end_time: None,
        };
        assert!(session_line(&open, "Piano").ends_with("  running"));

        let closed = Session {
            end_time: Some(open.start_time + chrono::Duration::seconds(95)),
            ..open.clone()
        };
        let line = session_line(&closed, "Piano");
        assert!(line.contains("Piano"));
        assert!(line.ends_with("00:01:35"));
    }

    #[test]
    fn summaries_render_names_and_change() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).expect("date");
        let day = DaySummary {
            date,
            activities: vec![ActivityDayTotal {
                activity_id: 3,
                total_ms: 90_000,
                session_count: 1,
            }],
            total_ms: 90_000,
        };
        let names = HashMap::from([(3, "Piano".to_string())]);
        let rendered = day_summary(&day, &names);
        assert!(rendered.starts_with("2026-03-14  total 00:01:30"));
        assert!(rendered.contains("Piano"));
        assert!(rendered.contains("(1 session)"));

        let month = MonthSummary {
            year: 2026,
            month: 3,
            days: vec![
                DayTotal {
                    date,
                    total_ms: 150_000,
                },
                DayTotal {
                    date: date.succ_opt().expect("next day"),
                    total_ms: 0,
                },
            ],
            total_ms: 150_000,
            previous_month_total_ms: 100_000,
        };
        let rendered = month_summary(&month);
        assert!(rendered.contains("+50%"));
        assert_eq!(rendered.lines().count(), 2);
    }
}
