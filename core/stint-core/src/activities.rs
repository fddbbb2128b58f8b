//! Activity aggregate store.
//!
//! Holds the user's activities and two derived cache fields the coordinator
//! maintains: `total_duration_ms_today` (closed sessions only) and the
//! `is_active` / `running_total_ms` pair written on start, tick and stop.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use crate::db::Db;
use crate::error::{Result, TrackerError};
use crate::types::{Activity, NewActivity};

const ACTIVITY_COLUMNS: &str = "id, remote_key, user_id, name, total_duration_ms_today, \
                                is_active, running_total_ms, color_hex, created_at";
const MAX_NAME_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct ActivityStore {
    db: Db,
}

impl ActivityStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn insert(
        &self,
        activity: &NewActivity,
        remote_key: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Activity> {
        validate_name(&activity.name)?;
        if let Some(color) = activity.color_hex.as_deref() {
            validate_color(color)?;
        }

        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO activities (remote_key, user_id, name, color_hex, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    remote_key,
                    activity.user_id,
                    activity.name.trim(),
                    activity.color_hex,
                    created_at.to_rfc3339()
                ],
            )
            .map_err(|err| TrackerError::persistence("Failed to insert activity", err))?;
            let id = conn.last_insert_rowid();
            get_activity(conn, id)?
                .ok_or_else(|| TrackerError::NotFound(format!("activity {}", id)))
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<Activity>> {
        self.db.with_connection(|conn| get_activity(conn, id))
    }

    pub fn list(&self, user_id: &str) -> Result<Vec<Activity>> {
        self.db.with_connection(|conn| list_activities(conn, user_id))
    }

    pub fn update_details(
        &self,
        id: i64,
        name: Option<&str>,
        color_hex: Option<Option<&str>>,
    ) -> Result<Activity> {
        if let Some(name) = name {
            validate_name(name)?;
        }
        if let Some(Some(color)) = color_hex {
            validate_color(color)?;
        }

        self.db.write(|tx| {
            let current = get_activity(tx, id)?
                .ok_or_else(|| TrackerError::NotFound(format!("activity {}", id)))?;
            let name = name.map(str::trim).unwrap_or(&current.name);
            let color = match color_hex {
                Some(value) => value.map(str::to_string),
                None => current.color_hex.clone(),
            };
            tx.execute(
                "UPDATE activities SET name = ?2, color_hex = ?3 WHERE id = ?1",
                params![id, name, color],
            )
            .map_err(|err| TrackerError::persistence("Failed to update activity", err))?;
            get_activity(tx, id)?.ok_or_else(|| TrackerError::NotFound(format!("activity {}", id)))
        })
    }
}

pub(crate) fn list_activities(conn: &Connection, user_id: &str) -> Result<Vec<Activity>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities \
             WHERE user_id = ?1 ORDER BY name COLLATE NOCASE ASC, id ASC"
        ))
        .map_err(|err| TrackerError::persistence("Failed to prepare activities query", err))?;
    let rows = stmt
        .query_map(params![user_id], activity_from_row)
        .map_err(|err| TrackerError::persistence("Failed to query activities", err))?;

    let mut activities = Vec::new();
    for row in rows {
        activities.push(
            row.map_err(|err| TrackerError::persistence("Failed to decode activity row", err))?,
        );
    }
    Ok(activities)
}

/// Deletes the activity row; its sessions go with it via the foreign key.
pub(crate) fn delete_activity(conn: &Connection, id: i64) -> Result<()> {
    let changed = conn
        .execute("DELETE FROM activities WHERE id = ?1", params![id])
        .map_err(|err| TrackerError::persistence("Failed to delete activity", err))?;
    if changed == 0 {
        return Err(TrackerError::NotFound(format!("activity {}", id)));
    }
    Ok(())
}

pub(crate) fn get_activity(conn: &Connection, id: i64) -> Result<Option<Activity>> {
    conn.query_row(
        &format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?1"),
        params![id],
        activity_from_row,
    )
    .optional()
    .map_err(|err| TrackerError::persistence("Failed to query activity", err))
}

pub(crate) fn mark_running(conn: &Connection, id: i64, running_total_ms: i64) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE activities SET is_active = 1, running_total_ms = ?2 WHERE id = ?1",
            params![id, running_total_ms],
        )
        .map_err(|err| TrackerError::persistence("Failed to mark activity running", err))?;
    if changed == 0 {
        return Err(TrackerError::NotFound(format!("activity {}", id)));
    }
    Ok(())
}

pub(crate) fn mark_stopped(conn: &Connection, id: i64, completed_today_ms: i64) -> Result<()> {
    conn.execute(
        "UPDATE activities SET is_active = 0, running_total_ms = 0, total_duration_ms_today = ?2 \
         WHERE id = ?1",
        params![id, completed_today_ms],
    )
    .map_err(|err| TrackerError::persistence("Failed to mark activity stopped", err))?;
    Ok(())
}

/// Tick checkpoint; only lands while the activity is still flagged active.
pub(crate) fn checkpoint(conn: &Connection, id: i64, running_total_ms: i64) -> Result<()> {
    conn.execute(
        "UPDATE activities SET running_total_ms = ?2 WHERE id = ?1 AND is_active = 1",
        params![id, running_total_ms],
    )
    .map_err(|err| TrackerError::persistence("Failed to checkpoint running total", err))?;
    Ok(())
}

/// Rewrites every cached daily total for the user; activities absent from
/// `totals` had nothing completed in the window and drop to zero.
pub(crate) fn replace_daily_totals(
    conn: &Connection,
    user_id: &str,
    totals: &HashMap<i64, i64>,
) -> Result<()> {
    conn.execute(
        "UPDATE activities SET total_duration_ms_today = 0 WHERE user_id = ?1",
        params![user_id],
    )
    .map_err(|err| TrackerError::persistence("Failed to reset daily totals", err))?;
    for (activity_id, total) in totals {
        conn.execute(
            "UPDATE activities SET total_duration_ms_today = ?2 WHERE id = ?1",
            params![activity_id, total],
        )
        .map_err(|err| TrackerError::persistence("Failed to write daily total", err))?;
    }
    Ok(())
}

/// Clears `is_active` on every activity of the user except `keep`.
pub(crate) fn clear_active_flags(
    conn: &Connection,
    user_id: &str,
    keep: Option<i64>,
) -> Result<()> {
    conn.execute(
        "UPDATE activities SET is_active = 0, running_total_ms = 0 \
         WHERE user_id = ?1 AND is_active = 1 AND id IS NOT ?2",
        params![user_id, keep],
    )
    .map_err(|err| TrackerError::persistence("Failed to clear active flags", err))?;
    Ok(())
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<Activity> {
    let created_raw: String = row.get(8)?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(err))
        })?;

    Ok(Activity {
        id: row.get(0)?,
        remote_key: row.get(1)?,
        user_id: row.get(2)?,
        name: row.get(3)?,
        total_duration_ms_today: row.get(4)?,
        is_active: row.get(5)?,
        running_total_ms: row.get(6)?,
        color_hex: row.get(7)?,
        created_at,
    })
}

fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(TrackerError::invalid("name", "must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_CHARS {
        return Err(TrackerError::invalid(
            "name",
            format!("must be {} characters or fewer", MAX_NAME_CHARS),
        ));
    }
    Ok(())
}

fn validate_color(color: &str) -> Result<()> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(TrackerError::invalid("color_hex", "must look like #RRGGBB"))
    }
}
