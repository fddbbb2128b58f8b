//! Session ledger: the authoritative local record of what ran, and when.
//!
//! Rows are appended by `start` and mutated exactly once by `stop`. The
//! connection-level functions are shared with the coordinator so a ledger
//! write and an activity-cache write can commit together.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;

use crate::clock::{from_millis, to_millis};
use crate::db::Db;
use crate::error::{Result, TrackerError};
use crate::types::{NewSession, Session};

const SESSION_COLUMNS: &str = "id, uid, activity_id, user_id, start_time_ms, end_time_ms";

#[derive(Debug, Clone)]
pub struct Ledger {
    db: Db,
}

impl Ledger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn insert_session(&self, session: &NewSession) -> Result<Session> {
        let id = self
            .db
            .with_connection(|conn| insert_session(conn, session))?;
        Ok(session.clone().into_session(id))
    }

    pub fn update_session(&self, session: &Session) -> Result<()> {
        self.db
            .with_connection(|conn| update_session(conn, session))
    }

    pub fn get_open_session(&self, user_id: &str, activity_id: i64) -> Result<Option<Session>> {
        self.db
            .with_connection(|conn| get_open_session(conn, user_id, activity_id))
    }

    /// Every open session the user has, oldest first.
    pub fn open_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        self.db.with_connection(|conn| open_sessions(conn, user_id))
    }

    /// Sessions whose start falls in `[from, to]`, ascending by start time.
    pub fn get_sessions_in_range(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        self.db.with_connection(|conn| {
            query_sessions(
                conn,
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE user_id = ?1 AND start_time_ms BETWEEN ?2 AND ?3 \
                     ORDER BY start_time_ms ASC, id ASC"
                ),
                params![user_id, to_millis(from), to_millis(to)],
            )
        })
    }

    /// Full history for one activity, newest first.
    pub fn sessions_for_activity(&self, user_id: &str, activity_id: i64) -> Result<Vec<Session>> {
        self.db.with_connection(|conn| {
            query_sessions(
                conn,
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE user_id = ?1 AND activity_id = ?2 \
                     ORDER BY start_time_ms DESC, id DESC"
                ),
                params![user_id, activity_id],
            )
        })
    }
}

pub(crate) fn insert_session(conn: &Connection, session: &NewSession) -> Result<i64> {
    conn.execute(
        "INSERT INTO sessions (uid, activity_id, user_id, start_time_ms, end_time_ms) \
         VALUES (?1, ?2, ?3, ?4, NULL)",
        params![
            session.uid,
            session.activity_id,
            session.user_id,
            to_millis(session.start_time)
        ],
    )
    .map_err(|err| TrackerError::persistence("Failed to insert session", err))?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_session(conn: &Connection, session: &Session) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE sessions \
             SET activity_id = ?2, user_id = ?3, start_time_ms = ?4, end_time_ms = ?5 \
             WHERE id = ?1",
            params![
                session.id,
                session.activity_id,
                session.user_id,
                to_millis(session.start_time),
                session.end_time.map(to_millis)
            ],
        )
        .map_err(|err| TrackerError::persistence("Failed to update session", err))?;
    if changed == 0 {
        return Err(TrackerError::NotFound(format!("session {}", session.id)));
    }
    Ok(())
}

pub(crate) fn get_open_session(
    conn: &Connection,
    user_id: &str,
    activity_id: i64,
) -> Result<Option<Session>> {
    let mut open = query_sessions(
        conn,
        &format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE user_id = ?1 AND activity_id = ?2 AND end_time_ms IS NULL \
             ORDER BY start_time_ms ASC"
        ),
        params![user_id, activity_id],
    )?;
    if open.len() > 1 {
        tracing::error!(
            user_id,
            activity_id,
            open_sessions = open.len(),
            "More than one open session for activity"
        );
        return Err(TrackerError::Integrity(format!(
            "{} open sessions for user {} activity {}",
            open.len(),
            user_id,
            activity_id
        )));
    }
    Ok(open.pop())
}

pub(crate) fn open_sessions(conn: &Connection, user_id: &str) -> Result<Vec<Session>> {
    query_sessions(
        conn,
        &format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE user_id = ?1 AND end_time_ms IS NULL \
             ORDER BY start_time_ms ASC, id ASC"
        ),
        params![user_id],
    )
}

/// Total of closed sessions per activity whose start lies in `[from, to)`.
pub(crate) fn completed_totals(
    conn: &Connection,
    user_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<HashMap<i64, i64>> {
    let mut stmt = conn
        .prepare(
            "SELECT activity_id, COALESCE(SUM(MAX(end_time_ms - start_time_ms, 0)), 0) \
             FROM sessions \
             WHERE user_id = ?1 AND end_time_ms IS NOT NULL \
               AND start_time_ms >= ?2 AND start_time_ms < ?3 \
             GROUP BY activity_id",
        )
        .map_err(|err| TrackerError::persistence("Failed to prepare totals query", err))?;
    let rows = stmt
        .query_map(params![user_id, to_millis(from), to_millis(to)], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|err| TrackerError::persistence("Failed to query totals", err))?;

    let mut totals = HashMap::new();
    for row in rows {
        let (activity_id, total) =
            row.map_err(|err| TrackerError::persistence("Failed to decode totals row", err))?;
        totals.insert(activity_id, total);
    }
    Ok(totals)
}

fn query_sessions(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Session>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| TrackerError::persistence("Failed to prepare sessions query", err))?;
    let rows = stmt
        .query_map(params, session_from_row)
        .map_err(|err| TrackerError::persistence("Failed to query sessions", err))?;

    let mut sessions = Vec::new();
    for row in rows {
        let session =
            row.map_err(|err| TrackerError::persistence("Failed to decode session row", err))?;
        sessions.push(session);
    }
    Ok(sessions)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        uid: row.get(1)?,
        activity_id: row.get(2)?,
        user_id: row.get(3)?,
        start_time: from_millis(row.get(4)?),
        end_time: row.get::<_, Option<i64>>(5)?.map(from_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::ActivityStore;
    use crate::types::NewActivity;

    fn setup() -> (tempfile::TempDir, Db, i64) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("stint.db")).expect("db init");
        let activity = ActivityStore::new(db.clone())
            .insert(
                &NewActivity {
                    user_id: "u1".to_string(),
                    name: "Writing".to_string(),
                    color_hex: None,
                },
                "key-1",
                from_millis(0),
            )
            .expect("activity");
        (temp_dir, db, activity.id)
    }

    fn new_session(uid: &str, activity_id: i64, start_ms: i64) -> NewSession {
        NewSession {
            uid: uid.to_string(),
            activity_id,
            user_id: "u1".to_string(),
            start_time: from_millis(start_ms),
        }
    }

    #[test]
    fn inserts_and_closes_session() {
        let (_dir, db, activity_id) = setup();
        let ledger = Ledger::new(db);

        let mut session = ledger
            .insert_session(&new_session("s1", activity_id, 1_000))
            .expect("insert");
        assert!(session.id > 0);

        let open = ledger
            .get_open_session("u1", activity_id)
            .expect("query")
            .expect("open session");
        assert_eq!(open, session);

        session.end_time = Some(from_millis(6_000));
        ledger.update_session(&session).expect("update");
        assert!(ledger
            .get_open_session("u1", activity_id)
            .expect("query")
            .is_none());
    }

    #[test]
    fn update_of_unknown_session_is_not_found() {
        let (_dir, db, activity_id) = setup();
        let ledger = Ledger::new(db);
        let ghost = new_session("ghost", activity_id, 0).into_session(999);
        let err = ledger.update_session(&ghost).expect_err("missing row");
        assert!(matches!(err, TrackerError::NotFound(_)));
    }

    #[test]
    fn second_open_session_for_pair_is_rejected() {
        let (_dir, db, activity_id) = setup();
        let ledger = Ledger::new(db);
        ledger
            .insert_session(&new_session("s1", activity_id, 1_000))
            .expect("first");
        let err = ledger
            .insert_session(&new_session("s2", activity_id, 2_000))
            .expect_err("unique open row");
        assert!(matches!(err, TrackerError::Persistence { .. }));
    }

    #[test]
    fn duplicate_open_rows_surface_as_integrity_error() {
        let (_dir, db, activity_id) = setup();
        db.with_connection(|conn| {
            conn.execute("DROP INDEX idx_sessions_one_open", [])
                .map_err(|err| TrackerError::persistence("drop index", err))?;
            insert_session(conn, &new_session("s1", activity_id, 1_000))?;
            insert_session(conn, &new_session("s2", activity_id, 2_000))?;
            Ok(())
        })
        .expect("seed duplicates");

        let err = Ledger::new(db)
            .get_open_session("u1", activity_id)
            .expect_err("integrity");
        assert!(matches!(err, TrackerError::Integrity(_)));
    }

    #[test]
    fn range_query_is_inclusive_and_ascending() {
        let (_dir, db, activity_id) = setup();
        let ledger = Ledger::new(db.clone());
        for (uid, start, end) in [("a", 3_000, 4_000), ("b", 1_000, 2_000), ("c", 5_000, 6_000)] {
            let mut session = ledger
                .insert_session(&new_session(uid, activity_id, start))
                .expect("insert");
            session.end_time = Some(from_millis(end));
            ledger.update_session(&session).expect("close");
        }

        let sessions = ledger
            .get_sessions_in_range("u1", from_millis(1_000), from_millis(3_000))
            .expect("range");
        let uids: Vec<_> = sessions.iter().map(|s| s.uid.as_str()).collect();
        assert_eq!(uids, vec!["b", "a"]);

        let totals = db
            .with_connection(|conn| {
                completed_totals(conn, "u1", from_millis(0), from_millis(5_000))
            })
            .expect("totals");
        assert_eq!(totals.get(&activity_id), Some(&2_000));
    }
}
