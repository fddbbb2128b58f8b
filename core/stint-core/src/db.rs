//! SQLite persistence shared by the session ledger and the activity store.
//!
//! Both tables live in one database file so a `start`/`stop` can commit the
//! ledger row and the activity cache fields in a single transaction.

use rusqlite::{Connection, OpenFlags, Transaction};
use std::path::{Path, PathBuf};

use crate::error::{Result, TrackerError};

#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `op` inside one transaction; nothing is committed if it fails.
    pub fn write<T>(&self, op: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| TrackerError::persistence("Failed to begin transaction", err))?;
            let value = op(&tx)?;
            tx.commit()
                .map_err(|err| TrackerError::persistence("Failed to commit transaction", err))?;
            Ok(value)
        })
    }

    pub fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS activities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    remote_key TEXT UNIQUE,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    total_duration_ms_today INTEGER NOT NULL DEFAULT 0,
                    is_active INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uid TEXT NOT NULL UNIQUE,
                    activity_id INTEGER NOT NULL
                        REFERENCES activities(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    start_time_ms INTEGER NOT NULL,
                    end_time_ms INTEGER
                 );
                 CREATE INDEX IF NOT EXISTS idx_sessions_activity ON sessions(activity_id);
                 CREATE INDEX IF NOT EXISTS idx_sessions_user_start
                    ON sessions(user_id, start_time_ms);
                 CREATE INDEX IF NOT EXISTS idx_activities_user ON activities(user_id);
                 COMMIT;",
            )
            .map_err(|err| TrackerError::persistence("Failed to initialize schema", err))?;
            ensure_activity_columns(conn)?;

            // Older files may already hold duplicate open rows; the ledger
            // reports those as integrity violations instead of refusing to open.
            if let Err(err) = conn.execute(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_open \
                 ON sessions(user_id, activity_id) WHERE end_time_ms IS NULL",
                [],
            ) {
                tracing::error!(error = %err, "Failed to create open-session uniqueness index");
            }
            Ok(())
        })
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| TrackerError::Io {
                context: "Failed to create data dir".to_string(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| TrackerError::persistence("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| TrackerError::persistence("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| TrackerError::persistence("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| TrackerError::persistence("Failed to set busy_timeout", err))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|err| TrackerError::persistence("Failed to enable foreign keys", err))?;

        Ok(conn)
    }
}

fn ensure_activity_columns(conn: &Connection) -> Result<()> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(activities)")
        .map_err(|err| TrackerError::persistence("Failed to read activities schema", err))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|err| TrackerError::persistence("Failed to read activities schema rows", err))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(
            row.map_err(|err| TrackerError::persistence("Failed to decode schema row", err))?,
        );
    }

    if !columns.iter().any(|name| name == "color_hex") {
        conn.execute("ALTER TABLE activities ADD COLUMN color_hex TEXT", [])
            .map_err(|err| TrackerError::persistence("Failed to add color_hex column", err))?;
    }

    if !columns.iter().any(|name| name == "running_total_ms") {
        conn.execute(
            "ALTER TABLE activities ADD COLUMN running_total_ms INTEGER NOT NULL DEFAULT 0",
            [],
        )
        .map_err(|err| TrackerError::persistence("Failed to add running_total_ms column", err))?;
    }

    Ok(())
}
