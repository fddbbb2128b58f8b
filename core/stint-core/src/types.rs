//! Core records shared by the ledger, the coordinator and the daemon wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One interval of active tracking for one activity.
///
/// `end_time == None` means the session is still running. `uid` is the
/// client-generated identifier shared with the remote mirror; `id` is the
/// local row identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub uid: String,
    pub activity_id: i64,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Duration of a closed session; `None` while open.
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| {
            end.signed_duration_since(self.start_time)
                .num_milliseconds()
                .max(0)
        })
    }
}

/// Values for a session row that has not been inserted yet.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub uid: String,
    pub activity_id: i64,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
}

impl NewSession {
    pub fn into_session(self, id: i64) -> Session {
        Session {
            id,
            uid: self.uid,
            activity_id: self.activity_id,
            user_id: self.user_id,
            start_time: self.start_time,
            end_time: None,
        }
    }
}

/// A trackable named task plus its two engine-maintained cache fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    /// Key of the activity document in the remote mirror.
    pub remote_key: Option<String>,
    pub user_id: String,
    pub name: String,
    /// Completed sessions started today; never includes the open session.
    pub total_duration_ms_today: i64,
    pub is_active: bool,
    /// Last ticker checkpoint (`completed today + elapsed`) while running, 0 otherwise.
    pub running_total_ms: i64,
    pub color_hex: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub user_id: String,
    pub name: String,
    pub color_hex: Option<String>,
}

/// The coordinator's "what is running right now" slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningSessionInfo {
    pub activity_id: i64,
    pub start_time_ms: i64,
}

/// Latest value on the live duration stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveTick {
    pub activity_id: i64,
    pub start_time_ms: i64,
    pub elapsed_ms: i64,
}

/// An activity with its live-adjusted duration for today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedActivity {
    pub activity: Activity,
    pub display_duration_ms: i64,
    pub is_running: bool,
}

/// Everything a dashboard needs in one value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub live: Option<LiveTick>,
    pub activities: Vec<EnrichedActivity>,
    pub daily_total_ms: i64,
}
