//! Published interface of the engine: timer control, live durations,
//! activity management and statistics inputs, all scoped to the
//! authenticated user.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::activities::ActivityStore;
use crate::clock::{
    local_day_bounds, local_month_bounds, previous_month, to_millis, Clock, SystemClock,
};
use crate::config::{MirrorBackend, StintConfig};
use crate::coordinator::Coordinator;
use crate::db::Db;
use crate::enrichment;
use crate::error::{Result, TrackerError};
use crate::identity::{require_user, IdentityProvider, StaticIdentity};
use crate::ledger::Ledger;
use crate::mirror::{
    DisabledMirror, FileMirror, MemoryMirror, MirrorDispatcher, MirrorHealthSnapshot, MirrorOp,
    RemoteActivity, RemoteMirror,
};
use crate::stats::{summarize_day, summarize_month, DaySummary, MonthSummary};
use crate::types::{
    Activity, DashboardSnapshot, LiveTick, NewActivity, RunningSessionInfo, Session,
};

#[derive(Debug, Clone, Copy)]
pub struct TrackerOptions {
    pub tick_interval: Duration,
    pub mirror_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self::from_config(&StintConfig::default())
    }
}

impl TrackerOptions {
    pub fn from_config(config: &StintConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.timer.tick_interval_ms.max(1)),
            mirror_timeout: Duration::from_millis(config.mirror.timeout_ms),
            max_in_flight: config.mirror.max_in_flight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToggleOutcome {
    Started { running: RunningSessionInfo },
    Stopped { session: Option<Session> },
}

pub struct Tracker {
    activities: ActivityStore,
    ledger: Ledger,
    coordinator: Coordinator,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    mirror: MirrorDispatcher,
    dashboard_rx: watch::Receiver<DashboardSnapshot>,
    feed: JoinHandle<()>,
}

impl Tracker {
    /// Opens the engine on the current tokio runtime and adopts any session
    /// a previous process left open.
    pub fn open(
        db: Db,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        mirror: Arc<dyn RemoteMirror>,
        options: TrackerOptions,
    ) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| TrackerError::Runtime)?;
        let dispatcher = MirrorDispatcher::spawn(
            &handle,
            mirror,
            options.mirror_timeout,
            options.max_in_flight,
        );
        let coordinator = Coordinator::new(
            db.clone(),
            Arc::clone(&clock),
            dispatcher.clone(),
            handle.clone(),
            options.tick_interval,
        );

        match identity.current_user_id() {
            Some(user_id) => {
                if let Some(running) = coordinator.recover(&user_id)? {
                    tracing::info!(
                        activity_id = running.activity_id,
                        start_time_ms = running.start_time_ms,
                        "Resumed running session"
                    );
                }
            }
            None => tracing::warn!("No authenticated user; skipping session recovery"),
        }

        let (dashboard_rx, feed) = enrichment::spawn_feed(
            &handle,
            coordinator.clone(),
            Arc::clone(&identity),
            coordinator.subscribe_state(),
        );

        Ok(Self {
            activities: ActivityStore::new(db.clone()),
            ledger: Ledger::new(db),
            coordinator,
            identity,
            clock,
            mirror: dispatcher,
            dashboard_rx,
            feed,
        })
    }

    /// Builds the engine from config: database, mirror backend and identity.
    pub fn from_config(config: &StintConfig, stint_home: &Path) -> Result<Self> {
        let db = Db::new(config.db_path(stint_home))?;
        let mirror: Arc<dyn RemoteMirror> = match config.mirror.backend {
            MirrorBackend::File => Arc::new(FileMirror::new(config.mirror_dir(stint_home))),
            MirrorBackend::Memory => Arc::new(MemoryMirror::new()),
            MirrorBackend::Disabled => Arc::new(DisabledMirror),
        };
        tracing::info!(
            db = %db.path().display(),
            mirror = mirror.name(),
            "Opening tracker"
        );
        Self::open(
            db,
            Arc::new(StaticIdentity::new(config.user.id.clone())),
            Arc::new(SystemClock),
            mirror,
            TrackerOptions::from_config(config),
        )
    }

    pub fn user_id(&self) -> Result<String> {
        require_user(self.identity.as_ref())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Timer control
    // ─────────────────────────────────────────────────────────────────────

    pub fn start(&self, activity_id: i64) -> Result<RunningSessionInfo> {
        let user_id = self.user_id()?;
        self.coordinator.start(&user_id, activity_id)
    }

    pub fn stop(&self, activity_id: i64) -> Result<Option<Session>> {
        let user_id = self.user_id()?;
        self.coordinator.stop(&user_id, activity_id)
    }

    pub fn toggle(&self, activity_id: i64) -> Result<ToggleOutcome> {
        let running = self.coordinator.running()?;
        if running.is_some_and(|info| info.activity_id == activity_id) {
            Ok(ToggleOutcome::Stopped {
                session: self.stop(activity_id)?,
            })
        } else {
            Ok(ToggleOutcome::Started {
                running: self.start(activity_id)?,
            })
        }
    }

    pub fn running(&self) -> Result<Option<RunningSessionInfo>> {
        self.coordinator.running()
    }

    /// Live duration stream; `None` while idle.
    pub fn active_timer(&self) -> watch::Receiver<Option<LiveTick>> {
        self.coordinator.subscribe()
    }

    pub fn current_timer(&self) -> Option<LiveTick> {
        self.coordinator.current_tick()
    }

    /// Runs one ticker step immediately.
    pub fn tick_now(&self) -> bool {
        self.coordinator.tick_now()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Display totals
    // ─────────────────────────────────────────────────────────────────────

    pub fn display_duration(&self, activity_id: i64) -> Result<i64> {
        let user_id = self.user_id()?;
        self.coordinator.display_duration(&user_id, activity_id)
    }

    pub fn daily_total(&self) -> Result<i64> {
        Ok(self.dashboard()?.daily_total_ms)
    }

    /// Activity rows and the live tick from the same timer state.
    pub fn dashboard(&self) -> Result<DashboardSnapshot> {
        let user_id = self.user_id()?;
        let (state, activities) = self.coordinator.view(&user_id)?;
        Ok(enrichment::snapshot(&activities, state.live))
    }

    /// Dashboard snapshots republished on every tick and activity change.
    pub fn subscribe_dashboard(&self) -> watch::Receiver<DashboardSnapshot> {
        self.dashboard_rx.clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Activities
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_activity(&self, name: &str, color_hex: Option<String>) -> Result<Activity> {
        let user_id = self.user_id()?;
        let remote_key = ulid::Ulid::new().to_string();
        let activity = self.activities.insert(
            &NewActivity {
                user_id: user_id.clone(),
                name: name.to_string(),
                color_hex,
            },
            &remote_key,
            self.clock.now(),
        )?;

        self.mirror_activity(&activity);
        self.coordinator.notify_activities_changed()?;
        tracing::info!(activity_id = activity.id, name = %activity.name, "Created activity");
        Ok(activity)
    }

    pub fn list_activities(&self) -> Result<Vec<Activity>> {
        let user_id = self.user_id()?;
        self.coordinator.roll_day_if_needed(&user_id)?;
        self.activities.list(&user_id)
    }

    pub fn get_activity(&self, activity_id: i64) -> Result<Activity> {
        let user_id = self.user_id()?;
        self.coordinator.roll_day_if_needed(&user_id)?;
        self.activities
            .get(activity_id)?
            .filter(|activity| activity.user_id == user_id)
            .ok_or_else(|| TrackerError::NotFound(format!("activity {}", activity_id)))
    }

    /// `color_hex: Some(None)` clears the color.
    pub fn update_activity(
        &self,
        activity_id: i64,
        name: Option<&str>,
        color_hex: Option<Option<&str>>,
    ) -> Result<Activity> {
        self.get_activity(activity_id)?;
        let activity = self
            .activities
            .update_details(activity_id, name, color_hex)?;
        self.mirror_activity(&activity);
        self.coordinator.notify_activities_changed()?;
        Ok(activity)
    }

    /// Stops the activity if it is running, then deletes it and its sessions.
    pub fn delete_activity(&self, activity_id: i64) -> Result<Activity> {
        let user_id = self.user_id()?;
        self.coordinator.remove_activity(&user_id, activity_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // History and statistics
    // ─────────────────────────────────────────────────────────────────────

    /// Sessions starting in `[from, to]`, ascending.
    pub fn sessions_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let user_id = self.user_id()?;
        self.ledger.get_sessions_in_range(&user_id, from, to)
    }

    pub fn sessions_for_activity(&self, activity_id: i64) -> Result<Vec<Session>> {
        let user_id = self.user_id()?;
        self.ledger.sessions_for_activity(&user_id, activity_id)
    }

    pub fn day_summary(&self, date: NaiveDate) -> Result<DaySummary> {
        let (start, end) = local_day_bounds(date);
        let sessions = self.sessions_before(start, end)?;
        Ok(summarize_day(date, &sessions))
    }

    pub fn month_summary(&self, year: i32, month: u32) -> Result<MonthSummary> {
        let (start, end) = local_month_bounds(year, month)
            .ok_or_else(|| TrackerError::invalid("month", "expected 1-12"))?;
        let (prev_year, prev_month) = previous_month(year, month);
        let (prev_start, prev_end) = local_month_bounds(prev_year, prev_month)
            .ok_or_else(|| TrackerError::invalid("month", "previous month out of range"))?;

        let sessions = self.sessions_before(start, end)?;
        let previous = self.sessions_before(prev_start, prev_end)?;
        Ok(summarize_month(year, month, &sessions, &previous))
    }

    pub fn today(&self) -> NaiveDate {
        crate::clock::local_date(self.clock.now())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mirror
    // ─────────────────────────────────────────────────────────────────────

    pub fn mirror_health(&self) -> MirrorHealthSnapshot {
        self.mirror.health()
    }

    /// Waits until every mirror write queued so far has been attempted.
    pub async fn flush_mirror(&self) {
        self.mirror.flush().await;
    }

    fn mirror_activity(&self, activity: &Activity) {
        let Some(key) = activity.remote_key.clone() else {
            self.mirror.skip("add_activity", "activity has no remote key");
            return;
        };
        self.mirror.submit(MirrorOp::AddActivity {
            user_id: activity.user_id.clone(),
            activity_key: key,
            activity: RemoteActivity {
                name: activity.name.clone(),
                color_hex: activity.color_hex.clone(),
                created_at_ms: to_millis(activity.created_at),
            },
        });
    }

    /// Half-open `[start, end)` on top of the ledger's inclusive range query.
    fn sessions_before(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Session>> {
        self.sessions_in_range(start, end - ChronoDuration::milliseconds(1))
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.feed.abort();
    }
}
