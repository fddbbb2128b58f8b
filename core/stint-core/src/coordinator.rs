//! Timer coordinator: the single "what is running" slot, its ticker, and the
//! orchestration between ledger, activity cache and mirror.
//!
//! Every transition goes through one mutex-guarded [`Slot`]. The ledger row
//! and the activity cache fields for a transition commit in one SQLite
//! transaction, and the slot is only changed after that commit succeeds.
//!
//! Ticks carry the slot generation they were spawned for. `stop` bumps the
//! generation while holding the lock, so a tick that was already waiting on
//! the lock finds a stale generation and neither publishes nor persists.
//!
//! Each transition publishes exactly one [`TimerState`], after its commit and
//! before the lock is released. A reader that pairs the state's `live` with
//! activity rows read under the same revision never sees a closed session
//! missing from both.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::activities;
use crate::enrichment;
use crate::clock::{local_date, local_day_bounds, to_millis, Clock};
use crate::db::Db;
use crate::error::{Result, TrackerError};
use crate::ledger;
use crate::mirror::{MirrorDispatcher, MirrorOp, RemoteSession};
use crate::types::{Activity, LiveTick, NewSession, RunningSessionInfo, Session};

/// Revision of the activity rows plus the live tick that goes with them.
/// Ticks keep the revision; every transition bumps it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerState {
    pub revision: u64,
    pub live: Option<LiveTick>,
}

#[derive(Debug, Clone)]
struct Running {
    info: RunningSessionInfo,
    user_id: String,
    session_uid: String,
    remote_key: Option<String>,
    /// Closed sessions of this activity on the current local day.
    completed_today_ms: i64,
}

#[derive(Debug)]
struct Slot {
    running: Option<Running>,
    generation: u64,
    ticker: Option<JoinHandle<()>>,
    day: NaiveDate,
}

struct Inner {
    db: Db,
    clock: Arc<dyn Clock>,
    mirror: MirrorDispatcher,
    handle: Handle,
    tick_interval: Duration,
    slot: Mutex<Slot>,
    live_tx: watch::Sender<Option<LiveTick>>,
    state_tx: watch::Sender<TimerState>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        db: Db,
        clock: Arc<dyn Clock>,
        mirror: MirrorDispatcher,
        handle: Handle,
        tick_interval: Duration,
    ) -> Self {
        let (live_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(TimerState::default());
        let day = local_date(clock.now());
        Self {
            inner: Arc::new(Inner {
                db,
                clock,
                mirror,
                handle,
                tick_interval,
                slot: Mutex::new(Slot {
                    running: None,
                    generation: 0,
                    ticker: None,
                    day,
                }),
                live_tx,
                state_tx,
            }),
        }
    }

    /// Latest-value stream of the running session. New subscribers see
    /// only ticks published after they subscribed.
    pub fn subscribe(&self) -> watch::Receiver<Option<LiveTick>> {
        self.inner.live_tx.subscribe()
    }

    /// Timer state stream: the revision moves whenever activity rows or
    /// their cached totals change, `live` moves on every tick.
    pub fn subscribe_state(&self) -> watch::Receiver<TimerState> {
        self.inner.state_tx.subscribe()
    }

    pub fn current_tick(&self) -> Option<LiveTick> {
        *self.inner.live_tx.borrow()
    }

    pub fn running(&self) -> Result<Option<RunningSessionInfo>> {
        Ok(self
            .inner
            .lock_slot()?
            .running
            .as_ref()
            .map(|running| running.info))
    }

    pub fn start(&self, user_id: &str, activity_id: i64) -> Result<RunningSessionInfo> {
        self.inner.start(user_id, activity_id)
    }

    /// Returns the closed session, or `None` when `activity_id` was not the
    /// running activity (already stopped).
    pub fn stop(&self, user_id: &str, activity_id: i64) -> Result<Option<Session>> {
        self.inner.stop(user_id, activity_id)
    }

    /// Adopts open sessions left behind by a previous process.
    pub fn recover(&self, user_id: &str) -> Result<Option<RunningSessionInfo>> {
        self.inner.recover(user_id)
    }

    /// Stops the activity if it is running, then deletes it with its sessions.
    pub fn remove_activity(&self, user_id: &str, activity_id: i64) -> Result<Activity> {
        self.inner.remove_activity(user_id, activity_id)
    }

    /// Recomputes cached daily totals when the local date moved since the
    /// last check.
    pub fn roll_day_if_needed(&self, user_id: &str) -> Result<()> {
        let mut slot = self.inner.lock_slot()?;
        self.inner.roll_day(&mut slot, user_id)
    }

    /// Activity rows as of the returned state, read under the slot lock so
    /// no transition lands between the two.
    pub fn view(&self, user_id: &str) -> Result<(TimerState, Vec<Activity>)> {
        let mut slot = self.inner.lock_slot()?;
        self.inner.roll_day(&mut slot, user_id)?;
        let activities = self
            .inner
            .db
            .with_connection(|conn| activities::list_activities(conn, user_id))?;
        Ok((*self.inner.state_tx.borrow(), activities))
    }

    /// Completed-today plus the live elapsed time, read under the slot lock.
    pub fn display_duration(&self, user_id: &str, activity_id: i64) -> Result<i64> {
        let mut slot = self.inner.lock_slot()?;
        self.inner.roll_day(&mut slot, user_id)?;
        let activity = self
            .inner
            .db
            .with_connection(|conn| activities::get_activity(conn, activity_id))?
            .filter(|activity| activity.user_id == user_id)
            .ok_or_else(|| TrackerError::NotFound(format!("activity {}", activity_id)))?;
        let live = *self.inner.live_tx.borrow();
        Ok(enrichment::enrich(std::slice::from_ref(&activity), live.as_ref())
            .first()
            .map(|enriched| enriched.display_duration_ms)
            .unwrap_or(activity.total_duration_ms_today))
    }

    pub fn notify_activities_changed(&self) -> Result<()> {
        let slot = self.inner.lock_slot()?;
        self.inner.commit(&slot, self.inner.clock.now());
        Ok(())
    }

    /// Runs one tick synchronously, exactly as the ticker task would.
    pub fn tick_now(&self) -> bool {
        let generation = match self.inner.lock_slot() {
            Ok(slot) => slot.generation,
            Err(_) => return false,
        };
        self.inner.tick(generation)
    }
}

impl Inner {
    fn lock_slot(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| TrackerError::Integrity("coordinator state lock poisoned".to_string()))
    }

    fn start(self: &Arc<Self>, user_id: &str, activity_id: i64) -> Result<RunningSessionInfo> {
        let mut slot = self.lock_slot()?;

        let already_running = slot
            .running
            .as_ref()
            .filter(|running| {
                running.info.activity_id == activity_id && running.user_id == user_id
            })
            .map(|running| running.info);
        if let Some(info) = already_running {
            self.ensure_ticker(&mut slot);
            tracing::debug!(activity_id, "Start ignored, activity already running");
            return Ok(info);
        }

        let activity = self
            .db
            .with_connection(|conn| activities::get_activity(conn, activity_id))?
            .filter(|activity| activity.user_id == user_id)
            .ok_or_else(|| TrackerError::NotFound(format!("activity {}", activity_id)))?;
        let remote_key = activity.remote_key.clone().ok_or_else(|| {
            TrackerError::Precondition(format!(
                "activity {} has no remote key and cannot be mirrored",
                activity_id
            ))
        })?;

        let now = self.clock.now();
        let today = local_date(now);
        let previous = slot.running.clone();

        let (closed, session, adopted, completed_today_ms) = self.db.write(|tx| {
            let closed = match &previous {
                Some(other) => close_running(tx, other, now, today)?,
                None => None,
            };

            let (session, adopted) = match ledger::get_open_session(tx, user_id, activity_id)? {
                Some(existing) => (existing, true),
                None => {
                    let new_session = NewSession {
                        uid: ulid::Ulid::new().to_string(),
                        activity_id,
                        user_id: user_id.to_string(),
                        start_time: now,
                    };
                    let id = ledger::insert_session(tx, &new_session)?;
                    (new_session.into_session(id), false)
                }
            };

            let completed = completed_today(tx, user_id, activity_id, today)?;
            activities::mark_running(tx, activity_id, completed + elapsed_ms(&session, now))?;
            Ok((closed, session, adopted, completed))
        })?;

        if let Some(other) = &previous {
            self.mirror_session_end(other, closed.as_ref());
            tracing::info!(
                stopped_activity_id = other.info.activity_id,
                activity_id,
                "Switched running activity"
            );
        }

        slot.day = today;
        let running = Running {
            info: RunningSessionInfo {
                activity_id,
                start_time_ms: to_millis(session.start_time),
            },
            user_id: user_id.to_string(),
            session_uid: session.uid.clone(),
            remote_key: Some(remote_key.clone()),
            completed_today_ms,
        };
        let info = running.info;
        self.begin(&mut slot, running);

        if adopted {
            tracing::info!(
                activity_id,
                session_id = session.id,
                "Adopted open session from ledger"
            );
        } else {
            self.mirror.submit(MirrorOp::AddSession {
                user_id: user_id.to_string(),
                activity_key: remote_key,
                session: RemoteSession {
                    uid: Some(session.uid.clone()),
                    start_time_ms: info.start_time_ms,
                    end_time_ms: None,
                },
            });
            tracing::info!(activity_id, session_id = session.id, "Started session");
        }
        self.commit(&slot, now);
        Ok(info)
    }

    fn stop(&self, user_id: &str, activity_id: i64) -> Result<Option<Session>> {
        let mut slot = self.lock_slot()?;
        let running = match &slot.running {
            Some(running)
                if running.info.activity_id == activity_id && running.user_id == user_id =>
            {
                running.clone()
            }
            _ => {
                tracing::debug!(activity_id, "Stop ignored, activity not running");
                return Ok(None);
            }
        };

        let now = self.clock.now();
        let today = local_date(now);
        let closed = self
            .db
            .write(|tx| close_running(tx, &running, now, today))?;

        self.halt(&mut slot);
        slot.day = today;
        self.mirror_session_end(&running, closed.as_ref());
        if let Some(session) = &closed {
            tracing::info!(
                activity_id,
                session_id = session.id,
                duration_ms = session.duration_ms().unwrap_or_default(),
                "Stopped session"
            );
        }
        self.commit(&slot, now);
        Ok(closed)
    }

    fn recover(self: &Arc<Self>, user_id: &str) -> Result<Option<RunningSessionInfo>> {
        let mut slot = self.lock_slot()?;
        if slot.running.is_some() {
            return Ok(slot.running.as_ref().map(|running| running.info));
        }

        let now = self.clock.now();
        let today = local_date(now);

        let (strays, adopted) = self.db.write(|tx| {
            let open = ledger::open_sessions(tx, user_id)?;
            let mut strays = Vec::new();
            if open.len() > 1 {
                tracing::error!(
                    user_id,
                    open_sessions = open.len(),
                    "Found more than one open session; closing all but the latest"
                );
                for pair in open.windows(2) {
                    let mut stray = pair[0].clone();
                    stray.end_time = Some(pair[1].start_time.max(stray.start_time));
                    ledger::update_session(tx, &stray)?;
                    let remote_key =
                        activities::get_activity(tx, stray.activity_id)?.and_then(|a| a.remote_key);
                    strays.push((stray, remote_key));
                }
            }

            let (day_start, day_end) = local_day_bounds(today);
            let totals = ledger::completed_totals(tx, user_id, day_start, day_end)?;
            activities::replace_daily_totals(tx, user_id, &totals)?;

            let latest = open.last().cloned();
            activities::clear_active_flags(tx, user_id, latest.as_ref().map(|s| s.activity_id))?;

            let adopted = match latest {
                Some(session) => {
                    let completed = totals.get(&session.activity_id).copied().unwrap_or(0);
                    activities::mark_running(
                        tx,
                        session.activity_id,
                        completed + elapsed_ms(&session, now),
                    )?;
                    let remote_key = activities::get_activity(tx, session.activity_id)?
                        .and_then(|activity| activity.remote_key);
                    Some((session, remote_key, completed))
                }
                None => None,
            };
            Ok((strays, adopted))
        })?;

        slot.day = today;
        for (stray, remote_key) in &strays {
            if let Some(key) = remote_key {
                self.mirror.submit(MirrorOp::UpdateSessionEnd {
                    user_id: user_id.to_string(),
                    activity_key: key.clone(),
                    uid: Some(stray.uid.clone()),
                    start_time_ms: to_millis(stray.start_time),
                    end_time_ms: stray.end_time.map(to_millis).unwrap_or_default(),
                });
            }
        }

        let info = adopted.map(|(session, remote_key, completed_today_ms)| {
            let running = Running {
                info: RunningSessionInfo {
                    activity_id: session.activity_id,
                    start_time_ms: to_millis(session.start_time),
                },
                user_id: user_id.to_string(),
                session_uid: session.uid.clone(),
                remote_key,
                completed_today_ms,
            };
            let info = running.info;
            self.begin(&mut slot, running);
            tracing::info!(
                activity_id = info.activity_id,
                session_id = session.id,
                "Recovered running session"
            );
            info
        });
        self.commit(&slot, now);
        Ok(info)
    }

    fn remove_activity(&self, user_id: &str, activity_id: i64) -> Result<Activity> {
        let mut slot = self.lock_slot()?;
        let activity = self
            .db
            .with_connection(|conn| activities::get_activity(conn, activity_id))?
            .filter(|activity| activity.user_id == user_id)
            .ok_or_else(|| TrackerError::NotFound(format!("activity {}", activity_id)))?;

        let running = slot
            .running
            .clone()
            .filter(|running| running.info.activity_id == activity_id);
        let now = self.clock.now();
        let today = local_date(now);

        self.db.write(|tx| {
            if let Some(running) = &running {
                close_running(tx, running, now, today)?;
            }
            activities::delete_activity(tx, activity_id)
        })?;

        if running.is_some() {
            self.halt(&mut slot);
            tracing::info!(activity_id, "Stopped running activity before deletion");
        }

        match &activity.remote_key {
            Some(key) => self.mirror.submit(MirrorOp::DeleteActivity {
                user_id: user_id.to_string(),
                activity_key: key.clone(),
            }),
            None => self.mirror.skip("delete_activity", "activity has no remote key"),
        }
        tracing::info!(activity_id, "Deleted activity");
        self.commit(&slot, now);
        Ok(activity)
    }

    fn roll_day(&self, slot: &mut Slot, user_id: &str) -> Result<()> {
        let now = self.clock.now();
        let today = local_date(now);
        if today == slot.day {
            return Ok(());
        }

        let totals = self.db.write(|tx| {
            let (day_start, day_end) = local_day_bounds(today);
            let totals = ledger::completed_totals(tx, user_id, day_start, day_end)?;
            activities::replace_daily_totals(tx, user_id, &totals)?;
            Ok(totals)
        })?;

        if let Some(running) = slot.running.as_mut() {
            running.completed_today_ms = totals
                .get(&running.info.activity_id)
                .copied()
                .unwrap_or(0);
        }
        tracing::info!(previous = %slot.day, today = %today, "Local day changed, refreshed totals");
        slot.day = today;
        self.commit(slot, now);
        Ok(())
    }

    /// One ticker step. Returns `false` once the ticker should exit.
    fn tick(&self, generation: u64) -> bool {
        let mut slot = match self.lock_slot() {
            Ok(slot) => slot,
            Err(_) => return false,
        };
        if slot.generation != generation {
            return false;
        }
        let user_id = match &slot.running {
            Some(running) => running.user_id.clone(),
            None => return false,
        };

        if let Err(err) = self.roll_day(&mut slot, &user_id) {
            tracing::warn!(error = %err, "Failed to refresh totals on day change");
        }
        let Some(running) = slot.running.as_ref() else {
            return false;
        };

        let tick = live_tick(running, self.clock.now());
        self.live_tx.send_replace(Some(tick));
        self.state_tx.send_modify(|state| state.live = Some(tick));
        let checkpoint = running.completed_today_ms + tick.elapsed_ms;
        if let Err(err) = self
            .db
            .with_connection(|conn| activities::checkpoint(conn, tick.activity_id, checkpoint))
        {
            tracing::warn!(
                activity_id = tick.activity_id,
                error = %err,
                "Failed to checkpoint running total"
            );
        }
        true
    }

    /// Publishes the slot as it stands after a transition: one new revision
    /// and the matching live tick, `None` when idle. Runs under the slot lock.
    fn commit(&self, slot: &Slot, now: DateTime<Utc>) {
        let live = slot.running.as_ref().map(|running| live_tick(running, now));
        self.live_tx.send_replace(live);
        self.state_tx.send_modify(|state| {
            state.revision += 1;
            state.live = live;
        });
    }

    /// Installs `running` in the slot and starts a ticker for the new
    /// generation. Nothing is published until the caller commits.
    fn begin(self: &Arc<Self>, slot: &mut Slot, running: Running) {
        self.halt(slot);
        slot.running = Some(running);
        self.ensure_ticker(slot);
    }

    /// Clears the slot and stops the ticker. Runs under the slot lock.
    fn halt(&self, slot: &mut Slot) {
        slot.generation += 1;
        if let Some(ticker) = slot.ticker.take() {
            ticker.abort();
        }
        slot.running = None;
    }

    fn ensure_ticker(self: &Arc<Self>, slot: &mut Slot) {
        if slot.running.is_none() {
            return;
        }
        if slot.ticker.as_ref().is_some_and(|ticker| !ticker.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        slot.ticker = Some(
            self.handle
                .spawn(run_ticker(weak, slot.generation, self.tick_interval)),
        );
    }

    fn mirror_session_end(&self, running: &Running, closed: Option<&Session>) {
        let (Some(key), Some(session)) = (&running.remote_key, closed) else {
            self.mirror
                .skip("update_session_end_time", "no remote key or no closed session");
            return;
        };
        self.mirror.submit(MirrorOp::UpdateSessionEnd {
            user_id: running.user_id.clone(),
            activity_key: key.clone(),
            uid: Some(running.session_uid.clone()),
            start_time_ms: to_millis(session.start_time),
            end_time_ms: session.end_time.map(to_millis).unwrap_or_default(),
        });
    }
}

async fn run_ticker(inner: Weak<Inner>, generation: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the starting commit already published it.
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match tokio::task::spawn_blocking(move || inner.tick(generation)).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                tracing::warn!(error = %err, "Ticker step panicked");
                break;
            }
        }
    }
    tracing::debug!(generation, "Ticker stopped");
}

/// Closes the open ledger row for `running` at `now` and refreshes the
/// user's cached daily totals. A missing open row is tolerated: the slot
/// still goes idle, nothing is mirrored.
fn close_running(
    conn: &Connection,
    running: &Running,
    now: DateTime<Utc>,
    today: NaiveDate,
) -> Result<Option<Session>> {
    let activity_id = running.info.activity_id;
    let closed = match ledger::get_open_session(conn, &running.user_id, activity_id)? {
        Some(mut session) => {
            session.end_time = Some(now.max(session.start_time));
            ledger::update_session(conn, &session)?;
            Some(session)
        }
        None => {
            tracing::warn!(activity_id, "No open session in ledger for running activity");
            None
        }
    };

    let (day_start, day_end) = local_day_bounds(today);
    let totals = ledger::completed_totals(conn, &running.user_id, day_start, day_end)?;
    activities::replace_daily_totals(conn, &running.user_id, &totals)?;
    activities::mark_stopped(
        conn,
        activity_id,
        totals.get(&activity_id).copied().unwrap_or(0),
    )?;
    Ok(closed)
}

fn completed_today(
    conn: &Connection,
    user_id: &str,
    activity_id: i64,
    today: NaiveDate,
) -> Result<i64> {
    let (day_start, day_end) = local_day_bounds(today);
    Ok(ledger::completed_totals(conn, user_id, day_start, day_end)?
        .get(&activity_id)
        .copied()
        .unwrap_or(0))
}

fn live_tick(running: &Running, now: DateTime<Utc>) -> LiveTick {
    LiveTick {
        activity_id: running.info.activity_id,
        start_time_ms: running.info.start_time_ms,
        elapsed_ms: (to_millis(now) - running.info.start_time_ms).max(0),
    }
}

fn elapsed_ms(session: &Session, now: DateTime<Utc>) -> i64 {
    (to_millis(now) - to_millis(session.start_time)).max(0)
}
