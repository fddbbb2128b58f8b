use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stint_core::clock::to_millis;
use stint_core::ledger::Ledger;
use stint_core::types::NewSession;
use stint_core::{
    Clock, DashboardSnapshot, Db, ManualClock, MemoryMirror, StaticIdentity, ToggleOutcome,
    Tracker, TrackerError, TrackerOptions,
};
use tempfile::TempDir;
use tokio::sync::watch;

const USER: &str = "user-1";

fn local_instant(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    Local
        .from_local_datetime(&date.and_hms_opt(hour, minute, 0).expect("time"))
        .earliest()
        .expect("local instant")
        .with_timezone(&Utc)
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 14).expect("date")
}

fn options() -> TrackerOptions {
    TrackerOptions {
        // Scenario tests drive ticks by hand.
        tick_interval: Duration::from_secs(3600),
        mirror_timeout: Duration::from_secs(5),
        max_in_flight: 64,
    }
}

struct Harness {
    tracker: Tracker,
    clock: Arc<ManualClock>,
    mirror: Arc<MemoryMirror>,
    db: Db,
}

fn open_tracker(
    dir: &Path,
    clock: Arc<ManualClock>,
    mirror: Arc<MemoryMirror>,
    user: Option<&str>,
    options: TrackerOptions,
) -> Harness {
    let db = Db::new(dir.join("stint.db")).expect("db");
    let tracker = Tracker::open(
        db.clone(),
        Arc::new(StaticIdentity::new(user.map(str::to_string))),
        clock.clone(),
        mirror.clone(),
        options,
    )
    .expect("open tracker");
    Harness {
        tracker,
        clock,
        mirror,
        db,
    }
}

fn harness(dir: &TempDir) -> Harness {
    open_tracker(
        dir.path(),
        Arc::new(ManualClock::new(local_instant(day(), 12, 0))),
        Arc::new(MemoryMirror::new()),
        Some(USER),
        options(),
    )
}

fn open_session_count(db: &Db) -> usize {
    Ledger::new(db.clone())
        .open_sessions(USER)
        .expect("open sessions")
        .len()
}

#[tokio::test]
async fn writing_scenario_adds_live_seconds_to_completed_total() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    let writing = h.tracker.create_activity("Writing", None).expect("create");

    h.tracker.start(writing.id).expect("start");
    h.clock.advance_ms(600_000);
    h.tracker.stop(writing.id).expect("stop");
    assert_eq!(h.tracker.display_duration(writing.id).expect("display"), 600_000);

    h.tracker.start(writing.id).expect("start again");
    let mut last = h.tracker.display_duration(writing.id).expect("display");
    assert_eq!(last, 600_000);
    for _ in 0..5 {
        h.clock.advance_ms(1_000);
        assert!(h.tracker.tick_now());
        let current = h.tracker.display_duration(writing.id).expect("display");
        assert!(current >= last);
        last = current;
    }
    assert_eq!(last, 605_000);

    let closed = h
        .tracker
        .stop(writing.id)
        .expect("stop")
        .expect("closed session");
    assert_eq!(closed.duration_ms(), Some(5_000));
    assert!(h.tracker.current_timer().is_none());
    assert_eq!(h.tracker.display_duration(writing.id).expect("display"), 605_000);
    assert_eq!(h.tracker.daily_total().expect("daily total"), 605_000);

    let activity = h.tracker.get_activity(writing.id).expect("activity");
    assert!(!activity.is_active);
    assert_eq!(activity.total_duration_ms_today, 605_000);
    assert_eq!(activity.running_total_ms, 0);
}

#[tokio::test]
async fn ticks_checkpoint_running_total_without_touching_completed_total() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    let reading = h.tracker.create_activity("Reading", None).expect("create");

    h.tracker.start(reading.id).expect("start");
    h.clock.advance_ms(3_000);
    h.tracker.tick_now();

    let activity = h.tracker.get_activity(reading.id).expect("activity");
    assert!(activity.is_active);
    assert_eq!(activity.running_total_ms, 3_000);
    assert_eq!(activity.total_duration_ms_today, 0);
}

#[tokio::test]
async fn starting_another_activity_closes_the_first() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    let a = h.tracker.create_activity("A", None).expect("create a");
    let b = h.tracker.create_activity("B", None).expect("create b");

    let started_a = h.tracker.start(a.id).expect("start a");
    h.clock.advance_ms(2_000);
    let started_b = h.tracker.start(b.id).expect("start b");

    let a_sessions = h.tracker.sessions_for_activity(a.id).expect("a sessions");
    assert_eq!(a_sessions.len(), 1);
    let a_end = a_sessions[0].end_time.expect("a closed");
    assert_eq!(to_millis(a_end) - started_a.start_time_ms, 2_000);
    assert!(to_millis(a_end) <= started_b.start_time_ms);

    assert_eq!(open_session_count(&h.db), 1);
    assert_eq!(h.tracker.running().expect("running"), Some(started_b));
    let tick = h.tracker.current_timer().expect("live tick");
    assert_eq!(tick.activity_id, b.id);
    assert!(!h.tracker.get_activity(a.id).expect("a").is_active);
    assert!(h.tracker.get_activity(b.id).expect("b").is_active);
}

#[tokio::test]
async fn stop_is_idempotent_and_ignores_other_activities() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    let a = h.tracker.create_activity("A", None).expect("create a");
    let b = h.tracker.create_activity("B", None).expect("create b");

    h.tracker.start(a.id).expect("start");
    assert!(h.tracker.stop(b.id).expect("stop other").is_none());
    assert!(h.tracker.running().expect("running").is_some());

    h.clock.advance_ms(1_500);
    assert!(h.tracker.stop(a.id).expect("stop").is_some());
    let after_first = h.tracker.sessions_for_activity(a.id).expect("sessions");
    assert!(h.tracker.stop(a.id).expect("stop again").is_none());
    let after_second = h.tracker.sessions_for_activity(a.id).expect("sessions");
    assert_eq!(after_first, after_second);
    assert_eq!(open_session_count(&h.db), 0);
}

#[tokio::test]
async fn restart_reports_running_session_from_persisted_start() {
    let dir = tempfile::tempdir().expect("temp dir");
    let clock = Arc::new(ManualClock::new(local_instant(day(), 9, 0)));
    let mirror = Arc::new(MemoryMirror::new());

    let first = open_tracker(dir.path(), clock.clone(), mirror.clone(), Some(USER), options());
    let a = first.tracker.create_activity("A", None).expect("create");
    let started = first.tracker.start(a.id).expect("start");
    clock.advance_ms(3_000);
    drop(first);

    clock.advance_ms(2_000);
    let second = open_tracker(dir.path(), clock.clone(), mirror, Some(USER), options());
    let tick = second.tracker.current_timer().expect("recovered tick");
    assert_eq!(tick.activity_id, a.id);
    assert_eq!(tick.start_time_ms, started.start_time_ms);
    assert_eq!(tick.elapsed_ms, 5_000);

    let resumed = second.tracker.start(a.id).expect("start adopts");
    assert_eq!(resumed, started);
    assert_eq!(open_session_count(&second.db), 1);
    assert_eq!(second.tracker.sessions_for_activity(a.id).expect("sessions").len(), 1);
}

#[tokio::test]
async fn recovery_closes_all_but_latest_open_session() {
    let dir = tempfile::tempdir().expect("temp dir");
    let clock = Arc::new(ManualClock::new(local_instant(day(), 10, 0)));
    let first = open_tracker(
        dir.path(),
        clock.clone(),
        Arc::new(MemoryMirror::new()),
        Some(USER),
        options(),
    );
    let a = first.tracker.create_activity("A", None).expect("create a");
    let b = first.tracker.create_activity("B", None).expect("create b");
    drop(first);

    let ledger = Ledger::new(Db::new(dir.path().join("stint.db")).expect("db"));
    let start_a = clock.now();
    let seeded = [
        ("s-a", a.id, start_a),
        ("s-b", b.id, start_a + chrono::Duration::seconds(60)),
    ];
    for (uid, activity_id, start) in seeded {
        ledger
            .insert_session(&NewSession {
                uid: uid.to_string(),
                activity_id,
                user_id: USER.to_string(),
                start_time: start,
            })
            .expect("seed open session");
    }
    clock.advance_ms(120_000);

    let h = open_tracker(
        dir.path(),
        clock.clone(),
        Arc::new(MemoryMirror::new()),
        Some(USER),
        options(),
    );
    assert_eq!(h.tracker.running().expect("running").map(|r| r.activity_id), Some(b.id));
    assert_eq!(open_session_count(&h.db), 1);

    let a_sessions = h.tracker.sessions_for_activity(a.id).expect("a sessions");
    assert_eq!(a_sessions[0].duration_ms(), Some(60_000));
    assert_eq!(h.tracker.display_duration(a.id).expect("display a"), 60_000);
    assert_eq!(h.tracker.display_duration(b.id).expect("display b"), 60_000);
}

#[tokio::test]
async fn failed_ledger_write_leaves_running_state_unchanged() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    let a = h.tracker.create_activity("A", None).expect("create a");
    let b = h.tracker.create_activity("B", None).expect("create b");
    let running = h.tracker.start(a.id).expect("start");

    let rename = |from: &str, to: &str| {
        h.db.with_connection(|conn| {
            conn.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}"))
                .map_err(|err| TrackerError::persistence("rename", err))
        })
        .expect("rename table");
    };

    rename("sessions", "sessions_offline");
    let err = h.tracker.stop(a.id).expect_err("stop must fail");
    assert!(matches!(err, TrackerError::Persistence { .. }));
    assert_eq!(h.tracker.running().expect("running"), Some(running));

    let err = h.tracker.start(b.id).expect_err("switch must fail");
    assert!(matches!(err, TrackerError::Persistence { .. }));
    assert_eq!(h.tracker.running().expect("running"), Some(running));
    assert!(h.tracker.current_timer().is_some());

    rename("sessions_offline", "sessions");
    h.clock.advance_ms(4_000);
    let closed = h.tracker.stop(a.id).expect("stop").expect("closed");
    assert_eq!(closed.duration_ms(), Some(4_000));
    assert!(!h.tracker.get_activity(b.id).expect("b").is_active);
}

#[tokio::test]
async fn mirror_outage_never_fails_start_or_stop() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    h.mirror.set_offline(true);
    let a = h.tracker.create_activity("A", None).expect("create");

    h.tracker.start(a.id).expect("start while offline");
    h.clock.advance_ms(1_000);
    h.tracker.stop(a.id).expect("stop while offline");
    h.tracker.flush_mirror().await;

    let health = h.tracker.mirror_health();
    assert_eq!(health.failed, 3);
    assert_eq!(health.succeeded, 0);
    assert!(health.last_error.is_some());
    assert_eq!(
        h.tracker.sessions_for_activity(a.id).expect("sessions")[0].duration_ms(),
        Some(1_000)
    );
}

#[tokio::test]
async fn mirror_receives_uid_and_end_time() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    let a = h.tracker.create_activity("A", Some("#336699".to_string())).expect("create");
    let key = a.remote_key.clone().expect("remote key");

    h.tracker.start(a.id).expect("start");
    h.clock.advance_ms(7_000);
    let closed = h.tracker.stop(a.id).expect("stop").expect("closed");
    h.tracker.flush_mirror().await;

    let tree = h.mirror.user_tree(USER).expect("mirrored user");
    let doc = &tree.activities[&key];
    assert_eq!(
        doc.fields.as_ref().and_then(|f| f.color_hex.as_deref()),
        Some("#336699")
    );
    assert_eq!(doc.sessions.len(), 1);
    assert_eq!(doc.sessions[0].session.uid.as_deref(), Some(closed.uid.as_str()));
    assert_eq!(
        doc.sessions[0].session.end_time_ms,
        closed.end_time.map(to_millis)
    );
    assert_eq!(h.tracker.mirror_health().failed, 0);
}

#[tokio::test]
async fn missing_user_and_unknown_activity_are_rejected() {
    let dir = tempfile::tempdir().expect("temp dir");
    let signed_out = open_tracker(
        dir.path(),
        Arc::new(ManualClock::new(local_instant(day(), 8, 0))),
        Arc::new(MemoryMirror::new()),
        None,
        options(),
    );
    assert!(matches!(
        signed_out.tracker.start(1),
        Err(TrackerError::Precondition(_))
    ));
    assert!(matches!(
        signed_out.tracker.stop(1),
        Err(TrackerError::Precondition(_))
    ));
    drop(signed_out);

    let h = harness(&dir);
    assert!(matches!(h.tracker.start(404), Err(TrackerError::NotFound(_))));
    assert!(h.tracker.running().expect("running").is_none());
}

#[tokio::test]
async fn activity_without_remote_key_cannot_start() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    let legacy = h.tracker.create_activity("Legacy", None).expect("create");
    h.db.with_connection(|conn| {
        conn.execute(
            "UPDATE activities SET remote_key = NULL WHERE id = ?1",
            [legacy.id],
        )
        .map_err(|err| TrackerError::persistence("clear key", err))
    })
    .expect("clear remote key");

    assert!(matches!(
        h.tracker.start(legacy.id),
        Err(TrackerError::Precondition(_))
    ));
    assert_eq!(open_session_count(&h.db), 0);
}

#[tokio::test]
async fn toggle_and_delete_running_activity() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    let a = h.tracker.create_activity("A", None).expect("create");
    let key = a.remote_key.clone().expect("key");

    assert!(matches!(
        h.tracker.toggle(a.id).expect("toggle on"),
        ToggleOutcome::Started { .. }
    ));
    h.clock.advance_ms(500);
    assert!(matches!(
        h.tracker.toggle(a.id).expect("toggle off"),
        ToggleOutcome::Stopped { session: Some(_) }
    ));

    h.tracker.start(a.id).expect("start");
    let deleted = h.tracker.delete_activity(a.id).expect("delete");
    assert_eq!(deleted.id, a.id);
    assert!(h.tracker.running().expect("running").is_none());
    assert!(h.tracker.current_timer().is_none());
    assert_eq!(open_session_count(&h.db), 0);
    assert!(h.tracker.sessions_for_activity(a.id).expect("sessions").is_empty());
    assert!(matches!(
        h.tracker.get_activity(a.id),
        Err(TrackerError::NotFound(_))
    ));

    h.tracker.flush_mirror().await;
    let tree = h.mirror.user_tree(USER).expect("tree");
    assert!(!tree.activities.contains_key(&key));
}

#[tokio::test]
async fn totals_roll_over_at_local_midnight() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = open_tracker(
        dir.path(),
        Arc::new(ManualClock::new(local_instant(day(), 23, 0))),
        Arc::new(MemoryMirror::new()),
        Some(USER),
        options(),
    );
    let a = h.tracker.create_activity("A", None).expect("create");
    h.tracker.start(a.id).expect("start");
    h.clock.advance_ms(30_000);
    h.tracker.stop(a.id).expect("stop");
    assert_eq!(h.tracker.daily_total().expect("total"), 30_000);

    let next_day = day().succ_opt().expect("next day");
    h.clock.set(local_instant(next_day, 10, 0));
    assert_eq!(h.tracker.daily_total().expect("total"), 0);
    assert_eq!(h.tracker.day_summary(day()).expect("summary").total_ms, 30_000);
    assert_eq!(h.tracker.day_summary(next_day).expect("summary").total_ms, 0);

    let month = h.tracker.month_summary(2026, 3).expect("month");
    assert_eq!(month.total_ms, 30_000);
    assert_eq!(month.days[13].total_ms, 30_000);
    assert_eq!(month.previous_month_total_ms, 0);
    assert!(matches!(
        h.tracker.month_summary(2026, 13),
        Err(TrackerError::InvalidInput { .. })
    ));
}

#[tokio::test]
async fn dashboard_feed_follows_live_ticks() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    let a = h.tracker.create_activity("A", None).expect("create");
    let mut feed = h.tracker.subscribe_dashboard();

    h.tracker.start(a.id).expect("start");
    h.clock.advance_ms(2_000);
    h.tracker.tick_now();

    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = feed.borrow_and_update().clone();
            if current.live.is_some_and(|tick| tick.elapsed_ms == 2_000)
                && current.activities.len() == 1
            {
                return current;
            }
            feed.changed().await.expect("feed open");
        }
    })
    .await
    .expect("dashboard update");

    assert_eq!(snapshot.daily_total_ms, 2_000);
    assert!(snapshot.activities[0].is_running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ticker_publishes_until_stop_and_never_after() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = open_tracker(
        dir.path(),
        Arc::new(ManualClock::new(local_instant(day(), 12, 0))),
        Arc::new(MemoryMirror::new()),
        Some(USER),
        TrackerOptions {
            tick_interval: Duration::from_millis(20),
            ..options()
        },
    );
    let a = h.tracker.create_activity("A", None).expect("create");
    let mut live = h.tracker.active_timer();

    h.tracker.start(a.id).expect("start");
    live.borrow_and_update();
    h.clock.advance_ms(1_000);
    tokio::time::timeout(Duration::from_secs(2), live.changed())
        .await
        .expect("tick within deadline")
        .expect("stream open");
    assert_eq!(live.borrow_and_update().map(|tick| tick.activity_id), Some(a.id));

    h.tracker.stop(a.id).expect("stop");
    assert!(live.borrow_and_update().is_none());
    h.clock.advance_ms(1_000);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(!live.has_changed().expect("stream open"));
    assert!(h.tracker.current_timer().is_none());
    assert_eq!(h.tracker.get_activity(a.id).expect("a").running_total_ms, 0);
}

/// Totals published by the feed until it has been quiet for a moment.
async fn settle(feed: &mut watch::Receiver<DashboardSnapshot>) -> Vec<i64> {
    let mut totals = vec![feed.borrow_and_update().daily_total_ms];
    while let Ok(Ok(())) = tokio::time::timeout(Duration::from_millis(100), feed.changed()).await {
        totals.push(feed.borrow_and_update().daily_total_ms);
    }
    totals
}

#[tokio::test]
async fn dashboard_total_never_dips_on_switch_or_stop() {
    let dir = tempfile::tempdir().expect("temp dir");
    let h = harness(&dir);
    let a = h.tracker.create_activity("A", None).expect("create a");
    let b = h.tracker.create_activity("B", None).expect("create b");
    let mut feed = h.tracker.subscribe_dashboard();

    h.tracker.start(a.id).expect("start a");
    h.clock.advance_ms(5_000);
    h.tracker.tick_now();
    assert_eq!(settle(&mut feed).await.last(), Some(&5_000));

    h.tracker.start(b.id).expect("switch to b");
    let after_switch = settle(&mut feed).await;
    assert!(after_switch.iter().all(|total| *total == 5_000), "{after_switch:?}");
    assert_eq!(h.tracker.dashboard().expect("dashboard").daily_total_ms, 5_000);

    h.clock.advance_ms(1_000);
    h.tracker.tick_now();
    h.tracker.stop(b.id).expect("stop b");
    let after_stop = settle(&mut feed).await;
    assert!(after_stop.iter().all(|total| *total >= 5_000), "{after_stop:?}");
    assert_eq!(after_stop.last(), Some(&6_000));

    let dashboard = h.tracker.dashboard().expect("dashboard");
    assert!(dashboard.live.is_none());
    assert_eq!(dashboard.daily_total_ms, 6_000);
    assert_eq!(h.tracker.display_duration(a.id).expect("display a"), 5_000);
    assert_eq!(h.tracker.display_duration(b.id).expect("display b"), 1_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_callers_keep_a_single_open_session() {
    let dir = tempfile::tempdir().expect("temp dir");
    let Harness {
        tracker, clock, db, ..
    } = harness(&dir);
    let ids: Vec<i64> = (0..6)
        .map(|n| {
            tracker
                .create_activity(&format!("Activity {n}"), None)
                .expect("create")
                .id
        })
        .collect();

    std::thread::scope(|scope| {
        for worker in 0..8 {
            let (tracker, clock, ids) = (&tracker, &clock, &ids);
            scope.spawn(move || {
                for round in 0..25 {
                    let id = ids[(worker * 7 + round) % ids.len()];
                    clock.advance_ms(10);
                    match (worker + round) % 3 {
                        0 => {
                            tracker.start(id).expect("start");
                        }
                        1 => {
                            tracker.toggle(id).expect("toggle");
                        }
                        _ => {
                            tracker.stop(id).expect("stop");
                        }
                    }
                }
            });
        }
    });

    let open = Ledger::new(db.clone()).open_sessions(USER).expect("open sessions");
    assert!(open.len() <= 1, "open sessions: {open:?}");
    let active: Vec<i64> = tracker
        .list_activities()
        .expect("activities")
        .into_iter()
        .filter(|activity| activity.is_active)
        .map(|activity| activity.id)
        .collect();
    let running = tracker.running().expect("running").map(|info| info.activity_id);
    assert_eq!(open.first().map(|session| session.activity_id), running);
    assert_eq!(active.first().copied(), running);
    assert!(active.len() <= 1);

    let history = tracker
        .sessions_in_range(local_instant(day(), 0, 0), clock.now())
        .expect("history");
    for pair in history.windows(2) {
        let end = pair[0].end_time.expect("earlier session closed");
        assert!(end <= pair[1].start_time, "overlap: {pair:?}");
    }
}
