//! Display totals: cached completed-today totals plus the live session.

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordinator::{Coordinator, TimerState};
use crate::identity::IdentityProvider;
use crate::types::{Activity, DashboardSnapshot, EnrichedActivity, LiveTick};

/// `completed + elapsed` for the running activity, `completed` for the rest.
pub fn enrich(activities: &[Activity], live: Option<&LiveTick>) -> Vec<EnrichedActivity> {
    activities
        .iter()
        .map(|activity| {
            let running = live.filter(|tick| tick.activity_id == activity.id);
            EnrichedActivity {
                activity: activity.clone(),
                display_duration_ms: activity.total_duration_ms_today
                    + running.map(|tick| tick.elapsed_ms).unwrap_or(0),
                is_running: running.is_some(),
            }
        })
        .collect()
}

pub fn daily_total(enriched: &[EnrichedActivity]) -> i64 {
    enriched
        .iter()
        .map(|activity| activity.display_duration_ms)
        .sum()
}

pub fn snapshot(activities: &[Activity], live: Option<LiveTick>) -> DashboardSnapshot {
    let enriched = enrich(activities, live.as_ref());
    DashboardSnapshot {
        live,
        daily_total_ms: daily_total(&enriched),
        activities: enriched,
    }
}

/// Republishes a [`DashboardSnapshot`] whenever the timer state changes.
/// Ticks reuse the activity rows loaded for their revision; a new revision
/// reloads rows and state together through [`Coordinator::view`].
pub fn spawn_feed(
    handle: &Handle,
    coordinator: Coordinator,
    identity: Arc<dyn IdentityProvider>,
    mut state_rx: watch::Receiver<TimerState>,
) -> (watch::Receiver<DashboardSnapshot>, JoinHandle<()>) {
    let (snapshot_tx, snapshot_rx) = watch::channel(DashboardSnapshot::default());

    let task = handle.spawn(async move {
        let mut loaded: Option<(u64, Vec<Activity>)> = None;
        loop {
            let state = *state_rx.borrow_and_update();
            let current = loaded
                .as_ref()
                .filter(|(revision, _)| *revision == state.revision);
            let next = match current {
                Some((_, activities)) => Some(snapshot(activities, state.live)),
                None => match identity.current_user_id() {
                    None => Some(DashboardSnapshot::default()),
                    Some(user_id) => load_view(&coordinator, user_id).await.map(
                        |(view_state, activities)| {
                            let next = snapshot(&activities, view_state.live);
                            loaded = Some((view_state.revision, activities));
                            next
                        },
                    ),
                },
            };
            if let Some(next) = next {
                snapshot_tx.send_replace(next);
            }

            if state_rx.changed().await.is_err() {
                break;
            }
        }
        tracing::debug!("Dashboard feed stopped");
    });

    (snapshot_rx, task)
}

/// Reads rows and timer state together; `None` keeps the last snapshot.
async fn load_view(
    coordinator: &Coordinator,
    user_id: String,
) -> Option<(TimerState, Vec<Activity>)> {
    let coordinator = coordinator.clone();
    match tokio::task::spawn_blocking(move || coordinator.view(&user_id)).await {
        Ok(Ok(view)) => Some(view),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "Failed to load activities for dashboard");
            None
        }
        Err(err) => {
            tracing::warn!(error = %err, "Dashboard load task failed");
            None
        }
    }
}
