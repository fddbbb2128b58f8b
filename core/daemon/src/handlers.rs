//! Request dispatch: maps protocol methods onto tracker operations.

use chrono::Datelike;
use serde::Serialize;
use serde_json::Value;
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use stint_core::{Tracker, TrackerError};
use stint_daemon_protocol::{
    parse_activity_id, parse_create_activity, parse_day, parse_month, parse_sessions_range,
    parse_update_activity, ErrorInfo, Method, Request, Response, PROTOCOL_VERSION,
};

use crate::write_response;

pub(crate) fn handle_request(request: Request, tracker: &Tracker) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let params = request.params;
    match request.method {
        Method::GetHealth => Response::ok(id, health(tracker)),
        Method::ListActivities => respond(id, tracker.dashboard().map(|d| d.activities)),
        Method::CreateActivity => match parse_create_activity(params) {
            Ok(parsed) => respond(id, tracker.create_activity(&parsed.name, parsed.color_hex)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::UpdateActivity => match parse_update_activity(params) {
            Ok(parsed) => {
                let color = if parsed.clear_color {
                    Some(None)
                } else {
                    parsed.color_hex.as_deref().map(Some)
                };
                respond(
                    id,
                    tracker.update_activity(parsed.activity_id, parsed.name.as_deref(), color),
                )
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::DeleteActivity => match parse_activity_id(params) {
            Ok(activity_id) => respond(id, tracker.delete_activity(activity_id)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::Start => match parse_activity_id(params) {
            Ok(activity_id) => respond(id, tracker.start(activity_id)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::Stop => match parse_activity_id(params) {
            Ok(activity_id) => respond(id, tracker.stop(activity_id)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::Toggle => match parse_activity_id(params) {
            Ok(activity_id) => respond(id, tracker.toggle(activity_id)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetActiveTimer => respond(id, Ok(tracker.current_timer())),
        Method::GetDisplayDuration => match parse_activity_id(params) {
            Ok(activity_id) => respond(
                id,
                tracker.display_duration(activity_id).map(|display_ms| {
                    serde_json::json!({
                        "activity_id": activity_id,
                        "display_duration_ms": display_ms,
                    })
                }),
            ),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetDailyTotal => respond(
            id,
            tracker.daily_total().map(|total_ms| {
                serde_json::json!({
                    "date": tracker.today(),
                    "daily_total_ms": total_ms,
                })
            }),
        ),
        Method::GetDashboard => respond(id, tracker.dashboard()),
        Method::GetDaySummary => match parse_day(params) {
            Ok(date) => respond(id, tracker.day_summary(date.unwrap_or_else(|| tracker.today()))),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetMonthSummary => match parse_month(params) {
            Ok(month) => {
                let (year, month) = month.unwrap_or_else(|| {
                    let today = tracker.today();
                    (today.year(), today.month())
                });
                respond(id, tracker.month_summary(year, month))
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetSessions => match parse_sessions_range(params) {
            Ok((from, to)) => respond(id, tracker.sessions_in_range(from, to)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::Watch => Response::error(
            id,
            "streaming_method",
            "watch must be served as a stream",
        ),
    }
}

/// Writes the current dashboard, then one line per change until the client
/// disconnects or the engine shuts down. An idle stream repeats the current
/// snapshot every `heartbeat`, so a vanished client is noticed by the next
/// failed write instead of holding the connection thread forever.
pub(crate) fn stream_watch(
    stream: &mut UnixStream,
    request: Request,
    tracker: &Tracker,
    handle: &Handle,
    heartbeat: Duration,
) {
    if request.protocol_version != PROTOCOL_VERSION {
        let response = Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
        let _ = write_response(stream, response);
        return;
    }
    if let Err(err) = tracker.user_id() {
        let _ = write_response(stream, error_response(request.id, &err));
        return;
    }

    let mut rx = tracker.subscribe_dashboard();
    let mut sent = 0u64;
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if let Err(err) = write_response(stream, respond(request.id.clone(), Ok(snapshot))) {
            debug!(error = %err, sent, "Watch client went away");
            return;
        }
        sent += 1;
        match handle.block_on(tokio::time::timeout(heartbeat, rx.changed())) {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!(sent, "Dashboard feed closed");
                return;
            }
            Err(_) => debug!(sent, "Watch heartbeat"),
        }
    }
}

fn health(tracker: &Tracker) -> Value {
    let mut data = serde_json::json!({
        "status": "ok",
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "user": tracker.user_id().ok(),
    });
    match tracker.running() {
        Ok(running) => {
            if let Ok(value) = serde_json::to_value(running) {
                data["running"] = value;
            }
        }
        Err(err) => warn!(error = %err, "Failed to read running session for health"),
    }
    if let Ok(value) = serde_json::to_value(tracker.mirror_health()) {
        data["mirror"] = value;
    }
    data
}

fn respond<T: Serialize>(id: Option<String>, result: stint_core::Result<T>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize response: {}", err),
            ),
        },
        Err(err) => error_response(id, &err),
    }
}

fn error_response(id: Option<String>, err: &TrackerError) -> Response {
    debug!(code = err.code(), error = %err, "Request failed");
    Response::error_with_info(id, ErrorInfo::new(err.code(), err.to_string()))
}
