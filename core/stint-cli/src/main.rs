//! stint: command-line client for the stint daemon.
//!
//! Every subcommand is one request over the daemon socket, except `watch`,
//! which follows the live dashboard until interrupted.

mod daemon_client;
mod format;
mod logging;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Write;

use daemon_client::ClientError;
use stint_core::{
    Activity, DashboardSnapshot, DaySummary, EnrichedActivity, MonthSummary, Session,
    ToggleOutcome,
};
use stint_daemon_protocol::Method;

#[derive(Parser)]
#[command(name = "stint")]
#[command(about = "Track time spent on activities")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an activity
    Add {
        #[arg(value_name = "NAME")]
        name: String,

        /// Display color as #RRGGBB
        #[arg(long)]
        color: Option<String>,
    },

    /// Rename or recolor an activity
    Edit {
        #[arg(value_name = "ID")]
        id: i64,

        #[arg(long)]
        name: Option<String>,

        #[arg(long, conflicts_with = "clear_color")]
        color: Option<String>,

        /// Remove the display color
        #[arg(long)]
        clear_color: bool,
    },

    /// Delete an activity and all of its sessions
    Rm {
        #[arg(value_name = "ID")]
        id: i64,
    },

    /// List activities with today's durations
    Ls,

    /// Start timing an activity (stops whatever is running)
    Start {
        #[arg(value_name = "ID")]
        id: i64,
    },

    /// Stop timing an activity
    Stop {
        #[arg(value_name = "ID")]
        id: i64,
    },

    /// Start the activity if idle, stop it if running
    Toggle {
        #[arg(value_name = "ID")]
        id: i64,
    },

    /// Show the running timer and today's total
    Status,

    /// Today's live per-activity durations and total
    Today,

    /// Summarize completed sessions for a day (defaults to today)
    Day {
        #[arg(value_name = "YYYY-MM-DD")]
        date: Option<String>,
    },

    /// Summarize a month (defaults to the current month)
    Month {
        #[arg(value_name = "YYYY-MM")]
        month: Option<String>,
    },

    /// List sessions that started within an RFC3339 range
    Sessions {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,
    },

    /// Follow the live dashboard
    Watch,

    /// Check that the daemon is up
    Health,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli.command) {
        tracing::error!(error = %err, "stint command failed");
        eprintln!("stint: {}", err);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), ClientError> {
    match command {
        Commands::Add { name, color } => {
            let activity: Activity = request(
                Method::CreateActivity,
                json!({ "name": name, "color_hex": color }),
            )?;
            println!("Created {} ({})", activity.name, activity.id);
        }
        Commands::Edit {
            id,
            name,
            color,
            clear_color,
        } => {
            let activity: Activity = request(
                Method::UpdateActivity,
                json!({
                    "activity_id": id,
                    "name": name,
                    "color_hex": color,
                    "clear_color": clear_color,
                }),
            )?;
            println!(
                "Updated {} ({}) {}",
                activity.name,
                activity.id,
                activity.color_hex.as_deref().unwrap_or("")
            );
        }
        Commands::Rm { id } => {
            let activity: Activity = request(Method::DeleteActivity, json!({ "activity_id": id }))?;
            println!("Deleted {}", activity.name);
        }
        Commands::Ls => {
            let activities: Vec<EnrichedActivity> = decode(daemon_client::call(
                Method::ListActivities,
                None,
            )?)?;
            print!("{}", format::activity_table(&activities));
        }
        Commands::Start { id } => {
            request::<Value>(Method::Start, json!({ "activity_id": id }))?;
            println!("Started {}", activity_name(id));
        }
        Commands::Stop { id } => {
            let session: Option<Session> = request(Method::Stop, json!({ "activity_id": id }))?;
            match session.and_then(|session| session.duration_ms()) {
                Some(ms) => println!(
                    "Stopped {} after {}",
                    activity_name(id),
                    format::duration(ms)
                ),
                None => println!("{} was not running", activity_name(id)),
            }
        }
        Commands::Toggle { id } => {
            let outcome: ToggleOutcome = request(Method::Toggle, json!({ "activity_id": id }))?;
            match outcome {
                ToggleOutcome::Started { .. } => println!("Started {}", activity_name(id)),
                ToggleOutcome::Stopped { session } => println!(
                    "Stopped {} after {}",
                    activity_name(id),
                    format::duration(session.and_then(|s| s.duration_ms()).unwrap_or(0))
                ),
            }
        }
        Commands::Status => println!("{}", format::status_line(&dashboard()?)),
        Commands::Today => {
            let snapshot = dashboard()?;
            print!("{}", format::activity_table(&snapshot.activities));
            println!("Total {}", format::duration(snapshot.daily_total_ms));
        }
        Commands::Day { date } => {
            let summary: DaySummary = request(Method::GetDaySummary, json!({ "date": date }))?;
            print!("{}", format::day_summary(&summary, &activity_names()?));
        }
        Commands::Month { month } => {
            let summary: MonthSummary =
                request(Method::GetMonthSummary, json!({ "month": month }))?;
            print!("{}", format::month_summary(&summary));
        }
        Commands::Sessions { from, to } => {
            let sessions: Vec<Session> =
                request(Method::GetSessions, json!({ "from": from, "to": to }))?;
            let names = activity_names()?;
            for session in &sessions {
                let name = names
                    .get(&session.activity_id)
                    .map(String::as_str)
                    .unwrap_or("?");
                println!("{}", format::session_line(session, name));
            }
        }
        Commands::Watch => watch()?,
        Commands::Health => {
            let data = daemon_client::call(Method::GetHealth, None)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string())
            );
        }
    }
    Ok(())
}

fn watch() -> Result<(), ClientError> {
    let mut stdout = std::io::stdout();
    daemon_client::watch(|value| {
        let snapshot: DashboardSnapshot = match serde_json::from_value(value) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed dashboard snapshot");
                return true;
            }
        };
        write!(stdout, "\r\x1b[2K{}", format::status_line(&snapshot))
            .and_then(|_| stdout.flush())
            .is_ok()
    })
}

/// Activities, live tick and total from one daemon read.
fn dashboard() -> Result<DashboardSnapshot, ClientError> {
    decode(daemon_client::call(Method::GetDashboard, None)?)
}

fn request<T: DeserializeOwned>(method: Method, params: Value) -> Result<T, ClientError> {
    decode(daemon_client::call(method, Some(strip_nulls(params)))?)
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T, ClientError> {
    serde_json::from_value(data)
        .map_err(|err| ClientError::Transport(format!("Unexpected daemon response: {}", err)))
}

/// Drops `null` members so optional arguments are simply absent on the wire.
fn strip_nulls(params: Value) -> Value {
    match params {
        Value::Object(map) => {
            Value::Object(map.into_iter().filter(|(_, v)| !v.is_null()).collect())
        }
        other => other,
    }
}

fn activity_names() -> Result<HashMap<i64, String>, ClientError> {
    let activities: Vec<EnrichedActivity> =
        decode(daemon_client::call(Method::ListActivities, None)?)?;
    Ok(activities
        .into_iter()
        .map(|entry| (entry.activity.id, entry.activity.name))
        .collect())
}

/// Best-effort display name; falls back to the numeric id.
fn activity_name(id: i64) -> String {
    activity_names()
        .ok()
        .and_then(|mut names| names.remove(&id))
        .unwrap_or_else(|| format!("activity {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_nulls_drops_absent_options() {
        let params = strip_nulls(json!({ "name": "Writing", "color_hex": null }));
        assert_eq!(params, json!({ "name": "Writing" }));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["stint", "edit", "3", "--clear-color"]).expect("parse");
        match cli.command {
            Commands::Edit {
                id, clear_color, ..
            } => {
                assert_eq!(id, 3);
                assert!(clear_color);
            }
            _ => panic!("expected edit"),
        }

        assert!(Cli::try_parse_from(["stint", "edit", "3", "--color", "#fff000", "--clear-color"])
            .is_err());
        assert!(Cli::try_parse_from(["stint", "start", "not-a-number"]).is_err());
    }
}
