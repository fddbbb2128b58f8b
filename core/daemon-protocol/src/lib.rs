//! IPC protocol types and validation for stint-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_ACTIVITY_NAME_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    ListActivities,
    CreateActivity,
    UpdateActivity,
    DeleteActivity,
    Start,
    Stop,
    Toggle,
    GetActiveTimer,
    GetDisplayDuration,
    GetDailyTotal,
    /// Activities, live tick and daily total read together.
    GetDashboard,
    GetDaySummary,
    GetMonthSummary,
    GetSessions,
    /// Streams one response line per dashboard change until the client hangs up.
    Watch,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Method parameters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivityIdParams {
    pub activity_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateActivityParams {
    pub name: String,
    #[serde(default)]
    pub color_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateActivityParams {
    pub activity_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color_hex: Option<String>,
    #[serde(default)]
    pub clear_color: bool,
}

/// `date` is `YYYY-MM-DD`; absent means the daemon's local today.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DayParams {
    #[serde(default)]
    pub date: Option<String>,
}

/// `month` is `YYYY-MM`; absent means the current local month.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonthParams {
    #[serde(default)]
    pub month: Option<String>,
}

/// Inclusive RFC3339 bounds on session start time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsParams {
    pub from: String,
    pub to: String,
}

pub fn parse_activity_id(params: Option<Value>) -> Result<i64, ErrorInfo> {
    let params: ActivityIdParams = parse_params(params, "activity")?;
    require_positive_id(params.activity_id)?;
    Ok(params.activity_id)
}

pub fn parse_create_activity(params: Option<Value>) -> Result<CreateActivityParams, ErrorInfo> {
    let params: CreateActivityParams = parse_params(params, "create_activity")?;
    validate_name(&params.name)?;
    if let Some(color) = &params.color_hex {
        validate_color(color)?;
    }
    Ok(params)
}

pub fn parse_update_activity(params: Option<Value>) -> Result<UpdateActivityParams, ErrorInfo> {
    let params: UpdateActivityParams = parse_params(params, "update_activity")?;
    require_positive_id(params.activity_id)?;
    if let Some(name) = &params.name {
        validate_name(name)?;
    }
    if let Some(color) = &params.color_hex {
        if params.clear_color {
            return Err(ErrorInfo::new(
                "invalid_params",
                "color_hex and clear_color are mutually exclusive",
            ));
        }
        validate_color(color)?;
    }
    Ok(params)
}

pub fn parse_day(params: Option<Value>) -> Result<Option<NaiveDate>, ErrorInfo> {
    let params: DayParams = parse_optional_params(params, "day")?;
    params
        .date
        .map(|raw| {
            NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
                ErrorInfo::new("invalid_params", format!("date must be YYYY-MM-DD, got {}", raw))
            })
        })
        .transpose()
}

pub fn parse_month(params: Option<Value>) -> Result<Option<(i32, u32)>, ErrorInfo> {
    let params: MonthParams = parse_optional_params(params, "month")?;
    params.month.map(|raw| parse_year_month(&raw)).transpose()
}

pub fn parse_year_month(raw: &str) -> Result<(i32, u32), ErrorInfo> {
    let invalid = || {
        ErrorInfo::new(
            "invalid_params",
            format!("month must be YYYY-MM, got {}", raw),
        )
    };
    let (year, month) = raw.trim().split_once('-').ok_or_else(invalid)?;
    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    if !(1..=12).contains(&month) {
        return Err(invalid());
    }
    Ok((year, month))
}

pub fn parse_sessions_range(
    params: Option<Value>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ErrorInfo> {
    let params: SessionsParams = parse_params(params, "sessions")?;
    let from = parse_timestamp(&params.from, "from")?;
    let to = parse_timestamp(&params.to, "to")?;
    if from > to {
        return Err(ErrorInfo::new("invalid_params", "from must not be after to"));
    }
    Ok((from, to))
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>, what: &str) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| {
        ErrorInfo::new("invalid_params", format!("{} params are required", what))
    })?;
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} params are invalid: {}", what, err),
        )
    })
}

fn parse_optional_params<T: DeserializeOwned + Default>(
    params: Option<Value>,
    what: &str,
) -> Result<T, ErrorInfo> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => parse_params(Some(value), what),
    }
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, ErrorInfo> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ErrorInfo::new("invalid_timestamp", format!("{} must be RFC3339", field)))
}

fn require_positive_id(id: i64) -> Result<(), ErrorInfo> {
    if id <= 0 {
        return Err(ErrorInfo::new(
            "invalid_params",
            "activity_id must be a positive integer",
        ));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), ErrorInfo> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ErrorInfo::new("missing_field", "name is required"));
    }
    if trimmed.chars().count() > MAX_ACTIVITY_NAME_CHARS {
        return Err(ErrorInfo::new(
            "invalid_params",
            format!("name must be {} characters or fewer", MAX_ACTIVITY_NAME_CHARS),
        ));
    }
    Ok(())
}

fn validate_color(color: &str) -> Result<(), ErrorInfo> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(ErrorInfo::new(
            "invalid_params",
            "color_hex must look like #RRGGBB",
        ));
    }
    Ok(())
}
