//! # stint-core
//!
//! Session timing engine shared by the stint daemon and its clients.
//!
//! ## Design Principles
//!
//! - **Local authority**: the SQLite ledger is the source of truth. A start or
//!   stop either commits durably or leaves the running state untouched.
//! - **One running session**: a single mutex-guarded slot per engine; starting
//!   a second activity closes the first in the same transaction.
//! - **Mirror is best effort**: remote writes run on a background worker,
//!   at most once, and their failures are only counted and logged.
//! - **Latest value wins**: live ticks and dashboard snapshots go out on
//!   `tokio::sync::watch` channels, so slow readers never hold up the ticker.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stint_core::{config, Tracker};
//!
//! let config = config::load_config(None)?;
//! let tracker = Tracker::from_config(&config, &config::stint_home()?)?;
//! let writing = tracker.create_activity("Writing", None)?;
//! tracker.start(writing.id)?;
//! ```

pub mod activities;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod mirror;
pub mod stats;
pub mod tracker;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, MirrorBackend, StintConfig};
pub use db::Db;
pub use error::{Result, TrackerError};
pub use identity::{IdentityProvider, StaticIdentity};
pub use mirror::{
    DisabledMirror, FileMirror, MemoryMirror, MirrorError, MirrorHealthSnapshot, RemoteMirror,
};
pub use stats::{DaySummary, MonthSummary};
pub use tracker::{ToggleOutcome, Tracker, TrackerOptions};
pub use types::*;
