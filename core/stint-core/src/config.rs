//! Runtime configuration loaded from `~/.stint/config.toml`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, TrackerError};

const STINT_DIR: &str = ".stint";
const CONFIG_FILE: &str = "config.toml";
const USER_ENV: &str = "STINT_USER";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MirrorBackend {
    #[default]
    File,
    Memory,
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub backend: MirrorBackend,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_mirror_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            backend: MirrorBackend::default(),
            dir: None,
            timeout_ms: default_mirror_timeout_ms(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StintConfig {
    #[serde(default)]
    pub user: UserConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

impl StintConfig {
    /// SQLite file, falling back to `<stint home>/stint.db`.
    pub fn db_path(&self, stint_home: &Path) -> PathBuf {
        self.storage
            .db_path
            .clone()
            .unwrap_or_else(|| stint_home.join("stint.db"))
    }

    pub fn mirror_dir(&self, stint_home: &Path) -> PathBuf {
        self.mirror
            .dir
            .clone()
            .unwrap_or_else(|| stint_home.join("mirror"))
    }

    pub fn apply_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(user) = lookup(USER_ENV).filter(|value| !value.trim().is_empty()) {
            self.user.id = Some(user);
        }
        self
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.timer.tick_interval_ms == 0 {
            return Err(TrackerError::Config {
                path: path.to_path_buf(),
                details: "timer.tick_interval_ms must be greater than zero".to_string(),
            });
        }
        if self.mirror.max_in_flight == 0 {
            return Err(TrackerError::Config {
                path: path.to_path_buf(),
                details: "mirror.max_in_flight must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_mirror_timeout_ms() -> u64 {
    5000
}

fn default_max_in_flight() -> usize {
    32
}

/// `~/.stint`, home of the database, mirror files, socket and logs.
pub fn stint_home() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| TrackerError::Io {
        context: "Home directory not found".to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    Ok(home.join(STINT_DIR))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(stint_home()?.join(CONFIG_FILE))
}

/// Loads the config file (defaults when it does not exist) and applies
/// environment overrides.
pub fn load_config(path: Option<PathBuf>) -> Result<StintConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    let config = if config_path.exists() {
        let content = fs_err::read_to_string(&config_path).map_err(|source| TrackerError::Io {
            context: format!("Failed to read config {}", config_path.display()),
            source,
        })?;
        toml::from_str::<StintConfig>(&content).map_err(|err| TrackerError::Config {
            path: config_path.clone(),
            details: err.to_string(),
        })?
    } else {
        StintConfig::default()
    };

    config.validate(&config_path)?;
    Ok(config.apply_env_overrides(|key| std::env::var(key).ok()))
}
