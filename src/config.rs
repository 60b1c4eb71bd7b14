//! Player configuration with persistence.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::error::{MpvError, Result};

/// Valid `volume` range.
pub const VOLUME_RANGE: (f64, f64) = (0.0, 100.0);
/// Valid `speed` range.
pub const SPEED_RANGE: (f64, f64) = (0.01, 100.0);

const CONFIG_DIR: &str = "mpv-control";
const CONFIG_FILE: &str = "config.json";

/// Player configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub mpv_path: Option<String>,

  /// Additional MPV command-line arguments.
  #[serde(default)]
  pub mpv_args: Vec<String>,

  /// Initial volume (0-100).
  #[serde(default)]
  pub volume: Option<f64>,

  /// Start muted.
  #[serde(default)]
  pub mute: Option<bool>,

  /// Initial playback speed (0.01-100).
  #[serde(default)]
  pub speed: Option<f64>,

  /// Overall budget for connecting to a freshly spawned player.
  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms: u64,

  /// Pause between connection attempts.
  #[serde(default = "default_connect_backoff_ms")]
  pub connect_backoff_ms: u64,

  /// Per-command timeout, 0 waits forever.
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,

  /// How long `play` waits for a file to load, 0 waits forever.
  #[serde(default = "default_load_timeout_ms")]
  pub load_timeout_ms: u64,

  /// Log level for the control channel ("error" .. "trace", or "off").
  #[serde(default = "default_log_level")]
  pub log_level: String,
}

fn default_connect_timeout_ms() -> u64 {
  8_000
}

fn default_connect_backoff_ms() -> u64 {
  1_000
}

fn default_request_timeout_ms() -> u64 {
  10_000
}

fn default_load_timeout_ms() -> u64 {
  30_000
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Default for PlayerConfig {
  fn default() -> Self {
    Self {
      mpv_path: None,
      mpv_args: Vec::new(),
      volume: None,
      mute: None,
      speed: None,
      connect_timeout_ms: default_connect_timeout_ms(),
      connect_backoff_ms: default_connect_backoff_ms(),
      request_timeout_ms: default_request_timeout_ms(),
      load_timeout_ms: default_load_timeout_ms(),
      log_level: default_log_level(),
    }
  }
}

fn non_zero(ms: u64) -> Option<Duration> {
  (ms > 0).then(|| Duration::from_millis(ms))
}

impl PlayerConfig {
  /// Validate configuration values.
  pub fn validate(&self) -> Result<()> {
    if self.connect_timeout_ms == 0 {
      return Err(MpvError::Config("Connect timeout must be positive".into()));
    }
    if self.connect_backoff_ms == 0 || self.connect_backoff_ms > self.connect_timeout_ms {
      return Err(MpvError::Config(
        "Connect backoff must be positive and within the connect timeout".into(),
      ));
    }
    if let Some(path) = &self.mpv_path {
      if path.trim().is_empty() {
        return Err(MpvError::Config("MPV path cannot be empty".into()));
      }
    }
    self.log_level_filter()?;
    Ok(())
  }

  pub fn log_level_filter(&self) -> Result<LevelFilter> {
    LevelFilter::from_str(self.log_level.trim())
      .map_err(|_| MpvError::Config(format!("Unknown log level '{}'", self.log_level)))
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn connect_backoff(&self) -> Duration {
    Duration::from_millis(self.connect_backoff_ms)
  }

  pub fn request_timeout(&self) -> Option<Duration> {
    non_zero(self.request_timeout_ms)
  }

  pub fn load_timeout(&self) -> Option<Duration> {
    non_zero(self.load_timeout_ms)
  }

  /// Default location of the config file, under the user config directory.
  pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
  }

  /// Read and validate a config file.
  pub fn load(path: &Path) -> Result<Self> {
    let text = std::fs::read_to_string(path)
      .map_err(|e| MpvError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    let config: PlayerConfig = serde_json::from_str(&text)?;
    config.validate()?;
    Ok(config)
  }

  /// Load from `path` if given, else from the default location if a file
  /// exists there, else fall back to defaults.
  pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
    if let Some(path) = path {
      return Self::load(path);
    }
    match Self::default_path() {
      Some(path) if path.exists() => Self::load(&path),
      _ => Ok(Self::default()),
    }
  }
}
