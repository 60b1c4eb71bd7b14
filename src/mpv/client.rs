//! High-level MPV client with command methods.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::EventHub;
use super::ipc::Connection;
use super::protocol::{MpvCommand, MpvEvent};
use super::supervisor::Supervisor;
use crate::config::{PlayerConfig, SPEED_RANGE, VOLUME_RANGE};
use crate::deferred::Deferred;
use crate::dispose::Disposable;
use crate::error::{MpvError, Result};
use crate::logging::Logger;

/// How `seek` interprets its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeekMode {
  Relative,
  Absolute,
  RelativePercent,
  AbsolutePercent,
}

impl SeekMode {
  pub fn as_str(self) -> &'static str {
    match self {
      SeekMode::Relative => "relative",
      SeekMode::Absolute => "absolute",
      SeekMode::RelativePercent => "relative-percent",
      SeekMode::AbsolutePercent => "absolute-percent",
    }
  }

  fn is_absolute(self) -> bool {
    matches!(self, SeekMode::Absolute | SeekMode::AbsolutePercent)
  }
}

impl FromStr for SeekMode {
  type Err = MpvError;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "relative" => Ok(SeekMode::Relative),
      "absolute" => Ok(SeekMode::Absolute),
      "relative-percent" => Ok(SeekMode::RelativePercent),
      "absolute-percent" => Ok(SeekMode::AbsolutePercent),
      other => Err(MpvError::InvalidArgument(format!("Unknown seek mode '{}'", other))),
    }
  }
}

/// Snapshot of the player returned by [`MpvClient::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
  pub connected: bool,
  pub paused: bool,
  pub time_pos: Option<f64>,
  pub duration: Option<f64>,
  pub volume: f64,
  pub muted: bool,
  pub speed: f64,
}

impl Default for PlayerState {
  fn default() -> Self {
    Self {
      connected: false,
      paused: true,
      time_pos: None,
      duration: None,
      volume: 100.0,
      muted: false,
      speed: 1.0,
    }
  }
}

enum Backend {
  /// MPV spawned and restarted by us.
  Supervised(Supervisor),
  /// An MPV someone else started; no restart.
  Attached(Connection),
}

/// High-level MPV client.
#[derive(Clone)]
pub struct MpvClient {
  backend: Arc<Backend>,
  events: EventHub,
  load_timeout: Option<Duration>,
  log: Logger,
}

impl MpvClient {
  /// Create a client that launches MPV on first use. Fails if MPV cannot be
  /// found or is too old.
  pub fn create(config: PlayerConfig) -> Result<Self> {
    let log = Logger::new("mpv_control", config.log_level_filter()?);
    Self::create_with_logger(config, log)
  }

  pub fn create_with_logger(config: PlayerConfig, log: Logger) -> Result<Self> {
    let events = EventHub::new(log.scoped("events"));
    let load_timeout = config.load_timeout();
    let supervisor = Supervisor::new(config, events.clone(), log.scoped("supervisor"))?;
    Ok(Self {
      backend: Arc::new(Backend::Supervised(supervisor)),
      events,
      load_timeout,
      log,
    })
  }

  /// Connect to an MPV that is already listening on `address`.
  pub async fn attach(address: &str, config: PlayerConfig) -> Result<Self> {
    config.validate()?;
    let log = Logger::new("mpv_control", config.log_level_filter()?);
    let events = EventHub::new(log.scoped("events"));
    let connection =
      Connection::connect(address, events, config.request_timeout(), log.scoped("ipc")).await?;
    Ok(Self::from_connection(connection, &config, log))
  }

  /// Wrap an existing connection.
  pub fn from_connection(connection: Connection, config: &PlayerConfig, log: Logger) -> Self {
    Self {
      events: connection.events().clone(),
      backend: Arc::new(Backend::Attached(connection)),
      load_timeout: config.load_timeout(),
      log,
    }
  }

  /// The supervisor, when this client launched MPV itself.
  pub fn supervisor(&self) -> Option<&Supervisor> {
    match &*self.backend {
      Backend::Supervised(supervisor) => Some(supervisor),
      Backend::Attached(_) => None,
    }
  }

  /// Check if connected.
  pub fn is_connected(&self) -> bool {
    match &*self.backend {
      Backend::Supervised(supervisor) => supervisor.address().is_some(),
      Backend::Attached(connection) => !connection.is_closed(),
    }
  }

  async fn connection(&self) -> Result<Connection> {
    match &*self.backend {
      Backend::Supervised(supervisor) => supervisor.ensure_started().await,
      Backend::Attached(connection) if connection.is_closed() => Err(MpvError::ConnectionClosed),
      Backend::Attached(connection) => Ok(connection.clone()),
    }
  }

  /// Send a command to MPV, starting it if needed.
  pub async fn send(&self, cmd: MpvCommand) -> Result<Value> {
    let connection = self.connection().await?;
    connection.send(cmd).await
  }

  /// Run an arbitrary MPV command by name.
  pub async fn command(&self, name: &str, args: Vec<Value>) -> Result<Value> {
    let cmd = args
      .into_iter()
      .fold(MpvCommand::new(name), |cmd, arg| cmd.arg(arg));
    self.send(cmd).await
  }

  /// Get a property value.
  pub async fn get_prop<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
    let data = self.send(MpvCommand::get_property(name)).await?;
    Ok(serde_json::from_value(data)?)
  }

  pub async fn set_prop(&self, name: &str, value: impl Into<Value>) -> Result<()> {
    self.send(MpvCommand::set_property(name, value)).await?;
    Ok(())
  }

  /// Cycle (toggle) a property.
  pub async fn cycle_prop(&self, name: &str) -> Result<()> {
    self.send(MpvCommand::cycle(name)).await?;
    Ok(())
  }

  pub async fn add_prop(&self, name: &str, delta: f64) -> Result<()> {
    self.send(MpvCommand::add(name, delta)).await?;
    Ok(())
  }

  /// Property that MPV leaves unset while nothing is playing.
  async fn optional_prop(&self, name: &str) -> Result<Option<f64>> {
    match self.get_prop::<Option<f64>>(name).await {
      Ok(value) => Ok(value),
      Err(e) if e.is_property_unavailable() => Ok(None),
      Err(e) => Err(e),
    }
  }

  /// Call `callback` with every new value of `name`.
  pub async fn watch<F>(&self, name: &str, callback: F) -> Result<Disposable>
  where
    F: Fn(&Value) + Send + Sync + 'static,
  {
    let connection = self.connection().await?;
    let observation = connection.observe(name, callback).await?;
    self.log.debug(format_args!(
      "Watching '{}' as observer {}",
      name,
      observation.id()
    ));
    Ok(observation.into_disposable())
  }

  /// Listen for an MPV event by name (e.g. "end-file", "seek").
  pub fn on<F>(&self, event: &str, callback: F) -> Disposable
  where
    F: Fn(&MpvEvent) + Send + Sync + 'static,
  {
    self.events.subscribe(event, callback)
  }

  /// Listen for the next occurrence of an event only.
  pub fn once<F>(&self, event: &str, callback: F) -> Disposable
  where
    F: Fn(&MpvEvent) + Send + Sync + 'static,
  {
    self.events.once(event, callback)
  }

  pub fn events(&self) -> &EventHub {
    &self.events
  }

  /// Resume playback, or load `source` and wait until it has started.
  ///
  /// Loading succeeds on `file-loaded` and fails with
  /// [`MpvError::Operation`] if `end-file` arrives first. Only events after
  /// the new file's `start-file` count, so the end of a previous file is
  /// ignored. Losing the connection meanwhile fails with
  /// [`MpvError::ConnectionClosed`].
  pub async fn play(&self, source: Option<&str>) -> Result<()> {
    let Some(source) = source else {
      return self.resume().await;
    };

    let target = resolve_source(source)?;
    let connection = self.connection().await?;
    self.log.info(format_args!("Loading file: {}", target));

    let started = Arc::new(AtomicBool::new(false));
    let outcome = Deferred::new(self.load_timeout);
    let listeners = Disposable::combine(vec![
      self.events.subscribe("start-file", {
        let started = started.clone();
        move |_| started.store(true, Ordering::SeqCst)
      }),
      self.events.subscribe("file-loaded", {
        let started = started.clone();
        let outcome = outcome.clone();
        move |_| {
          if started.load(Ordering::SeqCst) {
            outcome.resolve(());
          }
        }
      }),
      self.events.subscribe("end-file", {
        let outcome = outcome.clone();
        let target = target.clone();
        move |event| {
          if started.load(Ordering::SeqCst) {
            outcome.reject(MpvError::Operation(end_file_message(&target, event)));
          }
        }
      }),
    ]);

    let result = match connection.send(MpvCommand::loadfile(&target)).await {
      // A player that dies mid-load never sends `end-file`.
      Ok(_) => tokio::select! {
        biased;
        result = outcome.wait() => result,
        _ = connection.closed() => Err(MpvError::ConnectionClosed),
      },
      Err(e) => Err(e),
    };

    if let Err(e) = listeners.dispose() {
      self
        .log
        .warn(format_args!("Failed to remove load listeners: {}", e));
    }
    result
  }

  pub async fn pause(&self) -> Result<()> {
    self.set_prop("pause", true).await
  }

  pub async fn resume(&self) -> Result<()> {
    self.set_prop("pause", false).await
  }

  /// Toggle pause, or force it to `paused`.
  pub async fn toggle_pause(&self, paused: Option<bool>) -> Result<()> {
    match paused {
      Some(paused) => self.set_prop("pause", paused).await,
      None => self.cycle_prop("pause").await,
    }
  }

  pub async fn is_paused(&self) -> Result<bool> {
    self.get_prop("pause").await
  }

  /// Stop playback and clear the playlist.
  pub async fn stop(&self) -> Result<()> {
    self.send(MpvCommand::stop()).await?;
    Ok(())
  }

  pub async fn get_speed(&self) -> Result<f64> {
    self.get_prop("speed").await
  }

  /// Set playback speed, clamped to 0.01-100.
  pub async fn set_speed(&self, speed: f64) -> Result<()> {
    let speed = clamp("speed", speed, SPEED_RANGE)?;
    self.set_prop("speed", speed).await
  }

  pub async fn get_volume(&self) -> Result<f64> {
    self.get_prop("volume").await
  }

  /// Set volume, clamped to 0-100.
  pub async fn set_volume(&self, volume: f64) -> Result<()> {
    let volume = clamp("volume", volume, VOLUME_RANGE)?;
    self.set_prop("volume", volume).await
  }

  pub async fn add_volume(&self, delta: f64) -> Result<()> {
    self.add_prop("volume", delta).await
  }

  pub async fn mute(&self) -> Result<()> {
    self.set_prop("mute", true).await
  }

  pub async fn unmute(&self) -> Result<()> {
    self.set_prop("mute", false).await
  }

  /// Toggle mute, or force it to `muted`.
  pub async fn toggle_mute(&self, muted: Option<bool>) -> Result<()> {
    match muted {
      Some(muted) => self.set_prop("mute", muted).await,
      None => self.cycle_prop("mute").await,
    }
  }

  pub async fn is_muted(&self) -> Result<bool> {
    self.get_prop("mute").await
  }

  /// Current position in seconds, `None` when nothing is loaded.
  pub async fn get_time_pos(&self) -> Result<Option<f64>> {
    self.optional_prop("time-pos").await
  }

  pub async fn get_duration(&self) -> Result<Option<f64>> {
    self.optional_prop("duration").await
  }

  pub async fn get_time_remaining(&self) -> Result<Option<f64>> {
    self.optional_prop("time-remaining").await
  }

  pub async fn get_percent_position(&self) -> Result<Option<f64>> {
    self.optional_prop("percent-pos").await
  }

  /// Seek with exact precision. Negative positions only make sense for the
  /// relative modes.
  pub async fn seek(&self, position: f64, mode: SeekMode) -> Result<()> {
    if !position.is_finite() || (mode.is_absolute() && position < 0.0) {
      return Err(MpvError::InvalidArgument(format!(
        "Cannot seek to {} in {} mode",
        position,
        mode.as_str()
      )));
    }
    let flags = format!("{}+exact", mode.as_str());
    self.send(MpvCommand::seek(position, &flags)).await?;
    Ok(())
  }

  /// Collect the commonly displayed properties in one go.
  pub async fn status(&self) -> Result<PlayerState> {
    Ok(PlayerState {
      connected: true,
      paused: self.is_paused().await?,
      time_pos: self.get_time_pos().await?,
      duration: self.get_duration().await?,
      volume: self.get_volume().await?,
      muted: self.is_muted().await?,
      speed: self.get_speed().await?,
    })
  }

  /// Ask MPV to quit. A supervised player will be started again on the next
  /// command.
  pub async fn quit(&self) -> Result<()> {
    if self.is_connected() {
      if let Err(e) = self.send(MpvCommand::quit()).await {
        self.log.debug(format_args!("quit: {}", e));
      }
    }
    match &*self.backend {
      Backend::Supervised(supervisor) => supervisor.stop(),
      Backend::Attached(connection) => connection.dispose(),
    }
    Ok(())
  }

  /// Shut the player down for good and drop every listener.
  pub fn dispose(&self) {
    match &*self.backend {
      Backend::Supervised(supervisor) => supervisor.dispose(),
      Backend::Attached(connection) => {
        connection.dispose();
        self.events.dispose();
      }
    }
  }
}

fn end_file_message(target: &str, event: &MpvEvent) -> String {
  let reason = event.reason.as_deref().unwrap_or("unknown");
  match &event.file_error {
    Some(error) => format!("Failed to load {} ({}): {}", target, reason, error),
    None => format!("Failed to load {} ({})", target, reason),
  }
}

fn clamp(name: &str, value: f64, (min, max): (f64, f64)) -> Result<f64> {
  if value.is_nan() {
    return Err(MpvError::InvalidArgument(format!("{} cannot be NaN", name)));
  }
  Ok(value.clamp(min, max))
}

/// URLs pass through; local paths are made absolute since MPV resolves them
/// against its own working directory.
pub fn resolve_source(source: &str) -> Result<String> {
  let lower = source.to_ascii_lowercase();
  if lower.starts_with("http://") || lower.starts_with("https://") {
    return Ok(source.to_string());
  }

  let path = Path::new(source);
  if path.is_absolute() {
    return Ok(source.to_string());
  }
  let cwd = std::env::current_dir()
    .map_err(|e| MpvError::InvalidArgument(format!("Cannot resolve {}: {}", source, e)))?;
  Ok(cwd.join(path).to_string_lossy().into_owned())
}
