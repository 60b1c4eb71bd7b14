//! Error types shared by the control channel.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving the player.
///
/// The type is `Clone` so a single start attempt can hand the same failure to
/// every caller that was waiting on it.
#[derive(Error, Debug, Clone)]
pub enum MpvError {
  /// Transport-level failure: connecting to or writing on the IPC socket.
  #[error("Socket error: {0}")]
  Socket(String),

  /// The player answered a command with something other than `"success"`.
  #[error("MPV command '{command}' failed: {error}")]
  Command { command: String, error: String },

  /// A multi-step protocol failed (e.g. the file ended before it loaded).
  #[error("Operation failed: {0}")]
  Operation(String),

  #[error("Timed out after {0:?}")]
  Timeout(Duration),

  #[error("Connection closed")]
  ConnectionClosed,

  #[error("MPV executable not found")]
  NotFound,

  #[error("Failed to spawn MPV: {0}")]
  Spawn(Arc<std::io::Error>),

  #[error("MPV version check failed: {0}")]
  VersionCheck(String),

  #[error("MPV {found} is not supported, {required} or newer is required")]
  UnsupportedVersion { found: String, required: String },

  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("Invalid configuration: {0}")]
  Config(String),

  #[error("JSON error: {0}")]
  Json(Arc<serde_json::Error>),

  #[error("Player has been disposed")]
  Disposed,

  /// Several independent failures, e.g. from disposing a group of resources.
  #[error("{}", join_messages(.0))]
  Aggregate(Vec<MpvError>),
}

fn join_messages(errors: &[MpvError]) -> String {
  errors
    .iter()
    .map(|e| e.to_string())
    .collect::<Vec<_>>()
    .join("; ")
}

impl MpvError {
  /// Whether the player reported that a property has no value right now
  /// (e.g. `time-pos` while idle).
  pub fn is_property_unavailable(&self) -> bool {
    matches!(self, MpvError::Command { error, .. } if error == "property unavailable")
  }
}

impl From<serde_json::Error> for MpvError {
  fn from(e: serde_json::Error) -> Self {
    MpvError::Json(Arc::new(e))
  }
}

pub type Result<T, E = MpvError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn aggregate_joins_messages() {
    let err = MpvError::Aggregate(vec![
      MpvError::Operation("first".into()),
      MpvError::Socket("second".into()),
    ]);
    let msg = err.to_string();
    assert!(msg.contains("first"));
    assert!(msg.contains("second"));
  }

  #[test]
  fn detects_unavailable_property() {
    let err = MpvError::Command {
      command: "get_property".into(),
      error: "property unavailable".into(),
    };
    assert!(err.is_property_unavailable());
    assert!(!MpvError::ConnectionClosed.is_property_unavailable());
  }
}
