//! Injected logger handle.
//!
//! Components never configure logging globally. They receive a [`Logger`]
//! carrying a target and a level filter, and write through the `log` facade
//! into whatever sink the host installed.

use std::fmt;
use std::sync::Arc;

use log::{Level, LevelFilter};

/// Cheap, cloneable logging handle.
#[derive(Debug, Clone)]
pub struct Logger {
  target: Arc<str>,
  level: LevelFilter,
}

impl Logger {
  pub fn new(target: &str, level: LevelFilter) -> Self {
    Self {
      target: Arc::from(target),
      level,
    }
  }

  /// Logger for a sub-component, e.g. `mpv_control::ipc`.
  pub fn scoped(&self, name: &str) -> Self {
    Self {
      target: Arc::from(format!("{}::{}", self.target, name)),
      level: self.level,
    }
  }

  pub fn target(&self) -> &str {
    &self.target
  }

  pub fn level(&self) -> LevelFilter {
    self.level
  }

  pub fn enabled(&self, level: Level) -> bool {
    level <= self.level
  }

  pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
    if self.enabled(level) {
      log::log!(target: &*self.target, level, "{}", args);
    }
  }

  pub fn error(&self, args: fmt::Arguments<'_>) {
    self.log(Level::Error, args);
  }

  pub fn warn(&self, args: fmt::Arguments<'_>) {
    self.log(Level::Warn, args);
  }

  pub fn info(&self, args: fmt::Arguments<'_>) {
    self.log(Level::Info, args);
  }

  pub fn debug(&self, args: fmt::Arguments<'_>) {
    self.log(Level::Debug, args);
  }

  pub fn trace(&self, args: fmt::Arguments<'_>) {
    self.log(Level::Trace, args);
  }
}

impl Default for Logger {
  fn default() -> Self {
    Self::new("mpv_control", LevelFilter::Info)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scoped_logger_keeps_level() {
    let log = Logger::new("player", LevelFilter::Warn);
    let ipc = log.scoped("ipc");
    assert_eq!(ipc.target(), "player::ipc");
    assert_eq!(ipc.level(), LevelFilter::Warn);
    assert!(ipc.enabled(Level::Error));
    assert!(!ipc.enabled(Level::Info));
  }

  #[test]
  fn off_disables_everything() {
    let log = Logger::new("player", LevelFilter::Off);
    assert!(!log.enabled(Level::Error));
  }
}
