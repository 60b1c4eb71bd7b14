//! MPV process detection, version checks and spawning.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{PlayerConfig, SPEED_RANGE, VOLUME_RANGE};
use crate::error::{MpvError, Result};
use crate::logging::Logger;

/// Oldest MPV release whose IPC behaves the way the client expects.
pub const MIN_VERSION: (u32, u32) = (0, 33);

/// Arguments every spawned player gets.
const BASE_ARGS: &[&str] = &[
  "--no-config",
  "--idle=yes",
  "--quiet",
  "--msg-level=ipc=v",
  "--no-video",
  "--audio-display=no",
];

/// Version reported by `mpv --version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MpvVersion {
  Release { major: u32, minor: u32, raw: String },
  /// Development or vendor build; assumed to be recent.
  Unknown(String),
}

impl std::fmt::Display for MpvVersion {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      MpvVersion::Release { raw, .. } => write!(f, "{}", raw),
      MpvVersion::Unknown(raw) => write!(f, "{} (unknown)", raw),
    }
  }
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  #[cfg(windows)]
  let common_paths: &[&str] = &[
    r"C:\Program Files\mpv\mpv.exe",
    r"C:\Program Files (x86)\mpv\mpv.exe",
    r"C:\mpv\mpv.exe",
  ];
  #[cfg(target_os = "macos")]
  let common_paths: &[&str] = &[
    "/usr/local/bin/mpv",
    "/opt/homebrew/bin/mpv",
    "/Applications/mpv.app/Contents/MacOS/mpv",
  ];
  #[cfg(not(any(windows, target_os = "macos")))]
  let common_paths: &[&str] = &["/usr/bin/mpv", "/usr/local/bin/mpv"];

  common_paths
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

/// Use the configured path if any, otherwise search for MPV.
pub fn resolve_executable(configured: Option<&str>) -> Result<PathBuf> {
  match configured.map(str::trim).filter(|s| !s.is_empty()) {
    Some(path) => {
      let path = PathBuf::from(path);
      if path.exists() {
        Ok(path)
      } else {
        which::which(&path).map_err(|_| MpvError::NotFound)
      }
    }
    None => find_mpv().ok_or(MpvError::NotFound),
  }
}

/// Pull the version token out of `mpv --version` output
/// (first line looks like `mpv 0.36.0 Copyright ...`).
pub fn parse_version_token(output: &str) -> Option<&str> {
  output
    .lines()
    .filter_map(|line| {
      let mut words = line.split_whitespace();
      match words.next() {
        Some("mpv") => words.next(),
        _ => None,
      }
    })
    .next()
}

/// Classify a version token and reject releases older than [`MIN_VERSION`].
pub fn check_version(token: &str) -> Result<MpvVersion> {
  if token.is_empty() || token.chars().any(|c| !c.is_ascii_digit() && c != '.') {
    return Ok(MpvVersion::Unknown(token.to_string()));
  }

  let mut parts = token.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
  let major = parts.next().unwrap_or(0);
  let minor = parts.next().unwrap_or(0);

  if (major, minor) < MIN_VERSION {
    return Err(MpvError::UnsupportedVersion {
      found: token.to_string(),
      required: format!("{}.{}", MIN_VERSION.0, MIN_VERSION.1),
    });
  }

  Ok(MpvVersion::Release {
    major,
    minor,
    raw: token.to_string(),
  })
}

/// Run `mpv --version` and check the result. Blocks until MPV exits.
pub fn query_version(executable: &Path) -> Result<MpvVersion> {
  let output = std::process::Command::new(executable)
    .arg("--version")
    .stdin(Stdio::null())
    .output()
    .map_err(|e| MpvError::VersionCheck(format!("Failed to run {:?}: {}", executable, e)))?;

  if !output.status.success() {
    return Err(MpvError::VersionCheck(format!(
      "{:?} --version exited with {}",
      executable, output.status
    )));
  }

  let stdout = String::from_utf8_lossy(&output.stdout);
  let token = parse_version_token(&stdout)
    .ok_or_else(|| MpvError::VersionCheck("Unrecognized --version output".into()))?;
  check_version(token)
}

/// Fresh IPC socket/pipe address, unique per call.
pub fn socket_address() -> String {
  let token = Uuid::new_v4().simple();
  #[cfg(windows)]
  {
    format!(r"\\.\pipe\mpv-control-{}", token)
  }
  #[cfg(not(windows))]
  {
    std::env::temp_dir()
      .join(format!("mpv-control-{}.sock", token))
      .to_string_lossy()
      .into_owned()
  }
}

/// Remove a stale socket file.
pub fn cleanup_socket(address: &str) {
  #[cfg(not(windows))]
  {
    let _ = std::fs::remove_file(address);
  }
  // Windows named pipes are cleaned up automatically
  #[cfg(windows)]
  let _ = address;
}

/// Drop repeated arguments, keyed by the text before `=`. The first
/// occurrence wins.
pub fn unique_arguments<I>(args: I, log: &Logger) -> Vec<String>
where
  I: IntoIterator<Item = String>,
{
  let mut seen = HashSet::new();
  args
    .into_iter()
    .filter(|arg| {
      let name = arg.split('=').next().unwrap_or(arg).to_string();
      let first = seen.insert(name);
      if !first {
        log.warn(format_args!("Dropping duplicate MPV argument: {}", arg));
      }
      first
    })
    .collect()
}

/// Full argument list for a player listening on `address`.
///
/// Order decides precedence: the IPC address, then config-derived values,
/// then the user's extra arguments, then the defaults.
pub fn build_args(address: &str, config: &PlayerConfig, log: &Logger) -> Vec<String> {
  let mut args = vec![format!("--input-ipc-server={}", address)];

  if let Some(volume) = config.volume {
    if (VOLUME_RANGE.0..=VOLUME_RANGE.1).contains(&volume) {
      args.push(format!("--volume={}", volume));
    } else {
      log.warn(format_args!("Ignoring out-of-range initial volume {}", volume));
    }
  }
  if let Some(mute) = config.mute {
    args.push(format!("--mute={}", if mute { "yes" } else { "no" }));
  }
  if let Some(speed) = config.speed {
    if (SPEED_RANGE.0..=SPEED_RANGE.1).contains(&speed) {
      args.push(format!("--speed={}", speed));
    } else {
      log.warn(format_args!("Ignoring out-of-range initial speed {}", speed));
    }
  }

  args.extend(config.mpv_args.iter().cloned());
  args.extend(BASE_ARGS.iter().map(|s| s.to_string()));
  unique_arguments(args, log)
}

/// Spawn MPV with the given arguments. The process is killed if its handle
/// is dropped.
pub fn spawn_mpv(executable: &Path, args: &[String], log: &Logger) -> Result<Child> {
  log.info(format_args!("Spawning MPV: {:?} {:?}", executable, args));

  Command::new(executable)
    .args(args)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .map_err(|e| MpvError::Spawn(Arc::new(e)))
}

/// Forward the child's output to the log. The returned token is cancelled
/// once MPV reports that its IPC server is up.
pub fn watch_output(child: &mut Child, log: &Logger) -> CancellationToken {
  let ready = CancellationToken::new();
  if let Some(stdout) = child.stdout.take() {
    tokio::spawn(forward_lines(stdout, ready.clone(), log.clone()));
  }
  if let Some(stderr) = child.stderr.take() {
    tokio::spawn(forward_lines(stderr, ready.clone(), log.clone()));
  }
  ready
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: R, ready: CancellationToken, log: Logger) {
  let mut lines = BufReader::new(stream).lines();
  while let Ok(Some(line)) = lines.next_line().await {
    if line.contains("[ipc]") {
      ready.cancel();
    }
    log.debug(format_args!("mpv: {}", line));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use log::LevelFilter;

  fn quiet() -> Logger {
    Logger::new("test", LevelFilter::Off)
  }

  #[test]
  fn first_occurrence_wins() {
    let args = vec!["--a=1".to_string(), "--b".to_string(), "--a=2".to_string()];
    assert_eq!(unique_arguments(args, &quiet()), vec!["--a=1", "--b"]);
  }

  #[test]
  fn parses_version_output() {
    let output = "mpv 0.36.0 Copyright © 2000-2023 mpv/MPlayer/mplayer2 projects\n built on ...";
    assert_eq!(parse_version_token(output), Some("0.36.0"));
    assert_eq!(parse_version_token("garbage"), None);
  }

  #[test]
  fn version_policy() {
    assert!(matches!(
      check_version("0.36.0"),
      Ok(MpvVersion::Release { major: 0, minor: 36, .. })
    ));
    assert!(matches!(check_version("0.33"), Ok(MpvVersion::Release { .. })));
    assert!(matches!(check_version("1.0.0"), Ok(MpvVersion::Release { major: 1, .. })));
    assert!(matches!(
      check_version("0.32.0"),
      Err(MpvError::UnsupportedVersion { .. })
    ));
    // Git builds and vendor tags are accepted as "latest".
    assert!(matches!(
      check_version("v0.36.0-622-g1a2b3c"),
      Ok(MpvVersion::Unknown(_))
    ));
  }

  #[test]
  fn socket_addresses_do_not_collide() {
    assert_ne!(socket_address(), socket_address());
  }

  #[test]
  fn args_include_ipc_defaults_and_overrides() {
    let config = PlayerConfig {
      volume: Some(55.0),
      mute: Some(true),
      speed: Some(500.0),
      mpv_args: vec!["--quiet=no".into(), "--ao=null".into(), "--ao=pulse".into()],
      ..Default::default()
    };
    let args = build_args("/tmp/x.sock", &config, &quiet());

    assert_eq!(args[0], "--input-ipc-server=/tmp/x.sock");
    assert!(args.contains(&"--volume=55".to_string()));
    assert!(args.contains(&"--mute=yes".to_string()));
    assert!(!args.iter().any(|a| a.starts_with("--speed")));
    assert!(args.contains(&"--ao=null".to_string()));
    assert!(!args.contains(&"--ao=pulse".to_string()));
    // The user's override replaces the default.
    assert!(args.contains(&"--quiet=no".to_string()));
    assert!(!args.contains(&"--quiet".to_string()));
    assert!(args.contains(&"--no-config".to_string()));
    assert!(args.contains(&"--idle=yes".to_string()));
    assert!(args.contains(&"--no-video".to_string()));
  }

  #[test]
  fn extra_args_cannot_move_the_ipc_socket() {
    let config = PlayerConfig {
      mpv_args: vec!["--input-ipc-server=/elsewhere".into()],
      ..Default::default()
    };
    let args = build_args("/tmp/mine.sock", &config, &quiet());
    let ipc: Vec<_> = args
      .iter()
      .filter(|a| a.starts_with("--input-ipc-server"))
      .collect();
    assert_eq!(ipc, vec!["--input-ipc-server=/tmp/mine.sock"]);
  }

  #[test]
  fn missing_configured_executable() {
    assert!(matches!(
      resolve_executable(Some("/definitely/not/here/mpv")),
      Err(MpvError::NotFound)
    ));
  }
}
