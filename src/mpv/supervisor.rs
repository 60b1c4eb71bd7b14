//! Owns the MPV process: startup, health monitoring and restart.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::EventHub;
use super::ipc::Connection;
use super::process::{
  build_args, cleanup_socket, query_version, resolve_executable, socket_address, spawn_mpv,
  watch_output,
};
use crate::config::PlayerConfig;
use crate::error::{MpvError, Result};
use crate::logging::Logger;

/// Lifecycle of the supervised player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
  Unstarted,
  VersionChecked,
  Starting,
  Connecting,
  Running,
}

type StartFuture = Shared<BoxFuture<'static, Result<Connection>>>;

/// The in-flight or completed start shared by every caller.
struct StartSlot {
  generation: u64,
  future: StartFuture,
}

struct RunningPlayer {
  generation: u64,
  address: String,
  pid: Option<u32>,
  connection: Connection,
  stop: CancellationToken,
}

struct SupervisorInner {
  executable: PathBuf,
  config: PlayerConfig,
  events: EventHub,
  log: Logger,
  state: Mutex<SupervisorState>,
  start: Mutex<Option<StartSlot>>,
  running: Mutex<Option<RunningPlayer>>,
  generation: AtomicU64,
  disposed: AtomicBool,
}

impl Drop for SupervisorInner {
  fn drop(&mut self) {
    if let Some(player) = self.running.get_mut().take() {
      player.stop.cancel();
      player.connection.dispose();
    }
  }
}

/// Starts MPV on demand and restarts it after it goes away.
///
/// At most one process and one connection exist at a time. When the process
/// exits or the socket drops, everything is torn down and the next
/// [`Supervisor::ensure_started`] spawns a fresh player.
#[derive(Clone)]
pub struct Supervisor {
  inner: Arc<SupervisorInner>,
}

impl Supervisor {
  /// Locate MPV and check its version. Fails outright if MPV is missing or
  /// too old.
  pub fn new(config: PlayerConfig, events: EventHub, log: Logger) -> Result<Self> {
    config.validate()?;
    let executable = resolve_executable(config.mpv_path.as_deref())?;
    let version = query_version(&executable)?;
    log.info(format_args!("Using MPV {} at {:?}", version, executable));

    Ok(Self {
      inner: Arc::new(SupervisorInner {
        executable,
        config,
        events,
        log,
        state: Mutex::new(SupervisorState::Unstarted),
        start: Mutex::new(None),
        running: Mutex::new(None),
        generation: AtomicU64::new(0),
        disposed: AtomicBool::new(false),
      }),
    })
  }

  pub fn state(&self) -> SupervisorState {
    *self.inner.state.lock()
  }

  /// IPC address of the running player.
  pub fn address(&self) -> Option<String> {
    self.inner.running.lock().as_ref().map(|r| r.address.clone())
  }

  pub fn pid(&self) -> Option<u32> {
    self.inner.running.lock().as_ref().and_then(|r| r.pid)
  }

  pub fn events(&self) -> &EventHub {
    &self.inner.events
  }

  /// Return the live connection, starting MPV first if needed.
  ///
  /// Concurrent callers share a single start. A failed start is forgotten so
  /// the next call tries again from scratch.
  pub async fn ensure_started(&self) -> Result<Connection> {
    for _ in 0..2 {
      if self.inner.disposed.load(Ordering::SeqCst) {
        return Err(MpvError::Disposed);
      }

      let (generation, future) = {
        let mut slot = self.inner.start.lock();
        match slot.as_ref() {
          Some(existing) => {
            self.inner.log.trace(format_args!(
              "Joining MPV start, generation {}",
              existing.generation
            ));
            (existing.generation, existing.future.clone())
          }
          None => {
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self
              .inner
              .log
              .debug(format_args!("Leading MPV start, generation {}", generation));
            let future = start(self.inner.clone(), generation).boxed().shared();
            *slot = Some(StartSlot {
              generation,
              future: future.clone(),
            });
            (generation, future)
          }
        }
      };

      match future.await {
        // The player died but the monitor has not cleaned up yet.
        Ok(connection) if connection.is_closed() => clear_start(&self.inner, generation),
        Ok(connection) => return Ok(connection),
        Err(e) => {
          clear_start(&self.inner, generation);
          return Err(e);
        }
      }
    }
    Err(MpvError::ConnectionClosed)
  }

  /// Kill the running player, if any, and abandon a start in progress. The
  /// next call to [`Supervisor::ensure_started`] starts a new one.
  pub fn stop(&self) {
    // Bumping first makes an in-flight launch see it is stale before it can
    // register its player.
    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let running = self.inner.running.lock().take();
    if let Some(player) = running {
      release(player);
    }
    *self.inner.start.lock() = None;
    set_state(&self.inner, generation, SupervisorState::Unstarted);
  }

  /// Stop the player and release the event hub. Idempotent.
  pub fn dispose(&self) {
    if self.inner.disposed.swap(true, Ordering::SeqCst) {
      return;
    }
    self.inner.log.info(format_args!("Disposing MPV supervisor"));
    self.stop();
    self.inner.events.dispose();
  }
}

fn is_current(inner: &SupervisorInner, generation: u64) -> bool {
  inner.generation.load(Ordering::SeqCst) == generation
}

fn set_state(inner: &SupervisorInner, generation: u64, state: SupervisorState) {
  if inner.generation.load(Ordering::SeqCst) == generation {
    *inner.state.lock() = state;
  }
}

fn clear_start(inner: &SupervisorInner, generation: u64) {
  let mut slot = inner.start.lock();
  if slot.as_ref().is_some_and(|s| s.generation == generation) {
    *slot = None;
  }
}

async fn start(inner: Arc<SupervisorInner>, generation: u64) -> Result<Connection> {
  let result = launch(&inner, generation).await;
  if let Err(e) = &result {
    inner.log.error(format_args!("Failed to start MPV: {}", e));
    set_state(&inner, generation, SupervisorState::Unstarted);
  }
  result
}

async fn launch(inner: &Arc<SupervisorInner>, generation: u64) -> Result<Connection> {
  let log = &inner.log;

  let executable = inner.executable.clone();
  let version = tokio::task::spawn_blocking(move || query_version(&executable))
    .await
    .map_err(|e| MpvError::VersionCheck(e.to_string()))??;
  log.debug(format_args!("MPV version {} confirmed", version));
  set_state(inner, generation, SupervisorState::VersionChecked);

  let address = socket_address();
  cleanup_socket(&address);
  let args = build_args(&address, &inner.config, log);
  set_state(inner, generation, SupervisorState::Starting);
  let mut child = spawn_mpv(&inner.executable, &args, log)?;
  let ready = watch_output(&mut child, log);

  set_state(inner, generation, SupervisorState::Connecting);
  let connection = match connect_with_retry(inner, generation, &address, &mut child, &ready).await {
    Ok(connection) => connection,
    Err(e) => {
      kill(&mut child, log).await;
      cleanup_socket(&address);
      return Err(e);
    }
  };

  let stop = CancellationToken::new();
  let registered = {
    let mut running = inner.running.lock();
    if inner.disposed.load(Ordering::SeqCst) || !is_current(inner, generation) {
      false
    } else {
      *running = Some(RunningPlayer {
        generation,
        address: address.clone(),
        pid: child.id(),
        connection: connection.clone(),
        stop: stop.clone(),
      });
      true
    }
  };
  if !registered {
    log.info(format_args!("MPV was stopped while starting"));
    connection.dispose();
    kill(&mut child, log).await;
    cleanup_socket(&address);
    return Err(if inner.disposed.load(Ordering::SeqCst) {
      MpvError::Disposed
    } else {
      MpvError::ConnectionClosed
    });
  }

  set_state(inner, generation, SupervisorState::Running);
  log.info(format_args!("MPV client connected on {}", address));

  tokio::spawn(monitor(
    Arc::downgrade(inner),
    log.clone(),
    generation,
    child,
    connection.clone(),
    stop,
  ));

  Ok(connection)
}

/// Connect to a freshly spawned player. MPV needs a moment to open its IPC
/// listener, so attempts are repeated with a fixed pause until the budget
/// runs out.
async fn connect_with_retry(
  inner: &SupervisorInner,
  generation: u64,
  address: &str,
  child: &mut Child,
  ready: &CancellationToken,
) -> Result<Connection> {
  let log = &inner.log;
  let backoff = inner.config.connect_backoff();
  let deadline = Instant::now() + inner.config.connect_timeout();
  let mut attempt = 0u32;

  loop {
    // Before the first attempt wait for MPV's IPC announcement, but never
    // longer than one backoff step.
    if !ready.is_cancelled() {
      let _ = tokio::time::timeout(backoff, ready.cancelled()).await;
    } else if attempt > 0 {
      tokio::time::sleep(backoff).await;
    }

    if !is_current(inner, generation) {
      return Err(MpvError::ConnectionClosed);
    }
    if let Ok(Some(status)) = child.try_wait() {
      return Err(MpvError::Socket(format!(
        "MPV exited during startup with {}",
        status
      )));
    }

    attempt += 1;
    match Connection::connect(
      address,
      inner.events.clone(),
      inner.config.request_timeout(),
      log.scoped("ipc"),
    )
    .await
    {
      Ok(connection) => return Ok(connection),
      Err(e) => {
        log.debug(format_args!("IPC connect attempt {} failed: {}", attempt, e));
        if Instant::now() + backoff > deadline {
          return Err(e);
        }
      }
    }
  }
}

/// Watch the process and its socket; whichever goes first takes down the
/// other.
async fn monitor(
  inner: Weak<SupervisorInner>,
  log: Logger,
  generation: u64,
  mut child: Child,
  connection: Connection,
  stop: CancellationToken,
) {
  tokio::select! {
    status = child.wait() => match status {
      Ok(status) => log.warn(format_args!("MPV exited with {}", status)),
      Err(e) => log.error(format_args!("Failed to wait on MPV: {}", e)),
    },
    _ = connection.closed() => log.warn(format_args!("MPV IPC connection lost")),
    _ = stop.cancelled() => log.info(format_args!("Stopping MPV")),
  }

  kill(&mut child, &log).await;
  match inner.upgrade() {
    Some(inner) => teardown(&inner, generation),
    None => connection.dispose(),
  }
}

async fn kill(child: &mut Child, log: &Logger) {
  if let Ok(None) = child.try_wait() {
    log.info(format_args!("Killing MPV process (pid: {:?})", child.id()));
    if let Err(e) = child.start_kill() {
      log.error(format_args!("kill() failed: {}", e));
    }
  }
  match child.wait().await {
    Ok(status) => log.debug(format_args!("MPV process exited with: {}", status)),
    Err(e) => log.error(format_args!("wait() failed: {}", e)),
  }
}

/// Signal the monitor to kill the process and close the connection.
fn release(player: RunningPlayer) {
  player.stop.cancel();
  player.connection.dispose();
  cleanup_socket(&player.address);
}

/// Forget everything belonging to `generation` and go back to `Unstarted`.
fn teardown(inner: &SupervisorInner, generation: u64) {
  let running = {
    let mut running = inner.running.lock();
    if running.as_ref().is_some_and(|r| r.generation == generation) {
      running.take()
    } else {
      None
    }
  };

  if let Some(player) = running {
    release(player);
  }

  clear_start(inner, generation);
  set_state(inner, generation, SupervisorState::Unstarted);
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use log::LevelFilter;
  use std::os::unix::fs::PermissionsExt;
  use std::path::Path;
  use std::time::Duration;
  use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
  use tokio::net::UnixListener;

  struct FakeMpv {
    dir: PathBuf,
    script: PathBuf,
    spawn_log: PathBuf,
    pid_log: PathBuf,
  }

  impl FakeMpv {
    /// A shell script that answers `--version` with `version` and otherwise
    /// records its pid and IPC address and idles.
    fn new(version: &str) -> Self {
      let dir = std::env::temp_dir().join(format!("mpv-control-test-{}", uuid::Uuid::new_v4()));
      std::fs::create_dir_all(&dir).unwrap();
      let script = dir.join("mpv");
      let spawn_log = dir.join("spawned");
      let pid_log = dir.join("pids");
      let body = format!(
        "#!/bin/sh\n\
         if [ \"$1\" = \"--version\" ]; then echo \"mpv {version} Copyright\"; exit 0; fi\n\
         echo $$ >> \"{pids}\"\n\
         for arg in \"$@\"; do case \"$arg\" in --input-ipc-server=*) echo \"${{arg#--input-ipc-server=}}\" >> \"{log}\";; esac; done\n\
         echo \"[ipc] Starting IPC master\"\n\
         exec sleep 30\n",
        version = version,
        log = spawn_log.display(),
        pids = pid_log.display(),
      );
      std::fs::write(&script, body).unwrap();
      std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
      Self {
        dir,
        script,
        spawn_log,
        pid_log,
      }
    }

    fn config(&self) -> PlayerConfig {
      PlayerConfig {
        mpv_path: Some(self.script.to_string_lossy().into_owned()),
        connect_timeout_ms: 3_000,
        connect_backoff_ms: 50,
        request_timeout_ms: 2_000,
        ..Default::default()
      }
    }

    fn addresses(&self) -> Vec<String> {
      std::fs::read_to_string(&self.spawn_log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
    }

    fn pids(&self) -> Vec<u32> {
      std::fs::read_to_string(&self.pid_log)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
    }

    async fn wait_for_spawn(&self, count: usize) -> String {
      for _ in 0..200 {
        let addresses = self.addresses();
        if addresses.len() >= count {
          return addresses[count - 1].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
      panic!("fake mpv was not spawned {} times", count);
    }
  }

  impl Drop for FakeMpv {
    fn drop(&mut self) {
      let _ = std::fs::remove_dir_all(&self.dir);
    }
  }

  /// Accept one client at `address` and answer every command with success.
  fn serve(address: &str) {
    let listener = UnixListener::bind(address).unwrap();
    tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let (read, mut write) = stream.into_split();
      let mut lines = BufReader::new(read).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        let cmd: serde_json::Value = serde_json::from_str(&line).unwrap();
        let reply = serde_json::json!({"request_id": cmd["request_id"], "error": "success", "data": null});
        let mut out = reply.to_string();
        out.push('\n');
        if write.write_all(out.as_bytes()).await.is_err() {
          break;
        }
      }
    });
  }

  fn supervisor(fake: &FakeMpv) -> Supervisor {
    let log = Logger::new("test", LevelFilter::Off);
    Supervisor::new(fake.config(), EventHub::new(log.clone()), log).unwrap()
  }

  fn is_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
      .arg("-0")
      .arg(pid.to_string())
      .stderr(std::process::Stdio::null())
      .status()
      .map(|s| s.success())
      .unwrap_or(false)
  }

  async fn wait_for_exit(pid: u32) {
    for _ in 0..300 {
      if !is_alive(pid) {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("process {} is still running", pid);
  }

  async fn wait_for_state(supervisor: &Supervisor, state: SupervisorState) {
    for _ in 0..300 {
      if supervisor.state() == state {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("supervisor never reached {:?}", state);
  }

  #[test]
  fn old_version_fails_construction() {
    let fake = FakeMpv::new("0.29.1");
    let log = Logger::new("test", LevelFilter::Off);
    let result = Supervisor::new(fake.config(), EventHub::new(log.clone()), log);
    assert!(matches!(result, Err(MpvError::UnsupportedVersion { .. })));
  }

  #[test]
  fn missing_executable_fails_construction() {
    let config = PlayerConfig {
      mpv_path: Some("/no/such/dir/mpv".into()),
      ..Default::default()
    };
    let log = Logger::new("test", LevelFilter::Off);
    let result = Supervisor::new(config, EventHub::new(log.clone()), log);
    assert!(matches!(result, Err(MpvError::NotFound)));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn concurrent_callers_share_one_process() {
    let fake = FakeMpv::new("0.37.0");
    let supervisor = supervisor(&fake);

    let watcher = {
      let fake_log = fake.spawn_log.clone();
      tokio::spawn(async move {
        for _ in 0..300 {
          if let Ok(text) = std::fs::read_to_string(&fake_log) {
            if let Some(address) = text.lines().next() {
              serve(address);
              return;
            }
          }
          tokio::time::sleep(Duration::from_millis(10)).await;
        }
      })
    };

    let (a, b) = tokio::join!(supervisor.ensure_started(), supervisor.ensure_started());
    watcher.await.unwrap();
    a.unwrap();
    b.unwrap();
    assert_eq!(fake.addresses().len(), 1);
    assert_eq!(supervisor.state(), SupervisorState::Running);
    supervisor.dispose();
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn process_exit_triggers_fresh_start() {
    let fake = FakeMpv::new("0.37.0");
    let supervisor = supervisor(&fake);

    let starting = tokio::spawn({
      let supervisor = supervisor.clone();
      async move { supervisor.ensure_started().await }
    });
    let first = fake.wait_for_spawn(1).await;
    serve(&first);
    let connection = starting.await.unwrap().unwrap();
    connection
      .send(crate::mpv::protocol::MpvCommand::stop())
      .await
      .unwrap();
    assert_eq!(supervisor.address().as_deref(), Some(first.as_str()));

    // Simulate a crash.
    let pid = supervisor.pid().unwrap();
    std::process::Command::new("kill")
      .arg("-9")
      .arg(pid.to_string())
      .status()
      .unwrap();
    wait_for_state(&supervisor, SupervisorState::Unstarted).await;
    assert!(connection.is_closed());

    let starting = tokio::spawn({
      let supervisor = supervisor.clone();
      async move { supervisor.ensure_started().await }
    });
    let second = fake.wait_for_spawn(2).await;
    serve(&second);
    starting.await.unwrap().unwrap();

    assert_ne!(first, second);
    assert_eq!(supervisor.address().as_deref(), Some(second.as_str()));
    supervisor.dispose();
    assert!(matches!(
      supervisor.ensure_started().await,
      Err(MpvError::Disposed)
    ));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn failed_connect_resets_and_retries() {
    let fake = FakeMpv::new("0.37.0");
    let mut config = fake.config();
    config.connect_timeout_ms = 200;
    let log = Logger::new("test", LevelFilter::Off);
    let supervisor = Supervisor::new(config, EventHub::new(log.clone()), log).unwrap();

    // Nobody listens on the socket, so the budget runs out.
    assert!(matches!(
      supervisor.ensure_started().await,
      Err(MpvError::Socket(_))
    ));
    assert_eq!(supervisor.state(), SupervisorState::Unstarted);
    assert!(supervisor.pid().is_none());

    assert!(supervisor.ensure_started().await.is_err());
    let addresses = fake.addresses();
    assert_eq!(addresses.len(), 2);
    assert_ne!(addresses[0], addresses[1]);
    assert!(!Path::new(&addresses[0]).exists());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn stop_during_start_leaves_a_single_process() {
    let fake = FakeMpv::new("0.37.0");
    let supervisor = supervisor(&fake);

    let first_start = tokio::spawn({
      let supervisor = supervisor.clone();
      async move { supervisor.ensure_started().await }
    });
    // Nobody listens on the first socket yet, so that launch is still
    // connecting when it gets stopped.
    let first = fake.wait_for_spawn(1).await;
    supervisor.stop();

    let second_start = tokio::spawn({
      let supervisor = supervisor.clone();
      async move { supervisor.ensure_started().await }
    });
    let second = fake.wait_for_spawn(2).await;
    serve(&first);
    serve(&second);

    assert!(first_start.await.unwrap().is_err());
    second_start.await.unwrap().unwrap();
    assert_eq!(supervisor.address().as_deref(), Some(second.as_str()));
    assert_eq!(supervisor.state(), SupervisorState::Running);

    let pids = fake.pids();
    assert_eq!(pids.len(), 2);
    assert!(!is_alive(pids[0]));
    assert_eq!(supervisor.pid(), Some(pids[1]));

    supervisor.dispose();
    wait_for_exit(pids[1]).await;
  }
}
