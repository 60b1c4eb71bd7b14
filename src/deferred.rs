//! Single-assignment result with an optional timeout.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{MpvError, Result};

type ErrorTap = Box<dyn Fn(&MpvError) + Send + Sync>;

struct Shared<T> {
  settled: AtomicBool,
  outcome: watch::Sender<Option<Result<T>>>,
  timer: Mutex<Option<JoinHandle<()>>>,
  on_error: Option<ErrorTap>,
}

impl<T> Drop for Shared<T> {
  fn drop(&mut self) {
    if let Some(timer) = self.timer.get_mut().take() {
      timer.abort();
    }
  }
}

/// A value that will be produced exactly once.
///
/// Clones share the same slot: any clone may settle it, and the first of
/// `resolve`, `reject` or the timeout wins. Later attempts are ignored.
/// Any number of callers may wait; each gets a copy of the outcome.
/// A timeout spawns a timer on the current tokio runtime, so a deferred with
/// a timeout must be created from within one.
pub struct Deferred<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for Deferred<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
  pub fn new(timeout: Option<Duration>) -> Self {
    Self::build(timeout, None)
  }

  /// Like [`Deferred::new`], with `tap` invoked synchronously on rejection
  /// before the error reaches the waiters. A panicking tap is contained.
  pub fn with_error_tap<F>(timeout: Option<Duration>, tap: F) -> Self
  where
    F: Fn(&MpvError) + Send + Sync + 'static,
  {
    Self::build(timeout, Some(Box::new(tap)))
  }

  fn build(timeout: Option<Duration>, on_error: Option<ErrorTap>) -> Self {
    let (outcome, _) = watch::channel(None);
    let shared = Arc::new(Shared {
      settled: AtomicBool::new(false),
      outcome,
      timer: Mutex::new(None),
      on_error,
    });

    if let Some(after) = timeout {
      let weak = Arc::downgrade(&shared);
      let handle = tokio::spawn(Self::expire(weak, after));
      *shared.timer.lock() = Some(handle);
    }

    Self { shared }
  }

  async fn expire(shared: Weak<Shared<T>>, after: Duration) {
    tokio::time::sleep(after).await;
    if let Some(shared) = shared.upgrade() {
      shared.timer.lock().take();
      Deferred { shared }.reject(MpvError::Timeout(after));
    }
  }

  /// Claim the single settle transition.
  fn claim(&self) -> bool {
    !self.shared.settled.swap(true, Ordering::SeqCst)
  }

  pub fn resolve(&self, value: T) {
    if !self.claim() {
      return;
    }
    self.cancel_timer();
    self.shared.outcome.send_replace(Some(Ok(value)));
  }

  pub fn reject(&self, error: MpvError) {
    if !self.claim() {
      return;
    }
    self.cancel_timer();
    if let Some(tap) = &self.shared.on_error {
      if catch_unwind(AssertUnwindSafe(|| tap(&error))).is_err() {
        log::warn!("Deferred error tap panicked while handling: {}", error);
      }
    }
    self.shared.outcome.send_replace(Some(Err(error)));
  }

  pub fn is_settled(&self) -> bool {
    self.shared.settled.load(Ordering::SeqCst)
  }

  /// Wait for the outcome.
  pub async fn wait(&self) -> Result<T> {
    let mut outcome = self.shared.outcome.subscribe();
    let settled = outcome
      .wait_for(Option::is_some)
      .await
      .map(|value| value.clone());

    match settled {
      Ok(Some(result)) => result,
      _ => Err(MpvError::ConnectionClosed),
    }
  }

  fn cancel_timer(&self) {
    if let Some(timer) = self.shared.timer.lock().take() {
      timer.abort();
    }
  }
}
