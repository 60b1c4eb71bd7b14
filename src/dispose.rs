//! Teardown handles.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{MpvError, Result};

type Teardown = Box<dyn FnOnce() -> Result<()> + Send>;

/// A resource release that runs at most once.
///
/// Dropping an undisposed handle disposes it; failures on that path are
/// logged because `Drop` cannot return them.
#[must_use = "dropping a Disposable releases the resource immediately"]
pub struct Disposable {
  teardown: Mutex<Option<Teardown>>,
}

impl Disposable {
  pub fn new<F>(teardown: F) -> Self
  where
    F: FnOnce() -> Result<()> + Send + 'static,
  {
    Self {
      teardown: Mutex::new(Some(Box::new(teardown))),
    }
  }

  /// A handle with nothing to release.
  pub fn noop() -> Self {
    Self {
      teardown: Mutex::new(None),
    }
  }

  /// Group several handles so that disposing the group disposes every member,
  /// even when some of them fail.
  ///
  /// The group reports no error if every member succeeded, the member's own
  /// error if exactly one failed, and [`MpvError::Aggregate`] otherwise.
  pub fn combine(items: Vec<Disposable>) -> Self {
    Self::new(move || {
      let mut errors: Vec<MpvError> = items.iter().filter_map(|d| d.dispose().err()).collect();
      match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(MpvError::Aggregate(errors)),
      }
    })
  }

  pub fn dispose(&self) -> Result<()> {
    let teardown = self.teardown.lock().take();
    match teardown {
      Some(teardown) => teardown(),
      None => Ok(()),
    }
  }

  pub fn is_disposed(&self) -> bool {
    self.teardown.lock().is_none()
  }
}

impl Drop for Disposable {
  fn drop(&mut self) {
    if let Err(e) = self.dispose() {
      log::warn!("Failed to release resource on drop: {}", e);
    }
  }
}

impl fmt::Debug for Disposable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Disposable")
      .field("disposed", &self.is_disposed())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  fn counting(counter: &Arc<AtomicUsize>) -> Disposable {
    let counter = counter.clone();
    Disposable::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    })
  }

  fn failing(message: &str) -> Disposable {
    let message = message.to_string();
    Disposable::new(move || Err(MpvError::Operation(message)))
  }

  #[test]
  fn dispose_is_idempotent() {
    let count = Arc::new(AtomicUsize::new(0));
    let d = counting(&count);
    d.dispose().unwrap();
    d.dispose().unwrap();
    drop(d);
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn drop_disposes() {
    let count = Arc::new(AtomicUsize::new(0));
    drop(counting(&count));
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn failure_in_the_middle_still_disposes_the_rest() {
    let count = Arc::new(AtomicUsize::new(0));
    let group = Disposable::combine(vec![counting(&count), failing("second"), counting(&count)]);

    let err = group.dispose().unwrap_err();
    assert_eq!(count.load(Ordering::SeqCst), 2);
    // A single failure comes back as-is, not wrapped.
    assert!(matches!(err, MpvError::Operation(m) if m == "second"));
  }

  #[test]
  fn several_failures_are_aggregated() {
    let group = Disposable::combine(vec![failing("first"), Disposable::noop(), failing("third")]);
    match group.dispose().unwrap_err() {
      MpvError::Aggregate(errors) => {
        assert_eq!(errors.len(), 2);
        let msg = MpvError::Aggregate(errors).to_string();
        assert!(msg.contains("first") && msg.contains("third"));
      }
      other => panic!("Expected aggregate, got {:?}", other),
    }
    assert!(group.dispose().is_ok());
  }

  #[test]
  fn empty_group_succeeds() {
    assert!(Disposable::combine(Vec::new()).dispose().is_ok());
  }
}
