//! Callback registry for MPV events, keyed by event name.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use super::protocol::MpvEvent;
use crate::dispose::Disposable;
use crate::logging::Logger;

/// Callback invoked for every matching event.
pub type EventCallback = Arc<dyn Fn(&MpvEvent) + Send + Sync>;

struct Subscriber {
  id: u64,
  once: bool,
  callback: EventCallback,
}

#[derive(Default)]
struct HubState {
  subscribers: HashMap<String, Vec<Subscriber>>,
  next_id: u64,
  disposed: bool,
}

/// Fans events out to subscribers of the event's name.
///
/// Subscriptions outlive individual connections: the supervisor hands the
/// same hub to every connection it creates.
#[derive(Clone)]
pub struct EventHub {
  state: Arc<Mutex<HubState>>,
  log: Logger,
}

impl EventHub {
  pub fn new(log: Logger) -> Self {
    Self {
      state: Arc::new(Mutex::new(HubState::default())),
      log,
    }
  }

  /// Call `callback` for every `event` until the returned handle is disposed.
  pub fn subscribe<F>(&self, event: &str, callback: F) -> Disposable
  where
    F: Fn(&MpvEvent) + Send + Sync + 'static,
  {
    self.add(event, false, Arc::new(callback))
  }

  /// Call `callback` for the next `event` only.
  pub fn once<F>(&self, event: &str, callback: F) -> Disposable
  where
    F: Fn(&MpvEvent) + Send + Sync + 'static,
  {
    self.add(event, true, Arc::new(callback))
  }

  fn add(&self, event: &str, once: bool, callback: EventCallback) -> Disposable {
    let id = {
      let mut state = self.state.lock();
      if state.disposed {
        self
          .log
          .debug(format_args!("Ignoring subscription to '{}' on disposed hub", event));
        return Disposable::noop();
      }
      state.next_id += 1;
      let id = state.next_id;
      state
        .subscribers
        .entry(event.to_string())
        .or_default()
        .push(Subscriber { id, once, callback });
      id
    };

    let weak = Arc::downgrade(&self.state);
    let event = event.to_string();
    Disposable::new(move || {
      if let Some(state) = weak.upgrade() {
        remove_subscriber(&mut state.lock(), &event, id);
      }
      Ok(())
    })
  }

  /// Deliver `event` to its subscribers, in subscription order.
  pub fn emit(&self, event: &MpvEvent) {
    let callbacks: Vec<EventCallback> = {
      let mut state = self.state.lock();
      let Some(list) = state.subscribers.get_mut(&event.event) else {
        return;
      };
      let callbacks = list.iter().map(|s| s.callback.clone()).collect();
      list.retain(|s| !s.once);
      if list.is_empty() {
        state.subscribers.remove(&event.event);
      }
      callbacks
    };

    for callback in callbacks {
      if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        self
          .log
          .error(format_args!("Event callback for '{}' panicked", event.event));
      }
    }
  }

  pub fn subscriber_count(&self, event: &str) -> usize {
    self
      .state
      .lock()
      .subscribers
      .get(event)
      .map_or(0, Vec::len)
  }

  /// Drop every subscription and refuse new ones.
  pub fn dispose(&self) {
    let mut state = self.state.lock();
    state.disposed = true;
    state.subscribers.clear();
  }
}

fn remove_subscriber(state: &mut HubState, event: &str, id: u64) {
  if let Some(list) = state.subscribers.get_mut(event) {
    list.retain(|s| s.id != id);
    if list.is_empty() {
      state.subscribers.remove(event);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn event(name: &str) -> MpvEvent {
    serde_json::from_value(serde_json::json!({ "event": name })).unwrap()
  }

  fn counter(hub: &EventHub, name: &str, count: &Arc<AtomicUsize>) -> Disposable {
    let count = count.clone();
    hub.subscribe(name, move |_| {
      count.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn only_matching_subscribers_fire() {
    let hub = EventHub::new(Logger::default());
    let idle = Arc::new(AtomicUsize::new(0));
    let seek = Arc::new(AtomicUsize::new(0));
    let _a = counter(&hub, "idle", &idle);
    let _b = counter(&hub, "seek", &seek);

    hub.emit(&event("idle"));
    hub.emit(&event("idle"));
    assert_eq!(idle.load(Ordering::SeqCst), 2);
    assert_eq!(seek.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn disposing_unsubscribes() {
    let hub = EventHub::new(Logger::default());
    let count = Arc::new(AtomicUsize::new(0));
    let sub = counter(&hub, "idle", &count);
    assert_eq!(hub.subscriber_count("idle"), 1);

    sub.dispose().unwrap();
    hub.emit(&event("idle"));
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(hub.subscriber_count("idle"), 0);
  }

  #[test]
  fn once_fires_a_single_time() {
    let hub = EventHub::new(Logger::default());
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let _sub = hub.once("file-loaded", move |_| {
      seen.fetch_add(1, Ordering::SeqCst);
    });

    hub.emit(&event("file-loaded"));
    hub.emit(&event("file-loaded"));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(hub.subscriber_count("file-loaded"), 0);
  }

  #[test]
  fn panicking_callback_does_not_block_others() {
    let hub = EventHub::new(Logger::default());
    let count = Arc::new(AtomicUsize::new(0));
    let _bad = hub.subscribe("idle", |_| panic!("boom"));
    let _good = counter(&hub, "idle", &count);

    hub.emit(&event("idle"));
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn disposed_hub_refuses_subscriptions() {
    let hub = EventHub::new(Logger::default());
    let count = Arc::new(AtomicUsize::new(0));
    hub.dispose();
    let _sub = counter(&hub, "idle", &count);
    hub.emit(&event("idle"));
    assert_eq!(count.load(Ordering::SeqCst), 0);
  }
}
