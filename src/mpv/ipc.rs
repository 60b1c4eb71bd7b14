//! Async IPC connection to MPV.
//!
//! Handles platform-specific socket/pipe connections, request correlation and
//! event dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::events::EventHub;
use super::protocol::{FrameDecoder, MpvCommand, MpvEvent, MpvMessage, MpvResponse};
use crate::deferred::Deferred;
use crate::dispose::Disposable;
use crate::error::{MpvError, Result};
use crate::logging::Logger;

/// Request waiting for its response.
struct PendingRequest {
  command: String,
  completion: Deferred<Value>,
}

/// IPC connection state shared between the caller, reader and writer.
#[derive(Default)]
struct IpcState {
  pending: HashMap<i64, PendingRequest>,
  closed: bool,
}

/// Encoded command waiting for the writer.
struct OutgoingFrame {
  request_id: i64,
  bytes: Vec<u8>,
}

struct ConnectionInner {
  state: Arc<Mutex<IpcState>>,
  next_request_id: AtomicI64,
  next_observer_id: AtomicI64,
  write_tx: async_channel::Sender<OutgoingFrame>,
  events: EventHub,
  closed: CancellationToken,
  request_timeout: Option<Duration>,
  log: Logger,
}

/// MPV IPC connection. Clones share the same socket.
#[derive(Clone)]
pub struct Connection {
  inner: Arc<ConnectionInner>,
}

/// A property observation registered with MPV.
#[derive(Debug)]
pub struct Observation {
  id: i64,
  property: String,
  handle: Disposable,
}

impl Observation {
  pub fn id(&self) -> i64 {
    self.id
  }

  pub fn property(&self) -> &str {
    &self.property
  }

  /// Stop delivering changes and issue `unobserve_property`. Failures of the
  /// latter are only logged.
  pub fn dispose(&self) -> Result<()> {
    self.handle.dispose()
  }

  pub fn into_disposable(self) -> Disposable {
    self.handle
  }
}

impl Connection {
  /// Connect to the MPV IPC socket/pipe at `address`.
  #[cfg(windows)]
  pub async fn connect(
    address: &str,
    events: EventHub,
    request_timeout: Option<Duration>,
    log: Logger,
  ) -> Result<Self> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let client = ClientOptions::new()
      .open(address)
      .map_err(|e| MpvError::Socket(format!("Failed to open pipe {}: {}", address, e)))?;

    Ok(Self::from_stream(client, events, request_timeout, log))
  }

  /// Connect to the MPV IPC socket/pipe at `address`.
  #[cfg(not(windows))]
  pub async fn connect(
    address: &str,
    events: EventHub,
    request_timeout: Option<Duration>,
    log: Logger,
  ) -> Result<Self> {
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(address)
      .await
      .map_err(|e| MpvError::Socket(format!("Failed to connect to {}: {}", address, e)))?;

    Ok(Self::from_stream(stream, events, request_timeout, log))
  }

  /// Run the protocol over an already-open duplex stream.
  pub fn from_stream<S>(
    stream: S,
    events: EventHub,
    request_timeout: Option<Duration>,
    log: Logger,
  ) -> Self
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    let (reader, writer) = tokio::io::split(stream);
    let state = Arc::new(Mutex::new(IpcState::default()));
    let closed = CancellationToken::new();
    let (write_tx, write_rx) = async_channel::unbounded::<OutgoingFrame>();

    // Both loops exit once `closed` is cancelled.
    tokio::spawn(reader_loop(
      reader,
      state.clone(),
      events.clone(),
      closed.clone(),
      log.clone(),
    ));
    tokio::spawn(writer_loop(
      writer,
      write_rx,
      state.clone(),
      closed.clone(),
      log.clone(),
    ));

    Self {
      inner: Arc::new(ConnectionInner {
        state,
        next_request_id: AtomicI64::new(1),
        next_observer_id: AtomicI64::new(1),
        write_tx,
        events,
        closed,
        request_timeout,
        log,
      }),
    }
  }

  /// Send a command to MPV and wait for its response data.
  pub async fn send(&self, cmd: MpvCommand) -> Result<Value> {
    let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
    let bytes = cmd.encode(request_id)?;

    // A timed-out request must not linger in the table.
    let weak_state = Arc::downgrade(&self.inner.state);
    let completion = Deferred::with_error_tap(self.inner.request_timeout, move |error| {
      if let MpvError::Timeout(_) = error {
        if let Some(state) = weak_state.upgrade() {
          state.lock().pending.remove(&request_id);
        }
      }
    });

    {
      let mut state = self.inner.state.lock();
      if state.closed {
        return Err(MpvError::ConnectionClosed);
      }
      state.pending.insert(
        request_id,
        PendingRequest {
          command: cmd.name().to_string(),
          completion: completion.clone(),
        },
      );
    }

    self.inner.log.debug(format_args!(
      "Sending MPV command #{}: {}",
      request_id,
      String::from_utf8_lossy(&bytes).trim_end()
    ));

    if self
      .inner
      .write_tx
      .send(OutgoingFrame { request_id, bytes })
      .await
      .is_err()
    {
      self.inner.state.lock().pending.remove(&request_id);
      return Err(MpvError::Socket("IPC writer is closed".into()));
    }

    completion.wait().await
  }

  /// Ask MPV to report changes of `property` and call `on_change` with each
  /// new value.
  ///
  /// The callback is registered before `observe_property` is sent, so the
  /// initial value MPV reports right away is not missed. Disposing the
  /// observation unsubscribes locally and sends `unobserve_property` in the
  /// background.
  pub async fn observe<F>(&self, property: &str, on_change: F) -> Result<Observation>
  where
    F: Fn(&Value) + Send + Sync + 'static,
  {
    let id = self.inner.next_observer_id.fetch_add(1, Ordering::SeqCst);
    // The hub outlives this connection; ids restart on the next one.
    let closed = self.inner.closed.clone();
    let subscription = self.inner.events.subscribe("property-change", move |event| {
      if event.id == Some(id) && !closed.is_cancelled() {
        on_change(event.data.as_ref().unwrap_or(&Value::Null));
      }
    });

    if let Err(e) = self
      .send(MpvCommand::observe_property(id, property))
      .await
    {
      let _ = subscription.dispose();
      return Err(e);
    }

    let weak = Arc::downgrade(&self.inner);
    let log = self.inner.log.clone();
    let unobserve = Disposable::new(move || {
      let Some(inner) = weak.upgrade() else {
        return Ok(());
      };
      let connection = Connection { inner };
      if connection.is_closed() {
        return Ok(());
      }
      match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
          runtime.spawn(async move {
            if let Err(e) = connection.send(MpvCommand::unobserve_property(id)).await {
              log.debug(format_args!("unobserve_property {} failed: {}", id, e));
            }
          });
        }
        Err(_) => log.debug(format_args!(
          "No runtime available to unobserve property {}",
          id
        )),
      }
      Ok(())
    });

    Ok(Observation {
      id,
      property: property.to_string(),
      handle: Disposable::combine(vec![subscription, unobserve]),
    })
  }

  /// Subscribe to an event by name.
  pub fn subscribe<F>(&self, event: &str, callback: F) -> Disposable
  where
    F: Fn(&MpvEvent) + Send + Sync + 'static,
  {
    self.inner.events.subscribe(event, callback)
  }

  pub fn events(&self) -> &EventHub {
    &self.inner.events
  }

  /// Number of requests still waiting for a response.
  pub fn pending_count(&self) -> usize {
    self.inner.state.lock().pending.len()
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.is_cancelled()
  }

  /// Resolves once the socket has closed, for whatever reason.
  pub async fn closed(&self) {
    self.inner.closed.cancelled().await
  }

  /// Close the connection. Every pending request fails with
  /// [`MpvError::ConnectionClosed`]; the reader stops and the writer shuts
  /// down its half of the socket.
  pub fn dispose(&self) {
    if !self.is_closed() {
      self.inner.log.debug(format_args!("Closing MPV IPC connection"));
    }
    shutdown(&self.inner.state, &self.inner.closed);
    self.inner.write_tx.close();
  }
}

/// Mark the connection closed and fail whatever is still in flight.
fn shutdown(state: &Mutex<IpcState>, closed: &CancellationToken) {
  closed.cancel();
  let pending: Vec<PendingRequest> = {
    let mut state = state.lock();
    state.closed = true;
    state.pending.drain().map(|(_, p)| p).collect()
  };
  for request in pending {
    request.completion.reject(MpvError::ConnectionClosed);
  }
}

async fn reader_loop<R: AsyncRead + Unpin>(
  mut reader: R,
  state: Arc<Mutex<IpcState>>,
  events: EventHub,
  closed: CancellationToken,
  log: Logger,
) {
  log.debug(format_args!("MPV IPC reader loop started"));
  let mut decoder = FrameDecoder::new();
  let mut buf = vec![0u8; 8192];

  loop {
    let read = tokio::select! {
      _ = closed.cancelled() => break,
      read = reader.read(&mut buf) => read,
    };

    match read {
      Ok(0) => {
        for message in decoder.finish() {
          dispatch(message, &state, &events, &log);
        }
        log.info(format_args!("MPV IPC connection closed"));
        break;
      }
      Ok(n) => {
        for message in decoder.feed(&buf[..n]) {
          dispatch(message, &state, &events, &log);
        }
      }
      Err(e) => {
        log.error(format_args!("MPV IPC read error: {}", e));
        break;
      }
    }
  }

  shutdown(&state, &closed);
}

fn dispatch(
  message: std::result::Result<MpvMessage, serde_json::Error>,
  state: &Mutex<IpcState>,
  events: &EventHub,
  log: &Logger,
) {
  match message {
    Ok(MpvMessage::Response(response)) => complete(response, state, log),
    Ok(MpvMessage::Event(event)) => {
      log.trace(format_args!("MPV event: {:?}", event));
      events.emit(&event);
    }
    Err(e) => log.warn(format_args!("Failed to parse MPV message: {}", e)),
  }
}

fn complete(response: MpvResponse, state: &Mutex<IpcState>, log: &Logger) {
  let request = state.lock().pending.remove(&response.request_id);
  let Some(request) = request else {
    log.debug(format_args!(
      "Discarding response for unknown request_id={}",
      response.request_id
    ));
    return;
  };

  if response.is_success() {
    request.completion.resolve(response.data);
  } else {
    request.completion.reject(MpvError::Command {
      command: request.command,
      error: response.error,
    });
  }
}

async fn writer_loop<W: AsyncWrite + Unpin>(
  mut writer: W,
  write_rx: async_channel::Receiver<OutgoingFrame>,
  state: Arc<Mutex<IpcState>>,
  closed: CancellationToken,
  log: Logger,
) {
  log.debug(format_args!("MPV IPC writer loop started"));

  loop {
    let frame = tokio::select! {
      _ = closed.cancelled() => break,
      frame = write_rx.recv() => frame,
    };
    let Ok(OutgoingFrame { request_id, bytes }) = frame else {
      break;
    };

    let written = tokio::select! {
      _ = closed.cancelled() => break,
      written = write_frame(&mut writer, &bytes) => written,
    };
    if let Err(e) = written {
      log.error(format_args!("MPV IPC write error: {}", e));
      let request = state.lock().pending.remove(&request_id);
      if let Some(request) = request {
        request
          .completion
          .reject(MpvError::Socket(format!("Write failed: {}", e)));
      }
      shutdown(&state, &closed);
      break;
    }
  }

  log.debug(format_args!("MPV IPC writer closing"));
  let _ = writer.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
  writer.write_all(bytes).await?;
  writer.flush().await
}
