//! Line-oriented command surface over [`MpvClient`].
//!
//! Each input line is `<name> [args...]`; every command answers with one
//! JSON line. Property watches print their changes as extra lines.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::dispose::Disposable;
use crate::error::{MpvError, Result};
use crate::mpv::{MpvClient, SeekMode};

type Handler = Arc<dyn Fn(Session, Vec<String>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// State shared by all commands of one interactive session.
#[derive(Clone)]
pub struct Session {
  client: MpvClient,
  watches: Arc<Mutex<HashMap<String, Disposable>>>,
  notify: async_channel::Sender<Value>,
}

impl Session {
  /// Returns the session and the receiving end of its notifications.
  pub fn new(client: MpvClient) -> (Self, async_channel::Receiver<Value>) {
    let (notify, notifications) = async_channel::unbounded();
    let session = Self {
      client,
      watches: Arc::default(),
      notify,
    };
    (session, notifications)
  }

  pub fn client(&self) -> &MpvClient {
    &self.client
  }

  /// Drop all property watches.
  pub fn clear_watches(&self) {
    let watches: Vec<_> = self.watches.lock().drain().map(|(_, w)| w).collect();
    for watch in watches {
      let _ = watch.dispose();
    }
  }
}

struct Entry {
  usage: &'static str,
  about: &'static str,
  handler: Handler,
}

/// Name to handler table.
#[derive(Default)]
pub struct CommandRegistry {
  commands: BTreeMap<&'static str, Entry>,
}

impl CommandRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<F, Fut>(&mut self, name: &'static str, usage: &'static str, about: &'static str, f: F)
  where
    F: Fn(Session, Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let handler: Handler = Arc::new(move |session, args| f(session, args).boxed());
    self.commands.insert(name, Entry { usage, about, handler });
  }

  pub fn contains(&self, name: &str) -> bool {
    self.commands.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
    self.commands.keys().copied()
  }

  pub fn help(&self) -> Value {
    let lines: Vec<String> = self
      .commands
      .values()
      .map(|entry| format!("{:<24} {}", entry.usage, entry.about))
      .chain(std::iter::once(format!("{:<24} {}", "help", "List commands")))
      .collect();
    json!(lines)
  }

  /// Run one input line.
  pub async fn dispatch(&self, session: &Session, line: &str) -> Result<Value> {
    let mut words = line.split_whitespace().map(str::to_string);
    let Some(name) = words.next() else {
      return Ok(Value::Null);
    };
    if name == "help" {
      return Ok(self.help());
    }
    let entry = self
      .commands
      .get(name.as_str())
      .ok_or_else(|| MpvError::InvalidArgument(format!("Unknown command '{}', try 'help'", name)))?;
    (entry.handler)(session.clone(), words.collect()).await
  }

  /// The commands `mpvctl` understands.
  pub fn standard() -> Self {
    let mut r = Self::new();

    r.register("play", "play [source]", "Load a file or URL, or resume", |s, a| async move {
      s.client.play(a.first().map(String::as_str)).await?;
      Ok(Value::Null)
    });
    r.register("pause", "pause", "Pause playback", |s, _| async move {
      s.client.pause().await?;
      Ok(Value::Null)
    });
    r.register("resume", "resume", "Resume playback", |s, _| async move {
      s.client.resume().await?;
      Ok(Value::Null)
    });
    r.register("toggle-pause", "toggle-pause", "Toggle pause", |s, _| async move {
      s.client.toggle_pause(None).await?;
      Ok(Value::Null)
    });
    r.register("stop", "stop", "Stop playback", |s, _| async move {
      s.client.stop().await?;
      Ok(Value::Null)
    });
    r.register("seek", "seek <pos> [mode]", "Seek (relative by default)", |s, a| async move {
      let position = number(&a, 0, "position")?;
      let mode = match a.get(1) {
        Some(mode) => mode.parse()?,
        None => SeekMode::Relative,
      };
      s.client.seek(position, mode).await?;
      Ok(Value::Null)
    });
    r.register("volume", "volume [n]", "Get or set volume", |s, a| async move {
      if a.is_empty() {
        return Ok(json!(s.client.get_volume().await?));
      }
      s.client.set_volume(number(&a, 0, "volume")?).await?;
      Ok(Value::Null)
    });
    r.register("add-volume", "add-volume <d>", "Change volume by d", |s, a| async move {
      s.client.add_volume(number(&a, 0, "delta")?).await?;
      Ok(Value::Null)
    });
    r.register("speed", "speed [n]", "Get or set playback speed", |s, a| async move {
      if a.is_empty() {
        return Ok(json!(s.client.get_speed().await?));
      }
      s.client.set_speed(number(&a, 0, "speed")?).await?;
      Ok(Value::Null)
    });
    r.register("mute", "mute", "Mute audio", |s, _| async move {
      s.client.mute().await?;
      Ok(Value::Null)
    });
    r.register("unmute", "unmute", "Unmute audio", |s, _| async move {
      s.client.unmute().await?;
      Ok(Value::Null)
    });
    r.register("toggle-mute", "toggle-mute", "Toggle mute", |s, _| async move {
      s.client.toggle_mute(None).await?;
      Ok(Value::Null)
    });
    r.register("status", "status", "Show player state", |s, _| async move {
      Ok(serde_json::to_value(s.client.status().await?)?)
    });
    r.register("get", "get <prop>", "Read a property", |s, a| async move {
      s.client.get_prop::<Value>(word(&a, 0, "property")?).await
    });
    r.register("set", "set <prop> <json>", "Write a property", |s, a| async move {
      let property = word(&a, 0, "property")?;
      if a.len() < 2 {
        return Err(MpvError::InvalidArgument("Missing value".into()));
      }
      s.client.set_prop(property, parse_value(&a[1..].join(" "))).await?;
      Ok(Value::Null)
    });
    r.register("cycle", "cycle <prop>", "Cycle a property", |s, a| async move {
      s.client.cycle_prop(word(&a, 0, "property")?).await?;
      Ok(Value::Null)
    });
    r.register("watch", "watch <prop>", "Print changes of a property", |s, a| async move {
      let property = word(&a, 0, "property")?.to_string();
      if s.watches.lock().contains_key(&property) {
        return Ok(Value::Null);
      }
      let notify = s.notify.clone();
      let name = property.clone();
      let watch = s
        .client
        .watch(&property, move |data| {
          let _ = notify.try_send(json!({"event": "property-change", "name": name, "data": data}));
        })
        .await?;
      s.watches.lock().insert(property, watch);
      Ok(Value::Null)
    });
    r.register("unwatch", "unwatch <prop>", "Stop printing a property", |s, a| async move {
      let property = word(&a, 0, "property")?;
      let removed = s.watches.lock().remove(property);
      match removed {
        Some(watch) => watch.dispose()?,
        None => return Err(MpvError::InvalidArgument(format!("Not watching '{}'", property))),
      }
      Ok(Value::Null)
    });
    r.register("raw", "raw <name> [json...]", "Send any MPV command", |s, a| async move {
      let name = word(&a, 0, "command")?;
      let args = a[1..].iter().map(|arg| parse_value(arg)).collect();
      s.client.command(name, args).await
    });
    r.register("quit", "quit", "Quit MPV and exit", |s, _| async move {
      s.clear_watches();
      s.client.quit().await?;
      Ok(Value::Null)
    });

    r
  }
}

fn word<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str> {
  args
    .get(index)
    .map(String::as_str)
    .ok_or_else(|| MpvError::InvalidArgument(format!("Missing {}", what)))
}

fn number(args: &[String], index: usize, what: &str) -> Result<f64> {
  let text = word(args, index, what)?;
  text
    .parse()
    .map_err(|_| MpvError::InvalidArgument(format!("Invalid {} '{}'", what, text)))
}

/// JSON if it parses, otherwise the literal text.
fn parse_value(text: &str) -> Value {
  serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn reply(result: Result<Value>) -> Value {
  match result {
    Ok(result) => json!({"ok": true, "result": result}),
    Err(e) => json!({"ok": false, "error": e.to_string()}),
  }
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, value: &Value) -> std::io::Result<()> {
  let mut line = value.to_string();
  line.push('\n');
  output.write_all(line.as_bytes()).await?;
  output.flush().await
}

/// Read commands from `input` until EOF or `quit`, writing replies and
/// watch notifications to `output`.
pub async fn run_repl<R, W>(
  registry: &CommandRegistry,
  session: &Session,
  notifications: async_channel::Receiver<Value>,
  input: R,
  mut output: W,
) -> std::io::Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut lines = input.lines();
  loop {
    tokio::select! {
      line = lines.next_line() => {
        let Some(line) = line? else {
          break;
        };
        let line = line.trim();
        if line.is_empty() {
          continue;
        }
        let result = registry.dispatch(session, line).await;
        write_line(&mut output, &reply(result)).await?;
        if line.split_whitespace().next() == Some("quit") {
          break;
        }
      }
      Ok(note) = notifications.recv() => {
        write_line(&mut output, &note).await?;
      }
    }
  }
  session.clear_watches();
  Ok(())
}
