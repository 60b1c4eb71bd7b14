//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A command to send to MPV. The request ID is assigned by the connection
/// when the command is written.
#[derive(Debug, Clone, PartialEq)]
pub struct MpvCommand {
  name: String,
  args: Vec<Value>,
}

#[derive(Serialize)]
struct Frame<'a> {
  command: Vec<&'a Value>,
  request_id: i64,
}

impl MpvCommand {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      args: Vec::new(),
    }
  }

  /// Append an argument.
  pub fn arg(mut self, value: impl Into<Value>) -> Self {
    self.args.push(value.into());
    self
  }

  /// Append an argument only if present. Absent arguments are left out of
  /// the command entirely rather than sent as `null`.
  pub fn opt_arg<V: Into<Value>>(mut self, value: Option<V>) -> Self {
    if let Some(value) = value {
      self.args.push(value.into());
    }
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn args(&self) -> &[Value] {
    &self.args
  }

  /// Load a file or URL, replacing the current one.
  pub fn loadfile(url: &str) -> Self {
    Self::new("loadfile").arg(url)
  }

  /// Seek with an explicit mode (e.g. `absolute+exact`).
  pub fn seek(position: f64, flags: &str) -> Self {
    Self::new("seek").arg(position).arg(flags)
  }

  pub fn set_property(name: &str, value: impl Into<Value>) -> Self {
    Self::new("set_property").arg(name).arg(value)
  }

  pub fn get_property(name: &str) -> Self {
    Self::new("get_property").arg(name)
  }

  /// Cycle (toggle) a property.
  pub fn cycle(property: &str) -> Self {
    Self::new("cycle").arg(property)
  }

  /// Add a delta to a numeric property.
  pub fn add(property: &str, delta: f64) -> Self {
    Self::new("add").arg(property).arg(delta)
  }

  pub fn observe_property(id: i64, name: &str) -> Self {
    Self::new("observe_property").arg(id).arg(name)
  }

  pub fn unobserve_property(id: i64) -> Self {
    Self::new("unobserve_property").arg(id)
  }

  /// Stop playback and clear the playlist.
  pub fn stop() -> Self {
    Self::new("stop")
  }

  pub fn quit() -> Self {
    Self::new("quit")
  }

  /// Serialize into one newline-terminated frame.
  pub fn encode(&self, request_id: i64) -> Result<Vec<u8>, serde_json::Error> {
    let mut command = Vec::with_capacity(self.args.len() + 1);
    let name = Value::String(self.name.clone());
    command.push(&name);
    command.extend(self.args.iter());

    let mut bytes = serde_json::to_vec(&Frame {
      command,
      request_id,
    })?;
    bytes.push(b'\n');
    Ok(bytes)
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success" or error message.
  #[serde(default = "default_error")]
  pub error: String,
  /// Response data (command-specific).
  #[serde(default)]
  pub data: Value,
  /// Matching request ID.
  pub request_id: i64,
}

fn default_error() -> String {
  "success".to_string()
}

impl MpvResponse {
  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Event sent by MPV (property changes, playback events, etc.).
#[derive(Debug, Clone, Deserialize)]
pub struct MpvEvent {
  /// Event type (e.g., "property-change", "end-file", "client-message").
  pub event: String,
  /// Observer ID for property-change events.
  pub id: Option<i64>,
  /// Property name for property-change events.
  pub name: Option<String>,
  /// Event data.
  pub data: Option<Value>,
  /// Reason for end-file events (e.g., "eof", "stop", "quit", "error").
  pub reason: Option<String>,
  /// Error text for end-file events with reason "error".
  pub file_error: Option<String>,
  /// Any other event-specific fields.
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Message received from MPV IPC (either response or event).
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
}

impl MpvMessage {
  /// Parse one JSON frame. Frames carrying `request_id` are responses,
  /// everything else is an event.
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    let is_response = value
      .as_object()
      .is_some_and(|obj| obj.contains_key("request_id"));

    if is_response {
      Ok(MpvMessage::Response(serde_json::from_value(value)?))
    } else {
      Ok(MpvMessage::Event(serde_json::from_value(value)?))
    }
  }
}

/// Split a chunk into frames and parse each one. Empty segments are skipped.
pub fn decode_chunk(chunk: &str) -> Vec<Result<MpvMessage, serde_json::Error>> {
  chunk
    .split('\n')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(MpvMessage::parse)
    .collect()
}

/// Longest partial frame the decoder buffers before giving up on it.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Incremental decoder for a byte stream. A frame split across reads is held
/// back until its terminating newline arrives. A partial frame that grows
/// past the limit is dropped along with the rest of its line.
#[derive(Debug)]
pub struct FrameDecoder {
  buffer: Vec<u8>,
  max_frame: usize,
  skipping: bool,
}

impl Default for FrameDecoder {
  fn default() -> Self {
    Self::with_max_frame(MAX_FRAME_LEN)
  }
}

impl FrameDecoder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_max_frame(max_frame: usize) -> Self {
    Self {
      buffer: Vec::new(),
      max_frame,
      skipping: false,
    }
  }

  /// Feed raw bytes, returning every complete frame they finish.
  pub fn feed(&mut self, mut bytes: &[u8]) -> Vec<Result<MpvMessage, serde_json::Error>> {
    if self.skipping {
      let Some(end) = bytes.iter().position(|&b| b == b'\n') else {
        return Vec::new();
      };
      self.skipping = false;
      bytes = &bytes[end + 1..];
    }

    self.buffer.extend_from_slice(bytes);
    let complete = match self.buffer.iter().rposition(|&b| b == b'\n') {
      Some(last_newline) => {
        let rest = self.buffer.split_off(last_newline + 1);
        std::mem::replace(&mut self.buffer, rest)
      }
      None => Vec::new(),
    };

    if self.buffer.len() > self.max_frame {
      log::warn!("Dropping MPV frame longer than {} bytes", self.max_frame);
      self.buffer = Vec::new();
      self.skipping = true;
    }

    decode_chunk(&String::from_utf8_lossy(&complete))
  }

  /// Flush whatever is buffered once the stream has ended.
  pub fn finish(&mut self) -> Vec<Result<MpvMessage, serde_json::Error>> {
    self.skipping = false;
    let remaining = std::mem::take(&mut self.buffer);
    decode_chunk(&String::from_utf8_lossy(&remaining))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_command_serialization() {
    let cmd = MpvCommand::loadfile("http://example.com/video.mp4");
    let frame = cmd.encode(7).unwrap();
    assert_eq!(frame.last(), Some(&b'\n'));
    let json: Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(
      json,
      serde_json::json!({"command": ["loadfile", "http://example.com/video.mp4"], "request_id": 7})
    );
  }

  #[test]
  fn absent_arguments_are_omitted() {
    let cmd = MpvCommand::new("loadfile")
      .arg("a.mp3")
      .opt_arg(None::<&str>)
      .opt_arg(Some("append"));
    let json: Value = serde_json::from_slice(&cmd.encode(1).unwrap()).unwrap();
    assert_eq!(json["command"], serde_json::json!(["loadfile", "a.mp3", "append"]));
  }

  #[test]
  fn test_response_parsing() {
    let json = r#"{"error":"success","data":null,"request_id":1}"#;
    let msg = MpvMessage::parse(json).unwrap();
    match msg {
      MpvMessage::Response(r) => {
        assert!(r.is_success());
        assert_eq!(r.request_id, 1);
      }
      _ => panic!("Expected response"),
    }
  }

  #[test]
  fn test_event_parsing() {
    let json = r#"{"event":"property-change","id":1,"name":"pause","data":false}"#;
    let msg = MpvMessage::parse(json).unwrap();
    match msg {
      MpvMessage::Event(e) => {
        assert_eq!(e.event, "property-change");
        assert_eq!(e.name, Some("pause".to_string()));
        assert_eq!(e.id, Some(1));
      }
      _ => panic!("Expected event"),
    }
  }

  #[test]
  fn event_keeps_unknown_fields() {
    let json = r#"{"event":"start-file","playlist_entry_id":3}"#;
    match MpvMessage::parse(json).unwrap() {
      MpvMessage::Event(e) => assert_eq!(e.extra["playlist_entry_id"], 3),
      _ => panic!("Expected event"),
    }
  }

  #[test]
  fn chunk_with_two_frames() {
    let chunk = "{\"request_id\":4,\"error\":\"success\",\"data\":1.5}\n{\"event\":\"idle\"}";
    let messages: Vec<_> = decode_chunk(chunk).into_iter().map(Result::unwrap).collect();
    assert_eq!(messages.len(), 2);
    assert!(matches!(&messages[0], MpvMessage::Response(r) if r.request_id == 4));
    assert!(matches!(&messages[1], MpvMessage::Event(e) if e.event == "idle"));
  }

  #[test]
  fn blank_lines_yield_nothing() {
    assert!(decode_chunk("\n  \n\n").is_empty());
  }

  #[test]
  fn decoder_holds_partial_frame() {
    let mut decoder = FrameDecoder::new();
    assert!(decoder.feed(b"{\"event\":\"pa").is_empty());
    let messages = decoder.feed(b"use\"}\n{\"event\":\"idle\"}\n{\"req");
    assert_eq!(messages.len(), 2);
    assert!(matches!(&messages[0], Ok(MpvMessage::Event(e)) if e.event == "pause"));

    let messages = decoder.feed(b"uest_id\":9,\"error\":\"success\"}\n");
    assert!(matches!(&messages[0], Ok(MpvMessage::Response(r)) if r.request_id == 9));
    assert!(decoder.finish().is_empty());
  }

  #[test]
  fn oversized_partial_frame_is_dropped() {
    let mut decoder = FrameDecoder::with_max_frame(16);
    assert_eq!(decoder.feed(b"{\"event\":\"idle\"}\n{\"event\":\"aaaa").len(), 1);
    // Still no newline and now past the limit: the partial frame goes.
    assert!(decoder.feed(b"aaaaaaaaaaaaaaaa").is_empty());
    // The tail of the dropped line is skipped, the next frame survives.
    let messages = decoder.feed(b"aaaa\"}\n{\"event\":\"seek\"}\n");
    assert_eq!(messages.len(), 1);
    assert!(matches!(&messages[0], Ok(MpvMessage::Event(e)) if e.event == "seek"));
    assert!(decoder.finish().is_empty());
  }

  #[test]
  fn malformed_frame_is_reported() {
    let results = decode_chunk("not json\n{\"event\":\"idle\"}\n");
    assert!(results[0].is_err());
    assert!(results[1].is_ok());
  }
}
