//! MPV IPC module - spawns and controls an external MPV player via JSON IPC.
//!
//! Architecture:
//! - `protocol.rs` - JSON command/response types and line framing
//! - `events.rs` - Event subscriptions shared across connections
//! - `ipc.rs` - Async IPC connection (Named Pipes on Windows, Unix Sockets on Linux/macOS)
//! - `process.rs` - MPV binary detection, version checks and process spawning
//! - `supervisor.rs` - Lazy start, readiness and restart of the player process
//! - `client.rs` - High-level MPV client with command methods

mod client;
mod events;
mod ipc;
mod process;
mod protocol;
mod supervisor;

pub use client::{resolve_source, MpvClient, PlayerState, SeekMode};
pub use events::{EventCallback, EventHub};
pub use ipc::{Connection, Observation};
pub use process::{
  build_args, check_version, find_mpv, query_version, resolve_executable, MpvVersion, MIN_VERSION,
};
pub use protocol::{
  decode_chunk, FrameDecoder, MpvCommand, MpvEvent, MpvMessage, MpvResponse, MAX_FRAME_LEN,
};
pub use supervisor::{Supervisor, SupervisorState};
