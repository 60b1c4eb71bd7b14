//! Control channel for an external MPV player.
//!
//! [`MpvClient`] starts MPV on demand, talks to it over its JSON IPC socket
//! and restarts it transparently after it exits.

pub mod command;
pub mod config;
pub mod deferred;
pub mod dispose;
pub mod error;
pub mod logging;
pub mod mpv;

pub use config::PlayerConfig;
pub use deferred::Deferred;
pub use dispose::Disposable;
pub use error::{MpvError, Result};
pub use logging::Logger;
pub use mpv::{MpvClient, MpvCommand, MpvEvent, PlayerState, SeekMode};
