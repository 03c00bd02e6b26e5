//! playit - a music player engine controlled over a local socket.

pub mod audio;
pub mod config;
pub mod engine;
pub mod ipc;
pub mod library;
pub mod player;
pub mod protocol;

pub use config::Config;
pub use engine::{Engine, EngineConnectionStatus, EngineError, EngineLocation};
pub use protocol::{EngineCommand, EngineResponse, LoopMode, Permission};
