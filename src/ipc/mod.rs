//! Local IPC: JSON lines over a Unix domain socket.

pub mod codec;
mod client;
mod server;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use client::IpcClient;
pub use server::{IpcServer, ServerEvent};

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("another engine is listening on {0}")]
    AddressInUse(PathBuf),

    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed")]
    Closed,

    #[error("no reply within {0:?}")]
    Timeout(std::time::Duration),
}
