// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Error types for the udev watcher
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Event source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Monitor is already running")]
    AlreadyRunning,

    #[error("Malformed uevent: {0}")]
    MalformedEvent(String),

    #[error("Work queue is closed")]
    QueueClosed,

    #[error("Inventory load failed: {0}")]
    LoadFailed(String),

    #[error("State updater stopped: {0}")]
    UpdaterStopped(String),
}

/// Result type alias for watcher operations
pub type Result<T> = std::result::Result<T, WatchError>;
