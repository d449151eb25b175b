// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use storage_udevwatch::WatchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("config file not found: {path:?}")]
    ConfigNotFound { path: PathBuf },
    #[error("invalid config {path:?}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },
    #[error("required tool not found: {tool}")]
    ToolMissing { tool: String },
    #[error("command failed: {command}; stderr: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Watch(#[from] WatchError),
}

impl From<ServiceError> for WatchError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Watch(inner) => inner,
            other => WatchError::LoadFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
