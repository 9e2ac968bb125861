use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockError;
use crate::manifest::FatalAssetError;
use crate::transport::{ToolUnavailable, TransportError};

/// Everything that can end an update cycle with a non-zero exit code.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("another update cycle is already running (pid {owner})")]
    LockContention { owner: u32 },

    #[error(transparent)]
    ToolUnavailable(#[from] ToolUnavailable),

    #[error("failed fetching {what}: {source}")]
    Transport {
        what: &'static str,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Asset(#[from] FatalAssetError),

    #[error("failed writing version marker {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed creating directory {}: {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl CycleError {
    pub fn exit_code(&self) -> u8 {
        1
    }

    /// Short machine-friendly name used in cycle records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LockContention { .. } => "lock_contention",
            Self::ToolUnavailable(_) => "tool_unavailable",
            Self::Transport { .. } => "transport",
            Self::Asset(_) => "asset",
            Self::Persistence { .. } => "persistence",
            Self::Directory { .. } => "directory",
            Self::Lock(_) => "lock_io",
        }
    }
}
