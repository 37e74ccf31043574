//! Transfer error types.

use std::path::{Path, PathBuf};

use partwise_protocol::TransportError;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("checksum mismatch: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("part {part_number} failed: {source}{}", checkpoint_note(.checkpoint))]
    PartFailed {
        part_number: u32,
        source: Box<TransferError>,
        checkpoint: Option<PathBuf>,
    },

    #[error("{operation} failed: {source}{}", checkpoint_note(.checkpoint))]
    FinalizeFailed {
        operation: &'static str,
        source: Box<TransferError>,
        checkpoint: Option<PathBuf>,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer aborted")]
    Aborted,

    #[error("worker panicked: {0}")]
    WorkerPanic(String),
}

fn checkpoint_note(checkpoint: &Option<PathBuf>) -> String {
    match checkpoint {
        Some(path) => format!("; checkpoint file kept at {}", path.display()),
        None => String::new(),
    }
}

impl TransferError {
    /// Returns `true` for failures caused locally: bad parameters, file I/O,
    /// serialization or checkpoint writes.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Io(_) | Self::Json(_) | Self::InvalidParameter(_) | Self::InvalidState(_) => {
                true
            }
            Self::Transport(TransportError::Client(_)) => true,
            Self::PartFailed { source, .. } | Self::FinalizeFailed { source, .. } => {
                source.is_client_error()
            }
            _ => false,
        }
    }

    /// Returns `true` if the transfer stopped because of a cancel request.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Aborted)
    }

    /// Path of the checkpoint left behind for a later resume, if any.
    pub fn checkpoint_path(&self) -> Option<&Path> {
        match self {
            Self::PartFailed { checkpoint, .. } | Self::FinalizeFailed { checkpoint, .. } => {
                checkpoint.as_deref()
            }
            _ => None,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}
