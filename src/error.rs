//! Error taxonomy for the repair core
//!
//! Per-file and per-attempt failures are values the controller folds into its
//! state machine. Anything that should halt the process travels as
//! `anyhow::Error` instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepairError {
    /// A candidate resolved (or would resolve) outside the safe root.
    #[error("`{candidate}` is outside the safe root {}", root.display())]
    OutOfScopePath { candidate: String, root: PathBuf },

    /// A structured patch could not be applied. Recovered by a full rewrite.
    #[error("patch did not apply: {reason}")]
    PatchFailure { reason: String },

    /// Generated content does not parse. Never written to disk.
    #[error("generated content for {} is not valid: {reason}", path.display())]
    ValidationFailure { path: PathBuf, reason: String },

    /// Backup or write failed. Fatal for that file only.
    #[error("failed to write {}: {source}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RepairError {
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RepairError::WriteError {
            path: path.into(),
            source,
        }
    }

    /// Whether the controller should answer this failure with a full rewrite.
    pub fn wants_rewrite(&self) -> bool {
        matches!(
            self,
            RepairError::PatchFailure { .. } | RepairError::ValidationFailure { .. }
        )
    }
}
