//! Error types for tessera.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Subsystems own focused error enums that convert into [`TesseraError`].

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::builder::parser::ParseError;
use crate::cache::CacheError;
use crate::registry::RegistryError;
use crate::snapshot::SnapshotError;
use crate::storage::StoreError;

/// Result type alias for tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Main error type for tessera.
#[derive(Error, Debug)]
pub enum TesseraError {
    // Subsystem errors
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("parse: {0}")]
    Parse(#[from] ParseError),

    // Plan validation errors
    #[error("Invalid build plan: {reason}")]
    InvalidPlan { reason: String },

    #[error("Invalid image name {name}: {reason}")]
    InvalidImageName { name: String, reason: String },

    // Execution errors
    #[error("Command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Step {step} failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<TesseraError>,
    },

    #[error("Stage {alias} failed: {source}")]
    StageFailed {
        alias: String,
        #[source]
        source: Box<TesseraError>,
    },

    #[error("Filesystem modification is not allowed for stage {alias}")]
    ModifyFsNotAllowed { alias: String },

    #[error("Build worker is busy with another build")]
    WorkerBusy,

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }

    /// Wrap this error with the step that produced it.
    pub fn in_step(self, step: impl fmt::Display) -> Self {
        Self::StepFailed { step: step.to_string(), source: Box::new(self) }
    }

    /// Wrap this error with the stage that produced it.
    pub fn in_stage(self, alias: impl Into<String>) -> Self {
        Self::StageFailed { alias: alias.into(), source: Box::new(self) }
    }
}

/// A collection of errors reported together.
///
/// Cache pushes run off the critical path; their failures accumulate here
/// and surface only when the caller waits for the pushes to drain.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<String>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: impl fmt::Display) {
        self.errors.push(err.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Returns `Ok(())` when nothing was collected, the aggregate otherwise.
    pub fn into_result(self) -> std::result::Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} error(s): {}", self.errors.len(), self.errors.join("; "))
    }
}

impl std::error::Error for MultiError {}
