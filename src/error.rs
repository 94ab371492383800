//! Error types for docconv.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// A submission rejected before any task or workspace exists.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown conversion type: {0}")]
    UnknownType(String),

    #[error("File {file_name} is not accepted for {conversion_type} (expected one of: {expected})")]
    UnsupportedExtension {
        conversion_type: String,
        file_name: String,
        expected: String,
    },

    #[error("File size exceeds the limit: {size} > {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Uploaded file is empty")]
    EmptyFile,

    #[error("Missing form field: {0}")]
    MissingField(&'static str),

    #[error("Invalid style configuration: {0}")]
    InvalidStyle(String),

    #[error("Malformed upload: {0}")]
    Malformed(String),
}

/// Registry lookups and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is {status}, output not available")]
    NotReady { id: Uuid, status: String },

    #[error("Task {id} is still {status}")]
    StillActive { id: Uuid, status: String },
}

/// Converter selection errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No converter registered for type {0}")]
    UnsupportedType(String),
}

/// Failures raised by a conversion strategy, or by dispatch once every
/// strategy for a type has failed.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("{tool} is not installed")]
    ToolUnavailable { tool: String },

    #[error("{tool} exited with status {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: i32,
        stderr: String,
    },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("Invalid input document: {0}")]
    InvalidInput(String),

    #[error("{strategy} produced no output")]
    MissingOutput { strategy: String },

    #[error("Failed to encode output: {0}")]
    Encode(String),

    #[error("Conversion task aborted: {0}")]
    Aborted(String),

    #[error("{strategy} failed: {message}")]
    Failed { strategy: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<zip::result::ZipError> for ConversionError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Encode(e.to_string())
    }
}

impl From<WorkspaceError> for ConversionError {
    fn from(e: WorkspaceError) -> Self {
        match e {
            WorkspaceError::Io(io) => Self::Io(io),
            other => Self::Aborted(other.to_string()),
        }
    }
}

/// Session workspace errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Path escapes workspace: {0}")]
    PathEscape(String),

    #[error("Workspace already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single entry that could not be removed during teardown.
///
/// Collected into a `DestroyReport` and logged; never returned as an `Err`.
#[derive(Debug, thiserror::Error)]
#[error("Failed to remove {}: {source}", path.display())]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
