//! Task state machine.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::converters::StyleConfig;
use crate::error::ValidationError;
use crate::workspace::SessionWorkspace;

/// The fixed set of supported conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversionType {
    PdfToWord,
    MarkdownToWord,
    WordToPdf,
    PdfToMarkdown,
}

impl ConversionType {
    pub const ALL: [ConversionType; 4] = [
        Self::PdfToWord,
        Self::MarkdownToWord,
        Self::WordToPdf,
        Self::PdfToMarkdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PdfToWord => "pdf-to-word",
            Self::MarkdownToWord => "markdown-to-word",
            Self::WordToPdf => "word-to-pdf",
            Self::PdfToMarkdown => "pdf-to-markdown",
        }
    }

    /// Upload extensions accepted for this conversion (lowercase, no dot).
    pub fn accepted_extensions(&self) -> &'static [&'static str] {
        match self {
            Self::PdfToWord | Self::PdfToMarkdown => &["pdf"],
            Self::MarkdownToWord => &["md", "markdown", "txt"],
            Self::WordToPdf => &["docx", "doc"],
        }
    }

    /// Extension of the produced file.
    pub fn target_extension(&self) -> &'static str {
        match self {
            Self::PdfToWord | Self::MarkdownToWord => "docx",
            Self::WordToPdf => "pdf",
            Self::PdfToMarkdown => "md",
        }
    }

    /// MIME type of the produced file.
    pub fn target_mime(&self) -> &'static str {
        match self {
            Self::PdfToWord | Self::MarkdownToWord => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Self::WordToPdf => "application/pdf",
            Self::PdfToMarkdown => "text/markdown; charset=utf-8",
        }
    }
}

impl FromStr for ConversionType {
    type Err = ValidationError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let normalized = tag.trim().to_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownType(tag.to_string()))
    }
}

impl std::fmt::Display for ConversionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, not yet picked up by its runner.
    Pending,
    /// A converter is executing.
    Running,
    /// Output is ready for download.
    Completed,
    /// Conversion failed; `error` holds the summary.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows moving to `target`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A registered conversion job.
///
/// `output_path` is set only in `Completed`; `error` only in `Failed`.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub conversion_type: ConversionType,
    pub status: TaskStatus,
    /// Percent, non-decreasing while running.
    pub progress: u8,
    pub error: Option<String>,
    /// Name of the file as uploaded by the client.
    pub input_filename: String,
    pub input_path: PathBuf,
    /// Where the converter is asked to write.
    pub target_path: PathBuf,
    pub output_path: Option<PathBuf>,
    /// Output came from a fallback strategy.
    pub degraded: bool,
    pub style: StyleConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub workspace: Arc<SessionWorkspace>,
}

impl Task {
    pub fn new(
        conversion_type: ConversionType,
        input_filename: impl Into<String>,
        input_path: PathBuf,
        target_path: PathBuf,
        style: StyleConfig,
        workspace: Arc<SessionWorkspace>,
    ) -> Self {
        Self {
            id: workspace.task_id(),
            conversion_type,
            status: TaskStatus::Pending,
            progress: 0,
            error: None,
            input_filename: input_filename.into(),
            input_path,
            target_path,
            output_path: None,
            degraded: false,
            style,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            workspace,
        }
    }

    /// Move to `target` if the state machine allows it.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, target
            ));
        }
        self.status = target;
        match target {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed => self.finished_at = Some(Utc::now()),
            TaskStatus::Pending => {}
        }
        Ok(())
    }

    pub fn output_filename(&self) -> Option<String> {
        self.output_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id,
            conversion_type: self.conversion_type,
            status: self.status,
            progress: self.progress,
            error: self.error.clone(),
            input_filename: self.input_filename.clone(),
            output_filename: self.output_filename(),
            degraded: self.degraded,
            created_at: self.created_at,
        }
    }
}

/// Consistent point-in-time view of a task, as returned by status polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub conversion_type: ConversionType,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub input_filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<String>,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}
