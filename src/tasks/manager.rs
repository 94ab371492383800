//! Task registry: submission, status polling and state updates.
//!
//! All reads and writes go through one mutex over the whole registry, so a
//! snapshot always carries a matching status, progress and error. The lock is
//! never held across an `.await` or a converter call.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::converters::StyleConfig;
use crate::error::{Error, TaskError, ValidationError};
use crate::tasks::state::{ConversionType, Task, TaskSnapshot, TaskStatus};
use crate::workspace::{SessionWorkspace, WorkspaceManager, paths};

/// Maximum length of an error summary exposed to clients.
const MAX_ERROR_CHARS: usize = 300;

/// A client upload as received at the boundary.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Conversion-type tag, e.g. `pdf-to-word`.
    pub conversion_type: String,
    /// Original file name of the upload.
    pub file_name: String,
    pub content: Vec<u8>,
    /// Optional style configuration as raw JSON.
    pub style: Option<String>,
}

/// Everything a runner needs to execute a task it has just started.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub task_id: Uuid,
    pub conversion_type: ConversionType,
    pub input_path: PathBuf,
    pub target_path: PathBuf,
    pub style: StyleConfig,
    pub workspace: Arc<SessionWorkspace>,
}

/// Where a completed task's output lives.
#[derive(Debug, Clone)]
pub struct DownloadTicket {
    pub task_id: Uuid,
    pub conversion_type: ConversionType,
    pub output_path: PathBuf,
    pub file_name: String,
    pub workspace: Arc<SessionWorkspace>,
}

struct ValidSubmission {
    conversion_type: ConversionType,
    file_name: String,
    extension: String,
    content: Vec<u8>,
    style: StyleConfig,
}

/// Owns every live task. Process-scoped: created at startup, never persisted.
pub struct TaskManager {
    tasks: Mutex<HashMap<Uuid, Task>>,
    workspaces: WorkspaceManager,
    max_upload_bytes: usize,
}

impl TaskManager {
    pub fn new(workspaces: WorkspaceManager, max_upload_bytes: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            workspaces,
            max_upload_bytes,
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Validate an upload, allocate its workspace and register a pending task.
    ///
    /// Nothing is created when validation fails. Conversion is not started here.
    pub async fn submit(&self, submission: Submission) -> Result<Uuid, Error> {
        let valid = validate(submission, self.max_upload_bytes)?;

        let task_id = Uuid::new_v4();
        let workspace = Arc::new(self.workspaces.create(task_id).await?);

        let input_name = format!("{}.{}", paths::INPUT_STEM, valid.extension);
        let output_name = output_file_name(&valid.file_name, valid.conversion_type);
        let resolved = match workspace.write(&input_name, &valid.content).await {
            Ok(input_path) => workspace
                .path(&output_name)
                .map(|target_path| (input_path, target_path)),
            Err(e) => Err(e),
        };
        let (input_path, target_path) = match resolved {
            Ok(p) => p,
            Err(e) => {
                workspace.destroy().await;
                return Err(e.into());
            }
        };

        let task = Task::new(
            valid.conversion_type,
            valid.file_name,
            input_path,
            target_path,
            valid.style,
            workspace,
        );
        info!(
            task_id = %task_id,
            conversion_type = %valid.conversion_type,
            input = %task.input_filename,
            size = valid.content.len(),
            "Task submitted"
        );
        self.lock().insert(task_id, task);
        Ok(task_id)
    }

    /// Consistent snapshot of a task.
    pub fn status(&self, task_id: Uuid) -> Result<TaskSnapshot, TaskError> {
        self.lock()
            .get(&task_id)
            .map(Task::snapshot)
            .ok_or(TaskError::NotFound { id: task_id })
    }

    /// Current status only, `None` when the task is unknown or reclaimed.
    pub fn status_of(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.lock().get(&task_id).map(|t| t.status)
    }

    /// Move a pending task to running and hand out its job ticket.
    ///
    /// Returns `None` if the task is unknown or was already started, which
    /// keeps at most one converter in flight per task.
    pub fn start(&self, task_id: Uuid) -> Option<JobTicket> {
        let mut tasks = self.lock();
        let task = tasks.get_mut(&task_id)?;
        if let Err(reason) = task.transition_to(TaskStatus::Running) {
            debug!(task_id = %task_id, %reason, "Start ignored");
            return None;
        }
        Some(JobTicket {
            task_id,
            conversion_type: task.conversion_type,
            input_path: task.input_path.clone(),
            target_path: task.target_path.clone(),
            style: task.style.clone(),
            workspace: Arc::clone(&task.workspace),
        })
    }

    /// Record progress for a running task.
    ///
    /// Values are clamped to 100 and never lower the current progress. Late
    /// callbacks for a task that is no longer running are ignored.
    pub fn update_progress(&self, task_id: Uuid, percent: u8) -> bool {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return false;
        };
        if task.status != TaskStatus::Running {
            return false;
        }
        let percent = percent.min(100);
        if percent <= task.progress {
            return false;
        }
        task.progress = percent;
        debug!(task_id = %task_id, progress = percent, "Progress");
        true
    }

    /// Terminal transition to `Completed`. A repeat call is a no-op.
    pub fn mark_completed(&self, task_id: Uuid, output_path: PathBuf, degraded: bool) -> bool {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return false;
        };
        if task.transition_to(TaskStatus::Completed).is_err() {
            debug!(task_id = %task_id, status = %task.status, "Duplicate terminal signal ignored");
            return false;
        }
        task.progress = 100;
        task.output_path = Some(output_path);
        task.degraded = degraded;
        info!(task_id = %task_id, degraded, "Task completed");
        true
    }

    /// Terminal transition to `Failed`. A repeat call is a no-op.
    ///
    /// The stored message has workspace paths stripped and is truncated.
    pub fn mark_failed(&self, task_id: Uuid, message: impl AsRef<str>) -> bool {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return false;
        };
        if task.transition_to(TaskStatus::Failed).is_err() {
            debug!(task_id = %task_id, status = %task.status, "Duplicate terminal signal ignored");
            return false;
        }
        let summary = summarize_error(message.as_ref(), task.workspace.root());
        warn!(task_id = %task_id, error = %summary, "Task failed");
        task.error = Some(summary);
        true
    }

    /// Resolve the output of a completed task.
    pub fn download_ticket(&self, task_id: Uuid) -> Result<DownloadTicket, TaskError> {
        let tasks = self.lock();
        let task = tasks.get(&task_id).ok_or(TaskError::NotFound { id: task_id })?;
        match (&task.status, &task.output_path) {
            (TaskStatus::Completed, Some(output_path)) => Ok(DownloadTicket {
                task_id,
                conversion_type: task.conversion_type,
                output_path: output_path.clone(),
                file_name: task.output_filename().unwrap_or_default(),
                workspace: Arc::clone(&task.workspace),
            }),
            (status, _) => Err(TaskError::NotReady {
                id: task_id,
                status: status.to_string(),
            }),
        }
    }

    /// Remove a task from the registry, returning its workspace for teardown.
    ///
    /// Returns `None` (a no-op) if the task is unknown or already reclaimed.
    pub fn reclaim(&self, task_id: Uuid) -> Option<Arc<SessionWorkspace>> {
        let removed = self.lock().remove(&task_id)?;
        info!(task_id = %task_id, status = %removed.status, "Task reclaimed");
        Some(removed.workspace)
    }

    /// Reclaim only if the task is still in `expected`, checked under the same lock.
    pub fn reclaim_if(&self, task_id: Uuid, expected: TaskStatus) -> Option<Arc<SessionWorkspace>> {
        let mut tasks = self.lock();
        if tasks.get(&task_id)?.status != expected {
            return None;
        }
        let removed = tasks.remove(&task_id)?;
        info!(task_id = %task_id, status = %removed.status, "Task reclaimed");
        Some(removed.workspace)
    }

    /// Ids of every registered task.
    pub fn live_ids(&self) -> HashSet<Uuid> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Task>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Task registry mutex poisoned");
                poisoned.into_inner()
            }
        }
    }
}

fn validate(submission: Submission, max_bytes: usize) -> Result<ValidSubmission, ValidationError> {
    let conversion_type: ConversionType = submission.conversion_type.parse()?;

    if submission.content.is_empty() {
        return Err(ValidationError::EmptyFile);
    }
    if submission.content.len() > max_bytes {
        return Err(ValidationError::TooLarge {
            size: submission.content.len(),
            max: max_bytes,
        });
    }

    let accepted = conversion_type.accepted_extensions();
    let extension = Path::new(&submission.file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .filter(|e| accepted.contains(&e.as_str()))
        .ok_or_else(|| ValidationError::UnsupportedExtension {
            conversion_type: conversion_type.to_string(),
            file_name: submission.file_name.clone(),
            expected: accepted.join(", "),
        })?;

    let style = match submission.style.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => serde_json::from_str::<StyleConfig>(raw)
            .map_err(|e| ValidationError::InvalidStyle(e.to_string()))?,
        _ => StyleConfig::default(),
    };

    Ok(ValidSubmission {
        conversion_type,
        file_name: submission.file_name,
        extension,
        content: submission.content,
        style,
    })
}

/// `<stem>_<5 random alphanumerics>.<target ext>`, safe to use inside a workspace.
fn output_file_name(original: &str, conversion_type: ConversionType) -> String {
    // Uploads from Windows clients may carry backslash-separated paths.
    let base = original
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(original);
    let stem = Path::new(base)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | ' ' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.').trim();
    let stem = if sanitized.is_empty() {
        "document"
    } else {
        sanitized
    };

    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();
    format!("{stem}_{suffix}.{}", conversion_type.target_extension())
}

/// Strip workspace paths and truncate, so clients never see internal layout.
fn summarize_error(message: &str, workspace_root: &Path) -> String {
    let root = workspace_root.display().to_string();
    let mut summary = message
        .replace(&format!("{root}/"), "")
        .replace(&root, "<workspace>");
    if let Ok(absolute) = std::path::absolute(workspace_root) {
        let absolute = absolute.display().to_string();
        summary = summary
            .replace(&format!("{absolute}/"), "")
            .replace(&absolute, "<workspace>");
    }
    let summary = summary.trim();
    if summary.chars().count() > MAX_ERROR_CHARS {
        let truncated: String = summary.chars().take(MAX_ERROR_CHARS).collect();
        format!("{truncated}...")
    } else {
        summary.to_string()
    }
}
