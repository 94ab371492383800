//! The conversion service: wires the task registry, runner and cleanup
//! scheduler together behind the operations the HTTP layer exposes.

use std::sync::Arc;

use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::converters::ConverterDispatch;
use crate::error::{Error, TaskError, WorkspaceError};
use crate::tasks::{Submission, TaskManager, TaskSnapshot};
use crate::worker::{CleanupScheduler, JobRunner, SweepReport, spawn_sweep_task};
use crate::workspace::WorkspaceManager;

/// A converted file ready to send.
#[derive(Debug)]
pub struct Download {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Process-scoped service state. Created once at startup; nothing survives a
/// restart except workspaces, which the startup sweep reclaims.
pub struct ConversionService {
    config: ServiceConfig,
    tasks: Arc<TaskManager>,
    runner: Arc<JobRunner>,
    cleanup: Arc<CleanupScheduler>,
}

impl ConversionService {
    /// Service with the default strategy table.
    pub fn new(config: ServiceConfig) -> Self {
        let dispatch = ConverterDispatch::with_defaults(&config.converters);
        Self::with_dispatch(config, dispatch)
    }

    /// Service with a caller-supplied strategy table.
    pub fn with_dispatch(config: ServiceConfig, dispatch: ConverterDispatch) -> Self {
        let tasks = Arc::new(TaskManager::new(
            WorkspaceManager::new(config.temp_dir.clone()),
            config.max_upload_bytes,
        ));
        let cleanup = Arc::new(CleanupScheduler::new(Arc::clone(&tasks)));
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&tasks),
            Arc::new(dispatch),
            Arc::clone(&cleanup),
            config.failed_task_ttl,
            config.keep_failed_workspaces,
        ));
        Self {
            config,
            tasks,
            runner,
            cleanup,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Create the on-disk roots and sweep leftovers from a previous run.
    pub async fn init(&self) -> Result<SweepReport, Error> {
        self.tasks.workspaces().ensure_root().await?;
        fs::create_dir_all(&self.config.logs_dir)
            .await
            .map_err(WorkspaceError::from)?;
        Ok(self.sweep_stale().await)
    }

    /// Register the upload and start its conversion in the background.
    pub async fn submit(&self, submission: Submission) -> Result<Uuid, Error> {
        let task_id = self.tasks.submit(submission).await?;
        self.runner.spawn(task_id);
        Ok(task_id)
    }

    pub fn status(&self, task_id: Uuid) -> Result<TaskSnapshot, TaskError> {
        self.tasks.status(task_id)
    }

    /// Read the output of a completed task and (re)arm its cleanup timer.
    pub async fn download(&self, task_id: Uuid) -> Result<Download, Error> {
        let ticket = self.tasks.download_ticket(task_id)?;

        let read = {
            let _lease = ticket.workspace.lease().await;
            fs::read(&ticket.output_path).await
        };
        let bytes = match read {
            Ok(bytes) => bytes,
            // Reclaimed between the lookup and the read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TaskError::NotFound { id: task_id }.into());
            }
            Err(e) => return Err(WorkspaceError::from(e).into()),
        };

        info!(task_id = %task_id, file = %ticket.file_name, size = bytes.len(), "Output downloaded");
        self.cleanup
            .schedule_after_download(task_id, self.config.download_grace);

        Ok(Download {
            file_name: ticket.file_name,
            content_type: ticket.conversion_type.target_mime(),
            bytes,
        })
    }

    /// Reclaim a terminal task immediately, cancelling any pending timer.
    pub async fn discard(&self, task_id: Uuid) -> Result<(), TaskError> {
        let status = self
            .tasks
            .status_of(task_id)
            .ok_or(TaskError::NotFound { id: task_id })?;
        if !status.is_terminal() {
            return Err(TaskError::StillActive {
                id: task_id,
                status: status.to_string(),
            });
        }
        if self.cleanup.cancel(task_id) {
            debug!(task_id = %task_id, "Pending cleanup cancelled by discard");
        }
        self.cleanup.reclaim_now(task_id, None, false).await;
        Ok(())
    }

    pub async fn sweep_stale(&self) -> SweepReport {
        self.cleanup
            .sweep_stale(self.config.stale_max_age, Some(&self.config.logs_dir))
            .await
    }

    /// Start the periodic stale sweep.
    pub fn spawn_sweep_task(&self) -> JoinHandle<()> {
        spawn_sweep_task(
            Arc::clone(&self.cleanup),
            self.config.sweep_interval,
            self.config.stale_max_age,
            Some(self.config.logs_dir.clone()),
        )
    }
}
