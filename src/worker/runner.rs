//! Executes one conversion per task in the background.
//!
//! The runner is the only code that moves a task out of `Pending`, and every
//! path through [`JobRunner::run`] ends in exactly one terminal transition.
//! Converter panics are caught at the inner task boundary and recorded as
//! failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::converters::{ConversionOutcome, ConversionRequest, ConverterDispatch, ProgressFn};
use crate::tasks::{JobTicket, TaskManager};
use crate::worker::cleanup::CleanupScheduler;

/// Progress reported once the runner has picked a task up.
const STARTED_PROGRESS: u8 = 10;
/// Converter progress is scaled into `STARTED_PROGRESS..=FINISHING_PROGRESS`.
const FINISHING_PROGRESS: u8 = 90;

/// Background executor for submitted tasks.
pub struct JobRunner {
    tasks: Arc<TaskManager>,
    dispatch: Arc<ConverterDispatch>,
    cleanup: Arc<CleanupScheduler>,
    failed_task_ttl: Duration,
    keep_failed_workspaces: bool,
}

impl JobRunner {
    pub fn new(
        tasks: Arc<TaskManager>,
        dispatch: Arc<ConverterDispatch>,
        cleanup: Arc<CleanupScheduler>,
        failed_task_ttl: Duration,
        keep_failed_workspaces: bool,
    ) -> Self {
        Self {
            tasks,
            dispatch,
            cleanup,
            failed_task_ttl,
            keep_failed_workspaces,
        }
    }

    /// Start the task's conversion on the runtime and return immediately.
    pub fn spawn(self: &Arc<Self>, task_id: Uuid) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(task_id).await })
    }

    /// Run the task to a terminal state.
    ///
    /// A task that is unknown or already started is left alone.
    pub async fn run(&self, task_id: Uuid) {
        let Some(ticket) = self.tasks.start(task_id) else {
            debug!(task_id = %task_id, "Task not pending, nothing to run");
            return;
        };
        info!(task_id = %task_id, conversion_type = %ticket.conversion_type, "Conversion started");
        self.tasks.update_progress(task_id, STARTED_PROGRESS);

        let target_path = ticket.target_path.clone();
        let workspace = Arc::clone(&ticket.workspace);
        match self.execute(ticket).await {
            Ok(outcome) => {
                workspace.log(format!(
                    "completed by {}{}",
                    outcome.strategy,
                    if outcome.degraded { " (fallback)" } else { "" }
                ));
                self.tasks.update_progress(task_id, FINISHING_PROGRESS);
                self.tasks.mark_completed(task_id, target_path, outcome.degraded);
            }
            Err(message) => {
                workspace.log(format!("failed: {message}"));
                if self.tasks.mark_failed(task_id, &message) {
                    self.cleanup.schedule_after_failure(
                        task_id,
                        self.failed_task_ttl,
                        self.keep_failed_workspaces,
                    );
                }
            }
        }
    }

    async fn execute(&self, ticket: JobTicket) -> Result<ConversionOutcome, String> {
        let task_id = ticket.task_id;
        if let Err(e) = ticket.workspace.open_log() {
            warn!(task_id = %task_id, error = %e, "Task log unavailable");
        }
        ticket.workspace.log(format!(
            "{} conversion of {}",
            ticket.conversion_type,
            ticket.input_path.display()
        ));

        let chain = self
            .dispatch
            .select_type(ticket.conversion_type)
            .map_err(|e| e.to_string())?;

        let tasks = Arc::clone(&self.tasks);
        let progress: ProgressFn = Arc::new(move |percent| {
            tasks.update_progress(task_id, scale_progress(percent));
        });

        let conversion = tokio::spawn(async move {
            let _lease = ticket.workspace.lease().await;
            let request = ConversionRequest {
                input: &ticket.input_path,
                output: &ticket.target_path,
                workspace: &ticket.workspace,
                style: &ticket.style,
                progress: &progress,
            };
            ConverterDispatch::run(&chain, &request).await
        });

        match conversion.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Conversion task panicked");
                Err(format!("Internal error: conversion panicked: {e}"))
            }
        }
    }
}

fn scale_progress(percent: u8) -> u8 {
    let span = u16::from(FINISHING_PROGRESS - STARTED_PROGRESS);
    let scaled = u16::from(percent.min(100)) * span / 100;
    STARTED_PROGRESS + scaled as u8
}
