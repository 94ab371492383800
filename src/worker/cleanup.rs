//! Deferred task reclamation and stale-workspace sweeps.
//!
//! Each task has at most one pending cleanup timer. Arming a new timer for the
//! same task aborts the old one, so repeated downloads extend the grace
//! period instead of stacking timers. Every timer ends in the same idempotent
//! reclaim: remove the task from the registry, then destroy its workspace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::tasks::{TaskManager, TaskStatus};
use crate::workspace::DestroyReport;

/// What a reclaim attempt did.
#[derive(Debug)]
pub enum CleanupOutcome {
    /// Task removed and workspace torn down.
    Reclaimed(DestroyReport),
    /// Task removed, workspace left on disk on purpose.
    Retained,
    /// Nothing to do: unknown task, already reclaimed, or not in the expected state.
    Skipped,
}

/// Totals of one stale sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub workspaces: usize,
    pub log_files: usize,
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Schedules and performs task reclamation.
pub struct CleanupScheduler {
    tasks: Arc<TaskManager>,
    timers: Mutex<HashMap<Uuid, Timer>>,
    generation: AtomicU64,
}

impl CleanupScheduler {
    pub fn new(tasks: Arc<TaskManager>) -> Self {
        Self {
            tasks,
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Reclaim a completed task once `grace` has passed since its last download.
    pub fn schedule_after_download(self: &Arc<Self>, task_id: Uuid, grace: Duration) {
        self.arm(task_id, grace, TaskStatus::Completed, false);
    }

    /// Reclaim a failed task after `ttl`, so clients can still read its error.
    pub fn schedule_after_failure(self: &Arc<Self>, task_id: Uuid, ttl: Duration, retain_workspace: bool) {
        self.arm(task_id, ttl, TaskStatus::Failed, retain_workspace);
    }

    fn arm(self: &Arc<Self>, task_id: Uuid, delay: Duration, expected: TaskStatus, retain: bool) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);

        // The timer removes its own entry under this lock, so it cannot run
        // that step before the entry is inserted below.
        let mut timers = self.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.disarm(task_id, generation) {
                this.reclaim_now(task_id, Some(expected), retain).await;
            }
        });
        if let Some(previous) = timers.insert(task_id, Timer { generation, handle }) {
            previous.handle.abort();
            debug!(task_id = %task_id, "Cleanup timer re-armed");
        } else {
            debug!(task_id = %task_id, delay = ?delay, "Cleanup timer armed");
        }
    }

    /// Drop the entry for a firing timer. False if it was re-armed or cancelled meanwhile.
    fn disarm(&self, task_id: Uuid, generation: u64) -> bool {
        let mut timers = self.lock();
        if timers.get(&task_id).is_some_and(|t| t.generation == generation) {
            timers.remove(&task_id);
            true
        } else {
            false
        }
    }

    /// Abort a pending timer. Returns whether one was pending.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.lock().remove(&task_id) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.lock().len()
    }

    /// Remove the task from the registry and tear down its workspace.
    ///
    /// With `expected` set, only a task still in that state is reclaimed.
    /// Safe to call any number of times; later calls return `Skipped`.
    pub async fn reclaim_now(
        &self,
        task_id: Uuid,
        expected: Option<TaskStatus>,
        retain_workspace: bool,
    ) -> CleanupOutcome {
        let workspace = match expected {
            Some(status) => self.tasks.reclaim_if(task_id, status),
            None => self.tasks.reclaim(task_id),
        };
        let Some(workspace) = workspace else {
            debug!(task_id = %task_id, "Nothing to reclaim");
            return CleanupOutcome::Skipped;
        };

        if retain_workspace {
            workspace.log("task reclaimed, workspace retained");
            info!(task_id = %task_id, path = %workspace.root().display(), "Workspace retained");
            return CleanupOutcome::Retained;
        }

        let report = workspace.destroy().await;
        for failure in &report.failures {
            warn!(task_id = %task_id, error = %failure, "Cleanup left an entry behind");
        }
        CleanupOutcome::Reclaimed(report)
    }

    /// Remove workspaces no live task owns and log files, both older than `max_age`.
    pub async fn sweep_stale(&self, max_age: Duration, logs_dir: Option<&Path>) -> SweepReport {
        let live = self.tasks.live_ids();
        let workspaces = self.tasks.workspaces().sweep_stale(max_age, &live).await;
        let log_files = match logs_dir {
            Some(dir) => sweep_log_files(dir, max_age).await,
            None => 0,
        };
        if workspaces > 0 || log_files > 0 {
            info!(workspaces, log_files, "Stale sweep finished");
        }
        SweepReport {
            workspaces,
            log_files,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Timer>> {
        match self.timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Cleanup timer mutex poisoned");
                poisoned.into_inner()
            }
        }
    }
}

async fn sweep_log_files(dir: &Path, max_age: Duration) -> usize {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "Cannot scan logs directory");
            }
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if !metadata.is_file() || age < max_age {
            continue;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Could not remove old log file"),
        }
    }
    removed
}

/// Shortest accepted sweep interval.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Run the stale sweep every `interval`. The first sweep happens one interval
/// after spawning; callers sweep once themselves at startup.
pub fn spawn_sweep_task(
    cleanup: Arc<CleanupScheduler>,
    interval: Duration,
    max_age: Duration,
    logs_dir: Option<PathBuf>,
) -> JoinHandle<()> {
    let interval = if interval < MIN_SWEEP_INTERVAL {
        warn!(?interval, "Sweep interval too short, clamping to {MIN_SWEEP_INTERVAL:?}");
        MIN_SWEEP_INTERVAL
    } else {
        interval
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            cleanup.sweep_stale(max_age, logs_dir.as_deref()).await;
        }
    })
}
