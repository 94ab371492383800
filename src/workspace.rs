//! Per-task session workspaces.
//!
//! Every task owns one directory under the workspace root, named after its
//! task id:
//! - `input.<ext>`: the uploaded document
//! - the produced output file
//! - `conversion.log`: per-task log kept open for the task's lifetime
//! - `scratch/`: converter-private intermediate files
//!
//! Teardown is best-effort and never returns an error: whatever cannot be
//! removed is logged and reported in a [`DestroyReport`].

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{CleanupError, WorkspaceError};

/// Well-known workspace file names.
pub mod paths {
    pub const TASK_LOG: &str = "conversion.log";
    pub const SCRATCH: &str = "scratch";
    pub const INPUT_STEM: &str = "input";
}

/// How long `destroy` waits for in-flight downloads or conversions.
const LEASE_WAIT: Duration = Duration::from_secs(30);

/// Shared read access to a workspace; `destroy` waits until all leases drop.
pub type WorkspaceLease<'a> = RwLockReadGuard<'a, ()>;

/// Filesystem primitives used by teardown.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Remover {
    /// Remove a whole tree in one call.
    pub(crate) tree: fn(&Path) -> std::io::Result<()>,
    /// Remove a single entry; the flag says whether it is a directory.
    pub(crate) entry: fn(&Path, bool) -> std::io::Result<()>,
}

impl Default for Remover {
    fn default() -> Self {
        Self {
            tree: |path| std::fs::remove_dir_all(path),
            entry: |path, is_dir| {
                if is_dir {
                    std::fs::remove_dir(path)
                } else {
                    std::fs::remove_file(path)
                }
            },
        }
    }
}

/// Allocates and sweeps session workspaces under a common root.
pub struct WorkspaceManager {
    root: PathBuf,
    remover: Remover,
}

impl WorkspaceManager {
    /// Create a manager rooted at `root`. Nothing is created on disk yet.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            remover: Remover::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_remover(mut self, remover: Remover) -> Self {
        self.remover = remover;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the workspace root exists.
    pub async fn ensure_root(&self) -> Result<(), WorkspaceError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Allocate the workspace for `task_id`.
    ///
    /// The directory name is the task id itself, and the leaf is created with
    /// `create_dir` so an existing directory is reported instead of shared.
    pub async fn create(&self, task_id: Uuid) -> Result<SessionWorkspace, WorkspaceError> {
        fs::create_dir_all(&self.root).await?;
        let dir = self.root.join(task_id.to_string());
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::AlreadyExists(dir));
            }
            Err(e) => return Err(e.into()),
        }
        debug!(task_id = %task_id, path = %dir.display(), "Workspace created");
        Ok(SessionWorkspace::new(task_id, dir, self.remover))
    }

    /// Destroy workspace directories older than `max_age` that no live task owns.
    ///
    /// Returns the number of directories swept.
    pub async fn sweep_stale(&self, max_age: Duration, live: &HashSet<Uuid>) -> usize {
        let mut read_dir = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(root = %self.root.display(), error = %e, "Cannot scan workspace root");
                }
                return 0;
            }
        };

        let mut swept = 0;
        loop {
            let entry = match read_dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Workspace scan interrupted");
                    break;
                }
            };
            let path = entry.path();
            if let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| Uuid::parse_str(n).ok())
                && live.contains(&id)
            {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }

            info!(path = %path.display(), age_secs = age.as_secs(), "Sweeping stale workspace");
            let report = remove_tree(&path, self.remover).await;
            if !report.is_clean() {
                warn!(path = %path.display(), leftovers = report.failures.len(), "Stale workspace only partially removed");
            }
            swept += 1;
        }
        swept
    }
}

/// One task's isolated directory.
pub struct SessionWorkspace {
    task_id: Uuid,
    root: PathBuf,
    log: Mutex<Option<File>>,
    busy: RwLock<()>,
    remover: Remover,
}

impl std::fmt::Debug for SessionWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWorkspace")
            .field("task_id", &self.task_id)
            .field("root", &self.root)
            .finish()
    }
}

impl SessionWorkspace {
    fn new(task_id: Uuid, root: PathBuf, remover: Remover) -> Self {
        Self {
            task_id,
            root,
            log: Mutex::new(None),
            busy: RwLock::new(()),
            remover,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `relative` inside the workspace.
    ///
    /// `.` and `..` are resolved lexically; absolute paths and anything that
    /// climbs above the workspace root are rejected.
    pub fn path(&self, relative: impl AsRef<Path>) -> Result<PathBuf, WorkspaceError> {
        let relative = relative.as_ref();
        let mut resolved = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() {
                        return Err(WorkspaceError::PathEscape(relative.display().to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(WorkspaceError::PathEscape(relative.display().to_string()));
                }
            }
        }
        Ok(self.root.join(resolved))
    }

    /// Write `content` to `relative`, creating parent directories.
    pub async fn write(
        &self,
        relative: impl AsRef<Path>,
        content: &[u8],
    ) -> Result<PathBuf, WorkspaceError> {
        let full_path = self.path(relative)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full_path, content).await?;
        Ok(full_path)
    }

    /// Create (if needed) and return a converter-private scratch directory.
    pub async fn scratch_dir(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let dir = self.path(Path::new(paths::SCRATCH).join(name))?;
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Open the per-task log. The handle stays open until `destroy`.
    pub fn open_log(&self) -> Result<(), WorkspaceError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(paths::TASK_LOG))?;
        *self.lock_log() = Some(file);
        Ok(())
    }

    /// Append a timestamped line to the per-task log, if it is open.
    pub fn log(&self, line: impl AsRef<str>) {
        let mut guard = self.lock_log();
        if let Some(file) = guard.as_mut()
            && let Err(e) = writeln!(file, "{} {}", Utc::now().to_rfc3339(), line.as_ref())
        {
            debug!(task_id = %self.task_id, error = %e, "Task log write failed");
        }
    }

    /// Take a shared lease; held across a download or a conversion.
    pub async fn lease(&self) -> WorkspaceLease<'_> {
        self.busy.read().await
    }

    /// Remove the whole workspace.
    ///
    /// Waits for outstanding leases, closes the task log, then removes the
    /// tree. If whole-tree removal fails, entries are removed one at a time
    /// and the ones that still fail are skipped. Never returns an error and
    /// is safe to call repeatedly.
    pub async fn destroy(&self) -> DestroyReport {
        let _exclusive = match tokio::time::timeout(LEASE_WAIT, self.busy.write()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(task_id = %self.task_id, "Workspace still leased, destroying anyway");
                None
            }
        };

        self.close_log();

        let report = remove_tree(&self.root, self.remover).await;
        if report.is_clean() {
            info!(task_id = %self.task_id, "Workspace destroyed");
        } else {
            warn!(
                task_id = %self.task_id,
                leftovers = report.failures.len(),
                "Workspace partially left on disk"
            );
        }
        report
    }

    fn close_log(&self) {
        if let Some(mut file) = self.lock_log().take() {
            if let Err(e) = file.flush() {
                debug!(task_id = %self.task_id, error = %e, "Task log flush failed");
            }
        }
    }

    fn lock_log(&self) -> MutexGuard<'_, Option<File>> {
        match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!(task_id = %self.task_id, "Task log mutex poisoned");
                poisoned.into_inner()
            }
        }
    }
}

/// Outcome of a best-effort teardown.
#[derive(Debug)]
pub struct DestroyReport {
    pub root: PathBuf,
    /// The directory no longer exists.
    pub fully_removed: bool,
    /// Entries that could not be removed.
    pub failures: Vec<CleanupError>,
}

impl DestroyReport {
    pub fn is_clean(&self) -> bool {
        self.fully_removed && self.failures.is_empty()
    }
}

/// Remove `path` and everything below it, falling back to per-entry deletion.
async fn remove_tree(path: &Path, remover: Remover) -> DestroyReport {
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || remover.remove(&owned)).await {
        Ok(report) => report,
        Err(join_err) => {
            error!(path = %path.display(), error = %join_err, "Removal task died");
            DestroyReport {
                root: path.to_path_buf(),
                fully_removed: false,
                failures: Vec::new(),
            }
        }
    }
}

impl Remover {
    fn remove(&self, root: &Path) -> DestroyReport {
        match (self.tree)(root) {
            Ok(()) => DestroyReport {
                root: root.to_path_buf(),
                fully_removed: true,
                failures: Vec::new(),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DestroyReport {
                root: root.to_path_buf(),
                fully_removed: true,
                failures: Vec::new(),
            },
            Err(e) => {
                warn!(path = %root.display(), error = %e, "Tree removal failed, removing entries one at a time");
                self.remove_entries(root)
            }
        }
    }

    fn remove_entries(&self, root: &Path) -> DestroyReport {
        let mut failures = Vec::new();

        for entry in WalkDir::new(root).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                    let failure = CleanupError { path, source };
                    warn!(error = %failure, "Skipping unreadable entry");
                    failures.push(failure);
                    continue;
                }
            };

            if let Err(source) = (self.entry)(entry.path(), entry.file_type().is_dir()) {
                let failure = CleanupError {
                    path: entry.path().to_path_buf(),
                    source,
                };
                warn!(error = %failure, "Skipping entry that could not be removed");
                failures.push(failure);
            }
        }

        DestroyReport {
            root: root.to_path_buf(),
            fully_removed: !root.exists(),
            failures,
        }
    }
}
