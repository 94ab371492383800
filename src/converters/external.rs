//! Runs external conversion CLIs.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ConversionError;
use crate::workspace::SessionWorkspace;

/// Maximum stderr kept in an error message (4KB).
const MAX_STDERR_SIZE: usize = 4 * 1024;

/// One external program with a run timeout.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    program: String,
    timeout: Duration,
}

impl ExternalTool {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether the program can be found on `PATH` (or at its explicit path).
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    /// Run the program in `workdir` and return its stdout.
    ///
    /// stderr is appended to the task log. The child is killed if it outlives
    /// the timeout.
    pub async fn run<I, S>(
        &self,
        args: I,
        workdir: &Path,
        workspace: &SessionWorkspace,
    ) -> Result<String, ConversionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = which::which(&self.program).map_err(|_| ConversionError::ToolUnavailable {
            tool: self.program.clone(),
        })?;

        let mut command = Command::new(&program);
        command
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(tool = %self.program, workdir = %workdir.display(), "Spawning external tool");
        workspace.log(format!("running {}", self.program));

        let child = command.spawn()?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // Dropping the wait future kills the child.
                warn!(tool = %self.program, timeout = ?self.timeout, "External tool timed out");
                workspace.log(format!("{} timed out after {:?}", self.program, self.timeout));
                return Err(ConversionError::Timeout {
                    tool: self.program.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            workspace.log(format!("{} stderr:\n{}", self.program, stderr.trim_end()));
        }

        if !output.status.success() {
            return Err(ConversionError::ToolFailed {
                tool: self.program.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: truncate_stderr(stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Keep the tail of stderr, where tools usually print the actual error.
fn truncate_stderr(s: &str) -> String {
    if s.len() <= MAX_STDERR_SIZE {
        return s.to_string();
    }
    let mut start = s.len() - MAX_STDERR_SIZE;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceManager;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn workspace() -> (SessionWorkspace, TempDir) {
        let dir = TempDir::new().unwrap();
        let ws = WorkspaceManager::new(dir.path().to_path_buf())
            .create(Uuid::new_v4())
            .await
            .unwrap();
        ws.open_log().unwrap();
        (ws, dir)
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let (ws, _dir) = workspace().await;
        let tool = ExternalTool::new("docconv-no-such-tool", Duration::from_secs(5));
        assert!(!tool.is_available());

        let err = tool.run(["--version"], ws.root(), &ws).await.unwrap_err();
        assert!(matches!(err, ConversionError::ToolUnavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout() {
        let (ws, _dir) = workspace().await;
        let tool = ExternalTool::new("sh", Duration::from_secs(5));
        let out = tool.run(["-c", "echo hello"], ws.root(), &ws).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let (ws, _dir) = workspace().await;
        let tool = ExternalTool::new("sh", Duration::from_secs(5));
        let err = tool
            .run(["-c", "echo broken >&2; exit 3"], ws.root(), &ws)
            .await
            .unwrap_err();
        match err {
            ConversionError::ToolFailed { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let log = std::fs::read_to_string(ws.root().join("conversion.log")).unwrap();
        assert!(log.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_times_out() {
        let (ws, _dir) = workspace().await;
        let tool = ExternalTool::new("sleep", Duration::from_millis(100));
        let err = tool.run(["5"], ws.root(), &ws).await.unwrap_err();
        assert!(matches!(err, ConversionError::Timeout { .. }));
    }

    #[test]
    fn truncate_keeps_tail() {
        let long = format!("{}END", "x".repeat(MAX_STDERR_SIZE * 2));
        let out = truncate_stderr(&long);
        assert!(out.starts_with("..."));
        assert!(out.ends_with("END"));
        assert!(out.len() <= MAX_STDERR_SIZE + 3);
    }
}
