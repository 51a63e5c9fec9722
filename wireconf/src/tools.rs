// Host tool runner

//! External tool resolution and bounded execution
//!
//! Every host command goes through [`ToolRunner`]: the executable is resolved
//! once (process `PATH` first, then a fixed list of common install locations
//! verified by actually running them) and cached; every invocation is bounded
//! by a timeout and the child is killed when it expires.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Bound for the `--version` probe of fallback candidates
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Common installation locations tried when a tool is not on `PATH`
fn fallback_locations(tool: &str) -> &'static [&'static str] {
    match tool {
        "wg" => &["/usr/bin/wg", "/bin/wg", "/usr/local/bin/wg"],
        "wg-quick" => &["/usr/bin/wg-quick", "/bin/wg-quick", "/usr/local/bin/wg-quick"],
        "ip" => &["/usr/sbin/ip", "/sbin/ip", "/usr/bin/ip", "/bin/ip"],
        "iptables" => &["/usr/sbin/iptables", "/sbin/iptables"],
        "systemctl" => &["/usr/bin/systemctl", "/bin/systemctl"],
        "sh" => &["/bin/sh", "/usr/bin/sh"],
        _ => &[],
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// First executable `tool` in `dirs`
fn search_dirs<I: IntoIterator<Item = PathBuf>>(dirs: I, tool: &str) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

/// Search the process `PATH` for `tool`
fn search_path(tool: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    search_dirs(std::env::split_paths(&path), tool)
}

/// Check that a fallback candidate actually runs.
/// Some tools exit 1 for `--version`, so both 0 and 1 count.
async fn probe(candidate: &Path) -> bool {
    let child = Command::new(candidate)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(PROBE_TIMEOUT, child).await {
        Ok(Ok(status)) => matches!(status.code(), Some(0) | Some(1)),
        _ => false,
    }
}

/// Resolves and runs host tools with a per-call timeout
#[derive(Debug)]
pub struct ToolRunner {
    cache: Mutex<HashMap<String, PathBuf>>,
    timeout: Duration,
    /// Replaces `PATH` and the fallback locations when set
    dirs: Option<Vec<PathBuf>>,
}

impl ToolRunner {
    /// Create a runner bounding every invocation by `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            timeout,
            dirs: None,
        }
    }

    /// Create a runner that only looks for tools in `dirs`
    pub fn with_search_dirs(timeout: Duration, dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs: Some(dirs),
            ..Self::new(timeout)
        }
    }

    fn cached(&self, tool: &str) -> Option<PathBuf> {
        self.cache.lock().ok()?.get(tool).cloned()
    }

    fn remember(&self, tool: &str, path: &Path) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(tool.to_string(), path.to_path_buf());
        }
    }

    /// Absolute path of `tool`, or [`Error::ToolNotFound`]
    pub async fn resolve(&self, tool: &str) -> Result<PathBuf> {
        if let Some(path) = self.cached(tool) {
            return Ok(path);
        }

        if let Some(dirs) = &self.dirs {
            let path = search_dirs(dirs.iter().cloned(), tool).ok_or_else(|| Error::ToolNotFound {
                tool: tool.to_string(),
            })?;
            self.remember(tool, &path);
            return Ok(path);
        }

        if let Some(path) = search_path(tool) {
            log::debug!("Resolved {} via PATH: {}", tool, path.display());
            self.remember(tool, &path);
            return Ok(path);
        }

        for candidate in fallback_locations(tool) {
            let candidate = Path::new(candidate);
            if probe(candidate).await {
                log::debug!("Resolved {} via fallback: {}", tool, candidate.display());
                self.remember(tool, candidate);
                return Ok(candidate.to_path_buf());
            }
        }

        Err(Error::ToolNotFound {
            tool: tool.to_string(),
        })
    }

    /// Drop every cached resolution
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Run `tool` and return its output regardless of exit status
    pub async fn output(&self, tool: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Output> {
        let program = self.resolve(tool).await?;
        self.output_program(tool, &program, args, stdin).await
    }

    /// Run `tool` and fail with [`Error::ToolExecutionFailed`] on a non-zero exit
    pub async fn run(&self, tool: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Output> {
        let output = self.output(tool, args, stdin).await?;
        check_status(tool, output)
    }

    /// Run an executable by path (e.g. a generated script), bounded like any tool
    pub async fn run_program(&self, program: &Path, args: &[&str]) -> Result<Output> {
        let label = program.display().to_string();
        let output = self.output_program(&label, program, args, None).await?;
        check_status(&label, output)
    }

    async fn output_program(
        &self,
        label: &str,
        program: &Path,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<Output> {
        log::debug!("Executing: {} {}", program.display(), args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::tool_failed(label, format!("failed to spawn: {}", e)))?;

        let work = async {
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input).await?;
                // close stdin so the tool sees EOF
                drop(pipe);
            }
            child.wait_with_output().await
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Error::tool_failed(label, e.to_string())),
            Err(_) => Err(Error::tool_failed(
                label,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }
}

fn check_status(label: &str, output: Output) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(Error::tool_failed(
        label,
        format!("exited with {}: {}", output.status, stderr.trim()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SH: &str = "/bin/sh";

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let runner = ToolRunner::new(Duration::from_secs(5));
        let err = runner.resolve("definitely-not-a-real-tool-xyz").await.unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { ref tool } if tool == "definitely-not-a-real-tool-xyz"));
    }

    #[tokio::test]
    async fn test_search_dirs_replace_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("wg");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("ip"), "not executable").unwrap();

        let runner = ToolRunner::with_search_dirs(Duration::from_secs(5), vec![dir.path().to_path_buf()]);
        assert_eq!(runner.resolve("wg").await.unwrap(), tool);
        assert!(matches!(runner.resolve("ip").await, Err(Error::ToolNotFound { .. })));
        // no fallback to the host's own copy
        assert!(matches!(runner.resolve("sh").await, Err(Error::ToolNotFound { .. })));
    }

    #[tokio::test]
    async fn test_resolution_is_cached() {
        let runner = ToolRunner::new(Duration::from_secs(5));
        runner.remember("wg", Path::new("/opt/custom/wg"));
        assert_eq!(runner.resolve("wg").await.unwrap(), PathBuf::from("/opt/custom/wg"));

        runner.clear_cache();
        assert!(runner.cached("wg").is_none());
    }

    #[tokio::test]
    async fn test_run_program_reports_failure() {
        let runner = ToolRunner::new(Duration::from_secs(5));

        let output = runner.run_program(Path::new(SH), &["-c", "echo apply"]).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "apply");

        let err = runner
            .run_program(Path::new(SH), &["-c", "echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            Error::ToolExecutionFailed { reason, .. } => assert!(reason.contains("boom")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hanging_tool_times_out() {
        let runner = ToolRunner::new(Duration::from_millis(200));

        let err = runner
            .run_program(Path::new(SH), &["-c", "sleep 30"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolExecutionFailed { ref reason, .. } if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn test_stdin_is_piped() {
        let runner = ToolRunner::new(Duration::from_secs(5));
        runner.remember("sh", Path::new(SH));

        let output = runner.run("sh", &["-c", "cat"], Some(b"hello")).await.unwrap();
        assert_eq!(output.stdout, b"hello");
    }
}
