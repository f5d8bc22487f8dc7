//! Execute a catalog check under a timeout.
use crate::error::{GateError, Result};
use crate::scope::CheckSpec;
use crate::util::{duration_ms, truncate_bytes};
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Exit code recorded for a check killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What a single check execution produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckRun {
    pub check: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Combined stdout and stderr, capped.
    pub output: String,
}

impl CheckRun {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Run `check.command` through `sh -c` in `repo`.
///
/// Output goes to an unlinked temp file rather than pipes so a chatty check
/// cannot block on a full pipe while we poll for its exit.
pub fn run_check(
    check: &CheckSpec,
    repo: &Path,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<CheckRun> {
    let mut capture = tempfile::tempfile().map_err(|err| GateError::io(repo, err))?;
    let stdout = capture.try_clone().map_err(|err| GateError::io(repo, err))?;
    let stderr = capture.try_clone().map_err(|err| GateError::io(repo, err))?;

    let start = Instant::now();
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&check.command)
        .current_dir(repo)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|err| GateError::io(repo, err))?;
    tracing::debug!(check = %check.name, pid = child.id(), "check started");

    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait().map_err(|err| GateError::io(repo, err))? {
            break Some(status);
        }
        if start.elapsed() >= timeout {
            timed_out = true;
            // The child may exit between try_wait and kill.
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        std::thread::sleep(POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())));
    };
    let duration_ms = duration_ms(start.elapsed());

    let mut bytes = Vec::new();
    capture
        .seek(SeekFrom::Start(0))
        .and_then(|_| capture.read_to_end(&mut bytes))
        .map_err(|err| GateError::io(repo, err))?;

    let exit_code = match status {
        Some(status) => status.code().unwrap_or(-1),
        None => TIMEOUT_EXIT_CODE,
    };
    if timed_out {
        tracing::warn!(check = %check.name, duration_ms, "check timed out");
    } else {
        tracing::info!(check = %check.name, exit_code, duration_ms, "check finished");
    }
    Ok(CheckRun {
        check: check.name.clone(),
        exit_code,
        timed_out,
        duration_ms,
        output: truncate_bytes(&bytes, max_output_bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str) -> CheckSpec {
        CheckSpec {
            name: "probe".to_string(),
            inputs: vec!["**".to_string()],
            command: command.to_string(),
            timeout_secs: None,
            checklist: None,
        }
    }

    #[test]
    fn captures_exit_code_and_combined_output() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let run = run_check(
            &spec("echo out; echo err >&2; exit 3"),
            dir.path(),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert_eq!(run.exit_code, 3);
        assert!(!run.timed_out);
        assert!(!run.passed());
        assert!(run.output.contains("out"));
        assert!(run.output.contains("err"));
    }

    #[test]
    fn kills_checks_past_their_timeout() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let run = run_check(
            &spec("sleep 5"),
            dir.path(),
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(run.timed_out);
        assert_eq!(run.exit_code, TIMEOUT_EXIT_CODE);
        assert!(run.duration_ms < 5_000);
    }

    #[test]
    fn output_is_truncated() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let run = run_check(
            &spec("printf 'abcdefghij'"),
            dir.path(),
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert!(run.passed());
        assert_eq!(run.output, "abcd");
    }
}
