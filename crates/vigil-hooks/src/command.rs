//! Command execution abstraction

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        }
    }
}

/// Why a command produced no output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("failed to launch: {0}")]
    Spawn(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

/// Trait for running external commands (allows mocking in tests)
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` (program followed by args) in `cwd`.
    ///
    /// Implementations must stop the process when `timeout` elapses or
    /// `cancel` fires.
    async fn run(
        &self,
        command: &[String],
        cwd: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunError>;
}

/// Real subprocess runner
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    #[instrument(skip(self, cancel), fields(cwd = %cwd.display()))]
    async fn run(
        &self,
        command: &[String],
        cwd: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| RunError::Spawn("empty command".to_string()))?;

        debug!("Executing {} {:?}", program, args);

        let child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunError::Spawn(format!("{}: {}", program, e)))?;

        // Dropping the wait future drops the child, which kills it.
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output.map_err(|e| RunError::Spawn(format!("{}: {}", program, e)))?;
                Ok(CommandOutput::from(output))
            }
            _ = tokio::time::sleep(timeout) => {
                debug!("{} timed out after {:?}", program, timeout);
                Err(RunError::Timeout(timeout))
            }
            _ = cancel.cancelled() => {
                debug!("{} cancelled", program);
                Err(RunError::Cancelled)
            }
        }
    }
}

/// Scripted response for [`MockRunner`]
#[derive(Debug, Clone)]
pub enum MockResponse {
    Output(CommandOutput),
    /// Output delivered after a delay (honours timeout and cancellation)
    Delayed(Duration, CommandOutput),
    SpawnError(String),
}

impl MockResponse {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::Output(CommandOutput::new(stdout, "", 0))
    }

    pub fn fail(stdout: impl Into<String>) -> Self {
        Self::Output(CommandOutput::new(stdout, "", 1))
    }
}

/// Mock runner for testing.
///
/// Responses are queued per command line (`args.join(" ")`). Each call pops
/// the next response; the last one repeats once the queue is drained.
#[derive(Default)]
pub struct MockRunner {
    responses: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, command: &str, response: MockResponse) -> Self {
        self.push(command, response);
        self
    }

    pub fn with_sequence(self, command: &str, responses: Vec<MockResponse>) -> Self {
        for response in responses {
            self.push(command, response);
        }
        self
    }

    pub fn push(&self, command: &str, response: MockResponse) {
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        responses
            .entry(command.to_string())
            .or_default()
            .push_back(response);
    }

    /// Command lines run so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == command).count()
    }

    /// Highest number of commands observed running at once
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_response(&self, key: &str) -> Option<MockResponse> {
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        let queue = responses.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        command: &[String],
        _cwd: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunError> {
        let key = command.join(" ");
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.clone());

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let response = self
            .next_response(&key)
            .ok_or_else(|| RunError::Spawn(format!("No mock response for: {}", key)))?;

        match response {
            MockResponse::Output(output) => {
                // Yield so concurrently scheduled mocks overlap
                tokio::task::yield_now().await;
                Ok(output)
            }
            MockResponse::SpawnError(msg) => Err(RunError::Spawn(msg)),
            MockResponse::Delayed(delay, output) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay.min(timeout)) => {
                        if delay > timeout {
                            Err(RunError::Timeout(timeout))
                        } else {
                            Ok(output)
                        }
                    }
                    _ = cancel.cancelled() => Err(RunError::Cancelled),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_combined_output() {
        assert_eq!(CommandOutput::new("out\n", "", 0).combined(), "out");
        assert_eq!(CommandOutput::new("", "err\n", 1).combined(), "err");
        assert_eq!(CommandOutput::new("out", "err", 1).combined(), "out\nerr");
    }

    #[tokio::test]
    async fn test_mock_sequence_repeats_last() {
        let runner = MockRunner::new().with_sequence(
            "zuban check",
            vec![MockResponse::fail("first"), MockResponse::ok("second")],
        );
        let cancel = CancellationToken::new();
        let command = cmd(&["zuban", "check"]);
        let timeout = Duration::from_secs(5);

        let first = runner
            .run(&command, Path::new("."), timeout, &cancel)
            .await
            .unwrap();
        assert_eq!(first.stdout, "first");
        assert!(!first.success());

        for _ in 0..2 {
            let next = runner
                .run(&command, Path::new("."), timeout, &cancel)
                .await
                .unwrap();
            assert_eq!(next.stdout, "second");
        }
        assert_eq!(runner.call_count("zuban check"), 3);
    }

    #[tokio::test]
    async fn test_mock_missing_response_is_spawn_error() {
        let runner = MockRunner::new();
        let result = runner
            .run(
                &cmd(&["nope"]),
                Path::new("."),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(RunError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_mock_delay_times_out() {
        let runner = MockRunner::new().with_response(
            "slow",
            MockResponse::Delayed(Duration::from_secs(10), CommandOutput::default()),
        );
        let result = runner
            .run(
                &cmd(&["slow"]),
                Path::new("."),
                Duration::from_millis(20),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(RunError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_process_runner_missing_binary() {
        let runner = ProcessRunner::new();
        let result = runner
            .run(
                &cmd(&["vigil-definitely-not-installed-binary"]),
                Path::new("."),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(RunError::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let runner = ProcessRunner::new();
        let output = runner
            .run(
                &cmd(&["sh", "-c", "echo hello; echo oops >&2; exit 3"]),
                Path::new("."),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_timeout_and_cancel() {
        let runner = ProcessRunner::new();
        let result = runner
            .run(
                &cmd(&["sleep", "5"]),
                Path::new("."),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(RunError::Timeout(_))));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = runner
            .run(
                &cmd(&["sleep", "5"]),
                Path::new("."),
                Duration::from_secs(10),
                &cancel,
            )
            .await;
        assert_eq!(result, Err(RunError::Cancelled));
    }
}
