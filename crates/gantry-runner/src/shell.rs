//! Shell-based job execution on the host.

use crate::artifacts::{collect_reports, verify_paths};
use crate::runner::{ExecutorConfig, OutputLine, OutputStream};
use async_trait::async_trait;
use gantry_core::ids::InstanceKey;
use gantry_core::ports::{CancelSignal, JobExecutor, JobOutcome, JobRequest};
use gantry_core::{Error, Result};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Environment variable carrying upstream artifact records as JSON.
pub const UPSTREAM_ARTIFACTS_VAR: &str = "GANTRY_UPSTREAM_ARTIFACTS";

/// Exit code reported for a script stopped by cancellation.
pub const CANCELED_EXIT_CODE: i32 = 130;

/// Runs each script line with `sh -c` in the workspace.
pub struct ShellExecutor {
    config: ExecutorConfig,
    output_tx: Option<mpsc::Sender<OutputLine>>,
}

enum LineResult {
    Exited(i32),
    Canceled,
}

impl ShellExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            output_tx: None,
        }
    }

    /// Stream script output to `tx` in addition to the log.
    pub fn with_output(mut self, tx: mpsc::Sender<OutputLine>) -> Self {
        self.output_tx = Some(tx);
        self
    }

    fn environment(&self, request: &JobRequest) -> Result<HashMap<String, String>> {
        let mut env: HashMap<String, String> = if self.config.inherit_env {
            std::env::vars().collect()
        } else {
            HashMap::new()
        };
        env.extend(request.variables.clone());
        env.insert(
            "CI_JOB_ATTEMPT".to_string(),
            request.attempt.to_string(),
        );
        if !request.upstream_artifacts.is_empty() {
            env.insert(
                UPSTREAM_ARTIFACTS_VAR.to_string(),
                serde_json::to_string(&request.upstream_artifacts)?,
            );
        }
        Ok(env)
    }

    async fn run_line(
        &self,
        key: &InstanceKey,
        line: &str,
        env: &HashMap<String, String>,
        cancel: &mut CancelSignal,
    ) -> Result<LineResult> {
        info!(key = %key, command = %line, workspace = %self.config.workspace.display(), "Executing shell command");

        let mut command = Command::new(&self.config.shell);
        command
            .arg("-c")
            .arg(line)
            .current_dir(&self.config.workspace)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancellation reaches everything the line forks.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn process: {}", e)))?;
        let mut group = ProcessGroup(child.id());

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(stream_lines(out, key.clone(), OutputStream::Stdout, self.output_tx.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(stream_lines(err, key.clone(), OutputStream::Stderr, self.output_tx.clone())));

        let result = tokio::select! {
            status = child.wait() => {
                let status = status
                    .map_err(|e| Error::Internal(format!("Failed to wait for process: {}", e)))?;
                LineResult::Exited(status.code().unwrap_or(-1))
            }
            _ = wait_for_cancel(cancel) => {
                warn!(key = %key, "Cancel requested, killing process group");
                group.kill();
                let _ = child.kill().await;
                LineResult::Canceled
            }
        };

        let pumps = [stdout, stderr].into_iter().flatten();
        match &result {
            LineResult::Exited(_) => {
                for handle in pumps {
                    let _ = handle.await;
                }
                group.release();
            }
            // A process that left the group may still hold the pipes open.
            LineResult::Canceled => pumps.for_each(|handle| handle.abort()),
        }
        Ok(result)
    }

    /// Run lines in order until one fails. Returns the first non-zero exit code.
    async fn run_lines(
        &self,
        key: &InstanceKey,
        lines: &[String],
        env: &HashMap<String, String>,
        cancel: &mut CancelSignal,
    ) -> Result<LineResult> {
        for line in lines {
            match self.run_line(key, line, env, cancel).await? {
                LineResult::Exited(0) => {}
                other => return Ok(other),
            }
        }
        Ok(LineResult::Exited(0))
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

#[async_trait]
impl JobExecutor for ShellExecutor {
    async fn execute(&self, request: JobRequest, mut cancel: CancelSignal) -> Result<JobOutcome> {
        let env = self.environment(&request)?;
        let key = &request.key;

        let main: Vec<String> = request
            .before_script
            .iter()
            .chain(request.script.iter())
            .cloned()
            .collect();
        let result = self.run_lines(key, &main, &env, &mut cancel).await?;

        if !request.after_script.is_empty() && !*cancel.borrow() {
            // after_script outcome never changes the job result.
            match self.run_lines(key, &request.after_script, &env, &mut cancel).await {
                Ok(LineResult::Exited(0)) => {}
                Ok(LineResult::Exited(code)) => {
                    warn!(key = %key, exit_code = code, "after_script failed")
                }
                Ok(LineResult::Canceled) => debug!(key = %key, "after_script canceled"),
                Err(e) => warn!(key = %key, error = %e, "after_script failed"),
            }
        }

        let exit_code = match result {
            LineResult::Exited(code) => code,
            LineResult::Canceled => return Ok(JobOutcome::exit(CANCELED_EXIT_CODE)),
        };

        let mut outcome = JobOutcome::exit(exit_code);
        if exit_code == 0 {
            let scan = verify_paths(&self.config.workspace, &request.artifacts.paths)?;
            outcome.artifacts = scan.found;
            outcome.missing_artifacts = scan.missing;
        }
        outcome.reports = collect_reports(&self.config.workspace, &request.artifacts.reports)?;

        debug!(key = %key, exit_code, artifacts = outcome.artifacts.len(), "Job scripts completed");
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "shell"
    }
}

/// Kills a script's process group when dropped, unless released first.
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pid) = self.0.take() {
            kill_group(pid);
        }
    }

    fn release(&mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) only takes integers; a negative pid addresses the group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, "Process group already exited");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

async fn stream_lines<R>(
    reader: R,
    key: InstanceKey,
    stream: OutputStream,
    tx: Option<mpsc::Sender<OutputLine>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut line_number = 0u32;

    while let Ok(Some(content)) = lines.next_line().await {
        line_number += 1;
        debug!(key = %key, stream = ?stream, line = %content, "output");
        if let Some(tx) = &tx {
            let output = OutputLine {
                key: key.clone(),
                stream,
                content,
                line_number,
                timestamp: chrono::Utc::now(),
            };
            if tx.send(output).await.is_err() {
                break;
            }
        }
    }
}

async fn wait_for_cancel(cancel: &mut CancelSignal) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ids::RunId;
    use gantry_core::pipeline::ArtifactConfig;
    use gantry_core::ports::ArtifactRecord;
    use indexmap::IndexMap;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::watch;

    fn request(script: &[&str]) -> JobRequest {
        JobRequest {
            run_id: RunId::new(),
            key: InstanceKey::new("build"),
            job_name: "build".to_string(),
            stage: None,
            attempt: 1,
            variables: IndexMap::new(),
            before_script: Vec::new(),
            script: script.iter().map(|s| s.to_string()).collect(),
            after_script: Vec::new(),
            artifacts: ArtifactConfig::default(),
            upstream_artifacts: Vec::new(),
            timeout: None,
        }
    }

    fn executor(dir: &TempDir) -> ShellExecutor {
        ShellExecutor::new(ExecutorConfig::in_workspace(dir.path()))
    }

    fn never_canceled() -> (watch::Sender<bool>, CancelSignal) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_success_streams_output() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let executor = executor(&dir).with_output(tx);
        let (_keep, cancel) = never_canceled();

        let outcome = executor.execute(request(&["echo hello"]), cancel).await.unwrap();
        assert!(outcome.is_success());

        let line = rx.recv().await.unwrap();
        assert_eq!(line.content, "hello");
        assert_eq!(line.stream, OutputStream::Stdout);
        assert_eq!(line.key.as_str(), "build");
    }

    #[tokio::test]
    async fn test_stops_at_first_failure_and_runs_after_script() {
        let dir = TempDir::new().unwrap();
        let mut req = request(&["exit 3", "touch never"]);
        req.after_script = vec!["touch cleaned".to_string()];
        let (_keep, cancel) = never_canceled();

        let outcome = executor(&dir).execute(req, cancel).await.unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!dir.path().join("never").exists());
        assert!(dir.path().join("cleaned").exists());
    }

    #[tokio::test]
    async fn test_variables_and_upstream_artifacts_in_env() {
        let dir = TempDir::new().unwrap();
        let mut req = request(&[
            "printf '%s' \"$TARGET\" > target.txt",
            "printf '%s' \"$GANTRY_UPSTREAM_ARTIFACTS\" > upstream.json",
        ]);
        req.variables.insert("TARGET".to_string(), "x86_64".to_string());
        req.upstream_artifacts = vec![ArtifactRecord {
            instance: InstanceKey::new("compile"),
            paths: vec!["dist/app".to_string()],
        }];
        let (_keep, cancel) = never_canceled();

        let outcome = executor(&dir).execute(req, cancel).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(fs::read_to_string(dir.path().join("target.txt")).unwrap(), "x86_64");

        let upstream: Vec<ArtifactRecord> =
            serde_json::from_str(&fs::read_to_string(dir.path().join("upstream.json")).unwrap())
                .unwrap();
        assert_eq!(upstream[0].instance.as_str(), "compile");
    }

    #[tokio::test]
    async fn test_artifacts_verified_after_success() {
        let dir = TempDir::new().unwrap();
        let mut req = request(&["mkdir -p dist && touch dist/app"]);
        req.artifacts.paths = vec!["dist/app".to_string(), "dist/app.sig".to_string()];
        let (_keep, cancel) = never_canceled();

        let outcome = executor(&dir).execute(req, cancel).await.unwrap();
        assert_eq!(outcome.artifacts, vec!["dist/app"]);
        assert_eq!(outcome.missing_artifacts, vec!["dist/app.sig"]);
    }

    #[tokio::test]
    async fn test_cancel_kills_running_script() {
        let dir = TempDir::new().unwrap();
        let (tx, cancel) = watch::channel(false);
        let executor = executor(&dir);

        let handle = tokio::spawn(async move { executor.execute(request(&["sleep 30"]), cancel).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome.exit_code, CANCELED_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_cancel_reaches_background_children() {
        let dir = TempDir::new().unwrap();
        let (tx, cancel) = watch::channel(false);
        let executor = executor(&dir);
        let script = ["(sleep 1 && touch leaked) & sleep 30"];

        let handle = tokio::spawn(async move { executor.execute(request(&script), cancel).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome.exit_code, CANCELED_EXIT_CODE);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("leaked").exists());
    }
}
