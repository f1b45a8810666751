//! Docker container runtime for agent execution.
//!
//! Lifecycle per invocation: ensure the image exists locally (pull if
//! absent), create a one-shot container with a unique name, start it,
//! follow its demultiplexed log stream, wait for exit under the
//! wall-clock budget, harvest the git side-channel file, and always
//! force-remove the container before returning.
//!
//! Structured events ride the stderr channel: every line beginning with
//! `{` is parsed as JSON, stamped with a millisecond timestamp, and
//! handed to the event callback. Non-JSON lines and parse failures are
//! ignored.

use crate::adapter::{ExecuteOptions, Executor, ExecutorRequest, ExecutorResponse};
use crate::error::AgentError;
use crate::types::GitMetadata;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value as JsonValue};
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Absolute path of the git side-channel file inside the container.
const GIT_METADATA_PATH: &str = "/output/git_metadata.json";

/// Default wall-clock budget for a container run.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Deadline for forced container removal on all return paths.
const REMOVE_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for the kill signal on timeout/cancel.
const KILL_DEADLINE: Duration = Duration::from_secs(10);

/// How long to let the log follower drain after the container stops.
const LOG_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Event lines on stderr are accepted up to this length.
const MAX_EVENT_LINE: usize = 4 * 1024 * 1024;

/// Runs agent tasks inside Docker containers.
pub struct DockerExecutor {
    docker: Docker,
    default_image: String,
    default_timeout: Duration,
}

impl DockerExecutor {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Fails when no daemon is reachable.
    pub fn new(default_image: impl Into<String>) -> Result<Self, AgentError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| AgentError::Runtime {
                message: format!("connect docker: {e}"),
            })?;

        Ok(Self {
            docker,
            default_image: default_image.into(),
            default_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Overrides the default execution timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Pulls the image when it is not present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), AgentError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "pulling agent image");
        let mut pull = Box::pin(self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        ));
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| AgentError::Runtime {
                message: format!("pull image {image}: {e}"),
            })?;
        }

        Ok(())
    }

    /// Starts the container, follows logs, and waits for exit.
    async fn run_container(
        &self,
        name: &str,
        timeout: Duration,
        opts: &ExecuteOptions,
    ) -> Result<(i64, String, String), AgentError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| AgentError::Runtime {
                message: format!("start container: {e}"),
            })?;

        info!(container = name, "started agent container");

        // Follow logs concurrently; the stream ends when the container
        // stops.
        let docker = self.docker.clone();
        let log_name = name.to_string();
        let log_opts = opts.clone();
        let collector = tokio::spawn(async move {
            let mut logs = Box::pin(docker.logs(
                &log_name,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            ));

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut pending_line = Vec::new();

            while let Some(frame) = logs.next().await {
                match frame {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.extend_from_slice(&message);
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.extend_from_slice(&message);
                        scan_event_lines(&mut pending_line, &message, &log_opts);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(container = %log_name, error = %e, "log stream ended");
                        break;
                    }
                }
            }
            emit_event_line(&pending_line, &log_opts);

            (stdout, stderr)
        });

        let mut wait = Box::pin(
            self.docker
                .wait_container(name, None::<WaitContainerOptions<String>>),
        );

        let outcome: Result<i64, AgentError> = tokio::select! {
            waited = wait.next() => match waited {
                Some(Ok(status)) => Ok(status.status_code),
                // Non-zero exits surface as a typed wait error; the exit
                // code still belongs to the caller, not the runtime.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Ok(code)
                }
                Some(Err(e)) => Err(AgentError::Runtime {
                    message: format!("wait container: {e}"),
                }),
                None => Err(AgentError::Runtime {
                    message: "wait stream closed before exit".to_string(),
                }),
            },
            () = tokio::time::sleep(timeout) => {
                self.kill_container(name).await;
                Err(AgentError::Timeout { limit: timeout })
            }
            () = opts.cancel.cancelled() => {
                self.kill_container(name).await;
                Err(AgentError::Cancelled)
            }
        };

        let (stdout, stderr) =
            match tokio::time::timeout(LOG_DRAIN_DEADLINE, collector).await {
                Ok(Ok(buffers)) => buffers,
                _ => (Vec::new(), Vec::new()),
            };

        let exit_code = outcome?;
        Ok((
            exit_code,
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    async fn kill_container(&self, name: &str) {
        let kill = self
            .docker
            .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }));
        if let Err(e) = tokio::time::timeout(KILL_DEADLINE, kill).await {
            warn!(container = name, error = %e, "kill container timed out");
        }
    }

    /// Extracts `/output/git_metadata.json` from the stopped container.
    /// Absence is not an error.
    async fn extract_git_metadata(&self, name: &str) -> Option<GitMetadata> {
        let mut download = Box::pin(self.docker.download_from_container(
            name,
            Some(DownloadFromContainerOptions {
                path: GIT_METADATA_PATH.to_string(),
            }),
        ));

        let mut archive_bytes = Vec::new();
        while let Some(chunk) = download.next().await {
            match chunk {
                Ok(bytes) => archive_bytes.extend_from_slice(&bytes),
                Err(e) => {
                    debug!(container = name, error = %e, "no git metadata in container");
                    return None;
                }
            }
        }

        parse_metadata_archive(&archive_bytes)
    }

    async fn remove_container(&self, name: &str) {
        let remove = self.docker.remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        );
        match tokio::time::timeout(REMOVE_DEADLINE, remove).await {
            Ok(Ok(())) => info!(container = name, "removed agent container"),
            Ok(Err(e)) => warn!(container = name, error = %e, "remove container failed"),
            Err(_) => warn!(container = name, "remove container timed out"),
        }
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn kind(&self) -> &str {
        "docker"
    }

    async fn execute(
        &self,
        req: &ExecutorRequest,
        opts: &ExecuteOptions,
    ) -> Result<ExecutorResponse, AgentError> {
        let image = if req.image.is_empty() {
            self.default_image.clone()
        } else {
            req.image.clone()
        };
        let timeout = if req.timeout.is_zero() {
            self.default_timeout
        } else {
            req.timeout
        };

        self.ensure_image(&image).await?;

        let task_label = req
            .env
            .get("TASK_ID")
            .map(String::as_str)
            .unwrap_or("task");
        let container_name = format!(
            "flowforge-agent-{}-{}",
            task_label,
            Utc::now().timestamp_millis()
        );

        let env_list: Vec<String> = req.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let config = Config {
            image: Some(image.clone()),
            cmd: (!req.command.is_empty()).then(|| req.command.clone()),
            env: Some(env_list),
            working_dir: (!req.work_dir.is_empty()).then(|| req.work_dir.clone()),
            ..Default::default()
        };

        info!(image = %image, container = %container_name, ?timeout, "creating agent container");

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(|e| AgentError::Runtime {
                message: format!("create container: {e}"),
            })?;

        let result = match self.run_container(&container_name, timeout, opts).await {
            Ok((exit_code, stdout, stderr)) => {
                let git_metadata = self.extract_git_metadata(&container_name).await;
                info!(
                    container = %container_name,
                    exit_code,
                    stdout_len = stdout.len(),
                    stderr_len = stderr.len(),
                    "agent container finished"
                );
                Ok(ExecutorResponse {
                    exit_code,
                    stdout,
                    stderr,
                    git_metadata,
                })
            }
            Err(e) => Err(e),
        };

        self.remove_container(&container_name).await;
        result
    }
}

/// Splits stderr bytes into lines, forwarding JSON event lines to the
/// callback. Lines longer than the budget are truncated and therefore
/// fail the JSON parse, which drops them.
fn scan_event_lines(pending: &mut Vec<u8>, chunk: &[u8], opts: &ExecuteOptions) {
    for &byte in chunk {
        if byte == b'\n' {
            emit_event_line(pending, opts);
            pending.clear();
        } else if pending.len() < MAX_EVENT_LINE {
            pending.push(byte);
        }
    }
}

/// Parses one stderr line as a structured event. Lines not beginning
/// with `{`, invalid JSON, and invalid UTF-8 are ignored.
fn emit_event_line(line: &[u8], opts: &ExecuteOptions) {
    let Ok(text) = std::str::from_utf8(line) else {
        return;
    };
    let text = text.trim();
    if !text.starts_with('{') {
        return;
    }
    let Ok(mut value) = serde_json::from_str::<JsonValue>(text) else {
        return;
    };
    if let Some(object) = value.as_object_mut() {
        object
            .entry("timestamp")
            .or_insert_with(|| json!(Utc::now().timestamp_millis()));
    }
    opts.emit(value);
}

/// Finds and parses `git_metadata.json` inside a tar archive downloaded
/// from the container.
fn parse_metadata_archive(archive_bytes: &[u8]) -> Option<GitMetadata> {
    let mut archive = tar::Archive::new(archive_bytes);
    let entries = archive.entries().ok()?;

    for entry in entries {
        let mut entry = entry.ok()?;
        let is_metadata = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|f| f == "git_metadata.json"))
            .unwrap_or(false);
        if !is_metadata {
            continue;
        }

        let mut content = String::new();
        entry.read_to_string(&mut content).ok()?;
        match serde_json::from_str(&content) {
            Ok(metadata) => return Some(metadata),
            Err(e) => {
                debug!(error = %e, "git metadata file is not valid JSON");
                return None;
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn capture_opts() -> (ExecuteOptions, Arc<Mutex<Vec<JsonValue>>>) {
        let events: Arc<Mutex<Vec<JsonValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let opts = ExecuteOptions::new()
            .with_event_callback(Arc::new(move |e| sink.lock().unwrap().push(e)));
        (opts, events)
    }

    #[test]
    fn json_lines_become_events_with_timestamp() {
        let (opts, events) = capture_opts();
        let mut pending = Vec::new();

        scan_event_lines(
            &mut pending,
            b"{\"type\":\"assistant\",\"content\":\"hi\"}\n",
            &opts,
        );

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "assistant");
        assert!(events[0]["timestamp"].is_i64());
    }

    #[test]
    fn existing_timestamp_is_preserved() {
        let (opts, events) = capture_opts();
        let mut pending = Vec::new();

        scan_event_lines(&mut pending, b"{\"type\":\"result\",\"timestamp\":42}\n", &opts);

        assert_eq!(events.lock().unwrap()[0]["timestamp"], 42);
    }

    #[test]
    fn non_json_lines_are_ignored() {
        let (opts, events) = capture_opts();
        let mut pending = Vec::new();

        scan_event_lines(&mut pending, b"plain progress output\n{broken json\n", &opts);

        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn lines_split_across_frames_are_reassembled() {
        let (opts, events) = capture_opts();
        let mut pending = Vec::new();

        scan_event_lines(&mut pending, b"{\"type\":\"tool_use\",\"tool", &opts);
        assert!(events.lock().unwrap().is_empty());
        scan_event_lines(&mut pending, b"_name\":\"bash\"}\n", &opts);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["tool_name"], "bash");
    }

    #[test]
    fn megabyte_line_is_accepted() {
        let (opts, events) = capture_opts();
        let mut pending = Vec::new();

        let payload = "x".repeat(1024 * 1024);
        let line = format!("{{\"type\":\"assistant\",\"content\":\"{payload}\"}}\n");
        scan_event_lines(&mut pending, line.as_bytes(), &opts);

        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn metadata_archive_roundtrip() {
        let json = r#"{"branch":"agent/x","commit":"abc","changedFiles":["a.md"]}"#;
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, "git_metadata.json", json.as_bytes())
            .expect("append");
        let archive = builder.into_inner().expect("finish");

        let metadata = parse_metadata_archive(&archive).expect("parse");
        assert_eq!(metadata.branch, "agent/x");
        assert_eq!(metadata.changed_files, ["a.md"]);
    }

    #[test]
    fn empty_archive_yields_no_metadata() {
        assert!(parse_metadata_archive(&[]).is_none());
    }
}
