// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutual exclusion and resume-by-attach for the vendor update executor.
//!
//! At most one executor session may run anywhere in the candidate set. A
//! non-retry request that finds a live session fails immediately; a retry
//! request attaches to it and waits instead of launching a second one. The
//! executor's recorded exit status is the sole source of truth for the EXEC
//! stage outcome.

use crate::config::Config;
use crate::errors::PatchError;
use crate::shell::RemoteShell;
use crate::stage::Stage;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{Logger, debug, info, o, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Console log file the executor writes on its launch node.
pub const EXECUTOR_CONSOLE: &str = "ExecutorConsole.out";

/// File the launch wrapper deposits the executor's exit code into.
const EXIT_STATUS_FILE: &str = "exit.status";

const NODES_FILE: &str = "nodes.lst";

/// Executor exit code meaning "target node is already at the requested
/// version", whitelisted as success.
pub const ALREADY_AT_TARGET_EXIT_CODE: i32 = 3;

/// Process-table probe for a live executor session.
const SESSION_PROBE: &str = "pgrep -f 'updatemgr -'";

/// Executor log directory for one request, on the launch node.
pub fn exec_log_dir(patch_base: &Utf8Path, request_id: Uuid) -> Utf8PathBuf {
    patch_base.join(format!("executor_log_{request_id}"))
}

/// Where the orchestrator renames the log directory to once the invocation
/// finishes (launch node short hostname appended).
pub fn completed_log_dir(log_dir: &Utf8Path, launch_node: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{log_dir}_{}", short_hostname(launch_node)))
}

pub fn console_path(log_dir: &Utf8Path) -> Utf8PathBuf {
    log_dir.join(EXECUTOR_CONSOLE)
}

fn exit_status_path(log_dir: &Utf8Path) -> Utf8PathBuf {
    log_dir.join(EXIT_STATUS_FILE)
}

fn short_hostname(node: &str) -> &str {
    node.split('.').next().unwrap_or(node)
}

/// One executor invocation, launched or attached to.
#[derive(Clone, Debug)]
pub struct InvocationHandle {
    pub launch_node: String,
    pub log_dir: Utf8PathBuf,
}

pub struct ExecutorSessionManager {
    shell: Arc<dyn RemoteShell>,
    poll_interval: Duration,
    wait_ceiling: Duration,
    log: Logger,
}

impl ExecutorSessionManager {
    pub fn new(shell: Arc<dyn RemoteShell>, config: &Config, log: &Logger) -> Self {
        Self {
            shell,
            poll_interval: config.executor_poll_interval(),
            wait_ceiling: config.executor_wait_ceiling(),
            log: log.new(o!("component" => "ExecutorSessionManager")),
        }
    }

    /// Probe the candidate set for a live executor session. Returns the node
    /// running one, if any.
    ///
    /// An unreachable candidate cannot be hosting a session we could attach
    /// to anyway, so transport errors are logged and skipped.
    pub async fn check_existence(
        &self,
        candidates: &[String],
    ) -> Result<Option<String>, PatchError> {
        for node in candidates {
            match self.shell.run(node, SESSION_PROBE).await {
                Ok(output) if output.success() => {
                    info!(
                        self.log, "live executor session found";
                        "node" => node,
                    );
                    return Ok(Some(node.clone()));
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        self.log, "session probe failed; skipping node";
                        "node" => node,
                        "error" => %error,
                    );
                }
            }
        }
        Ok(None)
    }

    /// Launch the executor on `launch_node` against `targets`, detached,
    /// with its exit code captured for later polling.
    pub async fn launch(
        &self,
        launch_node: &str,
        targets: &[String],
        operation: &str,
        target_version: &str,
        log_dir: &Utf8Path,
    ) -> Result<InvocationHandle, PatchError> {
        let nodes_file = log_dir.join(NODES_FILE);
        let write_nodes = format!(
            "mkdir -p {log_dir} && cat > {nodes_file} <<'EOF'\n{}\nEOF",
            targets.join("\n"),
        );
        let output = self
            .shell
            .run(launch_node, &write_nodes)
            .await
            .map_err(|source| PatchError::MetadataIo { source })?;
        if !output.success() {
            return Err(PatchError::StageFailed {
                node: launch_node.to_string(),
                stage: Stage::Exec,
                code: output.exit_code,
            });
        }

        let launch_cmd = format!(
            "mkdir -p {log_dir} && ( updatemgr --{operation} \
             --nodes-file {nodes_file} --target {target_version} ; \
             echo $? > {status} ) > {console} 2>&1 &",
            status = exit_status_path(log_dir),
            console = console_path(log_dir),
        );
        info!(
            self.log, "launching executor";
            "launch_node" => launch_node,
            "operation" => operation,
            "targets" => ?targets,
            "log_dir" => %log_dir,
        );
        let output = self
            .shell
            .run(launch_node, &launch_cmd)
            .await
            .map_err(|source| PatchError::MetadataIo { source })?;
        if !output.success() {
            return Err(PatchError::StageFailed {
                node: launch_node.to_string(),
                stage: Stage::Exec,
                code: output.exit_code,
            });
        }

        Ok(InvocationHandle {
            launch_node: launch_node.to_string(),
            log_dir: log_dir.to_owned(),
        })
    }

    /// Adopt an executor invocation that some previous request launched.
    /// No new process is started; the caller may only wait on the handle.
    pub fn attach(
        &self,
        launch_node: &str,
        log_dir: Utf8PathBuf,
    ) -> InvocationHandle {
        info!(
            self.log, "attaching to existing executor session";
            "launch_node" => launch_node,
            "log_dir" => %log_dir,
        );
        InvocationHandle { launch_node: launch_node.to_string(), log_dir }
    }

    /// Poll the invocation until its exit status appears, bounded by the
    /// operator-configured ceiling. Ceiling expiry is a distinct timeout
    /// error; the engine never retries it on its own.
    pub async fn await_completion(
        &self,
        handle: &InvocationHandle,
    ) -> Result<i32, PatchError> {
        let status_path = exit_status_path(&handle.log_dir);
        let read_status = format!("cat {status_path}");
        let started = tokio::time::Instant::now();

        loop {
            match self.shell.run(&handle.launch_node, &read_status).await {
                Ok(output) if output.success() => {
                    match output.stdout.trim().parse::<i32>() {
                        Ok(code) => {
                            info!(
                                self.log, "executor completed";
                                "launch_node" => &handle.launch_node,
                                "exit_code" => code,
                            );
                            return Ok(code);
                        }
                        Err(_) => {
                            // Status file exists but is mid-write; poll
                            // again.
                            debug!(
                                self.log,
                                "exit status file not yet parseable";
                                "content" => &output.stdout,
                            );
                        }
                    }
                }
                Ok(_) => {
                    debug!(
                        self.log, "executor still running";
                        "launch_node" => &handle.launch_node,
                    );
                }
                Err(error) => {
                    warn!(
                        self.log, "could not poll executor status";
                        "launch_node" => &handle.launch_node,
                        "error" => %error,
                    );
                }
            }

            if started.elapsed() >= self.wait_ceiling {
                return Err(PatchError::ExecutorTimeout {
                    launch_node: handle.launch_node.clone(),
                    ceiling_secs: self.wait_ceiling.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
