// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scripted fakes for the remote shell and the collaborator seams.
//!
//! [`FakeShell`] emulates just enough of a remote node to exercise the
//! engine: an in-memory per-node file system driven by the small set of
//! shell idioms the engine actually emits (`cat`, heredoc writes, `test -f`,
//! `touch`, `rm`, `mv`, `pgrep`, executor launches), plus scripted overrides
//! keyed by command substring.

use crate::shell::{
    ClusterTopology, CommandOutput, Diagnostics, NodeVersion, PluginRunner,
    RemoteShell, ShellError,
};
use crate::stage::Stage;
use async_trait::async_trait;
use camino::Utf8Path;
use slog::{Drain, Logger, o};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// A logger that prints to the test's captured stdout.
pub fn log() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

struct Rule {
    node: Option<String>,
    substring: String,
    output: CommandOutput,
    remaining: Option<usize>,
}

#[derive(Default)]
struct ShellState {
    files: BTreeMap<(String, String), String>,
    rules: Vec<Rule>,
    unreachable: BTreeSet<String>,
    executor_exit: BTreeMap<String, i32>,
    history: Vec<(String, String)>,
}

/// Scripted [`RemoteShell`].
#[derive(Default)]
pub struct FakeShell {
    state: Mutex<ShellState>,
}

impl FakeShell {
    /// Script a response for commands on `node` containing `substring`.
    pub fn respond(&self, node: &str, substring: &str, output: CommandOutput) {
        self.state.lock().unwrap().rules.push(Rule {
            node: Some(node.to_string()),
            substring: substring.to_string(),
            output,
            remaining: None,
        });
    }

    pub fn fail_command_on(&self, node: &str, substring: &str, exit_code: i32) {
        self.respond(node, substring, CommandOutput::failed(exit_code));
    }

    /// Like [`Self::fail_command_on`] but only for the first `times`
    /// matching commands.
    pub fn fail_command_on_times(
        &self,
        node: &str,
        substring: &str,
        exit_code: i32,
        times: usize,
    ) {
        self.state.lock().unwrap().rules.push(Rule {
            node: Some(node.to_string()),
            substring: substring.to_string(),
            output: CommandOutput::failed(exit_code),
            remaining: Some(times),
        });
    }

    /// Mark a node as unreachable at the transport level.
    pub fn set_unreachable(&self, node: &str) {
        self.state.lock().unwrap().unreachable.insert(node.to_string());
    }

    /// Exit code the fake executor reports when launched from `launch_node`
    /// (default 0).
    pub fn set_executor_exit(&self, launch_node: &str, exit_code: i32) {
        self.state
            .lock()
            .unwrap()
            .executor_exit
            .insert(launch_node.to_string(), exit_code);
    }

    pub fn put_file(&self, node: &str, path: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert((node.to_string(), path.to_string()), content.to_string());
    }

    pub fn file(&self, node: &str, path: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(node.to_string(), path.to_string()))
            .cloned()
    }

    /// Every `(node, command)` pair seen, in order.
    pub fn history(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().history.clone()
    }

    /// Commands matching a substring, in order.
    pub fn commands_containing(&self, substring: &str) -> Vec<(String, String)> {
        self.history()
            .into_iter()
            .filter(|(_, cmd)| cmd.contains(substring))
            .collect()
    }

    fn builtin(&self, node: &str, command: &str) -> CommandOutput {
        let mut state = self.state.lock().unwrap();

        // Heredoc write: `mkdir -p <dir> && cat > <path> <<'EOF'\n...\nEOF`
        if let Some(idx) = command.find("cat > ") {
            if let Some(marker) = command.find(" <<'EOF'") {
                let path = command[idx + "cat > ".len()..marker].trim();
                let body_start =
                    command[marker..].find('\n').map(|i| marker + i + 1);
                let content = match (body_start, command.rfind("\nEOF")) {
                    (Some(start), Some(end)) if start <= end => {
                        command[start..end].to_string()
                    }
                    _ => String::new(),
                };
                state
                    .files
                    .insert((node.to_string(), path.to_string()), content);
                return CommandOutput::ok("");
            }
        }

        // Executor launch: record the session and immediately deposit the
        // scripted exit status and console log, as if the run finished.
        if command.contains("updatemgr --") && command.contains("echo $? > ") {
            let exit_code =
                state.executor_exit.get(node).copied().unwrap_or(0);
            if let Some(idx) = command.find("echo $? > ") {
                let rest = &command[idx + "echo $? > ".len()..];
                let status_path =
                    rest.split_whitespace().next().unwrap_or("").to_string();
                state.files.insert(
                    (node.to_string(), status_path),
                    exit_code.to_string(),
                );
            }
            if let Some(idx) = command.find(") > ") {
                let rest = &command[idx + ") > ".len()..];
                let console_path =
                    rest.split_whitespace().next().unwrap_or("").to_string();
                state.files.insert(
                    (node.to_string(), console_path),
                    "executor console output".to_string(),
                );
            }
            return CommandOutput::ok("started");
        }

        let mut tokens = command.split_whitespace();
        match tokens.next() {
            Some("cat") => {
                let path = tokens.next().unwrap_or("");
                match state.files.get(&(node.to_string(), path.to_string())) {
                    Some(content) => CommandOutput::ok(content.clone()),
                    None => CommandOutput::failed(1),
                }
            }
            Some("test") => {
                // `test -f <path>`
                let _flag = tokens.next();
                let path = tokens.next().unwrap_or("");
                if state
                    .files
                    .contains_key(&(node.to_string(), path.to_string()))
                {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(1)
                }
            }
            Some("touch") => {
                let path = tokens.next().unwrap_or("").to_string();
                state.files.insert((node.to_string(), path), String::new());
                CommandOutput::ok("")
            }
            Some("rm") => {
                let path = tokens.last().unwrap_or("").to_string();
                state.files.remove(&(node.to_string(), path));
                CommandOutput::ok("")
            }
            Some("mv") => {
                let src = tokens.next().unwrap_or("").to_string();
                let dst = tokens.next().unwrap_or("").to_string();
                let moved: Vec<((String, String), String)> = state
                    .files
                    .iter()
                    .filter(|((n, p), _)| {
                        n == node
                            && (p == &src || p.starts_with(&format!("{src}/")))
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for ((n, p), content) in moved {
                    state.files.remove(&(n.clone(), p.clone()));
                    let new_path = format!("{dst}{}", &p[src.len()..]);
                    state.files.insert((n, new_path), content);
                }
                CommandOutput::ok("")
            }
            Some("pgrep") => CommandOutput::failed(1),
            _ => CommandOutput::ok(""),
        }
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn run(
        &self,
        node: &str,
        command: &str,
    ) -> Result<CommandOutput, ShellError> {
        {
            let mut state = self.state.lock().unwrap();
            state.history.push((node.to_string(), command.to_string()));
            if state.unreachable.contains(node) {
                return Err(ShellError::Connection {
                    node: node.to_string(),
                    source: anyhow::anyhow!("scripted unreachable node"),
                });
            }
            for rule in state.rules.iter_mut() {
                let node_matches =
                    rule.node.as_deref().map_or(true, |n| n == node);
                if node_matches && command.contains(&rule.substring) {
                    match rule.remaining {
                        Some(0) => continue,
                        Some(ref mut n) => {
                            *n -= 1;
                            return Ok(rule.output.clone());
                        }
                        None => return Ok(rule.output.clone()),
                    }
                }
            }
        }
        Ok(self.builtin(node, command))
    }
}

/// Scripted [`PluginRunner`]: records calls, returns configured exit codes.
#[derive(Default)]
pub struct FakePlugins {
    failures: Mutex<BTreeMap<(String, Stage), i32>>,
    calls: Mutex<Vec<(String, Stage, bool)>>,
}

impl FakePlugins {
    pub fn fail(&self, node: &str, stage: Stage, exit_code: i32) {
        self.failures
            .lock()
            .unwrap()
            .insert((node.to_string(), stage), exit_code);
    }

    pub fn calls(&self) -> Vec<(String, Stage, bool)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, node: &str, stage: Stage) -> usize {
        self.calls()
            .iter()
            .filter(|(n, s, _)| n == node && *s == stage)
            .count()
    }
}

#[async_trait]
impl PluginRunner for FakePlugins {
    async fn run_plugin(
        &self,
        node: &str,
        stage: Stage,
        rollback: bool,
    ) -> Result<i32, ShellError> {
        self.calls
            .lock()
            .unwrap()
            .push((node.to_string(), stage, rollback));
        let code = self
            .failures
            .lock()
            .unwrap()
            .get(&(node.to_string(), stage))
            .copied()
            .unwrap_or(0);
        Ok(code)
    }
}

/// Static [`ClusterTopology`].
pub struct FakeTopology {
    nodes: Vec<NodeVersion>,
}

impl FakeTopology {
    pub fn new(nodes: &[(&str, &str)]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|(host, version)| NodeVersion {
                    hostname: host.to_string(),
                    current_version: version.to_string(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ClusterTopology for FakeTopology {
    async fn candidate_nodes(&self) -> anyhow::Result<Vec<NodeVersion>> {
        Ok(self.nodes.clone())
    }
}

/// Records diagnostics pulls; optionally fails them all.
#[derive(Default)]
pub struct FakeDiagnostics {
    pub fail: bool,
    collected: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeDiagnostics {
    /// A collector whose every pull fails.
    pub fn failing() -> Self {
        Self { fail: true, collected: Mutex::new(Vec::new()) }
    }

    pub fn collected(&self) -> Vec<(String, Vec<String>)> {
        self.collected.lock().unwrap().clone()
    }
}

#[async_trait]
impl Diagnostics for FakeDiagnostics {
    async fn collect(
        &self,
        launch_node: &str,
        targets: &[String],
        _log_dir: &Utf8Path,
    ) -> anyhow::Result<()> {
        self.collected
            .lock()
            .unwrap()
            .push((launch_node.to_string(), targets.to_vec()));
        if self.fail {
            anyhow::bail!("scripted diagnostics failure");
        }
        Ok(())
    }
}
