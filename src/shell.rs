// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The remote command channel and the collaborator seams.
//!
//! Every node interaction in the engine (stage execution, health probes,
//! metadata reads and writes, artifact checks) is a remote-shell command
//! returning `(exit code, stdout, stderr)`. Credential and session setup is
//! the implementor's problem; the engine only sees [`RemoteShell`].

use crate::stage::Stage;
use async_trait::async_trait;
use camino::Utf8Path;
use thiserror::Error;

/// Result of one remote command. Exit code 0 is success; any non-zero code
/// is a failure unless the caller explicitly whitelists it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { exit_code: 0, stdout: stdout.into(), stderr: String::new() }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self { exit_code, stdout: String::new(), stderr: String::new() }
    }
}

/// Transport-level failure: the command could not be delivered at all. A
/// delivered command that exits non-zero is *not* a `ShellError`; that comes
/// back in [`CommandOutput`].
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("could not open a session to {node}")]
    Connection {
        node: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("session to {node} dropped while running a command")]
    Dropped {
        node: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ShellError {
    pub fn node(&self) -> &str {
        match self {
            ShellError::Connection { node, .. } => node,
            ShellError::Dropped { node, .. } => node,
        }
    }
}

/// The remote command channel.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(
        &self,
        node: &str,
        command: &str,
    ) -> Result<CommandOutput, ShellError>;
}

/// Plugin-execution collaborator invoked at the PRE and POST stages. The
/// plugin body is external; the engine only consumes its exit code.
#[async_trait]
pub trait PluginRunner: Send + Sync {
    async fn run_plugin(
        &self,
        node: &str,
        stage: Stage,
        rollback: bool,
    ) -> Result<i32, ShellError>;
}

/// One row of the candidate list provided by the topology collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeVersion {
    pub hostname: String,
    pub current_version: String,
}

/// Cluster-topology collaborator: the candidate node list and their current
/// software versions. Payload parsing (XML/JSON) happens behind this seam.
#[async_trait]
pub trait ClusterTopology: Send + Sync {
    async fn candidate_nodes(&self) -> anyhow::Result<Vec<NodeVersion>>;
}

/// Diagnostics collaborator: pulls console and log artifacts from a launch
/// node after an executor invocation terminates. Failure here never fails
/// the stage itself, only degrades observability.
#[async_trait]
pub trait Diagnostics: Send + Sync {
    async fn collect(
        &self,
        launch_node: &str,
        targets: &[String],
        log_dir: &Utf8Path,
    ) -> anyhow::Result<()>;
}
