// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet-wide health validation with a quorum rule.
//!
//! Each node gets one bounded-time worker that probes a liveness signal and,
//! on failure, tries a fixed number of service restarts before giving up.
//! The fleet passes when at least two non-disabled nodes are healthy (a
//! single-node fleet must have that node healthy). Quorum failure is a hard
//! error for the caller to act on; the gate itself never retries beyond the
//! in-worker loop.

use crate::config::Config;
use crate::errors::PatchError;
use crate::shell::RemoteShell;
use crate::task_set::{BatchStatus, ParallelTaskRunner, Task};
use futures::FutureExt;
use slog::{Logger, debug, info, o, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Which liveness signal to validate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthKind {
    /// Cluster-membership service heartbeat.
    ClusterService,
    /// Storage-cell heartbeat.
    StorageHeartbeat,
}

impl HealthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthKind::ClusterService => "cluster service",
            HealthKind::StorageHeartbeat => "storage heartbeat",
        }
    }

    fn probe_command(&self) -> &'static str {
        match self {
            HealthKind::ClusterService => "clusterctl check membership",
            HealthKind::StorageHeartbeat => "storagectl check heartbeat",
        }
    }

    fn restart_command(&self) -> &'static str {
        match self {
            HealthKind::ClusterService => "clusterctl start membership",
            HealthKind::StorageHeartbeat => "storagectl start heartbeat",
        }
    }
}

/// Probe exit code meaning "the operator disabled this service on purpose".
/// Such nodes are excluded from quorum entirely.
const DISABLED_EXIT_CODE: i32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProbeOutcome {
    Healthy,
    Unhealthy,
    Disabled,
}

/// Aggregated fleet health.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FleetHealth {
    pub ok: bool,
    pub unhealthy: Vec<String>,
    pub disabled: Vec<String>,
}

pub struct HealthGate {
    shell: Arc<dyn RemoteShell>,
    retry_budget: u32,
    retry_sleep: Duration,
    max_execution_time: Duration,
    join_timeout: Duration,
    log: Logger,
}

impl HealthGate {
    pub fn new(shell: Arc<dyn RemoteShell>, config: &Config, log: &Logger) -> Self {
        Self {
            shell,
            retry_budget: config.health_retry_budget,
            retry_sleep: config.health_retry_sleep(),
            max_execution_time: config.task_max_execution_time(),
            join_timeout: config.task_join_timeout(),
            log: log.new(o!("component" => "HealthGate")),
        }
    }

    /// Validate the liveness signal on every node in parallel and apply the
    /// quorum rule.
    ///
    /// `Err` is reserved for infrastructure trouble (the fan-out batch hit
    /// its join deadline); a mere quorum miss comes back as
    /// `FleetHealth { ok: false, .. }` so the caller decides whether to
    /// abort the whole request.
    pub async fn validate_fleet(
        &self,
        nodes: &[String],
        kind: HealthKind,
    ) -> Result<FleetHealth, PatchError> {
        if nodes.is_empty() {
            return Ok(FleetHealth {
                ok: true,
                unhealthy: Vec::new(),
                disabled: Vec::new(),
            });
        }

        info!(
            self.log, "validating fleet health";
            "kind" => kind.as_str(),
            "nodes" => ?nodes,
        );

        let runner = ParallelTaskRunner::new(&self.log);
        let tasks = nodes
            .iter()
            .map(|node| {
                let shell = Arc::clone(&self.shell);
                let node = node.clone();
                let log = self.log.new(o!("node" => node.clone()));
                let retry_budget = self.retry_budget;
                let retry_sleep = self.retry_sleep;
                Task::new(
                    node.clone(),
                    self.max_execution_time,
                    self.join_timeout,
                    check_node(shell, node, kind, retry_budget, retry_sleep, log)
                        .boxed(),
                )
            })
            .collect();

        let (status, results) = runner.run(tasks).await;
        if status == BatchStatus::Killed {
            return Err(PatchError::BatchKilled { operation: "health check" });
        }

        let mut disabled = Vec::new();
        let mut healthy = BTreeSet::new();
        for result in &results {
            match result.outcome {
                ProbeOutcome::Healthy => {
                    healthy.insert(result.id.clone());
                }
                ProbeOutcome::Disabled => disabled.push(result.id.clone()),
                ProbeOutcome::Unhealthy => {}
            }
        }

        // A worker that was hard-killed left no result; its node counts as
        // unhealthy.
        let unhealthy: Vec<String> = nodes
            .iter()
            .filter(|n| !healthy.contains(*n) && !disabled.contains(n))
            .cloned()
            .collect();

        if !disabled.is_empty() {
            info!(
                self.log, "nodes with intentionally disabled service excluded from quorum";
                "kind" => kind.as_str(),
                "nodes" => ?disabled,
            );
        }

        let participating = nodes.len() - disabled.len();
        let ok = match participating {
            0 => true,
            1 => unhealthy.is_empty(),
            n => n - unhealthy.len() >= 2,
        };

        if !ok {
            warn!(
                self.log, "fleet health quorum not met";
                "kind" => kind.as_str(),
                "participating" => participating,
                "unhealthy" => ?unhealthy,
            );
        }

        Ok(FleetHealth { ok, unhealthy, disabled })
    }
}

/// One worker: probe, then a bounded restart/re-probe loop.
async fn check_node(
    shell: Arc<dyn RemoteShell>,
    node: String,
    kind: HealthKind,
    retry_budget: u32,
    retry_sleep: Duration,
    log: Logger,
) -> ProbeOutcome {
    match probe(&*shell, &node, kind, &log).await {
        ProbeOutcome::Unhealthy => {}
        outcome => return outcome,
    }

    for attempt in 1..=retry_budget {
        debug!(
            log, "liveness probe failed; attempting service restart";
            "kind" => kind.as_str(),
            "attempt" => attempt,
        );
        match shell.run(&node, kind.restart_command()).await {
            Ok(output) if !output.success() => {
                debug!(
                    log, "service restart returned non-zero";
                    "exit_code" => output.exit_code,
                );
            }
            Err(error) => {
                warn!(log, "service restart unreachable"; "error" => %error);
            }
            Ok(_) => {}
        }
        tokio::time::sleep(retry_sleep).await;
        match probe(&*shell, &node, kind, &log).await {
            ProbeOutcome::Unhealthy => continue,
            outcome => return outcome,
        }
    }

    warn!(
        log, "node still unhealthy after restart attempts";
        "kind" => kind.as_str(),
        "attempts" => retry_budget,
    );
    ProbeOutcome::Unhealthy
}

async fn probe(
    shell: &dyn RemoteShell,
    node: &str,
    kind: HealthKind,
    log: &Logger,
) -> ProbeOutcome {
    match shell.run(node, kind.probe_command()).await {
        Ok(output) if output.success() => ProbeOutcome::Healthy,
        Ok(output) if output.exit_code == DISABLED_EXIT_CODE => {
            ProbeOutcome::Disabled
        }
        Ok(output) => {
            debug!(
                log, "liveness probe non-zero";
                "kind" => kind.as_str(),
                "exit_code" => output.exit_code,
            );
            ProbeOutcome::Unhealthy
        }
        Err(error) => {
            warn!(log, "liveness probe unreachable"; "error" => %error);
            ProbeOutcome::Unhealthy
        }
    }
}
