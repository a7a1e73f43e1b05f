// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The request-level entry point.
//!
//! One public method per task kind, each a thin driver over
//! [`RolloutScheduler`]: validate the request, discover and filter the
//! candidate fleet, pick launch nodes, stage the update payload, run the
//! rollout, and fold the final metadata into the caller payload. Failures
//! come back inside the payload with a stable error code and an operator
//! suggestion; the underlying error chain is logged here and goes no
//! further.

use crate::config::Config;
use crate::errors::PatchError;
use crate::launch::{LaunchNodePair, select_launch_nodes};
use crate::metadata::PatchMetadataStore;
use crate::request::{
    NodeReport, NodeTarget, OutcomeStatus, PatchOutcome, PatchRequest, TaskKind,
};
use crate::scheduler::{RolloutOutcome, RolloutScheduler};
use crate::shell::{ClusterTopology, Diagnostics, PluginRunner, RemoteShell};
use crate::stage::{Stage, StageMap, StageStatus};
use crate::task_set::{BatchStatus, ParallelTaskRunner, Task};
use futures::FutureExt;
use slog::{Logger, info, o, warn};
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;

/// Remote no-op used to partition candidates by reachability.
const REACHABILITY_PROBE: &str = "echo reachable";

pub struct PatchOrchestrator {
    shell: Arc<dyn RemoteShell>,
    topology: Arc<dyn ClusterTopology>,
    scheduler: RolloutScheduler,
    config: Config,
    log: Logger,
}

struct Prepared {
    targets: Vec<NodeTarget>,
    pair: LaunchNodePair,
    store: PatchMetadataStore,
}

impl PatchOrchestrator {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        plugins: Arc<dyn PluginRunner>,
        topology: Arc<dyn ClusterTopology>,
        diagnostics: Arc<dyn Diagnostics>,
        config: Config,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("component" => "PatchOrchestrator"));
        Self {
            scheduler: RolloutScheduler::new(
                Arc::clone(&shell),
                plugins,
                diagnostics,
                &config,
                &log,
            ),
            shell,
            topology,
            config,
            log,
        }
    }

    pub async fn precheck(&self, request: &PatchRequest) -> PatchOutcome {
        self.dispatch(request, TaskKind::Precheck).await
    }

    pub async fn apply(&self, request: &PatchRequest) -> PatchOutcome {
        self.dispatch(request, TaskKind::Apply).await
    }

    pub async fn rollback(&self, request: &PatchRequest) -> PatchOutcome {
        self.dispatch(request, TaskKind::Rollback).await
    }

    pub async fn backup_image(&self, request: &PatchRequest) -> PatchOutcome {
        self.dispatch(request, TaskKind::BackupImage).await
    }

    pub async fn postcheck(&self, request: &PatchRequest) -> PatchOutcome {
        self.dispatch(request, TaskKind::Postcheck).await
    }

    async fn dispatch(
        &self,
        request: &PatchRequest,
        expected: TaskKind,
    ) -> PatchOutcome {
        if request.task != expected {
            let error = PatchError::InvalidRequest {
                reason: format!(
                    "task is {} but the {} operation was invoked",
                    request.task, expected
                ),
            };
            return failure_outcome(&error, Vec::new());
        }

        info!(
            self.log, "patch request accepted";
            "request_id" => %request.request_id,
            "task" => %request.task,
            "style" => ?request.effective_style(),
            "target_version" => &request.target_version,
            "is_retry" => request.is_retry,
        );

        let prepared = match self.prepare(request).await {
            Ok(prepared) => prepared,
            Err(error) => {
                warn!(
                    self.log, "request failed before rollout";
                    "request_id" => %request.request_id,
                    InlineErrorChain::new(&error),
                );
                return failure_outcome(&error, Vec::new());
            }
        };

        let result = self
            .scheduler
            .run(request, &prepared.targets, &prepared.pair, &prepared.store)
            .await;
        let reports = self.node_reports(&prepared).await;

        match result {
            Ok(RolloutOutcome::Success) => {
                info!(
                    self.log, "patch request succeeded";
                    "request_id" => %request.request_id,
                );
                PatchOutcome {
                    status: OutcomeStatus::Success,
                    error_code: None,
                    message: format!(
                        "{} completed on all target nodes.",
                        request.task
                    ),
                    per_node: reports,
                }
            }
            Ok(RolloutOutcome::NoAction) => PatchOutcome {
                status: OutcomeStatus::Noop,
                error_code: None,
                message: "Every node is already at the target version; no \
                          action was required."
                    .to_string(),
                per_node: reports,
            },
            Err(error) => {
                warn!(
                    self.log, "patch request failed";
                    "request_id" => %request.request_id,
                    InlineErrorChain::new(&error),
                );
                failure_outcome(&error, reports)
            }
        }
    }

    /// Everything that must hold before the scheduler may run.
    async fn prepare(
        &self,
        request: &PatchRequest,
    ) -> Result<Prepared, PatchError> {
        if request.target_version.is_empty() {
            return Err(PatchError::InvalidRequest {
                reason: "targetVersion is empty".to_string(),
            });
        }

        let candidates =
            self.topology.candidate_nodes().await.map_err(|error| {
                PatchError::InvalidRequest {
                    reason: format!("cluster topology unavailable: {error:#}"),
                }
            })?;
        if candidates.is_empty() {
            return Err(PatchError::InvalidRequest {
                reason: "cluster topology reported no candidate nodes"
                    .to_string(),
            });
        }

        let hostnames: Vec<String> =
            candidates.iter().map(|c| c.hostname.clone()).collect();
        let unreachable = self.probe_reachability(&hostnames).await?;
        if !unreachable.is_empty() {
            return Err(PatchError::NodesUnreachable { nodes: unreachable });
        }

        let targets: Vec<NodeTarget> = candidates
            .into_iter()
            .map(|c| {
                let discarded = c.current_version == request.target_version;
                if discarded {
                    info!(
                        self.log, "node already at target version; discarded";
                        "node" => &c.hostname,
                    );
                }
                NodeTarget {
                    hostname: c.hostname,
                    current_version: c.current_version,
                    reachable: true,
                    discarded,
                }
            })
            .collect();

        let pair = select_launch_nodes(request, &targets, &self.log)?;
        self.stage_payload(&pair, &request.target_version).await?;

        let store = PatchMetadataStore::new(
            Arc::clone(&self.shell),
            pair.metadata_nodes(),
            &self.config.patch_base,
            &self.log,
        );
        Ok(Prepared { targets, pair, store })
    }

    /// Fan out one bounded probe per candidate; returns the nodes that did
    /// not answer. A worker killed by its own execution budget counts as
    /// unreachable.
    async fn probe_reachability(
        &self,
        nodes: &[String],
    ) -> Result<Vec<String>, PatchError> {
        let runner = ParallelTaskRunner::new(&self.log);
        let tasks = nodes
            .iter()
            .map(|node| {
                let shell = Arc::clone(&self.shell);
                let node = node.clone();
                Task::new(
                    node.clone(),
                    self.config.task_max_execution_time(),
                    self.config.task_join_timeout(),
                    async move {
                        matches!(
                            shell.run(&node, REACHABILITY_PROBE).await,
                            Ok(output) if output.success()
                        )
                    }
                    .boxed(),
                )
            })
            .collect();

        let (status, results) = runner.run(tasks).await;
        if status == BatchStatus::Killed {
            return Err(PatchError::BatchKilled {
                operation: "reachability probe",
            });
        }

        let unreachable: Vec<String> = nodes
            .iter()
            .filter(|node| {
                !results
                    .iter()
                    .any(|r| &r.id == *node && r.outcome)
            })
            .cloned()
            .collect();
        Ok(unreachable)
    }

    /// Unpack the update payload on every launch node before any executor
    /// run.
    async fn stage_payload(
        &self,
        pair: &LaunchNodePair,
        target_version: &str,
    ) -> Result<(), PatchError> {
        let command = format!(
            "mkdir -p {base} && updatemgr-stage --version {target_version}",
            base = self.config.patch_base,
        );
        for node in pair.metadata_nodes() {
            info!(
                self.log, "staging update payload";
                "node" => &node,
                "target_version" => target_version,
            );
            let output = self
                .shell
                .run(&node, &command)
                .await
                .map_err(|source| PatchError::MetadataIo { source })?;
            if !output.success() {
                return Err(PatchError::PayloadStagingFailed {
                    node,
                    code: output.exit_code,
                });
            }
        }
        Ok(())
    }

    /// Fold the final metadata into per-node reports. Metadata that cannot
    /// be read back (the request failed before initializing it, say)
    /// degrades to all-pending reports rather than failing the payload.
    async fn node_reports(&self, prepared: &Prepared) -> Vec<NodeReport> {
        let doc = match prepared.store.read().await {
            Ok(doc) => doc,
            Err(_) => {
                return prepared
                    .targets
                    .iter()
                    .map(|t| NodeReport {
                        node: t.hostname.clone(),
                        stage: Stage::Pre,
                        status: StageStatus::Pending,
                        message: String::new(),
                    })
                    .collect();
            }
        };

        prepared
            .targets
            .iter()
            .map(|t| {
                let (stage, status) = doc
                    .nodes
                    .get(&t.hostname)
                    .map_or((Stage::Pre, StageStatus::Pending), furthest_stage);
                NodeReport {
                    node: t.hostname.clone(),
                    stage,
                    status,
                    message: String::new(),
                }
            })
            .collect()
    }
}

/// The furthest stage a node reached: the last one with any recorded
/// progress, or a pending PRE if none.
fn furthest_stage(stages: &StageMap) -> (Stage, StageStatus) {
    for stage in [Stage::Post, Stage::Exec, Stage::Pre] {
        let status = stages.get(stage);
        if status != StageStatus::Pending {
            return (stage, status);
        }
    }
    (Stage::Pre, StageStatus::Pending)
}

fn failure_outcome(error: &PatchError, per_node: Vec<NodeReport>) -> PatchOutcome {
    PatchOutcome {
        status: OutcomeStatus::Failure,
        error_code: Some(error.code()),
        message: error.suggestion(),
        per_node,
    }
}
