// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The rollout policy engine.
//!
//! A single control task drives every node of a request through
//! `PRE -> EXEC -> POST`, one bootstrap round at a time. Rolling style
//! invokes the executor once per node and halts the fleet on the first
//! failure; non-rolling batches one executor invocation per round. All
//! fan-out (health gates, reachability) happens in bounded parallel batches
//! that the control task joins before any stage transition, and the control
//! task is the only writer of patch metadata.

use crate::config::Config;
use crate::errors::PatchError;
use crate::health::{HealthGate, HealthKind};
use crate::launch::{LaunchNodePair, plan_rounds};
use crate::metadata::{PatchMetadataStore, RetryDisposition};
use crate::request::{NodeTarget, OperationStyle, PatchRequest, TaskKind};
use crate::session::{
    ALREADY_AT_TARGET_EXIT_CODE, ExecutorSessionManager, InvocationHandle,
    exec_log_dir,
};
use crate::shell::{Diagnostics, PluginRunner, RemoteShell};
use crate::stage::{Stage, StageStatus};
use slog::{Logger, debug, info, o, warn};
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;

/// How a rollout ended when nothing went wrong. "Nothing to do" is a
/// first-class variant, never a sentinel exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutOutcome {
    Success,
    /// Every node was already at the target version.
    NoAction,
}

/// Exit code recorded when a plugin could not be delivered to its node at
/// all. A node we cannot reach cannot have passed its plugin.
const PLUGIN_TRANSPORT_EXIT_CODE: i32 = -1;

fn exec_success(code: i32) -> bool {
    code == 0 || code == ALREADY_AT_TARGET_EXIT_CODE
}

pub struct RolloutScheduler {
    shell: Arc<dyn RemoteShell>,
    plugins: Arc<dyn PluginRunner>,
    diagnostics: Arc<dyn Diagnostics>,
    health: HealthGate,
    session: ExecutorSessionManager,
    config: Config,
    log: Logger,
}

impl RolloutScheduler {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        plugins: Arc<dyn PluginRunner>,
        diagnostics: Arc<dyn Diagnostics>,
        config: &Config,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("component" => "RolloutScheduler"));
        Self {
            health: HealthGate::new(Arc::clone(&shell), config, &log),
            session: ExecutorSessionManager::new(
                Arc::clone(&shell),
                config,
                &log,
            ),
            shell,
            plugins,
            diagnostics,
            config: config.clone(),
            log,
        }
    }

    /// Drive one request to a terminal state.
    pub async fn run(
        &self,
        request: &PatchRequest,
        targets: &[NodeTarget],
        pair: &LaunchNodePair,
        store: &PatchMetadataStore,
    ) -> Result<RolloutOutcome, PatchError> {
        let fleet: Vec<String> =
            targets.iter().map(|t| t.hostname.clone()).collect();

        // Gating check, not a stage: a quorum miss here leaves metadata
        // untouched.
        let health = self
            .health
            .validate_fleet(&fleet, HealthKind::ClusterService)
            .await?;
        if !health.ok {
            return Err(PatchError::QuorumNotMet {
                kind: HealthKind::ClusterService.as_str(),
                unhealthy: health.unhealthy,
            });
        }

        let mut probe_set = fleet.clone();
        for node in pair.metadata_nodes() {
            if !probe_set.contains(&node) {
                probe_set.push(node);
            }
        }
        if let Some(active) = self.session.check_existence(&probe_set).await? {
            if !request.is_retry {
                return Err(PatchError::SessionAlreadyExists { node: active });
            }
            info!(
                self.log, "retry will adopt the live executor session";
                "node" => &active,
            );
        }

        if !request.is_retry {
            store.initialize(&fleet).await?;
            for target in targets.iter().filter(|t| t.discarded) {
                store
                    .set_all_stages(&target.hostname, StageStatus::Completed)
                    .await?;
            }
        } else {
            self.reconcile_discarded(request, targets, store).await?;
        }

        if targets.iter().all(|t| t.discarded) {
            info!(
                self.log,
                "every node already at the target version; nothing to do"
            );
            return Ok(RolloutOutcome::NoAction);
        }

        let doc = store.read().await?;
        let needing: Vec<String> = targets
            .iter()
            .filter(|t| !t.discarded)
            .filter(|t| {
                doc.nodes.get(&t.hostname).map_or(true, |stages| {
                    Stage::ALL
                        .iter()
                        .any(|s| stages.get(*s) != StageStatus::Completed)
                })
            })
            .map(|t| t.hostname.clone())
            .collect();
        if needing.is_empty() {
            info!(self.log, "all stages already completed");
            return Ok(RolloutOutcome::Success);
        }

        for round in plan_rounds(pair, &needing) {
            info!(
                self.log, "starting rollout round";
                "launch_node" => &round.launch_node,
                "targets" => ?round.targets,
                "style" => ?request.effective_style(),
            );
            match request.effective_style() {
                OperationStyle::Rolling => {
                    for node in &round.targets {
                        self.plugin_stage(request, store, node, Stage::Pre)
                            .await?;
                        self.exec_stage(
                            request,
                            store,
                            &round.launch_node,
                            std::slice::from_ref(node),
                            &fleet,
                        )
                        .await?;
                        self.plugin_stage(request, store, node, Stage::Post)
                            .await?;
                    }
                }
                OperationStyle::NonRolling => {
                    for node in &round.targets {
                        self.plugin_stage(request, store, node, Stage::Pre)
                            .await?;
                    }
                    self.exec_stage(
                        request,
                        store,
                        &round.launch_node,
                        &round.targets,
                        &fleet,
                    )
                    .await?;
                    for node in &round.targets {
                        self.plugin_stage(request, store, node, Stage::Post)
                            .await?;
                    }
                }
            }
        }

        Ok(RolloutOutcome::Success)
    }

    /// Retry bookkeeping for discarded nodes.
    ///
    /// A node that reached the target version while its EXEC record still
    /// says `running` was mid-update when the previous request died. Resolve
    /// it through the console-artifact lookup before stamping anything.
    async fn reconcile_discarded(
        &self,
        request: &PatchRequest,
        targets: &[NodeTarget],
        store: &PatchMetadataStore,
    ) -> Result<(), PatchError> {
        let doc = store.read().await?;
        let stuck: Vec<String> = targets
            .iter()
            .filter(|t| t.discarded)
            .filter(|t| {
                doc.nodes
                    .get(&t.hostname)
                    .map_or(false, |s| s.get(Stage::Exec) == StageStatus::Running)
            })
            .map(|t| t.hostname.clone())
            .collect();

        if !stuck.is_empty() {
            let log_dir =
                exec_log_dir(&self.config.patch_base, request.request_id);
            match store.locate_inflight_exec(&log_dir).await? {
                RetryDisposition::AssumeCompleted => {
                    self.set_suppression(&stuck, false).await;
                }
                RetryDisposition::Attach { launch_node, log_dir } => {
                    let handle = self.session.attach(&launch_node, log_dir);
                    let code = self.session.await_completion(&handle).await?;
                    self.finish_invocation(&handle, &stuck).await;
                    // The crashed run set the suppression marker before its
                    // EXEC window; that window just ended.
                    self.set_suppression(&stuck, false).await;
                    if !exec_success(code) {
                        for node in &stuck {
                            store
                                .set(node, Stage::Exec, StageStatus::Failed, None)
                                .await?;
                        }
                        return Err(PatchError::RetryResumeFailed {
                            node: stuck[0].clone(),
                            code,
                        });
                    }
                }
            }
        }

        for target in targets.iter().filter(|t| t.discarded) {
            store
                .set_all_stages(&target.hostname, StageStatus::Completed)
                .await?;
        }
        Ok(())
    }

    /// Run (or skip, or adopt) one stage's worth of executor work.
    async fn exec_stage(
        &self,
        request: &PatchRequest,
        store: &PatchMetadataStore,
        launch_node: &str,
        targets: &[String],
        fleet: &[String],
    ) -> Result<(), PatchError> {
        let doc = store.read().await?;
        let mut pending = Vec::new();
        let mut interrupted = Vec::new();
        for node in targets {
            match doc.nodes.get(node).map(|s| s.get(Stage::Exec)) {
                Some(StageStatus::Completed) => {
                    debug!(
                        self.log, "EXEC already completed; skipping";
                        "node" => node,
                    );
                }
                Some(StageStatus::Running) => {
                    interrupted.push(node.clone());
                    pending.push(node.clone());
                }
                _ => pending.push(node.clone()),
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        // Adopt an interrupted invocation before considering a fresh launch.
        // If no console artifact is found the previous launch never got
        // going, and a fresh launch is safe.
        if request.is_retry && !interrupted.is_empty() {
            let log_dir =
                exec_log_dir(&self.config.patch_base, request.request_id);
            if let RetryDisposition::Attach { launch_node, log_dir } =
                store.locate_inflight_exec(&log_dir).await?
            {
                let handle = self.session.attach(&launch_node, log_dir);
                let code = self.session.await_completion(&handle).await?;
                self.finish_invocation(&handle, &interrupted).await;
                // The previous run set the suppression marker before this
                // EXEC window; it ends here whether the adoption succeeded
                // or not.
                self.set_suppression(&interrupted, false).await;
                if !exec_success(code) {
                    for node in &interrupted {
                        store
                            .set(node, Stage::Exec, StageStatus::Failed, None)
                            .await?;
                    }
                    return Err(PatchError::RetryResumeFailed {
                        node: interrupted[0].clone(),
                        code,
                    });
                }
                for node in &interrupted {
                    store
                        .set(node, Stage::Exec, StageStatus::Completed, None)
                        .await?;
                }
                pending.retain(|n| !interrupted.contains(n));
                if pending.is_empty() {
                    return self.storage_gate(fleet).await;
                }
            }
        }

        for node in &pending {
            store
                .set(node, Stage::Exec, StageStatus::Running, Some(launch_node))
                .await?;
        }

        self.set_suppression(&pending, true).await;
        let log_dir = exec_log_dir(&self.config.patch_base, request.request_id);
        let result = match self
            .session
            .launch(
                launch_node,
                &pending,
                request.task.executor_operation(),
                &request.target_version,
                &log_dir,
            )
            .await
        {
            Ok(handle) => {
                let awaited = self.session.await_completion(&handle).await;
                self.finish_invocation(&handle, &pending).await;
                awaited
            }
            Err(error) => Err(error),
        };
        self.set_suppression(&pending, false).await;

        let code = match result {
            Ok(code) => code,
            Err(error) => {
                // A timed-out executor may still be running; its records
                // stay `running` so a retry can attach. Anything else means
                // no invocation is in flight.
                if !matches!(error, PatchError::ExecutorTimeout { .. }) {
                    for node in &pending {
                        store
                            .set(node, Stage::Exec, StageStatus::Failed, None)
                            .await?;
                    }
                }
                return Err(error);
            }
        };

        if !exec_success(code) {
            for node in &pending {
                store.set(node, Stage::Exec, StageStatus::Failed, None).await?;
            }
            return Err(PatchError::StageFailed {
                node: pending.join(","),
                stage: Stage::Exec,
                code,
            });
        }
        if code == ALREADY_AT_TARGET_EXIT_CODE {
            info!(
                self.log, "executor reports nodes already at target version";
                "nodes" => ?pending,
            );
        }
        for node in &pending {
            store.set(node, Stage::Exec, StageStatus::Completed, None).await?;
        }

        self.storage_gate(fleet).await
    }

    /// Post-update storage validation for the whole fleet.
    async fn storage_gate(&self, fleet: &[String]) -> Result<(), PatchError> {
        let health = self
            .health
            .validate_fleet(fleet, HealthKind::StorageHeartbeat)
            .await?;
        if !health.ok {
            return Err(PatchError::QuorumNotMet {
                kind: HealthKind::StorageHeartbeat.as_str(),
                unhealthy: health.unhealthy,
            });
        }
        Ok(())
    }

    /// PRE or POST for one node.
    async fn plugin_stage(
        &self,
        request: &PatchRequest,
        store: &PatchMetadataStore,
        node: &str,
        stage: Stage,
    ) -> Result<(), PatchError> {
        if store.get(node, stage).await? == StageStatus::Completed {
            debug!(
                self.log, "stage already completed; skipping";
                "node" => node,
                "stage" => %stage,
            );
            return Ok(());
        }

        store.set(node, stage, StageStatus::Running, None).await?;
        let rollback = request.task == TaskKind::Rollback;
        let code = match self.plugins.run_plugin(node, stage, rollback).await {
            Ok(code) => code,
            Err(error) => {
                warn!(
                    self.log, "plugin could not be delivered";
                    "node" => node,
                    "stage" => %stage,
                    InlineErrorChain::new(&error),
                );
                PLUGIN_TRANSPORT_EXIT_CODE
            }
        };

        if code == 0 {
            store.set(node, stage, StageStatus::Completed, None).await?;
            Ok(())
        } else {
            store.set(node, stage, StageStatus::Failed, None).await?;
            Err(PatchError::StageFailed {
                node: node.to_string(),
                stage,
                code,
            })
        }
    }

    /// Pull diagnostics and rename the executor log directory. Both are
    /// best-effort; neither can fail the stage.
    async fn finish_invocation(
        &self,
        handle: &InvocationHandle,
        targets: &[String],
    ) {
        if let Err(error) = self
            .diagnostics
            .collect(&handle.launch_node, targets, &handle.log_dir)
            .await
        {
            warn!(
                self.log, "diagnostics collection failed";
                "launch_node" => &handle.launch_node,
                "error" => format!("{error:#}"),
            );
        }

        let completed =
            crate::session::completed_log_dir(&handle.log_dir, &handle.launch_node);
        let rename = format!("mv {} {completed}", handle.log_dir);
        match self.shell.run(&handle.launch_node, &rename).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(
                self.log, "executor log directory rename returned non-zero";
                "launch_node" => &handle.launch_node,
                "exit_code" => output.exit_code,
            ),
            Err(error) => warn!(
                self.log, "executor log directory rename unreachable";
                "launch_node" => &handle.launch_node,
                InlineErrorChain::new(&error),
            ),
        }
    }

    /// Monitoring-suppression marker around an EXEC window. Best-effort on
    /// both edges; a node that cannot be told to suppress can still be
    /// patched.
    async fn set_suppression(&self, nodes: &[String], enable: bool) {
        let file = &self.config.monitor_suppression_file;
        let command = if enable {
            format!("touch {file}")
        } else {
            format!("rm -f {file}")
        };
        for node in nodes {
            match self.shell.run(node, &command).await {
                Ok(output) if output.success() => {}
                Ok(output) => warn!(
                    self.log, "suppression marker command returned non-zero";
                    "node" => node,
                    "enable" => enable,
                    "exit_code" => output.exit_code,
                ),
                Err(error) => warn!(
                    self.log, "suppression marker command unreachable";
                    "node" => node,
                    "enable" => enable,
                    InlineErrorChain::new(&error),
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::CommandOutput;
    use crate::test_util::{FakeDiagnostics, FakePlugins, FakeShell};
    use camino::Utf8PathBuf;
    use uuid::Uuid;

    struct Harness {
        shell: Arc<FakeShell>,
        plugins: Arc<FakePlugins>,
        diagnostics: Arc<FakeDiagnostics>,
        scheduler: RolloutScheduler,
        store: PatchMetadataStore,
        pair: LaunchNodePair,
    }

    fn harness() -> Harness {
        harness_with(Arc::new(FakeDiagnostics::default()))
    }

    fn harness_with(diagnostics: Arc<FakeDiagnostics>) -> Harness {
        let shell = Arc::new(FakeShell::default());
        let plugins = Arc::new(FakePlugins::default());
        let log = crate::test_util::log();
        let mut config = Config::default();
        config.health_retry_budget = 0;
        config.health_retry_sleep_secs = 0;
        let pair = LaunchNodePair {
            primary: "node1".to_string(),
            secondary: Some("node2".to_string()),
        };
        let store = PatchMetadataStore::new(
            Arc::clone(&shell) as Arc<dyn RemoteShell>,
            pair.metadata_nodes(),
            &config.patch_base,
            &log,
        );
        let scheduler = RolloutScheduler::new(
            Arc::clone(&shell) as Arc<dyn RemoteShell>,
            Arc::clone(&plugins) as Arc<dyn PluginRunner>,
            Arc::clone(&diagnostics) as Arc<dyn Diagnostics>,
            &config,
            &log,
        );
        Harness { shell, plugins, diagnostics, scheduler, store, pair }
    }

    fn request(style: OperationStyle, is_retry: bool) -> PatchRequest {
        PatchRequest {
            request_id: Uuid::new_v4(),
            task: TaskKind::Apply,
            style,
            target_version: "25.1.0".to_string(),
            is_retry,
            external_launch_nodes: Vec::new(),
        }
    }

    fn target(hostname: &str, discarded: bool) -> NodeTarget {
        NodeTarget {
            hostname: hostname.to_string(),
            current_version: if discarded { "25.1.0" } else { "24.0.0" }
                .to_string(),
            reachable: true,
            discarded,
        }
    }

    fn launches(shell: &FakeShell) -> Vec<(String, String)> {
        shell.commands_containing("updatemgr --upgrade")
    }

    #[tokio::test]
    async fn rolling_round_trip_with_a_discarded_node() {
        let h = harness();
        let targets = [
            target("node1", true),
            target("node2", false),
            target("node3", false),
        ];

        let outcome = h
            .scheduler
            .run(
                &request(OperationStyle::Rolling, false),
                &targets,
                &h.pair,
                &h.store,
            )
            .await
            .unwrap();
        assert_eq!(outcome, RolloutOutcome::Success);

        // One executor invocation per non-discarded node, none for node1.
        assert_eq!(launches(&h.shell).len(), 2);
        for (_, cmd) in h.shell.commands_containing("cat > ") {
            if cmd.contains("nodes.lst") {
                assert!(!cmd.contains("node1\n"));
            }
        }

        // PRE and POST bracket each node's EXEC, strictly in order.
        let calls = h.plugins.calls();
        assert_eq!(
            calls,
            vec![
                ("node2".to_string(), Stage::Pre, false),
                ("node2".to_string(), Stage::Post, false),
                ("node3".to_string(), Stage::Pre, false),
                ("node3".to_string(), Stage::Post, false),
            ]
        );

        let doc = h.store.read().await.unwrap();
        for node in ["node1", "node2", "node3"] {
            for stage in Stage::ALL {
                assert_eq!(
                    doc.nodes[node].get(stage),
                    StageStatus::Completed,
                    "{node} {stage}"
                );
            }
        }
    }

    #[tokio::test]
    async fn rolling_halts_the_fleet_on_an_exec_failure() {
        let h = harness();
        h.shell.set_executor_exit("node1", 1);
        let targets = [
            target("node1", true),
            target("node2", false),
            target("node3", false),
        ];

        let err = h
            .scheduler
            .run(
                &request(OperationStyle::Rolling, false),
                &targets,
                &h.pair,
                &h.store,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            PatchError::StageFailed { node, stage: Stage::Exec, code: 1 }
                if node == "node2"
        ));

        // node3 was never entered.
        assert_eq!(h.plugins.calls_for("node3", Stage::Pre), 0);
        let doc = h.store.read().await.unwrap();
        assert_eq!(doc.nodes["node2"].get(Stage::Exec), StageStatus::Failed);
        assert_eq!(doc.nodes["node3"].get(Stage::Pre), StageStatus::Pending);
    }

    #[tokio::test]
    async fn pre_failure_prevents_any_executor_launch() {
        let h = harness();
        h.plugins.fail("node2", Stage::Pre, 7);
        let targets = [target("node2", false), target("node3", false)];

        let err = h
            .scheduler
            .run(
                &request(OperationStyle::Rolling, false),
                &targets,
                &h.pair,
                &h.store,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            PatchError::StageFailed { node, stage: Stage::Pre, code: 7 }
                if node == "node2"
        ));
        assert!(launches(&h.shell).is_empty());
    }

    #[tokio::test]
    async fn live_session_fails_a_non_retry_request_with_zero_launches() {
        let h = harness();
        h.shell.respond("node3", "pgrep", CommandOutput::ok("4242"));
        let targets = [
            target("node1", false),
            target("node2", false),
            target("node3", false),
        ];

        let err = h
            .scheduler
            .run(
                &request(OperationStyle::Rolling, false),
                &targets,
                &h.pair,
                &h.store,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            PatchError::SessionAlreadyExists { node } if node == "node3"
        ));
        assert!(launches(&h.shell).is_empty());
        // Metadata was never touched either.
        assert!(h.store.read().await.is_err());
    }

    #[tokio::test]
    async fn non_rolling_batches_one_invocation_per_round() {
        let h = harness();
        let targets = [
            target("node1", false),
            target("node2", false),
            target("node3", false),
        ];

        let outcome = h
            .scheduler
            .run(
                &request(OperationStyle::NonRolling, false),
                &targets,
                &h.pair,
                &h.store,
            )
            .await
            .unwrap();
        assert_eq!(outcome, RolloutOutcome::Success);

        // Round one: node2 bootstraps node1. Round two: node1 drives the
        // rest as a single batch.
        let launched = launches(&h.shell);
        assert_eq!(launched.len(), 2);
        assert_eq!(launched[0].0, "node2");
        assert_eq!(launched[1].0, "node1");

        let nodes_lists: Vec<String> = h
            .shell
            .commands_containing("nodes.lst <<'EOF'")
            .into_iter()
            .map(|(_, cmd)| cmd)
            .collect();
        assert!(nodes_lists[0].contains("node1"));
        assert!(nodes_lists[1].contains("node2\nnode3"));

        // Both PREs of the batch round precede its POSTs.
        let calls = h.plugins.calls();
        assert_eq!(
            calls[2..],
            [
                ("node2".to_string(), Stage::Pre, false),
                ("node3".to_string(), Stage::Pre, false),
                ("node2".to_string(), Stage::Post, false),
                ("node3".to_string(), Stage::Post, false),
            ]
        );
    }

    #[tokio::test]
    async fn suppression_marker_is_cleared_even_on_failure() {
        let h = harness();
        h.shell.set_executor_exit("node1", 1);
        let targets = [target("node2", false), target("node3", false)];

        let _ = h
            .scheduler
            .run(
                &request(OperationStyle::Rolling, false),
                &targets,
                &h.pair,
                &h.store,
            )
            .await
            .unwrap_err();

        let touched = h.shell.commands_containing("touch /var/run/patch-in-progress");
        let cleared = h.shell.commands_containing("rm -f /var/run/patch-in-progress");
        assert_eq!(touched.len(), 1);
        assert_eq!(cleared.len(), 1);
        assert_eq!(touched[0].0, "node2");
        assert_eq!(cleared[0].0, "node2");
    }

    #[tokio::test]
    async fn quorum_miss_aborts_before_any_side_effect() {
        let h = harness();
        for node in ["node1", "node2", "node3"] {
            h.shell.fail_command_on(node, "clusterctl check membership", 1);
        }
        let targets = [
            target("node1", false),
            target("node2", false),
            target("node3", false),
        ];

        let err = h
            .scheduler
            .run(
                &request(OperationStyle::Rolling, false),
                &targets,
                &h.pair,
                &h.store,
            )
            .await
            .unwrap_err();
        assert!(matches!(&err, PatchError::QuorumNotMet { unhealthy, .. }
            if unhealthy.len() == 3));
        assert!(launches(&h.shell).is_empty());
        assert!(h.store.read().await.is_err());
    }

    #[tokio::test]
    async fn storage_gate_failure_after_exec_is_a_distinct_quorum_error() {
        let h = harness();
        for node in ["node2", "node3"] {
            h.shell.fail_command_on(node, "storagectl check heartbeat", 1);
        }
        let targets = [
            target("node1", false),
            target("node2", false),
            target("node3", false),
        ];

        let err = h
            .scheduler
            .run(
                &request(OperationStyle::Rolling, false),
                &targets,
                &h.pair,
                &h.store,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            PatchError::QuorumNotMet { kind: "storage heartbeat", .. }
        ));
    }

    #[tokio::test]
    async fn completed_request_retried_is_a_no_op() {
        let h = harness();
        let targets = [target("node2", false), target("node3", false)];
        let mut req = request(OperationStyle::Rolling, false);

        h.scheduler.run(&req, &targets, &h.pair, &h.store).await.unwrap();
        let launches_before = launches(&h.shell).len();
        let doc_before = h.store.read().await.unwrap();

        // Same request id, now flagged as a retry.
        req.is_retry = true;
        let outcome = h
            .scheduler
            .run(&req, &targets, &h.pair, &h.store)
            .await
            .unwrap();
        assert_eq!(outcome, RolloutOutcome::Success);
        assert_eq!(launches(&h.shell).len(), launches_before);
        assert_eq!(h.store.read().await.unwrap(), doc_before);
    }

    #[tokio::test]
    async fn retry_adopts_an_interrupted_exec_invocation() {
        let h = harness();
        let mut req = request(OperationStyle::Rolling, true);
        req.request_id = Uuid::new_v4();
        let targets = [target("node2", false), target("node3", false)];

        // The previous run launched node2's EXEC from node1 and died.
        h.store
            .initialize(&["node2".to_string(), "node3".to_string()])
            .await
            .unwrap();
        h.store
            .set("node2", Stage::Pre, StageStatus::Completed, None)
            .await
            .unwrap();
        h.store
            .set("node2", Stage::Exec, StageStatus::Running, Some("node1"))
            .await
            .unwrap();
        let log_dir = exec_log_dir(
            &Config::default().patch_base,
            req.request_id,
        );
        h.shell.put_file(
            "node1",
            crate::session::console_path(&log_dir).as_str(),
            "console",
        );
        h.shell
            .put_file("node1", log_dir.join("exit.status").as_str(), "0");

        let outcome = h
            .scheduler
            .run(&req, &targets, &h.pair, &h.store)
            .await
            .unwrap();
        assert_eq!(outcome, RolloutOutcome::Success);

        // node2's EXEC was adopted, not relaunched; node3 got a fresh one.
        let launched = launches(&h.shell);
        assert_eq!(launched.len(), 1);
        assert!(
            h.shell
                .commands_containing("nodes.lst <<'EOF'")
                .last()
                .unwrap()
                .1
                .contains("node3")
        );
        let doc = h.store.read().await.unwrap();
        assert_eq!(doc.nodes["node2"].get(Stage::Exec), StageStatus::Completed);
        assert_eq!(doc.nodes["node3"].get(Stage::Post), StageStatus::Completed);
    }

    #[tokio::test]
    async fn adopted_invocation_clears_the_suppression_marker() {
        let h = harness();
        let mut req = request(OperationStyle::Rolling, true);
        req.request_id = Uuid::new_v4();
        let targets = [target("node2", false), target("node3", false)];

        // The previous run set node2's marker, launched its EXEC from node1,
        // and died before the window could be closed.
        h.store
            .initialize(&["node2".to_string(), "node3".to_string()])
            .await
            .unwrap();
        h.store
            .set("node2", Stage::Pre, StageStatus::Completed, None)
            .await
            .unwrap();
        h.store
            .set("node2", Stage::Exec, StageStatus::Running, Some("node1"))
            .await
            .unwrap();
        h.shell.put_file("node2", "/var/run/patch-in-progress", "");
        let log_dir =
            exec_log_dir(&Config::default().patch_base, req.request_id);
        h.shell.put_file(
            "node1",
            crate::session::console_path(&log_dir).as_str(),
            "console",
        );
        h.shell
            .put_file("node1", log_dir.join("exit.status").as_str(), "0");

        let outcome = h
            .scheduler
            .run(&req, &targets, &h.pair, &h.store)
            .await
            .unwrap();
        assert_eq!(outcome, RolloutOutcome::Success);
        assert!(h.shell.file("node2", "/var/run/patch-in-progress").is_none());
    }

    #[tokio::test]
    async fn diagnostics_failure_does_not_fail_the_rollout() {
        let h = harness_with(Arc::new(FakeDiagnostics::failing()));
        let targets = [target("node2", false), target("node3", false)];

        let outcome = h
            .scheduler
            .run(
                &request(OperationStyle::Rolling, false),
                &targets,
                &h.pair,
                &h.store,
            )
            .await
            .unwrap();
        assert_eq!(outcome, RolloutOutcome::Success);

        // One pull per executor invocation was attempted despite failing.
        assert_eq!(h.diagnostics.collected().len(), 2);
        let doc = h.store.read().await.unwrap();
        assert_eq!(doc.nodes["node3"].get(Stage::Post), StageStatus::Completed);
    }

    #[tokio::test]
    async fn retry_reconciles_discarded_nodes_without_artifacts() {
        let h = harness();
        let mut req = request(OperationStyle::Rolling, true);
        req.request_id = Uuid::new_v4();
        // Both nodes reached the target version; node2's EXEC record was
        // left running by the crashed previous request.
        let targets = [target("node1", true), target("node2", true)];

        h.store
            .initialize(&["node1".to_string(), "node2".to_string()])
            .await
            .unwrap();
        h.store
            .set("node2", Stage::Exec, StageStatus::Running, Some("node1"))
            .await
            .unwrap();
        h.shell.put_file("node2", "/var/run/patch-in-progress", "");

        let outcome = h
            .scheduler
            .run(&req, &targets, &h.pair, &h.store)
            .await
            .unwrap();
        assert_eq!(outcome, RolloutOutcome::NoAction);

        let doc = h.store.read().await.unwrap();
        for node in ["node1", "node2"] {
            for stage in Stage::ALL {
                assert_eq!(doc.nodes[node].get(stage), StageStatus::Completed);
            }
        }
        assert!(launches(&h.shell).is_empty());
        // The crashed run's suppression marker is gone as well.
        assert!(h.shell.file("node2", "/var/run/patch-in-progress").is_none());
    }

    #[tokio::test]
    async fn discarded_fleet_is_no_action() {
        let h = harness();
        let targets = [target("node1", true), target("node2", true)];

        let outcome = h
            .scheduler
            .run(
                &request(OperationStyle::Rolling, false),
                &targets,
                &h.pair,
                &h.store,
            )
            .await
            .unwrap();
        assert_eq!(outcome, RolloutOutcome::NoAction);
        assert!(launches(&h.shell).is_empty());

        let doc = h.store.read().await.unwrap();
        for stage in Stage::ALL {
            assert_eq!(doc.nodes["node1"].get(stage), StageStatus::Completed);
        }
    }

    #[tokio::test]
    async fn executor_log_directory_is_renamed_after_the_invocation() {
        let h = harness();
        let req = request(OperationStyle::NonRolling, false);
        let targets = [target("node2", false), target("node3", false)];

        h.scheduler.run(&req, &targets, &h.pair, &h.store).await.unwrap();

        let log_dir = exec_log_dir(&Config::default().patch_base, req.request_id);
        let renamed: Utf8PathBuf =
            crate::session::completed_log_dir(&log_dir, "node1");
        assert!(
            h.shell
                .file("node1", renamed.join("ExecutorConsole.out").as_str())
                .is_some()
        );
    }
}
