// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable per-node, per-stage patch state.
//!
//! A small JSON document, replicated onto every launch node over the same
//! remote-shell channel used for everything else, so any launch node can
//! resume an interrupted run. Written exclusively by the single control
//! task; individual writes are whole-document replacements, so no locking
//! is needed on top of the storage layer.

use crate::errors::PatchError;
use crate::session;
use crate::shell::RemoteShell;
use crate::stage::{Stage, StageMap, StageStatus};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, info, o, warn};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::sync::Arc;

/// File name of the metadata document under the patch base directory.
pub const METADATA_FILE: &str = "patch_states.json";

/// The wire form of the store: per-node stage statuses keyed by hostname,
/// plus the launch node that most recently drove an executor run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDocument {
    #[serde(
        rename = "_activeLaunchNode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub active_launch_node: Option<String>,
    #[serde(flatten)]
    pub nodes: BTreeMap<String, StageMap>,
}

impl MetadataDocument {
    pub fn new_pending(nodes: &[String]) -> Self {
        Self {
            active_launch_node: None,
            nodes: nodes
                .iter()
                .map(|n| (n.clone(), StageMap::new_pending()))
                .collect(),
        }
    }
}

/// What a retry should do about a discarded node whose EXEC record was left
/// `running` by a crashed or interrupted previous request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDisposition {
    /// No console artifact found in either possible location: the previous
    /// run must have finished and been cleaned up. Best-effort heuristic,
    /// not a hard guarantee (see [`PatchMetadataStore::locate_inflight_exec`]).
    AssumeCompleted,
    /// A console artifact exists; attach to the (possibly still live)
    /// session there and take the terminal status from its real exit code.
    Attach { launch_node: String, log_dir: Utf8PathBuf },
}

pub struct PatchMetadataStore {
    shell: Arc<dyn RemoteShell>,
    /// Launch nodes holding a replica of the document.
    metadata_nodes: Vec<String>,
    file: Utf8PathBuf,
    log: Logger,
}

impl PatchMetadataStore {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        metadata_nodes: Vec<String>,
        patch_base: &Utf8Path,
        log: &Logger,
    ) -> Self {
        Self {
            shell,
            metadata_nodes,
            file: patch_base.join(METADATA_FILE),
            log: log.new(o!("component" => "PatchMetadataStore")),
        }
    }

    /// Lay down a fresh all-pending document on every launch node.
    pub async fn initialize(&self, nodes: &[String]) -> Result<(), PatchError> {
        info!(
            self.log, "writing initial patch states";
            "file" => %self.file,
            "metadata_nodes" => ?self.metadata_nodes,
        );
        self.write_all(&MetadataDocument::new_pending(nodes)).await
    }

    /// Read the document from the first launch node that has a readable
    /// copy.
    pub async fn read(&self) -> Result<MetadataDocument, PatchError> {
        let command = format!("cat {}", self.file);
        let mut last_transport: Option<PatchError> = None;
        for node in &self.metadata_nodes {
            match self.shell.run(node, &command).await {
                Ok(output) if output.success() => {
                    return serde_json::from_str(&output.stdout).map_err(
                        |source| PatchError::MetadataParse {
                            node: node.clone(),
                            source,
                        },
                    );
                }
                Ok(output) => {
                    debug!(
                        self.log, "metadata file not readable";
                        "node" => node,
                        "exit_code" => output.exit_code,
                    );
                }
                Err(source) => {
                    warn!(
                        self.log, "metadata node unreachable";
                        "node" => node,
                        InlineErrorChain::new(&source),
                    );
                    last_transport = Some(PatchError::MetadataIo { source });
                }
            }
        }
        Err(last_transport.unwrap_or_else(|| PatchError::MetadataUnavailable {
            reason: format!(
                "{} not found on any of {:?}",
                self.file, self.metadata_nodes
            ),
        }))
    }

    pub async fn get(
        &self,
        node: &str,
        stage: Stage,
    ) -> Result<StageStatus, PatchError> {
        let doc = self.read().await?;
        doc.nodes.get(node).map(|stages| stages.get(stage)).ok_or_else(|| {
            PatchError::MetadataUnavailable {
                reason: format!("node {node} missing from patch states"),
            }
        })
    }

    /// Record one (node, stage) status, optionally moving the active launch
    /// node pointer in the same write.
    pub async fn set(
        &self,
        node: &str,
        stage: Stage,
        status: StageStatus,
        active_launch_node: Option<&str>,
    ) -> Result<(), PatchError> {
        let mut doc = self.read().await?;
        let stages = doc.nodes.get_mut(node).ok_or_else(|| {
            PatchError::MetadataUnavailable {
                reason: format!("node {node} missing from patch states"),
            }
        })?;
        stages.set(stage, status);
        if let Some(launch_node) = active_launch_node {
            doc.active_launch_node = Some(launch_node.to_string());
        }
        debug!(
            self.log, "patch state updated";
            "node" => node,
            "stage" => %stage,
            "status" => %status,
        );
        self.write_all(&doc).await
    }

    /// Stamp every stage of a node at once (used for discarded nodes).
    pub async fn set_all_stages(
        &self,
        node: &str,
        status: StageStatus,
    ) -> Result<(), PatchError> {
        let mut doc = self.read().await?;
        let stages = doc.nodes.get_mut(node).ok_or_else(|| {
            PatchError::MetadataUnavailable {
                reason: format!("node {node} missing from patch states"),
            }
        })?;
        *stages = StageMap::all(status);
        self.write_all(&doc).await
    }

    /// Move the active-launch-node pointer. An explicit field on the
    /// document, never ambient state, so concurrent runs of different
    /// requests cannot interfere through it.
    pub async fn set_active_launch_node(
        &self,
        launch_node: &str,
    ) -> Result<(), PatchError> {
        let mut doc = self.read().await?;
        doc.active_launch_node = Some(launch_node.to_string());
        self.write_all(&doc).await
    }

    pub async fn active_launch_node(&self) -> Result<Option<String>, PatchError> {
        Ok(self.read().await?.active_launch_node)
    }

    /// Locate the console output of an EXEC invocation a previous request
    /// left `running`, using the active-launch-node pointer.
    ///
    /// The console file can be in one of two places: the in-flight log
    /// directory, or the directory the orchestrator renames it to on
    /// completion. If it is in neither, the node is assumed already fully
    /// updated; console artifacts cannot outlive a genuinely finished run
    /// indefinitely. This is a documented best-effort heuristic, not a
    /// correctness guarantee.
    pub async fn locate_inflight_exec(
        &self,
        request_log_dir: &Utf8Path,
    ) -> Result<RetryDisposition, PatchError> {
        let Some(launch_node) = self.active_launch_node().await? else {
            return Ok(RetryDisposition::AssumeCompleted);
        };

        let inflight_console = session::console_path(request_log_dir);
        if self.file_exists(&launch_node, &inflight_console).await? {
            return Ok(RetryDisposition::Attach {
                launch_node,
                log_dir: request_log_dir.to_owned(),
            });
        }

        let renamed_dir =
            session::completed_log_dir(request_log_dir, &launch_node);
        let renamed_console = session::console_path(&renamed_dir);
        if self.file_exists(&launch_node, &renamed_console).await? {
            return Ok(RetryDisposition::Attach {
                launch_node,
                log_dir: renamed_dir,
            });
        }

        info!(
            self.log,
            "no executor console artifact found; assuming the run finished";
            "launch_node" => &launch_node,
            "log_dir" => %request_log_dir,
        );
        Ok(RetryDisposition::AssumeCompleted)
    }

    async fn file_exists(
        &self,
        node: &str,
        path: &Utf8Path,
    ) -> Result<bool, PatchError> {
        let output = self
            .shell
            .run(node, &format!("test -f {path}"))
            .await
            .map_err(|source| PatchError::MetadataIo { source })?;
        Ok(output.success())
    }

    /// Replicate the document to every metadata node. Individual replica
    /// failures are tolerated as long as at least one write lands; `read`
    /// scans replicas in the same order.
    async fn write_all(&self, doc: &MetadataDocument) -> Result<(), PatchError> {
        let json = serde_json::to_string_pretty(doc).map_err(|source| {
            PatchError::MetadataParse { node: "local".to_string(), source }
        })?;
        let dir = self.file.parent().unwrap_or(Utf8Path::new("/"));
        let command = format!(
            "mkdir -p {dir} && cat > {} <<'EOF'\n{json}\nEOF",
            self.file
        );

        let mut wrote_any = false;
        let mut last_error = None;
        for node in &self.metadata_nodes {
            match self.shell.run(node, &command).await {
                Ok(output) if output.success() => wrote_any = true,
                Ok(output) => {
                    warn!(
                        self.log, "metadata write returned non-zero";
                        "node" => node,
                        "exit_code" => output.exit_code,
                    );
                }
                Err(source) => {
                    warn!(
                        self.log, "metadata write unreachable";
                        "node" => node,
                        InlineErrorChain::new(&source),
                    );
                    last_error = Some(source);
                }
            }
        }
        if wrote_any {
            Ok(())
        } else {
            match last_error {
                Some(source) => Err(PatchError::MetadataIo { source }),
                None => Err(PatchError::MetadataUnavailable {
                    reason: format!(
                        "could not write {} to any of {:?}",
                        self.file, self.metadata_nodes
                    ),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeShell;

    fn store(shell: Arc<FakeShell>, metadata_nodes: &[&str]) -> PatchMetadataStore {
        let log = crate::test_util::log();
        PatchMetadataStore::new(
            shell,
            metadata_nodes.iter().map(|s| s.to_string()).collect(),
            Utf8Path::new("/opt/fleet-patch"),
            &log,
        )
    }

    fn fleet() -> Vec<String> {
        vec!["node1".to_string(), "node2".to_string(), "node3".to_string()]
    }

    #[tokio::test]
    async fn initialize_replicates_to_every_metadata_node() {
        let shell = Arc::new(FakeShell::default());
        let store = store(Arc::clone(&shell), &["node1", "node2"]);
        store.initialize(&fleet()).await.unwrap();

        for node in ["node1", "node2"] {
            let raw = shell
                .file(node, "/opt/fleet-patch/patch_states.json")
                .expect("replica written");
            let doc: MetadataDocument = serde_json::from_str(&raw).unwrap();
            assert_eq!(doc.nodes.len(), 3);
            assert_eq!(
                doc.nodes["node2"].get(Stage::Exec),
                StageStatus::Pending
            );
        }
    }

    #[tokio::test]
    async fn set_and_get_round_trip() {
        let shell = Arc::new(FakeShell::default());
        let store = store(Arc::clone(&shell), &["node1", "node2"]);
        store.initialize(&fleet()).await.unwrap();

        store
            .set("node2", Stage::Exec, StageStatus::Running, Some("node1"))
            .await
            .unwrap();

        assert_eq!(
            store.get("node2", Stage::Exec).await.unwrap(),
            StageStatus::Running
        );
        assert_eq!(
            store.active_launch_node().await.unwrap().as_deref(),
            Some("node1")
        );

        // The wire document uses the documented key names.
        let raw = shell
            .file("node1", "/opt/fleet-patch/patch_states.json")
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["_activeLaunchNode"], "node1");
        assert_eq!(value["node2"]["EXEC"], "running");
    }

    #[tokio::test]
    async fn read_falls_back_past_an_unreachable_replica() {
        let shell = Arc::new(FakeShell::default());
        let store = store(Arc::clone(&shell), &["node1", "node2"]);
        store.initialize(&fleet()).await.unwrap();
        shell.set_unreachable("node1");

        let doc = store.read().await.unwrap();
        assert_eq!(doc.nodes.len(), 3);
    }

    #[tokio::test]
    async fn missing_document_everywhere_is_an_error() {
        let shell = Arc::new(FakeShell::default());
        let store = store(Arc::clone(&shell), &["node1"]);
        let err = store.read().await.unwrap_err();
        assert!(matches!(err, PatchError::MetadataUnavailable { .. }));
    }

    #[tokio::test]
    async fn inflight_lookup_checks_both_console_locations() {
        let shell = Arc::new(FakeShell::default());
        let store = store(Arc::clone(&shell), &["node1", "node2"]);
        store.initialize(&fleet()).await.unwrap();
        store.set_active_launch_node("node1.example.com").await.unwrap();

        let log_dir = Utf8PathBuf::from("/opt/fleet-patch/executor_log_req");

        // Nothing anywhere: assume the run finished.
        assert_eq!(
            store.locate_inflight_exec(&log_dir).await.unwrap(),
            RetryDisposition::AssumeCompleted
        );

        // In-flight location wins.
        shell.put_file(
            "node1.example.com",
            "/opt/fleet-patch/executor_log_req/ExecutorConsole.out",
            "console",
        );
        assert_eq!(
            store.locate_inflight_exec(&log_dir).await.unwrap(),
            RetryDisposition::Attach {
                launch_node: "node1.example.com".to_string(),
                log_dir: log_dir.clone(),
            }
        );

        // After the post-completion rename, the renamed directory is found.
        let renamed = Utf8PathBuf::from(
            "/opt/fleet-patch/executor_log_req_node1/ExecutorConsole.out",
        );
        let shell2 = Arc::new(FakeShell::default());
        let store2 = store2_helper(Arc::clone(&shell2)).await;
        shell2.put_file("node1.example.com", renamed.as_str(), "console");
        assert_eq!(
            store2.locate_inflight_exec(&log_dir).await.unwrap(),
            RetryDisposition::Attach {
                launch_node: "node1.example.com".to_string(),
                log_dir: Utf8PathBuf::from(
                    "/opt/fleet-patch/executor_log_req_node1"
                ),
            }
        );
    }

    async fn store2_helper(shell: Arc<FakeShell>) -> PatchMetadataStore {
        let s = store(shell, &["node1", "node2"]);
        s.initialize(&fleet()).await.unwrap();
        s.set_active_launch_node("node1.example.com").await.unwrap();
        s
    }

    #[tokio::test]
    async fn no_active_launch_node_means_assume_completed() {
        let shell = Arc::new(FakeShell::default());
        let store = store(Arc::clone(&shell), &["node1"]);
        store.initialize(&fleet()).await.unwrap();

        let disposition = store
            .locate_inflight_exec(Utf8Path::new(
                "/opt/fleet-patch/executor_log_req",
            ))
            .await
            .unwrap();
        assert_eq!(disposition, RetryDisposition::AssumeCompleted);
    }
}
