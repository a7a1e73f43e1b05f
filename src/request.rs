// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and result types exchanged with upstream automation.

use crate::errors::ErrorCode;
use crate::stage::{Stage, StageStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The operation a [`PatchRequest`] asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    Precheck,
    Apply,
    Rollback,
    BackupImage,
    Postcheck,
}

impl TaskKind {
    /// The subcommand handed to the vendor update executor.
    pub fn executor_operation(&self) -> &'static str {
        match self {
            TaskKind::Precheck => "precheck",
            TaskKind::Apply => "upgrade",
            TaskKind::Rollback => "rollback",
            TaskKind::BackupImage => "backup",
            TaskKind::Postcheck => "postcheck",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.executor_operation())
    }
}

/// Scheduling policy: one node at a time vs. one batch at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStyle {
    Rolling,
    NonRolling,
}

/// One orchestration run. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRequest {
    pub request_id: Uuid,
    pub task: TaskKind,
    pub style: OperationStyle,
    pub target_version: String,
    /// A retry re-examines `running` metadata records and may attach to a
    /// live executor session instead of failing on it.
    pub is_retry: bool,
    /// When non-empty, the first entry is used verbatim as the single launch
    /// node and no second bootstrap round is scheduled.
    #[serde(default)]
    pub external_launch_nodes: Vec<String>,
}

impl PatchRequest {
    /// Effective scheduling style for this request.
    ///
    /// Precheck and image backup never change node state, so they always run
    /// non-rolling: a single batched executor invocation is much cheaper than
    /// bracketing every node individually.
    pub fn effective_style(&self) -> OperationStyle {
        match self.task {
            TaskKind::Precheck | TaskKind::BackupImage => {
                OperationStyle::NonRolling
            }
            _ => self.style,
        }
    }
}

/// One candidate node, as seen at request start. Not persisted beyond the
/// run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTarget {
    pub hostname: String,
    pub current_version: String,
    pub reachable: bool,
    /// Already at the target version: excluded from the executor run but
    /// still tracked to completion for accounting.
    pub discarded: bool,
}

/// Overall request status reported to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    Failure,
    /// Every node was already at the target version; nothing was done.
    Noop,
}

/// Per-node entry in the caller-facing payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub node: String,
    /// The furthest stage this node reached (the failing stage on failure).
    pub stage: Stage,
    pub status: StageStatus,
    pub message: String,
}

/// The JSON response contract used by upstream automation.
///
/// `message` is a human-readable suggestion; underlying error chains are
/// logged but never included here.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOutcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub message: String,
    pub per_node: Vec<NodeReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precheck_and_backup_force_non_rolling() {
        let mut request = PatchRequest {
            request_id: Uuid::new_v4(),
            task: TaskKind::Precheck,
            style: OperationStyle::Rolling,
            target_version: "25.1.0".to_string(),
            is_retry: false,
            external_launch_nodes: Vec::new(),
        };
        assert_eq!(request.effective_style(), OperationStyle::NonRolling);

        request.task = TaskKind::BackupImage;
        assert_eq!(request.effective_style(), OperationStyle::NonRolling);

        request.task = TaskKind::Apply;
        assert_eq!(request.effective_style(), OperationStyle::Rolling);
    }

    #[test]
    fn outcome_payload_uses_wire_names() {
        let outcome = PatchOutcome {
            status: OutcomeStatus::Noop,
            error_code: None,
            message: "No action required.".to_string(),
            per_node: vec![NodeReport {
                node: "node1".to_string(),
                stage: Stage::Post,
                status: StageStatus::Completed,
                message: String::new(),
            }],
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "NOOP");
        assert_eq!(json["perNode"][0]["stage"], "POST");
        assert!(json.get("errorCode").is_none());
    }
}
