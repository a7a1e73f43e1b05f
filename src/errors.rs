// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy for the orchestration engine.
//!
//! Every failure carries an [`ErrorCode`] (stable, machine-readable, part of
//! the caller payload) and a human-readable suggestion string. Underlying
//! error chains are logged by the component that hit them but never surface
//! in the caller-facing payload.

use crate::shell::ShellError;
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes reported to upstream automation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    InsufficientLaunchNodes,
    NodesUnreachable,
    SessionAlreadyExists,
    QuorumNotMet,
    PreStageFailed,
    ExecStageFailed,
    PostStageFailed,
    ExecutorTimeout,
    BatchKilled,
    MetadataIo,
    RetryResumeFailed,
    PayloadStagingFailed,
}

/// Failures surfaced by the engine.
///
/// Timeout variants (`ExecutorTimeout`, `BatchKilled`) are deliberately
/// distinct from ordinary stage failures so callers can tell "infrastructure
/// did not respond" from "the update genuinely failed".
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("malformed patch request: {reason}")]
    InvalidRequest { reason: String },

    #[error(
        "cannot pick launch nodes: {available} usable candidate(s), \
         need at least two (or an external launch node)"
    )]
    InsufficientLaunchNodes { available: usize },

    #[error("candidate nodes are unreachable: {nodes:?}")]
    NodesUnreachable { nodes: Vec<String> },

    #[error("an executor session is already running on {node}")]
    SessionAlreadyExists { node: String },

    #[error("fleet health quorum not met ({kind}); unhealthy nodes: {unhealthy:?}")]
    QuorumNotMet { kind: &'static str, unhealthy: Vec<String> },

    #[error("{stage} stage failed on {node} (exit code {code})")]
    StageFailed { node: String, stage: Stage, code: i32 },

    #[error(
        "executor on {launch_node} did not complete within the configured \
         ceiling of {ceiling_secs}s"
    )]
    ExecutorTimeout { launch_node: String, ceiling_secs: u64 },

    #[error("parallel {operation} batch exceeded its join deadline and was killed")]
    BatchKilled { operation: &'static str },

    #[error("failed to read or write patch metadata")]
    MetadataIo {
        #[source]
        source: ShellError,
    },

    #[error("patch metadata unavailable: {reason}")]
    MetadataUnavailable { reason: String },

    #[error("metadata document on {node} is not valid JSON")]
    MetadataParse {
        node: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not resume the in-flight executor run for {node}")]
    RetryResumeFailed { node: String, code: i32 },

    #[error("failed to stage the update payload on launch node {node}")]
    PayloadStagingFailed { node: String, code: i32 },
}

impl PatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PatchError::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            PatchError::InsufficientLaunchNodes { .. } => {
                ErrorCode::InsufficientLaunchNodes
            }
            PatchError::NodesUnreachable { .. } => ErrorCode::NodesUnreachable,
            PatchError::SessionAlreadyExists { .. } => {
                ErrorCode::SessionAlreadyExists
            }
            PatchError::QuorumNotMet { .. } => ErrorCode::QuorumNotMet,
            PatchError::StageFailed { stage, .. } => match stage {
                Stage::Pre => ErrorCode::PreStageFailed,
                Stage::Exec => ErrorCode::ExecStageFailed,
                Stage::Post => ErrorCode::PostStageFailed,
            },
            PatchError::ExecutorTimeout { .. } => ErrorCode::ExecutorTimeout,
            PatchError::BatchKilled { .. } => ErrorCode::BatchKilled,
            PatchError::MetadataIo { .. }
            | PatchError::MetadataUnavailable { .. }
            | PatchError::MetadataParse { .. } => ErrorCode::MetadataIo,
            PatchError::RetryResumeFailed { .. } => ErrorCode::RetryResumeFailed,
            PatchError::PayloadStagingFailed { .. } => {
                ErrorCode::PayloadStagingFailed
            }
        }
    }

    /// Operator-facing suggestion accompanying every failure.
    pub fn suggestion(&self) -> String {
        match self {
            PatchError::InvalidRequest { reason } => {
                format!("Fix the request and resubmit: {reason}.")
            }
            PatchError::InsufficientLaunchNodes { .. } => {
                "Ensure at least two reachable candidate nodes exist, or \
                 supply an external launch node."
                    .to_string()
            }
            PatchError::NodesUnreachable { nodes } => format!(
                "Validate keys and host access control for {nodes:?}, then \
                 retry the patch operation."
            ),
            PatchError::SessionAlreadyExists { node } => format!(
                "An executor session already exists on {node}. Wait for it \
                 to finish, or re-issue the request with isRetry to attach."
            ),
            PatchError::QuorumNotMet { unhealthy, .. } => format!(
                "Bring the services on {unhealthy:?} back up so that at \
                 least two nodes are healthy, then retry."
            ),
            PatchError::StageFailed { node, stage, .. } => format!(
                "{stage} failed on {node}. Inspect the logs on that node and \
                 re-issue the request with isRetry once resolved."
            ),
            PatchError::ExecutorTimeout { launch_node, .. } => format!(
                "The executor session on {launch_node} is still running or \
                 stuck. Inspect its console log before retrying."
            ),
            PatchError::BatchKilled { operation } => format!(
                "Timed out waiting for parallel {operation} workers. Check \
                 node connectivity and retry."
            ),
            PatchError::MetadataIo { .. }
            | PatchError::MetadataUnavailable { .. }
            | PatchError::MetadataParse { .. } => {
                "Verify the metadata file on the launch nodes is readable \
                 and writable, then retry."
                    .to_string()
            }
            PatchError::RetryResumeFailed { node, code } => format!(
                "The previously in-flight executor run for {node} finished \
                 with exit code {code}. Inspect its console log before \
                 retrying."
            ),
            PatchError::PayloadStagingFailed { node, .. } => format!(
                "Staging the update payload on {node} failed. Verify disk \
                 space and the payload location, then retry."
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failures_map_to_stage_specific_codes() {
        for (stage, code) in [
            (Stage::Pre, ErrorCode::PreStageFailed),
            (Stage::Exec, ErrorCode::ExecStageFailed),
            (Stage::Post, ErrorCode::PostStageFailed),
        ] {
            let err = PatchError::StageFailed {
                node: "node1".to_string(),
                stage,
                code: 1,
            };
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn timeouts_are_distinct_from_stage_failures() {
        let timeout = PatchError::ExecutorTimeout {
            launch_node: "node1".to_string(),
            ceiling_secs: 60,
        };
        assert_eq!(timeout.code(), ErrorCode::ExecutorTimeout);
        assert_ne!(timeout.code(), ErrorCode::ExecStageFailed);
    }
}
