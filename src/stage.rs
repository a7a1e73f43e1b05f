// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-node patch stages and their status lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three stages a node passes through during a rollout.
///
/// Transitions for a given node are strictly ordered: `Pre` before `Exec`
/// before `Post`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Stage {
    /// Pre-update plugin run.
    #[serde(rename = "PRE")]
    Pre,
    /// The executor invocation itself.
    #[serde(rename = "EXEC")]
    Exec,
    /// Post-update plugin run plus validation.
    #[serde(rename = "POST")]
    Post,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Pre, Stage::Exec, Stage::Post];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pre => "PRE",
            Stage::Exec => "EXEC",
            Stage::Post => "POST",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one (node, stage) pair.
///
/// `Completed` and `Failed` are terminal for a given request; only a new
/// request with `is_retry = true` re-examines `Running` records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three per-node stage statuses, keyed by [`Stage`].
///
/// An enum-keyed struct rather than a string-keyed map so stage-transition
/// logic gets exhaustiveness checking from the compiler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMap {
    #[serde(rename = "PRE")]
    pub pre: StageStatus,
    #[serde(rename = "EXEC")]
    pub exec: StageStatus,
    #[serde(rename = "POST")]
    pub post: StageStatus,
}

impl StageMap {
    pub fn new_pending() -> Self {
        Self {
            pre: StageStatus::Pending,
            exec: StageStatus::Pending,
            post: StageStatus::Pending,
        }
    }

    pub fn all(status: StageStatus) -> Self {
        Self { pre: status, exec: status, post: status }
    }

    pub fn get(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Pre => self.pre,
            Stage::Exec => self.exec,
            Stage::Post => self.post,
        }
    }

    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Pre => self.pre = status,
            Stage::Exec => self.exec = status,
            Stage::Post => self.post = status,
        }
    }
}
