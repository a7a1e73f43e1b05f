// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestration engine for rolling and non-rolling software-update rollouts
//! across a fleet of paired compute nodes.
//!
//! A "launch node" drives the update of its peers through an external,
//! vendor-supplied update executor reached over a remote shell session. This
//! crate is the control plane around that executor: it decides when, on which
//! node, in what order, and with what recovery the executor and its
//! surrounding health gates run, while surviving process crashes, operator
//! retries, and partial fleet failures without double-applying or silently
//! skipping work.
//!
//! The entry point is [`orchestrator::PatchOrchestrator`]; everything it
//! needs from the outside world (remote command execution, cluster topology,
//! pre/post plugins, diagnostics collection) arrives through the traits in
//! [`shell`].

pub mod config;
pub mod errors;
pub mod health;
pub mod launch;
pub mod metadata;
pub mod orchestrator;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod shell;
pub mod stage;
pub mod task_set;
pub mod test_util;
