// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Launch-node selection and the bootstrap round plan.
//!
//! The executor always runs *on* a fleet node, so the node driving everyone
//! else's update cannot drive its own. The two-round bootstrap solves this:
//! a secondary launch node first updates the primary, then the freshly
//! updated primary drives the rest of the fleet. An operator-supplied
//! external launch node sits outside the fleet and collapses the plan to a
//! single round.

use crate::errors::PatchError;
use crate::request::{NodeTarget, PatchRequest};
use slog::{Logger, info};

/// The launch nodes chosen for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchNodePair {
    /// Drives the bulk of the fleet (and hosts the executor logs and patch
    /// metadata).
    pub primary: String,
    /// Drives the primary's own update. `None` when the primary is external
    /// to the fleet and never needs updating itself.
    pub secondary: Option<String>,
}

impl LaunchNodePair {
    /// The nodes that hold a replica of the patch metadata document.
    pub fn metadata_nodes(&self) -> Vec<String> {
        let mut nodes = vec![self.primary.clone()];
        if let Some(secondary) = &self.secondary {
            nodes.push(secondary.clone());
        }
        nodes
    }
}

/// One executor invocation's worth of work: which node drives, and which
/// nodes it updates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Round {
    pub launch_node: String,
    pub targets: Vec<String>,
}

/// Pick the launch nodes for a request.
///
/// An external launch node, when supplied, is used verbatim with no
/// reachability probe of its own (it was vetted by whoever supplied it).
/// Otherwise the first two reachable candidates are taken; fewer than two
/// reachable candidates is a hard error, because a lone in-fleet launch node
/// could never be updated.
pub fn select_launch_nodes(
    request: &PatchRequest,
    targets: &[NodeTarget],
    log: &Logger,
) -> Result<LaunchNodePair, PatchError> {
    if let Some(external) = request.external_launch_nodes.first() {
        info!(
            log, "using external launch node";
            "launch_node" => external,
        );
        return Ok(LaunchNodePair {
            primary: external.clone(),
            secondary: None,
        });
    }

    let mut reachable = targets.iter().filter(|t| t.reachable);
    match (reachable.next(), reachable.next()) {
        (Some(primary), Some(secondary)) => {
            info!(
                log, "selected in-fleet launch nodes";
                "primary" => &primary.hostname,
                "secondary" => &secondary.hostname,
            );
            Ok(LaunchNodePair {
                primary: primary.hostname.clone(),
                secondary: Some(secondary.hostname.clone()),
            })
        }
        (first, _) => Err(PatchError::InsufficientLaunchNodes {
            available: first.map_or(0, |_| 1),
        }),
    }
}

/// Build the round plan for the nodes that actually need work.
///
/// With an external launch node there is a single round covering everything.
/// In-fleet, the secondary first brings the primary to the target version,
/// then the primary drives every other node needing work. Rounds whose
/// target list comes up empty (the primary was already at the target
/// version, say) are dropped.
pub fn plan_rounds(pair: &LaunchNodePair, needing: &[String]) -> Vec<Round> {
    let Some(secondary) = &pair.secondary else {
        if needing.is_empty() {
            return Vec::new();
        }
        return vec![Round {
            launch_node: pair.primary.clone(),
            targets: needing.to_vec(),
        }];
    };

    let mut rounds = Vec::new();
    if needing.contains(&pair.primary) {
        rounds.push(Round {
            launch_node: secondary.clone(),
            targets: vec![pair.primary.clone()],
        });
    }
    let rest: Vec<String> =
        needing.iter().filter(|n| *n != &pair.primary).cloned().collect();
    if !rest.is_empty() {
        rounds.push(Round { launch_node: pair.primary.clone(), targets: rest });
    }
    rounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{OperationStyle, TaskKind};
    use uuid::Uuid;

    fn request(external: &[&str]) -> PatchRequest {
        PatchRequest {
            request_id: Uuid::new_v4(),
            task: TaskKind::Apply,
            style: OperationStyle::Rolling,
            target_version: "25.1.0".to_string(),
            is_retry: false,
            external_launch_nodes: external
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    fn target(hostname: &str, reachable: bool) -> NodeTarget {
        NodeTarget {
            hostname: hostname.to_string(),
            current_version: "24.0.0".to_string(),
            reachable,
            discarded: false,
        }
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn external_launch_node_is_used_verbatim() {
        let log = crate::test_util::log();
        let pair = select_launch_nodes(
            &request(&["jump1.example.com"]),
            &[target("node1", true)],
            &log,
        )
        .unwrap();
        assert_eq!(pair.primary, "jump1.example.com");
        assert_eq!(pair.secondary, None);
        assert_eq!(pair.metadata_nodes(), vec!["jump1.example.com"]);
    }

    #[test]
    fn first_two_reachable_candidates_become_the_pair() {
        let log = crate::test_util::log();
        let pair = select_launch_nodes(
            &request(&[]),
            &[
                target("node1", false),
                target("node2", true),
                target("node3", true),
                target("node4", true),
            ],
            &log,
        )
        .unwrap();
        assert_eq!(pair.primary, "node2");
        assert_eq!(pair.secondary.as_deref(), Some("node3"));
    }

    #[test]
    fn one_reachable_candidate_is_not_enough() {
        let log = crate::test_util::log();
        let err = select_launch_nodes(
            &request(&[]),
            &[target("node1", true), target("node2", false)],
            &log,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PatchError::InsufficientLaunchNodes { available: 1 }
        ));
    }

    #[test]
    fn in_fleet_plan_bootstraps_the_primary_first() {
        let pair = LaunchNodePair {
            primary: "node1".to_string(),
            secondary: Some("node2".to_string()),
        };
        let rounds = plan_rounds(&pair, &names(&["node1", "node2", "node3"]));
        assert_eq!(
            rounds,
            vec![
                Round {
                    launch_node: "node2".to_string(),
                    targets: names(&["node1"]),
                },
                Round {
                    launch_node: "node1".to_string(),
                    targets: names(&["node2", "node3"]),
                },
            ]
        );
    }

    #[test]
    fn primary_already_done_skips_the_bootstrap_round() {
        let pair = LaunchNodePair {
            primary: "node1".to_string(),
            secondary: Some("node2".to_string()),
        };
        let rounds = plan_rounds(&pair, &names(&["node2", "node3"]));
        assert_eq!(
            rounds,
            vec![Round {
                launch_node: "node1".to_string(),
                targets: names(&["node2", "node3"]),
            }]
        );
    }

    #[test]
    fn external_plan_is_one_round() {
        let pair = LaunchNodePair {
            primary: "jump1".to_string(),
            secondary: None,
        };
        let rounds = plan_rounds(&pair, &names(&["node1", "node2"]));
        assert_eq!(
            rounds,
            vec![Round {
                launch_node: "jump1".to_string(),
                targets: names(&["node1", "node2"]),
            }]
        );
        assert!(plan_rounds(&pair, &[]).is_empty());
    }
}
