// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded-time parallel fan-out: one worker per target node.
//!
//! Two distinct timeouts apply. Each worker carries its own hard
//! `max_execution_time`; a worker that blows it is killed in place and
//! contributes no result. On top of that the whole batch is only waited for
//! up to the *largest* `join_timeout` among its tasks, a coarse,
//! fleet-protecting circuit breaker. If that wait elapses with any worker
//! still alive, every outstanding worker is aborted and the batch is
//! reported [`BatchStatus::Killed`]; callers must treat that as "no
//! guarantee about any task", not as "all tasks failed".

use futures::future::BoxFuture;
use slog::{Logger, o, warn};
use std::time::Duration;
use tokio::task::JoinSet;

/// Whether the batch ran to completion or hit the join deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    Completed,
    Killed,
}

/// Outcome of one worker that actually returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskResult<T> {
    pub id: String,
    pub outcome: T,
}

/// One unit of work, typically "do something on one node".
pub struct Task<T> {
    pub id: String,
    pub work: BoxFuture<'static, T>,
    pub max_execution_time: Duration,
    pub join_timeout: Duration,
}

impl<T> Task<T> {
    pub fn new(
        id: impl Into<String>,
        max_execution_time: Duration,
        join_timeout: Duration,
        work: BoxFuture<'static, T>,
    ) -> Self {
        Self { id: id.into(), work, max_execution_time, join_timeout }
    }
}

pub struct ParallelTaskRunner {
    log: Logger,
}

impl ParallelTaskRunner {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.new(o!("component" => "ParallelTaskRunner")) }
    }

    /// Start every task, then wait up to the largest `join_timeout` among
    /// them for all workers to finish.
    ///
    /// The result list contains only entries from workers that returned
    /// before the deadline (and within their own `max_execution_time`).
    pub async fn run<T: Send + 'static>(
        &self,
        tasks: Vec<Task<T>>,
    ) -> (BatchStatus, Vec<TaskResult<T>>) {
        if tasks.is_empty() {
            return (BatchStatus::Completed, Vec::new());
        }

        let join_deadline = tasks
            .iter()
            .map(|t| t.join_timeout)
            .max()
            .unwrap_or(Duration::ZERO);

        let mut set = JoinSet::new();
        for task in tasks {
            let log = self.log.clone();
            let Task { id, work, max_execution_time, .. } = task;
            set.spawn(async move {
                match tokio::time::timeout(max_execution_time, work).await {
                    Ok(outcome) => Some(TaskResult { id, outcome }),
                    Err(_) => {
                        warn!(
                            log, "worker exceeded its execution time and was killed";
                            "task" => &id,
                            "max_execution_time" => ?max_execution_time,
                        );
                        None
                    }
                }
            });
        }

        let mut results = Vec::new();
        let status = tokio::time::timeout(join_deadline, async {
            while let Some(joined) = set.join_next().await {
                // A worker panic is a bug in the work function, not a node
                // failure; treat it like a worker that never returned.
                match joined {
                    Ok(Some(result)) => results.push(result),
                    Ok(None) => {}
                    Err(join_error) => {
                        warn!(
                            self.log, "worker panicked";
                            "error" => %join_error,
                        );
                    }
                }
            }
        })
        .await;

        match status {
            Ok(()) => (BatchStatus::Completed, results),
            Err(_) => {
                warn!(
                    self.log,
                    "join deadline elapsed with workers outstanding; \
                     killing the batch";
                    "join_deadline" => ?join_deadline,
                );
                set.abort_all();
                (BatchStatus::Killed, results)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test(start_paused = true)]
    async fn completed_batch_collects_every_result() {
        let log = crate::test_util::log();
        let runner = ParallelTaskRunner::new(&log);

        let tasks = (0..4)
            .map(|i| {
                Task::new(
                    format!("node{i}"),
                    Duration::from_secs(60),
                    Duration::from_secs(120),
                    async move {
                        tokio::time::sleep(Duration::from_millis(10 * i)).await;
                        i
                    }
                    .boxed(),
                )
            })
            .collect();

        let (status, mut results) = runner.run(tasks).await;
        assert_eq!(status, BatchStatus::Completed);
        results.sort_by_key(|r| r.outcome);
        assert_eq!(results.len(), 4);
        assert_eq!(results[3].id, "node3");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_task_kills_the_batch_but_keeps_finished_results() {
        let log = crate::test_util::log();
        let runner = ParallelTaskRunner::new(&log);

        let tasks = vec![
            Task::new(
                "fast",
                Duration::from_secs(60),
                Duration::from_secs(5),
                async { "done" }.boxed(),
            ),
            // Never returns and has a generous per-task budget, so only the
            // batch join deadline can stop it.
            Task::new(
                "hung",
                Duration::from_secs(3600),
                Duration::from_secs(5),
                futures::future::pending().boxed(),
            ),
        ];

        let (status, results) = runner.run(tasks).await;
        assert_eq!(status, BatchStatus::Killed);
        assert!(results.len() <= 1);
        for result in &results {
            assert_eq!(result.id, "fast");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn per_task_timeout_drops_only_that_result() {
        let log = crate::test_util::log();
        let runner = ParallelTaskRunner::new(&log);

        let tasks = vec![
            Task::new(
                "ok",
                Duration::from_secs(10),
                Duration::from_secs(300),
                async { 1 }.boxed(),
            ),
            Task::new(
                "slow",
                Duration::from_secs(10),
                Duration::from_secs(300),
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    2
                }
                .boxed(),
            ),
        ];

        let (status, results) = runner.run(tasks).await;
        // The slow worker was hard-killed inside its own budget, so the
        // batch itself still completes.
        assert_eq!(status, BatchStatus::Completed);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "ok");
    }

    #[tokio::test]
    async fn empty_batch_completes() {
        let log = crate::test_util::log();
        let runner = ParallelTaskRunner::new(&log);
        let (status, results) = runner.run(Vec::<Task<()>>::new()).await;
        assert_eq!(status, BatchStatus::Completed);
        assert!(results.is_empty());
    }
}
