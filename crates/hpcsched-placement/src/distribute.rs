//! Task distributor.
//!
//! Spreads a per-req pool of candidate node/task pairs across the job's reqs
//! in req order. A scratch copy of node availability is shared by all reqs
//! so no node is committed beyond its capacity.
//!
//! Jobs flagged `shared_mem` are distributed under a
//! [`SharedMemTransform`], which folds the memory demand of every req into
//! req 0 for the duration of the pass and restores it on drop.

use std::collections::BTreeMap;
use std::ops::Deref;

use hpc_core::{AllocRejection, RejectionCounts, ResourceVector};
use hpcsched_state::{Job, NodeList, NodeRegistry, PartitionRegistry, SchedulerContext};
use tracing::debug;

use crate::error::{PlacementError, PlacementResult};
use crate::idle::{Targets, round_tasks, tasks_to_take};

/// Scoped shared-memory transform over a job's reqs.
pub struct SharedMemTransform<'a> {
    job: &'a mut Job,
    saved: Vec<i64>,
}

impl<'a> SharedMemTransform<'a> {
    /// Apply the transform if the job asks for it; otherwise a no-op guard.
    pub fn apply(job: &'a mut Job) -> Self {
        let saved: Vec<i64> = job.reqs.iter().map(|r| r.per_task.memory_mb).collect();
        if job.flags.shared_mem && job.reqs.len() > 1 {
            let extra: i64 = job.reqs[1..]
                .iter()
                .map(|r| r.per_task.memory_mb.max(0) * i64::from(r.task_count))
                .sum();
            let tasks0 = i64::from(job.reqs[0].task_count.max(1));
            job.reqs[0].per_task.memory_mb += (extra + tasks0 - 1) / tasks0;
            for r in &mut job.reqs[1..] {
                r.per_task.memory_mb = 0;
            }
        }
        Self { job, saved }
    }
}

impl Deref for SharedMemTransform<'_> {
    type Target = Job;

    fn deref(&self) -> &Job {
        &*self.job
    }
}

impl Drop for SharedMemTransform<'_> {
    fn drop(&mut self) {
        for (req, mem) in self.job.reqs.iter_mut().zip(&self.saved) {
            req.per_task.memory_mb = *mem;
        }
    }
}

/// Distribute `pools` (one per req) across `job`'s reqs.
///
/// Returns one node list per req. Best-effort jobs may come back with fewer
/// tasks than requested, but never with none at all.
pub fn distribute(
    nodes: &NodeRegistry,
    partitions: &PartitionRegistry,
    job: &Job,
    pools: &[NodeList],
) -> PlacementResult<Vec<NodeList>> {
    if pools.len() != job.reqs.len() {
        return Err(PlacementError::invalid(format!(
            "job {}: {} pools for {} reqs",
            job.id,
            pools.len(),
            job.reqs.len()
        )));
    }

    let mut scratch: BTreeMap<usize, ResourceVector> = BTreeMap::new();
    let mut result = Vec::with_capacity(job.reqs.len());
    let mut rejections = vec![RejectionCounts::default(); job.reqs.len()];
    let mut short = Vec::new();

    for (pos, (req, pool)) in job.reqs.iter().zip(pools).enumerate() {
        let targets = Targets::of(req);
        let mut list = NodeList::new();
        let (mut tasks, mut count) = (0u32, 0u32);

        for entry in pool.iter() {
            if targets.met(tasks, count) {
                break;
            }
            let Some(node) = nodes.get(entry.node) else {
                continue;
            };
            if !node.state.is_usable() {
                rejections[pos].record(AllocRejection::State);
                continue;
            }
            let force_shared = partitions
                .get(node.partition)
                .is_some_and(|p| p.flags.force_shared);
            let exclusive = req.whole_node || (node.access_policy.is_exclusive() && !force_shared);
            if exclusive && node.claimed_by_other(&job.id) {
                rejections[pos].record(AllocRejection::Policy);
                continue;
            }

            let avail = scratch.entry(entry.node).or_insert_with(|| node.usable());
            let fit = round_tasks(
                req,
                avail
                    .tasks_fitting(&req.per_task, &node.configured)
                    .min(entry.tasks),
            );
            if fit == 0 {
                rejections[pos].record(AllocRejection::Resource);
                continue;
            }
            let take = tasks_to_take(req, targets, fit, tasks, count);
            if take == 0 {
                continue;
            }

            let footprint = SchedulerContext::footprint(node, req, take);
            *avail = avail.saturating_sub(&footprint);
            list.push(entry.node, take);
            tasks += take;
            count += 1;
        }

        if !targets.met(tasks, count) {
            short.push(format!(
                "req {}: {}/{} tasks {}/{} nodes {}",
                req.index, tasks, req.task_count, count, req.node_count, rejections[pos]
            ));
        }
        result.push(list);
    }

    let placed: u32 = result.iter().map(NodeList::total_tasks).sum();
    if (!short.is_empty() && !job.flags.best_effort) || placed == 0 {
        debug!(job = %job.id, shortfall = %short.join("; "), "distribution failed");
        return Err(PlacementError::DistributionFailed {
            message: hpc_core::bounded_message(format!("job {}: {}", job.id, short.join("; "))),
            rejections,
        });
    }

    debug!(job = %job.id, tasks = placed, "tasks distributed");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpc_core::{NodeState, ResourceVector};
    use hpcsched_state::{Node, NodeTasks, Req};

    fn make_ctx(nodes: &[(i64, i64)]) -> SchedulerContext {
        let mut ctx = SchedulerContext::default();
        for (i, (procs, mem)) in nodes.iter().enumerate() {
            ctx.nodes
                .insert(Node::new(&format!("n{i}"), ResourceVector::new(*procs, *mem, 0, 0)));
        }
        ctx.begin_iteration(0);
        ctx
    }

    fn pool(ctx: &SchedulerContext) -> NodeList {
        ctx.nodes
            .iter()
            .map(|n| NodeTasks { node: n.index, tasks: u32::MAX })
            .collect()
    }

    #[test]
    fn single_req_copies_with_validation() {
        let ctx = make_ctx(&[(4, 0), (4, 0)]);
        let job = Job::new("j1", vec![Req::new(0, ResourceVector::procs(2), 3)], 1);
        let out = distribute(&ctx.nodes, &ctx.partitions, &job, &[pool(&ctx)]).unwrap();
        assert_eq!(out[0].0, vec![NodeTasks { node: 0, tasks: 2 }, NodeTasks { node: 1, tasks: 1 }]);
    }

    #[test]
    fn multi_req_never_double_commits_a_node() {
        let ctx = make_ctx(&[(4, 0), (4, 0)]);
        let job = Job::new(
            "j1",
            vec![
                Req::new(0, ResourceVector::procs(1), 3),
                Req::new(1, ResourceVector::procs(1), 3),
            ],
            1,
        );
        let p = pool(&ctx);
        let out = distribute(&ctx.nodes, &ctx.partitions, &job, &[p.clone(), p]).unwrap();
        assert_eq!(out[0].0, vec![NodeTasks { node: 0, tasks: 3 }]);
        assert_eq!(out[1].0, vec![NodeTasks { node: 0, tasks: 1 }, NodeTasks { node: 1, tasks: 2 }]);
        for node in ctx.nodes.iter() {
            let used: u32 = out.iter().map(|l| l.tasks_on(node.index)).sum();
            assert!(i64::from(used) <= node.configured.procs);
        }
    }

    #[test]
    fn failure_reports_rejections_per_req() {
        let mut ctx = make_ctx(&[(1, 0), (1, 0)]);
        ctx.nodes.get_mut(1).unwrap().state = NodeState::Down;
        let job = Job::new("j1", vec![Req::new(0, ResourceVector::procs(1), 2)], 1);
        let err = distribute(&ctx.nodes, &ctx.partitions, &job, &[pool(&ctx)]).unwrap_err();
        match err {
            PlacementError::DistributionFailed { rejections, message } => {
                assert_eq!(rejections[0].get(AllocRejection::State), 1);
                assert!(message.contains("req 0: 1/2 tasks"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn best_effort_accepts_partial() {
        let ctx = make_ctx(&[(1, 0)]);
        let mut job = Job::new("j1", vec![Req::new(0, ResourceVector::procs(1), 4)], 1);
        job.flags.best_effort = true;
        let out = distribute(&ctx.nodes, &ctx.partitions, &job, &[pool(&ctx)]).unwrap();
        assert_eq!(out[0].total_tasks(), 1);
    }

    #[test]
    fn shared_mem_transform_reverts_on_drop() {
        let mut job = Job::new(
            "j1",
            vec![
                Req::new(0, ResourceVector::new(1, 100, 0, 0), 2),
                Req::new(1, ResourceVector::new(1, 50, 0, 0), 2),
            ],
            1,
        );
        job.flags.shared_mem = true;
        {
            let guard = SharedMemTransform::apply(&mut job);
            assert_eq!(guard.reqs[0].per_task.memory_mb, 150);
            assert_eq!(guard.reqs[1].per_task.memory_mb, 0);
        }
        assert_eq!(job.reqs[0].per_task.memory_mb, 100);
        assert_eq!(job.reqs[1].per_task.memory_mb, 50);
    }

    #[test]
    fn shared_mem_transform_reverts_after_failed_distribution() {
        let ctx = make_ctx(&[(8, 100)]);
        let mut job = Job::new(
            "j1",
            vec![
                Req::new(0, ResourceVector::new(1, 100, 0, 0), 1),
                Req::new(1, ResourceVector::new(1, 100, 0, 0), 1),
            ],
            1,
        );
        job.flags.shared_mem = true;
        let p = pool(&ctx);
        let result = {
            let guard = SharedMemTransform::apply(&mut job);
            distribute(&ctx.nodes, &ctx.partitions, &guard, &[p.clone(), p])
        };
        assert!(result.is_err());
        assert_eq!(job.reqs[0].per_task.memory_mb, 100);
        assert_eq!(job.reqs[1].per_task.memory_mb, 100);
    }
}
