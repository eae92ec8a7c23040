//! Feasible node lists.
//!
//! A feasible node satisfies a req's static constraints (partition,
//! features, architecture, opsys, host lists, configured capacity). Current
//! load and node state are ignored; the idle selector deals with those.

use hpcsched_state::{HostListMode, Job, NodeList, PartitionId, Req, SchedulerContext};
use tracing::debug;

use crate::error::{PlacementError, PlacementResult};

/// Resource-manager feasibility query.
///
/// Implementations must be deterministic for identical inputs and return
/// nodes in registry index order.
pub trait FeasibilityOracle: Send + Sync {
    fn feasible_nodes(
        &self,
        ctx: &SchedulerContext,
        job: &Job,
        req: &Req,
        partition: PartitionId,
    ) -> PlacementResult<NodeList>;
}

/// Feasibility computed from the node table alone.
///
/// Each returned entry carries the number of tasks of `req` that fit in the
/// node's configured resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticFeasibility;

impl FeasibilityOracle for StaticFeasibility {
    fn feasible_nodes(
        &self,
        ctx: &SchedulerContext,
        job: &Job,
        req: &Req,
        partition: PartitionId,
    ) -> PlacementResult<NodeList> {
        let part = ctx
            .partitions
            .get(partition)
            .ok_or_else(|| PlacementError::invalid(format!("unknown partition {partition}")))?;

        let mut list = NodeList::new();
        for &idx in &part.nodes {
            let Some(node) = ctx.nodes.get(idx) else {
                continue;
            };
            if !job.partition_mask.is_empty() {
                let name = ctx.partitions.get(node.partition).map(|p| p.name.as_str());
                if !name.is_some_and(|n| job.partition_mask.contains(n)) {
                    continue;
                }
            }
            if !req.features.iter().all(|f| node.has_feature(f)) {
                continue;
            }
            if req.arch.is_some() && req.arch != node.arch {
                continue;
            }
            if req.opsys.is_some() && req.opsys != node.opsys {
                continue;
            }
            if req.excluded_hosts.contains(&node.id) {
                continue;
            }
            if let Some(hosts) = &job.required_hosts {
                let listed = hosts.nodes.iter().any(|h| *h == node.id);
                if hosts.mode != HostListMode::Subset && !listed {
                    continue;
                }
            }
            let tasks = node
                .configured
                .tasks_fitting(&req.per_task, &node.configured);
            if tasks == 0 {
                continue;
            }
            list.push(idx, tasks);
        }

        if list.is_empty() {
            debug!(job = %job.id, req = req.index, partition, "no feasible nodes");
            return Err(PlacementError::infeasible(format!(
                "job {} req {}: no node in partition {} satisfies static constraints",
                job.id, req.index, part.name
            )));
        }
        Ok(list)
    }
}
