//! SchedulerContext: the explicit scheduler state passed to every pass.
//!
//! Holds the registries, the scheduling policy, per-iteration counters and
//! the feasible-node-list cache. A scheduling iteration begins with
//! [`SchedulerContext::begin_iteration`], which resets the counters and
//! drops cached lists.

use std::collections::HashMap;

use hpc_core::{JobState, ResourceVector, SchedulerPolicy};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::registry::*;
use crate::types::*;

/// Admission counters reset at the start of every iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationCounters {
    pub job_starts: u32,
    /// Preemption actions initiated.
    pub preemptees: u32,
    /// Jobs that preempted at least once.
    pub preemptors: u32,
}

type FnlKey = (JobId, usize, PartitionId);

#[derive(Debug, Clone, Default)]
pub struct SchedulerContext {
    pub nodes: NodeRegistry,
    pub jobs: JobRegistry,
    pub partitions: PartitionRegistry,
    pub vms: VmRegistry,
    pub policy: SchedulerPolicy,
    pub counters: IterationCounters,
    pub owner_preempt_rsvs: Vec<OwnerPreemptRsv>,
    /// Unix time of the current iteration.
    pub now: u64,
    pub iteration: u64,
    fnl_cache: HashMap<FnlKey, NodeList>,
}

impl SchedulerContext {
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Start a new scheduling iteration at `now`.
    pub fn begin_iteration(&mut self, now: u64) {
        self.iteration += 1;
        self.now = now;
        self.counters = IterationCounters::default();
        self.fnl_cache.clear();
        self.partitions.refresh(&self.nodes);
        debug!(iteration = self.iteration, now, "iteration started");
    }

    // ── Feasible node list cache ───────────────────────────────────

    pub fn cached_fnl(&self, job: &str, req: usize, partition: PartitionId) -> Option<&NodeList> {
        self.fnl_cache.get(&(job.to_string(), req, partition))
    }

    pub fn cache_fnl(&mut self, job: &str, req: usize, partition: PartitionId, list: NodeList) {
        self.fnl_cache.insert((job.to_string(), req, partition), list);
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Concrete footprint of `tasks` tasks of `req` on `node`.
    pub fn footprint(node: &Node, req: &Req, tasks: u32) -> ResourceVector {
        if req.whole_node || node.access_policy.is_exclusive() {
            return node.available();
        }
        req.per_task.resolve_against(&node.configured).scaled(tasks)
    }

    /// Dedicate node resources for every req of `job_id` according to
    /// `per_req`. All-or-nothing: on failure every claim made by this call
    /// is returned.
    pub fn allocate(&mut self, job_id: &str, per_req: &[NodeList]) -> StateResult<()> {
        let job = self.jobs.require(job_id)?.clone();
        if per_req.len() != job.reqs.len() {
            return Err(StateError::InvalidAllocation(format!(
                "job {job_id} has {} reqs, allocation has {}",
                job.reqs.len(),
                per_req.len()
            )));
        }

        let mut claimed: Vec<usize> = Vec::new();
        if let Err(e) = self.claim_all(&job, per_req, &mut claimed) {
            for idx in claimed {
                if let Some(node) = self.nodes.get_mut(idx) {
                    node.release(job_id);
                }
            }
            return Err(e);
        }

        let now = self.now;
        for idx in &claimed {
            if let Some(node) = self.nodes.get_mut(*idx) {
                node.refresh_load_state(now);
            }
        }
        let job = self.jobs.require_mut(job_id)?;
        for (req, list) in job.reqs.iter_mut().zip(per_req) {
            req.allocated = list.clone();
        }
        self.partitions.refresh(&self.nodes);
        debug!(job = %job_id, nodes = claimed.len(), "resources dedicated");
        Ok(())
    }

    fn claim_all(&mut self, job: &Job, per_req: &[NodeList], claimed: &mut Vec<usize>) -> StateResult<()> {
        for (req, list) in job.reqs.iter().zip(per_req) {
            for nt in list.iter() {
                let node = self
                    .nodes
                    .get_mut(nt.node)
                    .ok_or_else(|| StateError::NodeNotFound(nt.node.to_string()))?;
                let footprint = Self::footprint(node, req, nt.tasks);
                node.claim(&job.id, nt.tasks, footprint)?;
                claimed.push(nt.node);
            }
        }
        Ok(())
    }

    /// Return every node resource held by `job_id` and clear its
    /// allocation. Returns the node indices that were released.
    pub fn release_job(&mut self, job_id: &str) -> StateResult<Vec<usize>> {
        let now = self.now;
        let mut released = Vec::new();
        for node in self.nodes.iter_mut() {
            if node.release(job_id).is_some() {
                node.refresh_load_state(now);
                released.push(node.index);
            }
        }
        let job = self.jobs.require_mut(job_id)?;
        for req in &mut job.reqs {
            req.allocated = NodeList::new();
        }
        self.partitions.refresh(&self.nodes);
        debug!(job = %job_id, nodes = released.len(), "resources released");
        Ok(released)
    }

    /// Release whatever `job_id` holds and drop it from the job table.
    pub fn remove_job(&mut self, job_id: &str) -> StateResult<Job> {
        self.release_job(job_id)?;
        self.fnl_cache.retain(|(job, _, _), _| job != job_id);
        self.jobs
            .remove(job_id)
            .ok_or_else(|| StateError::JobNotFound(job_id.to_string()))
    }

    /// Allocate and mark `job_id` running. Counts toward the job-start cap.
    pub fn start_job(&mut self, job_id: &str, partition: PartitionId, per_req: &[NodeList]) -> StateResult<()> {
        self.allocate(job_id, per_req)?;
        let now = self.now;
        let job = self.jobs.require_mut(job_id)?;
        job.state = JobState::Running;
        job.start_time = Some(now);
        job.alloc_partition = Some(partition);
        self.counters.job_starts += 1;
        info!(job = %job_id, partition, "job started");
        Ok(())
    }

    /// True once the per-iteration job-start cap has been reached.
    pub fn job_start_cap_reached(&self) -> bool {
        SchedulerPolicy::cap_reached(self.policy.max_job_start_per_iteration, self.counters.job_starts)
    }

    /// True once the per-iteration preemption cap has been reached.
    pub fn preempt_cap_reached(&self) -> bool {
        SchedulerPolicy::cap_reached(self.policy.max_job_preempt_per_iteration, self.counters.preemptees)
    }

    /// Check `dedicated + available == configured` on every node, with
    /// `dedicated` never negative.
    pub fn check_conservation(&self) -> StateResult<()> {
        for node in self.nodes.iter() {
            if !node.dedicated.is_non_negative() || &node.dedicated + &node.available() != node.configured {
                return Err(StateError::InvalidAllocation(format!(
                    "node {} violates resource conservation",
                    node.id
                )));
            }
        }
        Ok(())
    }
}
