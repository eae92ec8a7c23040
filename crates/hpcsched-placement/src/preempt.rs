//! Preemptee selection.
//!
//! - **`get_preempt_list`**: which running jobs may be preempted for a
//!   req, ordered by ascending priority (table order breaks ties)
//! - **`select_preemptees`**: the shortest prefix of that list whose
//!   release covers a task/node deficit
//!
//! Both are pure: they simulate releases on scratch copies of node
//! availability, starting from the [`Availability`] the caller passes in,
//! and never touch the node table. Execution happens in
//! [`crate::executor`].

use std::collections::{BTreeMap, BTreeSet};

use hpc_core::ResourceVector;
use hpcsched_state::{Job, JobId, Node, NodeList, PartitionId, Req, SchedulerContext};
use tracing::debug;

use crate::error::{PlacementError, PlacementResult};
use crate::idle::{Availability, round_tasks};

/// A running job that may be preempted, with what it holds on feasible nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct PreemptCandidate {
    pub job_id: JobId,
    pub priority: i64,
    /// (node index, resources held) for each feasible node the job uses.
    pub holdings: Vec<(usize, ResourceVector)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreemptList {
    /// Ascending priority.
    pub candidates: Vec<PreemptCandidate>,
    /// Tasks of the req gained if every candidate were released.
    pub tasks: u32,
    /// Feasible nodes that would go from zero to non-zero capacity.
    pub nodes: u32,
}

impl PreemptList {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Filter applied to candidate victims.
#[derive(Debug, Clone, Copy)]
pub struct PreemptFilter<'a> {
    pub excluded: &'a BTreeSet<JobId>,
    /// Victims must have a strictly lower priority than this.
    pub priority_floor: i64,
    pub partition: PartitionId,
    /// Ignore priority and preemptee flags.
    pub force_cancel: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedVictim {
    pub job_id: JobId,
    /// Tasks this victim contributes toward the deficit.
    pub tasks: u32,
    /// Nodes this victim contributes toward the deficit.
    pub nodes: u32,
    /// Tasks of the req gained per node by releasing this victim.
    pub gained: NodeList,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreemptSelection {
    pub victims: Vec<SelectedVictim>,
    pub tasks: u32,
    pub nodes: u32,
}

impl PreemptSelection {
    pub fn contains(&self, job_id: &str) -> bool {
        self.victims.iter().any(|v| v.job_id == job_id)
    }
}

/// True if `victim` may be preempted on behalf of `job` under `filter`.
pub fn is_eligible(ctx: &SchedulerContext, job: &Job, victim: &Job, filter: &PreemptFilter<'_>) -> bool {
    if victim.id == job.id || !victim.state.is_active() {
        return false;
    }
    if filter.excluded.contains(&victim.id) {
        return false;
    }
    if ctx.policy.disable_same_qos_preemption && job.same_qos(victim) {
        return false;
    }
    if filter.force_cancel {
        return true;
    }
    victim.flags.preemptee && victim.effective_priority(filter.partition) < filter.priority_floor
}

/// Collect preemption candidates for `req` among jobs holding resources on
/// `feasible` nodes.
pub fn get_preempt_list(
    ctx: &SchedulerContext,
    job: &Job,
    req: &Req,
    feasible: &NodeList,
    avail: &Availability,
    filter: &PreemptFilter<'_>,
) -> PreemptList {
    let mut candidates = Vec::new();
    for victim in ctx.jobs.iter() {
        if !is_eligible(ctx, job, victim, filter) {
            continue;
        }
        let holdings: Vec<(usize, ResourceVector)> = feasible
            .iter()
            .filter_map(|nt| {
                let node = ctx.nodes.get(nt.node)?;
                let alloc = node.allocations.iter().find(|a| a.job_id == victim.id)?;
                Some((nt.node, alloc.resources.clone()))
            })
            .collect();
        if holdings.is_empty() {
            continue;
        }
        candidates.push(PreemptCandidate {
            job_id: victim.id.clone(),
            priority: victim.effective_priority(filter.partition),
            holdings,
        });
    }
    candidates.sort_by_key(|c| c.priority);

    let mut sim = Simulation::new(ctx, feasible, avail);
    let baseline: BTreeMap<usize, u32> = sim
        .nodes
        .keys()
        .map(|&idx| (idx, sim.tasks(ctx, job, req, idx)))
        .collect();
    for c in &candidates {
        for (idx, res) in &c.holdings {
            sim.release(*idx, &c.job_id, res);
        }
    }
    let mut tasks = 0u32;
    let mut nodes = 0u32;
    for (&idx, &before) in &baseline {
        let after = sim.tasks(ctx, job, req, idx);
        if after > before {
            tasks = tasks.saturating_add(after - before);
            if before == 0 {
                nodes += 1;
            }
        }
    }

    debug!(
        job = %job.id,
        req = req.index,
        candidates = candidates.len(),
        tasks,
        nodes,
        "preempt list built"
    );
    PreemptList {
        candidates,
        tasks,
        nodes,
    }
}

/// Pick victims from `list`, lowest priority first, until the deficit is
/// covered. `avail` is what earlier reqs left; `idle` is the idle selection
/// already made for this req, and its resources are not counted again.
///
/// Fails if the deficit cannot be covered, unless `allow_partial` is set.
#[allow(clippy::too_many_arguments)]
pub fn select_preemptees(
    ctx: &SchedulerContext,
    job: &Job,
    req: &Req,
    deficit_tasks: u32,
    deficit_nodes: u32,
    list: &PreemptList,
    feasible: &NodeList,
    avail: &Availability,
    idle: &NodeList,
    allow_partial: bool,
) -> PlacementResult<PreemptSelection> {
    let mut sim = Simulation::new(ctx, feasible, avail);
    let mut used: BTreeSet<usize> = BTreeSet::new();
    for nt in idle.iter().filter(|nt| nt.tasks > 0) {
        if let Some(node) = ctx.nodes.get(nt.node) {
            sim.consume(nt.node, &SchedulerContext::footprint(node, req, nt.tasks));
            used.insert(nt.node);
        }
    }

    let mut remaining_tasks = deficit_tasks;
    let mut remaining_nodes = deficit_nodes;
    let mut selection = PreemptSelection::default();
    let mut pending: Vec<&PreemptCandidate> = Vec::new();

    for cand in &list.candidates {
        if remaining_tasks == 0 && remaining_nodes == 0 {
            break;
        }

        let saved: Vec<(usize, NodeScratch)> = cand
            .holdings
            .iter()
            .filter_map(|(idx, _)| sim.nodes.get(idx).map(|s| (*idx, s.clone())))
            .collect();

        let mut gained = NodeList::new();
        for (idx, res) in &cand.holdings {
            let before = sim.tasks(ctx, job, req, *idx);
            sim.release(*idx, &cand.job_id, res);
            let after = sim.tasks(ctx, job, req, *idx);
            if after > before {
                gained.push(*idx, after - before);
            }
        }

        let gain_tasks = gained.total_tasks();
        if gain_tasks == 0 {
            // Freed resources stay in the scratch state; a later victim on
            // the same node may complete a task with them.
            pending.push(cand);
            continue;
        }

        let new_nodes = gained.iter().filter(|nt| !used.contains(&nt.node)).count() as u32;
        let tasks = gain_tasks.min(remaining_tasks);
        let nodes = new_nodes.min(remaining_nodes);
        if tasks == 0 && nodes == 0 {
            for (idx, scratch) in saved {
                sim.nodes.insert(idx, scratch);
            }
            continue;
        }

        let (enabling, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|p| {
            p.holdings
                .iter()
                .any(|(idx, _)| gained.contains(*idx))
        });
        pending = rest;
        for p in enabling {
            selection.victims.push(SelectedVictim {
                job_id: p.job_id.clone(),
                tasks: 0,
                nodes: 0,
                gained: NodeList::new(),
            });
        }

        remaining_tasks -= tasks;
        remaining_nodes -= nodes;
        used.extend(gained.iter().map(|nt| nt.node));
        selection.tasks += tasks;
        selection.nodes += nodes;
        debug!(
            job = %job.id,
            victim = %cand.job_id,
            priority = cand.priority,
            tasks,
            nodes,
            "preemptee selected"
        );
        selection.victims.push(SelectedVictim {
            job_id: cand.job_id.clone(),
            tasks,
            nodes,
            gained,
        });
    }

    if (remaining_tasks > 0 || remaining_nodes > 0) && !allow_partial {
        return Err(PlacementError::insufficient(format!(
            "job {} req {}: preemptible resources cover {}/{} tasks and {}/{} nodes",
            job.id,
            req.index,
            deficit_tasks - remaining_tasks,
            deficit_tasks,
            deficit_nodes - remaining_nodes,
            deficit_nodes
        )));
    }
    Ok(selection)
}

// ── Scratch simulation ─────────────────────────────────────────────

#[derive(Debug, Clone)]
struct NodeScratch {
    available: ResourceVector,
    holders: BTreeSet<JobId>,
}

/// Scratch copy of availability for the feasible nodes.
struct Simulation {
    nodes: BTreeMap<usize, NodeScratch>,
}

impl Simulation {
    fn new(ctx: &SchedulerContext, feasible: &NodeList, avail: &Availability) -> Self {
        let nodes = feasible
            .iter()
            .filter_map(|nt| ctx.nodes.get(nt.node))
            .map(|node| {
                let scratch = NodeScratch {
                    available: avail
                        .get(&node.index)
                        .cloned()
                        .unwrap_or_else(|| node.usable()),
                    holders: node.allocations.iter().map(|a| a.job_id.clone()).collect(),
                };
                (node.index, scratch)
            })
            .collect();
        Self { nodes }
    }

    fn release(&mut self, idx: usize, job_id: &str, res: &ResourceVector) {
        if let Some(s) = self.nodes.get_mut(&idx) {
            s.available += res;
            s.holders.remove(job_id);
        }
    }

    fn consume(&mut self, idx: usize, res: &ResourceVector) {
        if let Some(s) = self.nodes.get_mut(&idx) {
            s.available = s.available.saturating_sub(res);
        }
    }

    /// Whole tasks of `req` that fit on node `idx` in the simulated state.
    fn tasks(&self, ctx: &SchedulerContext, job: &Job, req: &Req, idx: usize) -> u32 {
        let (Some(scratch), Some(node)) = (self.nodes.get(&idx), ctx.nodes.get(idx)) else {
            return 0;
        };
        if !node.state.is_usable() {
            return 0;
        }
        if exclusive(ctx, req, node) && scratch.holders.iter().any(|h| *h != job.id) {
            return 0;
        }
        let fit = scratch
            .available
            .tasks_fitting(&req.per_task, &node.configured)
            .min(u32::MAX / 2);
        round_tasks(req, fit)
    }
}

fn exclusive(ctx: &SchedulerContext, req: &Req, node: &Node) -> bool {
    let force_shared = ctx
        .partitions
        .get(node.partition)
        .is_some_and(|p| p.flags.force_shared);
    req.whole_node || (node.access_policy.is_exclusive() && !force_shared)
}
