//! Idle-task selector.
//!
//! Walks a feasible node list in index order and takes whole tasks from
//! nodes that are usable right now, until the req's task and node targets
//! are met. Nothing is reserved in the node table. When a job has several
//! reqs, [`select_idle_tasks_in`] threads a scratch [`Availability`] through
//! them so a later req only sees what earlier reqs left.

use std::collections::BTreeMap;

use hpc_core::{AllocRejection, NodeAccessPolicy, RejectionCounts, ResourceVector};
use hpcsched_state::{Job, Node, NodeList, Req, SchedulerContext};
use tracing::trace;

/// Task and node targets for one selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Targets {
    pub tasks: u32,
    /// 0 means tasks only.
    pub nodes: u32,
}

impl Targets {
    pub fn of(req: &Req) -> Self {
        Self {
            tasks: req.task_count,
            nodes: req.node_count,
        }
    }

    /// Take everything that is available.
    pub fn unbounded() -> Self {
        Self {
            tasks: u32::MAX,
            nodes: 0,
        }
    }

    pub fn met(&self, tasks: u32, nodes: u32) -> bool {
        tasks >= self.tasks && nodes >= self.nodes
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdleSelection {
    pub nodes: NodeList,
    pub tasks: u32,
    pub node_count: u32,
    pub rejections: RejectionCounts,
}

impl IdleSelection {
    pub fn satisfies(&self, req: &Req) -> bool {
        Targets::of(req).met(self.tasks, self.node_count)
    }
}

/// Access-policy and state gate shared by every selector.
pub fn node_admits(ctx: &SchedulerContext, job: &Job, req: &Req, node: &Node) -> Result<(), AllocRejection> {
    if !node.state.is_usable() {
        return Err(AllocRejection::State);
    }
    let force_shared = ctx
        .partitions
        .get(node.partition)
        .is_some_and(|p| p.flags.force_shared);
    let exclusive = req.whole_node || (node.access_policy.is_exclusive() && !force_shared);
    if exclusive && node.claimed_by_other(&job.id) {
        return Err(AllocRejection::Policy);
    }
    match node.access_policy {
        NodeAccessPolicy::SharedOnly if req.whole_node => return Err(AllocRejection::Policy),
        NodeAccessPolicy::SingleUser | NodeAccessPolicy::UniqueUser if !force_shared => {
            let other_user = node.allocations.iter().any(|a| {
                a.job_id != job.id
                    && ctx
                        .jobs
                        .get(&a.job_id)
                        .is_some_and(|j| j.credential.user != job.credential.user)
            });
            if other_user {
                return Err(AllocRejection::Policy);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Round a per-node task count down to a multiple of `tasks_per_node`.
pub fn round_tasks(req: &Req, tasks: u32) -> u32 {
    match req.tasks_per_node {
        0 => tasks,
        tpn => tasks - tasks % tpn,
    }
}

/// How many tasks to take from a node offering `offered`, leaving room for
/// the nodes still needed.
pub fn tasks_to_take(req: &Req, targets: Targets, offered: u32, tasks: u32, nodes: u32) -> u32 {
    let remaining_tasks = targets.tasks.saturating_sub(tasks);
    let remaining_nodes = targets.nodes.saturating_sub(nodes);
    let mut cap = remaining_tasks;
    if remaining_nodes > 1 {
        cap = remaining_tasks.saturating_sub(remaining_nodes - 1).max(1);
    }
    round_tasks(req, offered.min(cap))
}

/// Scratch availability by node index. A node with no entry reads as its
/// current [`Node::usable`] resources.
pub type Availability = BTreeMap<usize, ResourceVector>;

/// Select idle tasks for `req` from `feasible`.
pub fn select_idle_tasks(
    ctx: &SchedulerContext,
    job: &Job,
    req: &Req,
    feasible: &NodeList,
    targets: Targets,
) -> IdleSelection {
    select_idle_tasks_in(ctx, job, req, feasible, targets, &mut Availability::new())
}

/// As [`select_idle_tasks`], reading node capacity from `avail` and
/// debiting it with the footprint of every task taken.
pub fn select_idle_tasks_in(
    ctx: &SchedulerContext,
    job: &Job,
    req: &Req,
    feasible: &NodeList,
    targets: Targets,
    avail: &mut Availability,
) -> IdleSelection {
    if req.node_sets.is_empty() {
        return select_over(ctx, job, req, feasible, targets, avail);
    }

    let mut best: Option<(IdleSelection, Availability)> = None;
    for set in &req.node_sets {
        let mut rejected = RejectionCounts::default();
        let subset: NodeList = feasible
            .iter()
            .filter(|nt| {
                let member = ctx.nodes.get(nt.node).is_some_and(|n| n.has_feature(set));
                if !member {
                    rejected.record(AllocRejection::NodeSet);
                }
                member
            })
            .copied()
            .collect();
        let mut trial = avail.clone();
        let mut sel = select_over(ctx, job, req, &subset, targets, &mut trial);
        sel.rejections.merge(&rejected);
        if targets.met(sel.tasks, sel.node_count) {
            trace!(job = %job.id, req = req.index, set = %set, "node set satisfies req");
            *avail = trial;
            return sel;
        }
        if best.as_ref().is_none_or(|(b, _)| sel.tasks > b.tasks) {
            best = Some((sel, trial));
        }
    }
    match best {
        Some((sel, trial)) => {
            *avail = trial;
            sel
        }
        None => IdleSelection::default(),
    }
}

fn select_over(
    ctx: &SchedulerContext,
    job: &Job,
    req: &Req,
    feasible: &NodeList,
    targets: Targets,
    avail: &mut Availability,
) -> IdleSelection {
    let mut sel = IdleSelection::default();

    for entry in feasible.iter() {
        if targets.met(sel.tasks, sel.node_count) {
            break;
        }
        let Some(node) = ctx.nodes.get(entry.node) else {
            continue;
        };
        if let Err(reason) = node_admits(ctx, job, req, node) {
            sel.rejections.record(reason);
            continue;
        }

        let free = avail.entry(entry.node).or_insert_with(|| node.usable());
        let offered = round_tasks(
            req,
            free.tasks_fitting(&req.per_task, &node.configured)
                .min(entry.tasks),
        );
        if offered == 0 {
            sel.rejections.record(AllocRejection::Resource);
            continue;
        }

        let take = tasks_to_take(req, targets, offered, sel.tasks, sel.node_count);
        if take == 0 {
            continue;
        }
        *free = free.saturating_sub(&SchedulerContext::footprint(node, req, take));
        sel.nodes.push(entry.node, take);
        sel.tasks = sel.tasks.saturating_add(take);
        sel.node_count += 1;
    }

    trace!(
        job = %job.id,
        req = req.index,
        tasks = sel.tasks,
        nodes = sel.node_count,
        rejections = %sel.rejections,
        "idle selection"
    );
    sel
}
