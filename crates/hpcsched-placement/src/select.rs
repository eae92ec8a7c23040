//! Node-list selection orchestrator.
//!
//! [`NodeListSelector::select_node_list`] runs once per (job, partition)
//! candidate:
//!
//! 1. Validate the request and the per-iteration job-start cap
//! 2. Build (or reuse cached) feasible node lists per req
//! 3. Select idle tasks per req against one shared scratch availability;
//!    if every req is covered, skip to 9
//! 4. Check that preemption is permitted (preemptor flag, owner-preempt
//!    reservation, or force-cancel)
//! 5. Select preemptees per req with a victim exclusion set shared across
//!    reqs
//! 6. Register a lien with the accounting manager
//! 7. Execute preemptions in selection order, skipping failed victims
//! 8. Fail (resuming victims if configured, deleting the lien) if a deficit
//!    remains
//! 9. Distribute the idle + freed pool across reqs
//! 10. On distribution failure, roll back as in 8
//! 11. Return the allocation
//!
//! The allocation is not dedicated here; the job-start path does that.

use std::collections::BTreeSet;

use hpcsched_state::{
    GLOBAL_PARTITION, HostListMode, Job, JobId, NodeList, PartitionId, SchedulerContext,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::accounting::AccountingManager;
use crate::distribute::{SharedMemTransform, distribute};
use crate::error::{FailureKind, PlacementError, PlacementResult};
use crate::executor::{PreemptBackend, PreemptRecord, preempt_job, resume_job};
use crate::feasible::FeasibilityOracle;
use crate::idle::{Availability, IdleSelection, Targets, select_idle_tasks, select_idle_tasks_in};
use crate::preempt::{PreemptFilter, PreemptSelection, get_preempt_list, select_preemptees};

/// Per-call selection switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectOptions {
    /// Consider preemption when idle resources fall short.
    pub allow_preemption: bool,
    /// Let run-now jobs cancel any running job in their way.
    pub allow_cancel: bool,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            allow_preemption: true,
            allow_cancel: false,
        }
    }
}

/// A concrete assignment of tasks to nodes for every req of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub job_id: JobId,
    pub partition: PartitionId,
    /// One node list per req, in req order.
    pub per_req: Vec<NodeList>,
    /// Victims preempted to make room, in preemption order.
    pub preempted: Vec<JobId>,
}

impl Allocation {
    pub fn total_tasks(&self) -> u32 {
        self.per_req.iter().map(NodeList::total_tasks).sum()
    }
}

struct PreemptOutcome {
    records: Vec<PreemptRecord>,
    lien: bool,
}

/// The orchestrator and its external collaborators.
pub struct NodeListSelector<'a> {
    pub feasibility: &'a dyn FeasibilityOracle,
    pub backend: &'a dyn PreemptBackend,
    pub accounting: &'a dyn AccountingManager,
}

impl<'a> NodeListSelector<'a> {
    pub fn new(
        feasibility: &'a dyn FeasibilityOracle,
        backend: &'a dyn PreemptBackend,
        accounting: &'a dyn AccountingManager,
    ) -> Self {
        Self {
            feasibility,
            backend,
            accounting,
        }
    }

    /// Select nodes for `job_id` in `partition`, preempting if needed.
    pub async fn select_node_list(
        &self,
        ctx: &mut SchedulerContext,
        job_id: &str,
        partition: PartitionId,
        opts: &SelectOptions,
    ) -> PlacementResult<Allocation> {
        let Some(job) = ctx.jobs.get(job_id) else {
            return Err(PlacementError::invalid(format!("unknown job {job_id}")));
        };
        if ctx.partitions.get(partition).is_none() {
            return Err(PlacementError::invalid(format!("unknown partition {partition}")));
        }
        if job.reqs.is_empty() {
            return Err(PlacementError::invalid(format!("job {job_id} has no reqs")));
        }
        if !job.flags.best_effort && job.reqs.iter().any(|r| r.task_count == 0) {
            return Err(PlacementError::invalid(format!("job {job_id} has a req with no tasks")));
        }
        if job.is_preempting {
            return Err(PlacementError::policy(format!("job {job_id} is already preempting")));
        }
        if ctx.job_start_cap_reached() {
            return Err(PlacementError::policy(format!(
                "job start cap of {} per iteration reached",
                ctx.policy.max_job_start_per_iteration
            )));
        }

        ctx.jobs.require_mut(job_id)?.is_preempting = true;
        let result = self.select_inner(ctx, job_id, partition, opts).await;
        if let Some(job) = ctx.jobs.get_mut(job_id) {
            job.is_preempting = false;
        }

        match &result {
            Ok(alloc) => debug!(job = %job_id, partition, tasks = alloc.total_tasks(), "node list selected"),
            Err(e) if e.kind() == FailureKind::AccountingFailure => {
                warn!(job = %job_id, partition, error = %e, "node selection failed")
            }
            Err(e) => debug!(job = %job_id, partition, error = %e, "node selection failed"),
        }
        result
    }

    async fn select_inner(
        &self,
        ctx: &mut SchedulerContext,
        job_id: &str,
        partition: PartitionId,
        opts: &SelectOptions,
    ) -> PlacementResult<Allocation> {
        let job = ctx.jobs.require(job_id)?.clone();

        let mut feasible = Vec::with_capacity(job.reqs.len());
        for req in &job.reqs {
            let list = match ctx.cached_fnl(&job.id, req.index, partition) {
                Some(list) => list.clone(),
                None => {
                    let list = self.feasibility.feasible_nodes(ctx, &job, req, partition)?;
                    ctx.cache_fnl(&job.id, req.index, partition, list.clone());
                    list
                }
            };
            feasible.push(restrict_to_subset(ctx, &job, list));
        }

        // Reqs draw on one scratch availability so idle resources are
        // counted once across the job. `views[i]` is what req i found.
        let mut avail = Availability::new();
        let mut views: Vec<Availability> = Vec::with_capacity(job.reqs.len());
        let mut idle: Vec<IdleSelection> = Vec::with_capacity(job.reqs.len());
        for (req, fnl) in job.reqs.iter().zip(&feasible) {
            views.push(avail.clone());
            idle.push(select_idle_tasks_in(ctx, &job, req, fnl, Targets::of(req), &mut avail));
        }
        let idle_ok = job.reqs.iter().zip(&idle).all(|(r, s)| s.satisfies(r));

        let outcome = if idle_ok {
            PreemptOutcome {
                records: Vec::new(),
                lien: false,
            }
        } else {
            self.preempt_phase(ctx, &job, partition, opts, &feasible, &views, &idle)
                .await?
        };

        let pools: Vec<NodeList> = {
            let job_now = ctx.jobs.require(job_id)?;
            job_now
                .reqs
                .iter()
                .zip(&feasible)
                .map(|(req, fnl)| select_idle_tasks(ctx, job_now, req, fnl, Targets::unbounded()).nodes)
                .collect()
        };

        let distributed = {
            let job_mut = ctx.jobs.require_mut(job_id)?;
            let guard = SharedMemTransform::apply(job_mut);
            distribute(&ctx.nodes, &ctx.partitions, &guard, &pools)
        };
        let per_req = match distributed {
            Ok(per_req) => per_req,
            Err(e) => {
                self.rollback(ctx, &job, &outcome).await;
                return Err(e);
            }
        };
        if per_req.iter().all(NodeList::is_empty) {
            self.rollback(ctx, &job, &outcome).await;
            return Err(PlacementError::insufficient(format!("job {job_id}: empty allocation")));
        }

        Ok(Allocation {
            job_id: job_id.to_string(),
            partition,
            per_req,
            preempted: outcome.records.iter().map(|r| r.victim.clone()).collect(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn preempt_phase(
        &self,
        ctx: &mut SchedulerContext,
        job: &Job,
        partition: PartitionId,
        opts: &SelectOptions,
        feasible: &[NodeList],
        views: &[Availability],
        idle: &[IdleSelection],
    ) -> PlacementResult<PreemptOutcome> {
        let best_effort = job.flags.best_effort;
        let conditional = !job.flags.preemptor
            && ctx
                .owner_preempt_rsvs
                .iter()
                .any(|r| r.grants(job, ctx.now));
        let force_cancel = opts.allow_cancel && job.flags.run_now;
        let allowed = opts.allow_preemption && (job.flags.preemptor || conditional);

        if !allowed && !force_cancel {
            return Err(PlacementError::insufficient(shortfall(ctx, job, partition, idle)));
        }
        if ctx.preempt_cap_reached() {
            return Err(PlacementError::policy(format!(
                "job {}: preemption cap of {} per iteration reached",
                job.id, ctx.policy.max_job_preempt_per_iteration
            )));
        }
        if let Some(last) = job.preempt_time {
            let retry = ctx.policy.reservation_retry_time_secs;
            if retry > 0 && !ctx.policy.no_wait_preemption && ctx.now < last + retry {
                return Err(PlacementError::policy(format!(
                    "job {}: preempted {}s ago, retry time is {}s",
                    job.id,
                    ctx.now - last,
                    retry
                )));
            }
        }
        if !force_cancel && !can_preempt_any(ctx, job) {
            return Err(PlacementError::insufficient(format!(
                "job {}: no preemptible jobs running",
                job.id
            )));
        }

        let mut excluded: BTreeSet<JobId> = BTreeSet::new();
        let mut selections: Vec<PreemptSelection> = Vec::with_capacity(job.reqs.len());
        for (((req, fnl), view), idle_sel) in job.reqs.iter().zip(feasible).zip(views).zip(idle) {
            if idle_sel.satisfies(req) {
                selections.push(PreemptSelection::default());
                continue;
            }
            let filter = PreemptFilter {
                excluded: &excluded,
                priority_floor: job.effective_priority(partition),
                partition,
                force_cancel,
            };
            let list = get_preempt_list(ctx, job, req, fnl, view, &filter);

            let reachable_tasks = idle_sel.tasks.saturating_add(list.tasks);
            let reachable_nodes = idle_sel.node_count + list.nodes;
            if !best_effort && (reachable_tasks < req.task_count || reachable_nodes < req.node_count) {
                return Err(PlacementError::insufficient(format!(
                    "job {} req {}: idle+preemptible {}/{} tasks {}/{} nodes",
                    job.id, req.index, reachable_tasks, req.task_count, reachable_nodes, req.node_count
                )));
            }

            if job.reqs.len() == 1 && !best_effort {
                let needed = req.total_procs();
                let preemptible = i64::from(list.tasks) * req.per_task.procs.max(1);
                for pid in [partition, GLOBAL_PARTITION] {
                    let available = ctx.partitions.get(pid).map_or(0, |p| p.available.procs);
                    if available + preemptible < needed {
                        return Err(PlacementError::insufficient(format!(
                            "job {}: partition {} has {} procs available + {} preemptible, needs {}",
                            job.id, pid, available, preemptible, needed
                        )));
                    }
                }
            }

            let sel = select_preemptees(
                ctx,
                job,
                req,
                req.task_count.saturating_sub(idle_sel.tasks),
                req.node_count.saturating_sub(idle_sel.node_count),
                &list,
                fnl,
                view,
                &idle_sel.nodes,
                best_effort,
            )?;
            excluded.extend(sel.victims.iter().map(|v| v.job_id.clone()));
            selections.push(sel);
        }

        if selections.iter().all(|s| s.victims.is_empty()) {
            if best_effort {
                return Ok(PreemptOutcome {
                    records: Vec::new(),
                    lien: false,
                });
            }
            return Err(PlacementError::insufficient(format!(
                "job {}: no victims selected",
                job.id
            )));
        }

        if let Err(message) = self.accounting.register_job_start(job).await {
            if let Err(e) = self.accounting.delete_lien(job).await {
                warn!(job = %job.id, error = %e, "lien cleanup failed");
            }
            return Err(PlacementError::accounting(format!(
                "job {}: lien registration failed: {message}",
                job.id
            )));
        }
        let mut outcome = PreemptOutcome {
            records: Vec::new(),
            lien: true,
        };

        let reason = format!("preempted by {}", job.id);
        let mut remaining: Vec<(u32, u32)> = job
            .reqs
            .iter()
            .zip(idle)
            .map(|(r, s)| {
                (
                    r.task_count.saturating_sub(s.tasks),
                    r.node_count.saturating_sub(s.node_count),
                )
            })
            .collect();
        let mut cap_hit = false;

        'reqs: for (i, sel) in selections.iter().enumerate() {
            for victim in &sel.victims {
                if remaining[i] == (0, 0) {
                    break;
                }
                match preempt_job(ctx, self.backend, &victim.job_id, &job.id, &reason).await {
                    Ok(record) => {
                        remaining[i].0 = remaining[i].0.saturating_sub(victim.tasks);
                        remaining[i].1 = remaining[i].1.saturating_sub(victim.nodes);
                        outcome.records.push(record);
                    }
                    Err(e) if e.kind() == FailureKind::PolicyBlocked => {
                        cap_hit = true;
                        break 'reqs;
                    }
                    Err(e) => {
                        warn!(job = %job.id, victim = %victim.job_id, error = %e, "skipping victim");
                    }
                }
            }
        }
        if !outcome.records.is_empty() {
            ctx.counters.preemptors += 1;
        }

        if !best_effort && remaining.iter().any(|&(t, n)| t > 0 || n > 0) {
            self.rollback(ctx, job, &outcome).await;
            let msg = format!(
                "job {}: {} of {} selected victims preempted, deficit remains",
                job.id,
                outcome.records.len(),
                excluded.len()
            );
            return Err(if cap_hit {
                PlacementError::policy(msg)
            } else {
                PlacementError::insufficient(msg)
            });
        }

        let now = ctx.now;
        let j = ctx.jobs.require_mut(&job.id)?;
        j.flags.preempt_completed = true;
        j.preempt_time = Some(now);
        info!(
            job = %job.id,
            partition,
            victims = outcome.records.len(),
            "preemption completed"
        );
        Ok(outcome)
    }

    /// Compensate a failed attempt: resume victims if configured, then
    /// release the lien.
    async fn rollback(&self, ctx: &mut SchedulerContext, job: &Job, outcome: &PreemptOutcome) {
        if ctx.policy.resume_on_failed_preempt {
            for record in outcome.records.iter().rev() {
                if let Err(e) = resume_job(ctx, self.backend, record).await {
                    warn!(job = %job.id, victim = %record.victim, error = %e, "resume after failed start");
                }
            }
        }
        if outcome.lien {
            if let Err(e) = self.accounting.delete_lien(job).await {
                warn!(job = %job.id, error = %e, "lien deletion failed");
            }
        }
    }
}

/// Subset host lists limit the feasible list to the listed hosts.
fn restrict_to_subset(ctx: &SchedulerContext, job: &Job, list: NodeList) -> NodeList {
    match &job.required_hosts {
        Some(hosts) if hosts.mode == HostListMode::Subset => list
            .iter()
            .filter(|nt| {
                ctx.nodes
                    .get(nt.node)
                    .is_some_and(|n| hosts.nodes.contains(&n.id))
            })
            .copied()
            .collect(),
        _ => list,
    }
}

/// True if any running job could be a preemptee for `job`.
fn can_preempt_any(ctx: &SchedulerContext, job: &Job) -> bool {
    ctx.jobs.iter().any(|j| {
        j.id != job.id
            && j.state.is_active()
            && j.flags.preemptee
            && !(ctx.policy.disable_same_qos_preemption && job.same_qos(j))
    })
}

fn shortfall(ctx: &SchedulerContext, job: &Job, partition: PartitionId, idle: &[IdleSelection]) -> String {
    let name = ctx
        .partitions
        .get(partition)
        .map_or("?", |p| p.name.as_str());
    let parts: Vec<String> = job
        .reqs
        .iter()
        .zip(idle)
        .map(|(r, s)| {
            format!(
                "req {} idle {}/{} tasks {}/{} nodes {}",
                r.index, s.tasks, r.task_count, s.node_count, r.node_count, s.rejections
            )
        })
        .collect();
    format!(
        "job {} cannot preempt in partition {}: {}",
        job.id,
        name,
        parts.join("; ")
    )
}
