//! Preemption executor.
//!
//! Performs the preemption action through a [`PreemptBackend`] (normally
//! the resource manager), then returns the victim's node resources to the
//! idle pool and updates victim, preemptor and iteration counters.
//! A [`PreemptRecord`] captures enough to resume the victim later.

use std::future::Future;
use std::pin::Pin;

use hpc_core::{JobState, PreemptMode};
use hpcsched_state::{Job, JobId, NodeList, PartitionId, SchedulerContext};
use tracing::{info, warn};

use crate::error::{PlacementError, PlacementResult};

/// Boxed future returned by backend calls.
pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Side that carries out preempt/resume against the running job.
pub trait PreemptBackend: Send + Sync {
    fn preempt<'a>(&'a self, victim: &'a Job, mode: PreemptMode, reason: &'a str) -> BackendFuture<'a>;

    fn resume<'a>(&'a self, victim: &'a Job, mode: PreemptMode) -> BackendFuture<'a>;
}

/// What a successful preemption changed.
#[derive(Debug, Clone, PartialEq)]
pub struct PreemptRecord {
    pub victim: JobId,
    pub preemptor: JobId,
    pub mode: PreemptMode,
    pub previous_state: JobState,
    pub previous_partition: Option<PartitionId>,
    /// Victim allocation per req before the preemption.
    pub allocation: Vec<NodeList>,
    pub released_nodes: Vec<usize>,
}

/// Preempt `victim_id` on behalf of `preemptor_id`.
///
/// Fails with `PolicyBlocked` once the per-iteration preemption cap is
/// reached, and with `PartialPreemption` if the backend refuses; in both
/// cases nothing in `ctx` changes.
pub async fn preempt_job(
    ctx: &mut SchedulerContext,
    backend: &dyn PreemptBackend,
    victim_id: &str,
    preemptor_id: &str,
    reason: &str,
) -> PlacementResult<PreemptRecord> {
    if ctx.preempt_cap_reached() {
        return Err(PlacementError::policy(format!(
            "preemption cap of {} per iteration reached",
            ctx.policy.max_job_preempt_per_iteration
        )));
    }

    let victim = ctx.jobs.require(victim_id)?.clone();
    let mode = PreemptMode::negotiate(
        ctx.policy.preempt_policy,
        victim.flags.checkpointable,
        victim.flags.suspendable,
        victim.flags.restartable,
    );

    if let Err(message) = backend.preempt(&victim, mode, reason).await {
        warn!(victim = %victim_id, preemptor = %preemptor_id, %mode, %message, "preemption failed");
        return Err(PlacementError::PartialPreemption {
            victim: victim_id.to_string(),
            message: hpc_core::bounded_message(message),
        });
    }

    let allocation: Vec<NodeList> = victim.reqs.iter().map(|r| r.allocated.clone()).collect();
    let released_nodes = ctx.release_job(victim_id)?;
    let now = ctx.now;
    {
        let v = ctx.jobs.require_mut(victim_id)?;
        v.state = mode.resulting_state();
        v.flags.preempted = true;
        if mode != PreemptMode::Suspend {
            v.alloc_partition = None;
        }
    }
    {
        let p = ctx.jobs.require_mut(preemptor_id)?;
        p.preempt_count += 1;
        p.preempt_time = Some(now);
    }
    ctx.counters.preemptees += 1;

    info!(
        victim = %victim_id,
        preemptor = %preemptor_id,
        %mode,
        nodes = released_nodes.len(),
        "job preempted"
    );
    Ok(PreemptRecord {
        victim: victim_id.to_string(),
        preemptor: preemptor_id.to_string(),
        mode,
        previous_state: victim.state,
        previous_partition: victim.alloc_partition,
        allocation,
        released_nodes,
    })
}

/// Undo a preemption: resume the victim through the backend and
/// re-dedicate its previous allocation.
pub async fn resume_job(
    ctx: &mut SchedulerContext,
    backend: &dyn PreemptBackend,
    record: &PreemptRecord,
) -> PlacementResult<()> {
    let victim = ctx.jobs.require(&record.victim)?.clone();
    if let Err(message) = backend.resume(&victim, record.mode).await {
        warn!(victim = %record.victim, %message, "resume failed");
        return Err(PlacementError::PartialPreemption {
            victim: record.victim.clone(),
            message: hpc_core::bounded_message(message),
        });
    }

    ctx.allocate(&record.victim, &record.allocation)?;
    let v = ctx.jobs.require_mut(&record.victim)?;
    v.state = record.previous_state;
    v.alloc_partition = record.previous_partition;
    v.flags.preempted = false;
    info!(victim = %record.victim, "preempted job resumed");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hpc_core::ResourceVector;
    use hpcsched_state::{Node, NodeTasks, Req};
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// Backend that records calls and fails for listed victims.
    #[derive(Default)]
    pub(crate) struct MockBackend {
        pub fail: BTreeSet<String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockBackend {
        pub fn failing(ids: &[&str]) -> Self {
            Self {
                fail: ids.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PreemptBackend for MockBackend {
        fn preempt<'a>(&'a self, victim: &'a Job, mode: PreemptMode, _reason: &'a str) -> BackendFuture<'a> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(format!("{mode}:{}", victim.id));
                if self.fail.contains(&victim.id) {
                    return Err("rm refused".to_string());
                }
                Ok(())
            })
        }

        fn resume<'a>(&'a self, victim: &'a Job, _mode: PreemptMode) -> BackendFuture<'a> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(format!("resume:{}", victim.id));
                Ok(())
            })
        }
    }

    fn make_ctx() -> SchedulerContext {
        let mut ctx = SchedulerContext::default();
        ctx.nodes.insert(Node::new("n1", ResourceVector::procs(2)));
        ctx.begin_iteration(500);
        let mut victim = Job::new("v1", vec![Req::new(0, ResourceVector::procs(2), 1)], 10);
        victim.flags.preemptee = true;
        victim.flags.suspendable = true;
        ctx.jobs.insert(victim);
        ctx.start_job("v1", 0, &[NodeList(vec![NodeTasks { node: 0, tasks: 1 }])])
            .unwrap();
        ctx.jobs
            .insert(Job::new("p1", vec![Req::new(0, ResourceVector::procs(2), 1)], 50));
        ctx
    }

    #[tokio::test]
    async fn preempt_releases_resources_and_counts() {
        let mut ctx = make_ctx();
        ctx.policy.preempt_policy = PreemptMode::Suspend;
        let backend = MockBackend::default();

        let record = preempt_job(&mut ctx, &backend, "v1", "p1", "test").await.unwrap();
        assert_eq!(record.mode, PreemptMode::Suspend);
        assert_eq!(record.released_nodes, vec![0]);
        assert_eq!(ctx.nodes.get(0).unwrap().available().procs, 2);
        assert_eq!(ctx.jobs.get("v1").unwrap().state, JobState::Suspended);
        assert!(ctx.jobs.get("v1").unwrap().flags.preempted);
        assert_eq!(ctx.jobs.get("p1").unwrap().preempt_count, 1);
        assert_eq!(ctx.jobs.get("p1").unwrap().preempt_time, Some(500));
        assert_eq!(ctx.counters.preemptees, 1);
        assert_eq!(backend.calls(), vec!["suspend:v1"]);
        ctx.check_conservation().unwrap();
    }

    #[tokio::test]
    async fn unsupported_mode_falls_back() {
        let mut ctx = make_ctx();
        ctx.policy.preempt_policy = PreemptMode::Checkpoint;
        let backend = MockBackend::default();
        let record = preempt_job(&mut ctx, &backend, "v1", "p1", "test").await.unwrap();
        assert_eq!(record.mode, PreemptMode::Suspend);
    }

    #[tokio::test]
    async fn backend_failure_changes_nothing() {
        let mut ctx = make_ctx();
        let backend = MockBackend::failing(&["v1"]);
        let err = preempt_job(&mut ctx, &backend, "v1", "p1", "test").await.unwrap_err();
        assert_eq!(err.kind(), crate::FailureKind::PartialPreemption);
        assert_eq!(ctx.jobs.get("v1").unwrap().state, JobState::Running);
        assert_eq!(ctx.nodes.get(0).unwrap().available().procs, 0);
        assert_eq!(ctx.counters.preemptees, 0);
    }

    #[tokio::test]
    async fn cap_blocks_before_backend() {
        let mut ctx = make_ctx();
        ctx.policy.max_job_preempt_per_iteration = 0;
        let backend = MockBackend::default();
        let err = preempt_job(&mut ctx, &backend, "v1", "p1", "test").await.unwrap_err();
        assert_eq!(err.kind(), crate::FailureKind::PolicyBlocked);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn resume_restores_allocation() {
        let mut ctx = make_ctx();
        ctx.policy.preempt_policy = PreemptMode::Suspend;
        let backend = MockBackend::default();
        let record = preempt_job(&mut ctx, &backend, "v1", "p1", "test").await.unwrap();

        resume_job(&mut ctx, &backend, &record).await.unwrap();
        let v = ctx.jobs.get("v1").unwrap();
        assert_eq!(v.state, JobState::Running);
        assert!(!v.flags.preempted);
        assert_eq!(ctx.nodes.get(0).unwrap().available().procs, 0);
        assert_eq!(backend.calls(), vec!["suspend:v1", "resume:v1"]);
    }
}
