//! Scheduling loop.
//!
//! Each iteration:
//! 1. Starts a new iteration on the context and every RM client
//! 2. Refreshes nodes (`GETNODES`) then jobs (`GETJOBS`) from every RM
//! 3. Walks eligible idle jobs in priority order, selecting nodes in each
//!    partition the job may use, preempting where policy allows
//! 4. Commits a selection locally, then sends `STARTJOB` to the job's RM;
//!    a refused start is rolled back

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hpc_core::{PreemptMode, SchedConfig};
use hpcsched_placement::{
    AccountingManager, Allocation, BackendFuture, FailureKind, InMemoryAccounting, NodeListSelector,
    PreemptBackend, SelectOptions, StaticFeasibility,
};
use hpcsched_state::{GLOBAL_PARTITION, Job, JobId, PartitionId, SchedulerContext};
use hpcsched_wiki::{WikiClient, WikiRm};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Routes preempt/resume calls to the RM that owns the victim.
pub struct RmRouter<'a>(pub &'a [WikiRm]);

impl PreemptBackend for RmRouter<'_> {
    fn preempt<'a>(&'a self, victim: &'a Job, mode: PreemptMode, reason: &'a str) -> BackendFuture<'a> {
        match self.0.get(victim.rm_index) {
            Some(rm) => rm.preempt(victim, mode, reason),
            None => Box::pin(async move { Err::<(), String>(format!("job {} has no rm", victim.id)) }),
        }
    }

    fn resume<'a>(&'a self, victim: &'a Job, mode: PreemptMode) -> BackendFuture<'a> {
        match self.0.get(victim.rm_index) {
            Some(rm) => rm.resume(victim, mode),
            None => Box::pin(async move { Err::<(), String>(format!("job {} has no rm", victim.id)) }),
        }
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationSummary {
    pub iteration: u64,
    pub rms_failed: usize,
    pub candidates: usize,
    pub started: Vec<JobId>,
    pub preempted: Vec<JobId>,
}

pub struct Scheduler {
    ctx: SchedulerContext,
    rms: Vec<WikiRm>,
    accounting: InMemoryAccounting,
    options: SelectOptions,
    interval: Duration,
}

impl Scheduler {
    pub fn new(config: SchedConfig) -> Self {
        let interval = Duration::from_secs(config.scheduler.iteration_interval_secs.max(1));
        let rms = config
            .rm
            .into_iter()
            .enumerate()
            .map(|(i, cfg)| WikiRm::new(WikiClient::new(cfg), i))
            .collect();
        Self {
            ctx: SchedulerContext::new(config.scheduler),
            rms,
            accounting: InMemoryAccounting::new(),
            options: SelectOptions::default(),
            interval,
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Loop until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        info!(rms = self.rms.len(), interval = ?self.interval, "scheduler started");
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.run_iteration(unix_now()).await;
                    debug!(?summary, "iteration finished");
                }
                _ = &mut shutdown => break,
            }
        }
        info!("scheduler stopped");
        Ok(())
    }

    pub async fn run_iteration(&mut self, now: u64) -> IterationSummary {
        self.ctx.begin_iteration(now);
        let mut summary = IterationSummary {
            iteration: self.ctx.iteration,
            ..IterationSummary::default()
        };

        for rm in &self.rms {
            rm.begin_iteration(self.ctx.iteration);
            let refreshed = match rm.cluster_query(&mut self.ctx).await {
                Ok(_) => rm.workload_query(&mut self.ctx).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = refreshed {
                warn!(rm = %rm.name(), error = %e, "rm skipped this iteration");
                summary.rms_failed += 1;
            }
        }

        let candidates = self.candidates();
        summary.candidates = candidates.len();
        for job_id in candidates {
            if self.ctx.job_start_cap_reached() {
                debug!(started = summary.started.len(), "job start cap reached");
                break;
            }
            if let Some(alloc) = self.place(&job_id).await {
                summary.preempted.extend(alloc.preempted.iter().cloned());
                if self.commit(&alloc).await {
                    summary.started.push(job_id);
                }
            }
        }
        summary
    }

    /// Idle jobs not on hold, highest priority first; ties keep table order.
    fn candidates(&self) -> Vec<JobId> {
        let mut jobs: Vec<&Job> = self
            .ctx
            .jobs
            .iter()
            .filter(|j| j.state == hpc_core::JobState::Idle && !j.flags.user_hold && !j.has_allocation())
            .filter(|j| self.rms.get(j.rm_index).is_some_and(|rm| !rm.client().failed_this_iteration()))
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.priority));
        jobs.into_iter().map(|j| j.id.clone()).collect()
    }

    /// Partitions `job` may run in, in the order to try them.
    fn partitions_for(&self, job: &Job) -> Vec<PartitionId> {
        if job.partition_mask.is_empty() {
            return vec![GLOBAL_PARTITION];
        }
        job.partition_mask
            .iter()
            .filter_map(|name| self.ctx.partitions.by_name(name).map(|p| p.id))
            .collect()
    }

    async fn place(&mut self, job_id: &str) -> Option<Allocation> {
        let partitions = self.partitions_for(self.ctx.jobs.get(job_id)?);
        let router = RmRouter(&self.rms);
        let selector = NodeListSelector::new(&StaticFeasibility, &router, &self.accounting);

        for partition in partitions {
            match selector
                .select_node_list(&mut self.ctx, job_id, partition, &self.options)
                .await
            {
                Ok(alloc) => return Some(alloc),
                Err(e) => match e.kind() {
                    FailureKind::Infeasible | FailureKind::InsufficientNow | FailureKind::PolicyBlocked => {
                        debug!(job = %job_id, partition, reason = %e.message(), "job not placed")
                    }
                    _ => warn!(job = %job_id, partition, error = %e, "node selection failed"),
                },
            }
        }
        None
    }

    /// Dedicate the allocation and ask the RM to start the job.
    async fn commit(&mut self, alloc: &Allocation) -> bool {
        let job_id = alloc.job_id.as_str();
        if let Err(e) = self.ctx.start_job(job_id, alloc.partition, &alloc.per_req) {
            warn!(job = %job_id, error = %e, "cannot commit allocation");
            self.drop_lien(job_id).await;
            return false;
        }

        let rm_index = self.ctx.jobs.get(job_id).map_or(0, |j| j.rm_index);
        let sent = match self.rms.get(rm_index) {
            Some(rm) => rm.start_job(&self.ctx, job_id, &alloc.per_req).await,
            None => Err(hpcsched_wiki::WikiError::malformed(format!("job {job_id} has no rm"))),
        };
        self.drop_lien(job_id).await;

        match sent {
            Ok(()) => true,
            Err(e) => {
                warn!(job = %job_id, error = %e, "rm refused job start");
                if let Err(e) = self.ctx.release_job(job_id) {
                    warn!(job = %job_id, error = %e, "cannot release refused job");
                }
                if let Some(job) = self.ctx.jobs.get_mut(job_id) {
                    job.state = hpc_core::JobState::Idle;
                    job.start_time = None;
                    job.alloc_partition = None;
                }
                false
            }
        }
    }

    async fn drop_lien(&self, job_id: &str) {
        let Some(job) = self.ctx.jobs.get(job_id) else {
            return;
        };
        if let Err(e) = self.accounting.delete_lien(job).await {
            warn!(job = %job_id, error = %e, "cannot delete lien");
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpc_core::RmConfig;
    use hpcsched_wiki::frame::{read_frame, write_frame};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    async fn fake_rm(replies: Vec<&'static str>) -> (u16, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        tokio::spawn(async move {
            for reply in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let body = read_frame(&mut stream).await.unwrap();
                log.lock().unwrap().push(body);
                write_frame(&mut stream, reply).await.unwrap();
            }
        });
        (port, requests)
    }

    fn make_config(port: u16) -> SchedConfig {
        let mut config = SchedConfig::default();
        config.scheduler.preempt_policy = PreemptMode::Suspend;
        config.rm.push(RmConfig::new("slurm", "127.0.0.1", port));
        config
    }

    #[tokio::test]
    async fn iteration_starts_jobs_by_priority() {
        let (port, requests) = fake_rm(vec![
            "SC=0 ARG=1#n0:STATE=Idle;CPROC=2",
            "SC=0 ARG=2#low:STATE=Idle;TASKS=2;DPROCS=1;PRIORITY=1#high:STATE=Idle;TASKS=2;DPROCS=1;PRIORITY=9",
            "SC=0 RESPONSE=started",
        ])
        .await;
        let mut scheduler = Scheduler::new(make_config(port));

        let summary = scheduler.run_iteration(100).await;

        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.started, vec!["high".to_string()]);
        assert_eq!(
            requests.lock().unwrap().last().map(String::as_str),
            Some("CMD=STARTJOB ARG=high TASKLIST=n0:n0")
        );
        let ctx = scheduler.context();
        assert_eq!(ctx.jobs.get("high").unwrap().state, hpc_core::JobState::Running);
        assert_eq!(ctx.jobs.get("low").unwrap().state, hpc_core::JobState::Idle);
    }

    #[tokio::test]
    async fn refused_start_is_rolled_back() {
        let (port, _) = fake_rm(vec![
            "SC=0 ARG=1#n0:STATE=Idle;CPROC=2",
            "SC=0 ARG=1#j1:STATE=Idle;TASKS=1;DPROCS=1",
            "SC=-1 RESPONSE=node not ready",
        ])
        .await;
        let mut scheduler = Scheduler::new(make_config(port));

        let summary = scheduler.run_iteration(100).await;

        assert!(summary.started.is_empty());
        let ctx = scheduler.context();
        let job = ctx.jobs.get("j1").unwrap();
        assert_eq!(job.state, hpc_core::JobState::Idle);
        assert!(!job.has_allocation());
        assert_eq!(ctx.nodes.by_id("n0").unwrap().available().procs, 2);
    }

    #[tokio::test]
    async fn unreachable_rm_is_counted_and_nothing_starts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut scheduler = Scheduler::new(make_config(port));

        let summary = scheduler.run_iteration(100).await;

        assert_eq!(summary.rms_failed, 1);
        assert_eq!(summary.candidates, 0);
    }
}
