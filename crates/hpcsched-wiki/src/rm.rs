//! Resource manager adapter.
//!
//! [`WikiRm`] turns scheduler intents into Wiki commands on a [`WikiClient`]
//! and folds query replies back into the [`SchedulerContext`]. It is also
//! the [`PreemptBackend`] the placement engine drives.

use std::collections::HashSet;

use hpc_core::PreemptMode;
use hpcsched_placement::{BackendFuture, PreemptBackend};
use hpcsched_state::{Job, JobId, NodeList, SchedulerContext};
use tracing::{debug, info, warn};

use crate::apply::{
    ApplyReport, apply_job_record, apply_node_record, apply_vm_record, is_vm_record, vm_destroyed,
};
use crate::client::WikiClient;
use crate::codec::{WikiMessage, decode};
use crate::command::{WikiCommand, WikiVerb};
use crate::error::{WikiError, WikiResult};
use crate::frame::WikiResponse;

/// `ARG=` for full (non-delta) queries.
const FULL_QUERY: &str = "0:ALL";

/// Why a job is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    Admin,
    WallClock,
}

impl CancelKind {
    fn as_str(&self) -> &'static str {
        match self {
            CancelKind::Admin => "ADMIN",
            CancelKind::WallClock => "WALLCLOCK",
        }
    }
}

pub struct WikiRm {
    client: WikiClient,
    rm_index: usize,
}

impl WikiRm {
    pub fn new(client: WikiClient, rm_index: usize) -> Self {
        Self { client, rm_index }
    }

    pub fn name(&self) -> &str {
        &self.client.config().name
    }

    pub fn client(&self) -> &WikiClient {
        &self.client
    }

    pub fn rm_index(&self) -> usize {
        self.rm_index
    }

    pub fn begin_iteration(&self, iteration: u64) {
        self.client.begin_iteration(iteration);
    }

    async fn query(&self, verb: WikiVerb) -> WikiResult<Vec<WikiMessage>> {
        let resp = self.client.execute(&WikiCommand::new(verb, FULL_QUERY)).await?;
        match resp.data.as_deref() {
            Some(data) => decode(data),
            None => Ok(Vec::new()),
        }
    }

    /// Fetch raw node records without touching scheduler state.
    pub async fn fetch_nodes(&self) -> WikiResult<Vec<WikiMessage>> {
        self.query(WikiVerb::GetNodes).await
    }

    /// Fetch raw job records without touching scheduler state.
    pub async fn fetch_jobs(&self) -> WikiResult<Vec<WikiMessage>> {
        self.query(WikiVerb::GetJobs).await
    }

    /// `GETNODES`: refresh every node and VM this RM reports.
    pub async fn cluster_query(&self, ctx: &mut SchedulerContext) -> WikiResult<ApplyReport> {
        let records = self.fetch_nodes().await?;
        let mut report = ApplyReport::default();
        for msg in &records {
            if !is_vm_record(ctx, msg) {
                report.merge(apply_node_record(ctx, self.rm_index, msg));
            } else if vm_destroyed(msg) {
                debug!(rm = %self.name(), vm = %msg.object_id, "ignoring destroyed vm");
            } else {
                report.merge(apply_vm_record(ctx, msg));
            }
        }
        ctx.partitions.refresh(&ctx.nodes);
        debug!(rm = %self.name(), records = report.records, rejected = report.rejected.len(), "cluster query applied");
        Ok(report)
    }

    /// `GETJOBS`: refresh every job this RM reports. Jobs of this RM that
    /// are missing from the reply have left it; their resources are
    /// released and they are dropped.
    pub async fn workload_query(&self, ctx: &mut SchedulerContext) -> WikiResult<ApplyReport> {
        let records = self.fetch_jobs().await?;
        let mut report = ApplyReport::default();
        for msg in &records {
            report.merge(apply_job_record(ctx, self.rm_index, msg));
        }

        let reported: HashSet<&str> = records.iter().map(|m| m.object_id.as_str()).collect();
        let gone: Vec<JobId> = ctx
            .jobs
            .iter()
            .filter(|j| j.rm_index == self.rm_index && !reported.contains(j.id.as_str()))
            .map(|j| j.id.clone())
            .collect();
        for job_id in &gone {
            match ctx.remove_job(job_id) {
                Ok(job) => info!(rm = %self.name(), job = %job_id, state = %job.state, "job no longer reported"),
                Err(e) => warn!(rm = %self.name(), job = %job_id, error = %e, "cannot drop unreported job"),
            }
        }
        debug!(
            rm = %self.name(),
            jobs = report.records,
            dropped = gone.len(),
            rejected = report.rejected.len(),
            "workload query applied"
        );
        Ok(report)
    }

    /// `STARTJOB` with one task-list entry per task: `n1:n1:n2`.
    pub async fn start_job(&self, ctx: &SchedulerContext, job_id: &str, per_req: &[NodeList]) -> WikiResult<()> {
        let task_list = task_list_string(ctx, per_req)?;
        let cmd = WikiCommand::new(WikiVerb::StartJob, job_id).param("TASKLIST", task_list);
        self.client.execute(&cmd).await?;
        info!(rm = %self.name(), job = %job_id, "job start sent to rm");
        Ok(())
    }

    pub async fn cancel_job(&self, job_id: &str, kind: CancelKind, comment: Option<&str>) -> WikiResult<WikiResponse> {
        let mut cmd = WikiCommand::new(WikiVerb::CancelJob, job_id).param("TYPE", kind.as_str());
        if let Some(comment) = comment {
            cmd = cmd.param("COMMENT", format!("\"{}\"", comment.replace('"', "'")));
        }
        self.client.execute(&cmd).await
    }

    pub async fn suspend_job(&self, job_id: &str) -> WikiResult<WikiResponse> {
        self.client.execute(&WikiCommand::new(WikiVerb::SuspendJob, job_id)).await
    }

    pub async fn resume_job(&self, job_id: &str) -> WikiResult<WikiResponse> {
        self.client.execute(&WikiCommand::new(WikiVerb::ResumeJob, job_id)).await
    }

    pub async fn requeue_job(&self, job_id: &str) -> WikiResult<WikiResponse> {
        self.client.execute(&WikiCommand::new(WikiVerb::RequeueJob, job_id)).await
    }

    pub async fn checkpoint_job(&self, job_id: &str) -> WikiResult<WikiResponse> {
        self.client.execute(&WikiCommand::new(WikiVerb::CheckpointJob, job_id)).await
    }

    pub async fn modify_job(&self, job_id: &str, changes: &[(&str, &str)]) -> WikiResult<WikiResponse> {
        let cmd = changes
            .iter()
            .fold(WikiCommand::new(WikiVerb::ModifyJob, job_id), |cmd, (k, v)| {
                cmd.param(k, *v)
            });
        self.client.execute(&cmd).await
    }

    pub async fn signal_job(&self, job_id: &str, signal: &str) -> WikiResult<WikiResponse> {
        let cmd = WikiCommand::new(WikiVerb::SignalJob, job_id).param("VALUE", signal);
        self.client.execute(&cmd).await
    }

    /// Ask the RM whether `job_id` could start on `nodes`. Returns the
    /// records the RM replies with.
    pub async fn job_will_run(&self, job_id: &str, nodes: &[&str]) -> WikiResult<Vec<WikiMessage>> {
        let mut cmd = WikiCommand::new(WikiVerb::JobWillRun, job_id);
        if !nodes.is_empty() {
            cmd = cmd.param("NODES", nodes.join(":"));
        }
        let resp = self.client.execute(&cmd).await?;
        match resp.data.as_deref() {
            Some(data) => decode(data),
            None => Ok(Vec::new()),
        }
    }

    async fn preempt_with(&self, job_id: &str, mode: PreemptMode, reason: &str) -> WikiResult<WikiResponse> {
        match mode {
            PreemptMode::Checkpoint => self.checkpoint_job(job_id).await,
            PreemptMode::Suspend => self.suspend_job(job_id).await,
            PreemptMode::Requeue => self.requeue_job(job_id).await,
            PreemptMode::Cancel => self.cancel_job(job_id, CancelKind::Admin, Some(reason)).await,
        }
    }
}

/// Render an allocation as `name:name:...`, one entry per task.
pub fn task_list_string(ctx: &SchedulerContext, per_req: &[NodeList]) -> WikiResult<String> {
    let mut names = Vec::new();
    for nt in per_req.iter().flat_map(|list| list.iter()) {
        let node = ctx
            .nodes
            .get(nt.node)
            .ok_or_else(|| WikiError::malformed(format!("allocation names unknown node index {}", nt.node)))?;
        names.extend(std::iter::repeat_n(node.id.as_str(), nt.tasks as usize));
    }
    if names.is_empty() {
        return Err(WikiError::malformed("empty task list"));
    }
    Ok(names.join(":"))
}

impl PreemptBackend for WikiRm {
    fn preempt<'a>(&'a self, victim: &'a Job, mode: PreemptMode, reason: &'a str) -> BackendFuture<'a> {
        Box::pin(async move {
            self.preempt_with(&victim.id, mode, reason)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    }

    fn resume<'a>(&'a self, victim: &'a Job, mode: PreemptMode) -> BackendFuture<'a> {
        Box::pin(async move {
            if mode != PreemptMode::Suspend {
                return Err(format!("cannot resume a job preempted by {mode}"));
            }
            self.resume_job(&victim.id)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    }
}
