//! Job attribute registry.
//!
//! Scalar requirement attributes (`TASKS`, `DPROCS`, `RFEATURES`, ...) land on
//! the job's first req. `TASKLIST` is collected during the pass and turned
//! into a node allocation once every attribute has been applied.

use std::collections::HashMap;
use std::sync::LazyLock;

use hpc_core::{JobState, ResourceVector};
use hpcsched_state::{HostList, HostListMode, Job, JobFlags, NodeList, Req, SchedulerContext};
use tracing::{debug, info, warn};

use super::{ApplyReport, parse, parse_demand, parse_gres, parse_task_list, split_list};
use crate::codec::WikiMessage;
use crate::error::{WikiError, WikiResult};

/// Mutable view handed to job handlers.
pub struct JobUpdate<'a> {
    pub job: &'a mut Job,
    pub now: u64,
    pub rm_index: usize,
    /// State before this record was applied.
    pub previous_state: JobState,
    /// Per-node task counts reported by the RM.
    pub task_list: Option<Vec<(String, u32)>>,
    /// The job's resources must be given back once the record is applied.
    pub release: bool,
}

impl<'a> JobUpdate<'a> {
    pub fn new(job: &'a mut Job, rm_index: usize, now: u64) -> Self {
        let previous_state = job.state;
        Self {
            job,
            now,
            rm_index,
            previous_state,
            task_list: None,
            release: false,
        }
    }

    fn req0(&mut self) -> &mut Req {
        if self.job.reqs.is_empty() {
            self.job.reqs.push(Req::new(0, ResourceVector::procs(1), 1));
        }
        &mut self.job.reqs[0]
    }
}

type JobHandler = fn(&mut JobUpdate<'_>, &str) -> WikiResult<()>;

fn opt_string(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

static JOB_HANDLERS: LazyLock<HashMap<&'static str, JobHandler>> = LazyLock::new(|| {
    let mut m: HashMap<&'static str, JobHandler> = HashMap::new();
    m.insert("STATE", apply_state);
    m.insert("TASKS", |u, v| {
        u.req0().task_count = parse("TASKS", v)?;
        Ok(())
    });
    m.insert("NODES", |u, v| {
        u.req0().node_count = parse("NODES", v)?;
        Ok(())
    });
    m.insert("TASKPERNODE", |u, v| {
        u.req0().tasks_per_node = parse("TASKPERNODE", v)?;
        Ok(())
    });
    m.insert("UNAME", |u, v| {
        u.job.credential.user = opt_string(v);
        Ok(())
    });
    m.insert("GNAME", |u, v| {
        u.job.credential.group = opt_string(v);
        Ok(())
    });
    m.insert("ACCOUNT", |u, v| {
        u.job.credential.account = opt_string(v);
        Ok(())
    });
    m.insert("RCLASS", |u, v| {
        u.job.credential.class = opt_string(v);
        Ok(())
    });
    m.insert("QOS", |u, v| {
        u.job.credential.qos = opt_string(v);
        Ok(())
    });
    m.insert("PRIORITY", |u, v| {
        u.job.priority = parse("PRIORITY", v)?;
        Ok(())
    });
    m.insert("WCLIMIT", |u, v| {
        u.job.wall_limit_secs = Some(parse("WCLIMIT", v)?);
        Ok(())
    });
    m.insert("RFEATURES", |u, v| {
        u.req0().features = split_list(v).map(str::to_string).collect();
        Ok(())
    });
    m.insert("RARCH", |u, v| {
        u.req0().arch = opt_string(v);
        Ok(())
    });
    m.insert("ROPSYS", |u, v| {
        u.req0().opsys = opt_string(v);
        Ok(())
    });
    m.insert("DPROCS", |u, v| {
        u.req0().per_task.procs = parse_demand("DPROCS", v)?;
        Ok(())
    });
    m.insert("DMEM", |u, v| {
        u.req0().per_task.memory_mb = parse_demand("DMEM", v)?;
        Ok(())
    });
    m.insert("DDISK", |u, v| {
        u.req0().per_task.disk_mb = parse_demand("DDISK", v)?;
        Ok(())
    });
    m.insert("DSWAP", |u, v| {
        u.req0().per_task.swap_mb = parse_demand("DSWAP", v)?;
        Ok(())
    });
    m.insert("DGRES", |u, v| {
        for (name, count) in parse_gres("DGRES", v)? {
            u.req0().per_task.set_generic(&name, count);
        }
        Ok(())
    });
    m.insert("HOSTLIST", |u, v| {
        let nodes = parse_task_list(v)?.into_iter().map(|(name, _)| name).collect();
        u.job.required_hosts = Some(HostList {
            nodes,
            mode: HostListMode::Exact,
        });
        Ok(())
    });
    m.insert("EXCLUDE_HOSTLIST", |u, v| {
        let names = parse_task_list(v)?;
        u.req0().excluded_hosts = names.into_iter().map(|(name, _)| name).collect();
        Ok(())
    });
    m.insert("TASKLIST", |u, v| {
        u.task_list = Some(parse_task_list(v)?);
        Ok(())
    });
    m.insert("FLAGS", apply_flags);
    m.insert("PARTITIONMASK", |u, v| {
        u.job.partition_mask = split_list(v).map(str::to_string).collect();
        Ok(())
    });
    m.insert("QUEUETIME", |u, v| {
        u.job.queue_time = Some(parse("QUEUETIME", v)?);
        Ok(())
    });
    m.insert("STARTTIME", |u, v| {
        u.job.start_time = Some(parse("STARTTIME", v)?);
        Ok(())
    });
    m.insert("COMPLETETIME", |u, v| {
        u.job.completion_time = Some(parse("COMPLETETIME", v)?);
        Ok(())
    });
    m.insert("COMMENT", |u, v| {
        u.job.comment = Some(hpc_core::bounded_message(v));
        Ok(())
    });
    m.insert("NAME", |u, v| {
        u.job.name = opt_string(v);
        Ok(())
    });
    m
});

fn apply_state(u: &mut JobUpdate<'_>, value: &str) -> WikiResult<()> {
    let reported: JobState = value
        .trim()
        .parse()
        .map_err(|_| WikiError::invalid("STATE", value))?;
    let previous = u.previous_state;

    let next = match reported {
        JobState::Hold => {
            u.job.flags.user_hold = true;
            JobState::Idle
        }
        JobState::Unknown => match previous {
            JobState::Suspended | JobState::Idle => JobState::Suspended,
            other => other,
        },
        other => other,
    };

    if previous.is_active() && (next == JobState::Idle || next.is_finished()) {
        u.release = true;
    }
    if reported != JobState::Hold {
        u.job.flags.user_hold = false;
    }
    if next == JobState::Idle && previous.is_active() {
        info!(job = %u.job.id, "job requeued by rm");
    }
    if next.is_finished() && u.job.completion_time.is_none() {
        u.job.completion_time = Some(u.now);
    }
    u.job.state = next;
    Ok(())
}

/// `FLAGS=` carries the full set of RM-side flags; any not listed are off.
fn apply_flags(u: &mut JobUpdate<'_>, value: &str) -> WikiResult<()> {
    let kept = &u.job.flags;
    u.job.flags = JobFlags {
        preempted: kept.preempted,
        preempt_completed: kept.preempt_completed,
        user_hold: kept.user_hold,
        ..JobFlags::default()
    };
    for flag in split_list(value) {
        let flags = &mut u.job.flags;
        match flag.to_ascii_uppercase().as_str() {
            "PREEMPTOR" => flags.preemptor = true,
            "PREEMPTEE" => flags.preemptee = true,
            "BESTEFFORT" => flags.best_effort = true,
            "RESTARTABLE" => flags.restartable = true,
            "SUSPENDABLE" => flags.suspendable = true,
            "CHECKPOINTABLE" => flags.checkpointable = true,
            "RUNNOW" => flags.run_now = true,
            "SHAREDMEM" => flags.shared_mem = true,
            other => debug!(job = %u.job.id, flag = other, "ignoring unknown job flag"),
        }
    }
    Ok(())
}

/// Apply one attribute. Unknown names yield `UnknownAttribute`.
pub fn apply_job_attr(update: &mut JobUpdate<'_>, name: &str, value: &str) -> WikiResult<()> {
    let handler = JOB_HANDLERS
        .get(name)
        .ok_or_else(|| WikiError::UnknownAttribute(name.to_string()))?;
    handler(update, value)
}

/// Apply a `GETJOBS` record, creating the job if it is new.
///
/// A job that leaves an active state gives its node resources back; an
/// active job that arrives with a `TASKLIST` and no allocation is given one.
pub fn apply_job_record(ctx: &mut SchedulerContext, rm_index: usize, msg: &WikiMessage) -> ApplyReport {
    let now = ctx.now;
    let job = ctx.jobs.get_or_create(&msg.object_id);
    job.rm_index = rm_index;
    let mut update = JobUpdate::new(job, rm_index, now);

    let mut report = ApplyReport {
        records: 1,
        ..ApplyReport::default()
    };
    for (name, value) in msg.attrs() {
        let result = apply_job_attr(&mut update, name, value);
        if let Some(e) = report.record(name, result) {
            warn!(job = %msg.object_id, attribute = name, error = %e, "job attribute rejected");
        }
    }
    if !report.unknown.is_empty() {
        debug!(job = %msg.object_id, unknown = ?report.unknown, "unknown job attributes");
    }

    let JobUpdate {
        release, task_list, ..
    } = update;
    let job_id = msg.object_id.as_str();

    if release {
        if let Err(e) = ctx.release_job(job_id) {
            warn!(job = %job_id, error = %e, "cannot release job resources");
        }
    }
    if let Some(task_list) = task_list {
        adopt_task_list(ctx, job_id, &task_list);
    }
    report
}

/// Record an RM-side allocation for an active job we have no allocation for.
fn adopt_task_list(ctx: &mut SchedulerContext, job_id: &str, task_list: &[(String, u32)]) {
    let Some(job) = ctx.jobs.get(job_id) else {
        return;
    };
    if !job.state.is_active() || job.has_allocation() {
        return;
    }

    let mut list = NodeList::new();
    for (name, tasks) in task_list {
        match ctx.nodes.index_of(name) {
            Some(idx) => list.add(idx, *tasks),
            None => {
                warn!(job = %job_id, node = %name, "task list names unknown node");
                return;
            }
        }
    }
    let mut per_req = vec![NodeList::new(); job.reqs.len().max(1)];
    per_req[0] = list;

    match ctx.allocate(job_id, &per_req) {
        Ok(()) => debug!(job = %job_id, tasks = per_req[0].total_tasks(), "adopted rm allocation"),
        Err(e) => warn!(job = %job_id, error = %e, "cannot adopt rm allocation"),
    }
}
