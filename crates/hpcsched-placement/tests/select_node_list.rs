//! End-to-end node-list selection against an in-memory cluster.

use std::collections::BTreeSet;
use std::sync::Mutex;

use hpc_core::{JobState, PreemptMode, ResourceVector};
use hpcsched_placement::{
    BackendFuture, FailureKind, InMemoryAccounting, NodeListSelector, PreemptBackend, SelectOptions,
    StaticFeasibility,
};
use hpcsched_state::{Job, Node, NodeList, NodeTasks, OwnerPreemptRsv, Req, SchedulerContext};

// ── Helpers ────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingBackend {
    fail: BTreeSet<String>,
    calls: Mutex<Vec<String>>,
}

impl RecordingBackend {
    fn failing(ids: &[&str]) -> Self {
        Self {
            fail: ids.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl PreemptBackend for RecordingBackend {
    fn preempt<'a>(&'a self, victim: &'a Job, mode: PreemptMode, _reason: &'a str) -> BackendFuture<'a> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(format!("{mode}:{}", victim.id));
            if self.fail.contains(&victim.id) {
                return Err(format!("cannot {mode} {}", victim.id));
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

fn make_ctx(nodes: &[i64]) -> SchedulerContext {
    let mut ctx = SchedulerContext::default();
    ctx.policy.preempt_policy = PreemptMode::Suspend;
    for (i, procs) in nodes.iter().enumerate() {
        ctx.nodes
            .insert(Node::new(&format!("n{i}"), ResourceVector::procs(*procs)));
    }
    ctx.begin_iteration(1_000);
    ctx
}

fn make_job(id: &str, procs: i64, tasks: u32, priority: i64) -> Job {
    Job::new(id, vec![Req::new(0, ResourceVector::procs(procs), tasks)], priority)
}

fn run_victim(ctx: &mut SchedulerContext, id: &str, priority: i64, node: usize, procs: i64) {
    let mut job = make_job(id, procs, 1, priority);
    job.flags.preemptee = true;
    job.flags.suspendable = true;
    ctx.jobs.insert(job);
    ctx.start_job(id, 0, &[NodeList(vec![NodeTasks { node, tasks: 1 }])])
        .unwrap();
}

fn add_preemptor(ctx: &mut SchedulerContext, id: &str, procs: i64, tasks: u32, priority: i64) {
    let mut job = make_job(id, procs, tasks, priority);
    job.flags.preemptor = true;
    ctx.jobs.insert(job);
}

// ── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn idle_node_satisfies_without_preemption() {
    let mut ctx = make_ctx(&[4]);
    ctx.jobs.insert(make_job("j1", 4, 1, 10));
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let alloc = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap();

    assert_eq!(alloc.per_req[0].0, vec![NodeTasks { node: 0, tasks: 1 }]);
    assert!(alloc.preempted.is_empty());
    assert!(backend.calls().is_empty());
    assert_eq!(accounting.lien_count().await, 0);
    assert!(!ctx.jobs.get("j1").unwrap().is_preempting);
}

#[tokio::test]
async fn busy_node_is_freed_by_preempting_lower_priority_job() {
    let mut ctx = make_ctx(&[2]);
    run_victim(&mut ctx, "j2", 10, 0, 2);
    add_preemptor(&mut ctx, "j1", 2, 1, 50);
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let alloc = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap();

    assert_eq!(alloc.preempted, vec!["j2".to_string()]);
    assert_eq!(alloc.per_req[0].0, vec![NodeTasks { node: 0, tasks: 1 }]);
    assert_eq!(backend.calls(), vec!["suspend:j2"]);
    assert_eq!(ctx.jobs.get("j2").unwrap().state, JobState::Suspended);
    assert!(accounting.has_lien("j1").await);

    let j1 = ctx.jobs.get("j1").unwrap();
    assert!(j1.flags.preempt_completed);
    assert_eq!(j1.preempt_time, Some(1_000));
    assert_eq!(ctx.counters.preemptees, 1);
    assert_eq!(ctx.counters.preemptors, 1);

    ctx.start_job("j1", alloc.partition, &alloc.per_req).unwrap();
    ctx.check_conservation().unwrap();
}

#[tokio::test]
async fn zero_preempt_cap_blocks_before_any_victim_is_touched() {
    let mut ctx = make_ctx(&[2]);
    ctx.policy.max_job_preempt_per_iteration = 0;
    run_victim(&mut ctx, "j2", 10, 0, 2);
    add_preemptor(&mut ctx, "j1", 2, 1, 50);
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let err = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::PolicyBlocked);
    assert!(backend.calls().is_empty());
    assert_eq!(ctx.jobs.get("j2").unwrap().state, JobState::Running);
}

#[tokio::test]
async fn lien_failure_preempts_nothing() {
    let mut ctx = make_ctx(&[2]);
    run_victim(&mut ctx, "j2", 10, 0, 2);
    add_preemptor(&mut ctx, "j1", 2, 1, 50);
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    accounting.reject_registrations(true);
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let err = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::AccountingFailure);
    assert!(backend.calls().is_empty());
    assert!(ctx.jobs.iter().all(|j| !j.flags.preempted));
    assert_eq!(ctx.counters.preemptees, 0);
}

#[tokio::test]
async fn failed_victim_rolls_back_earlier_preemptions() {
    let mut ctx = make_ctx(&[2]);
    ctx.policy.resume_on_failed_preempt = true;
    run_victim(&mut ctx, "a", 5, 0, 1);
    run_victim(&mut ctx, "b", 10, 0, 1);
    add_preemptor(&mut ctx, "j1", 2, 1, 50);
    let backend = RecordingBackend::failing(&["b"]);
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let err = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::InsufficientNow);
    assert_eq!(backend.calls(), vec!["suspend:a", "suspend:b", "resume:a"]);
    assert_eq!(ctx.jobs.get("a").unwrap().state, JobState::Running);
    assert_eq!(ctx.jobs.get("b").unwrap().state, JobState::Running);
    assert_eq!(accounting.lien_count().await, 0);
    assert_eq!(ctx.nodes.get(0).unwrap().available().procs, 0);
    ctx.check_conservation().unwrap();
}

#[tokio::test]
async fn non_preemptor_reports_insufficient_with_rejections() {
    let mut ctx = make_ctx(&[2]);
    run_victim(&mut ctx, "j2", 10, 0, 2);
    ctx.jobs.insert(make_job("j1", 2, 1, 50));
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let err = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::InsufficientNow);
    assert!(err.message().contains("req 0 idle 0/1 tasks"));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn owner_preempt_reservation_grants_preemption() {
    let mut ctx = make_ctx(&[2]);
    run_victim(&mut ctx, "j2", 10, 0, 2);
    let mut job = make_job("j1", 2, 1, 50);
    job.credential.user = Some("alice".into());
    ctx.jobs.insert(job);
    ctx.owner_preempt_rsvs.push(OwnerPreemptRsv {
        id: "rsv.1".into(),
        owner: "alice".into(),
        start: 0,
        end: 5_000,
    });
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let alloc = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(alloc.preempted, vec!["j2".to_string()]);
}

#[tokio::test]
async fn recent_preemptor_waits_for_retry_time() {
    let mut ctx = make_ctx(&[2]);
    ctx.policy.reservation_retry_time_secs = 60;
    run_victim(&mut ctx, "j2", 10, 0, 2);
    add_preemptor(&mut ctx, "j1", 2, 1, 50);
    ctx.jobs.get_mut("j1").unwrap().preempt_time = Some(990);
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let err = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::PolicyBlocked);

    ctx.policy.no_wait_preemption = true;
    selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn job_start_cap_blocks_selection() {
    let mut ctx = make_ctx(&[4]);
    ctx.policy.max_job_start_per_iteration = 0;
    ctx.jobs.insert(make_job("j1", 1, 1, 10));
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let err = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::PolicyBlocked);
}

#[tokio::test]
async fn unknown_job_is_an_invalid_request() {
    let mut ctx = make_ctx(&[4]);
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let err = selector
        .select_node_list(&mut ctx, "missing", 0, &SelectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::InvalidRequest);
}

fn add_multi_req_preemptor(ctx: &mut SchedulerContext, id: &str, reqs: Vec<Req>, priority: i64) {
    let mut job = Job::new(id, reqs, priority);
    job.flags.preemptor = true;
    ctx.jobs.insert(job);
}

#[tokio::test]
async fn reqs_do_not_both_count_the_same_free_procs() {
    let mut ctx = make_ctx(&[4]);
    run_victim(&mut ctx, "v", 10, 0, 2);
    add_multi_req_preemptor(
        &mut ctx,
        "p",
        vec![
            Req::new(0, ResourceVector::procs(2), 1),
            Req::new(1, ResourceVector::procs(2), 1),
        ],
        50,
    );
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let alloc = selector
        .select_node_list(&mut ctx, "p", 0, &SelectOptions::default())
        .await
        .unwrap();

    assert_eq!(alloc.preempted, vec!["v".to_string()]);
    assert_eq!(backend.calls(), vec!["suspend:v"]);
    assert_eq!(alloc.per_req[0].0, vec![NodeTasks { node: 0, tasks: 1 }]);
    assert_eq!(alloc.per_req[1].0, vec![NodeTasks { node: 0, tasks: 1 }]);

    ctx.start_job("p", alloc.partition, &alloc.per_req).unwrap();
    assert_eq!(ctx.nodes.get(0).unwrap().available().procs, 0);
    ctx.check_conservation().unwrap();
}

#[tokio::test]
async fn victim_is_preempted_once_across_reqs() {
    let mut ctx = make_ctx(&[2, 2]);
    run_victim(&mut ctx, "v1", 5, 0, 2);
    run_victim(&mut ctx, "v2", 10, 1, 2);
    add_multi_req_preemptor(
        &mut ctx,
        "p",
        vec![
            Req::new(0, ResourceVector::procs(2), 1),
            Req::new(1, ResourceVector::procs(2), 1),
        ],
        50,
    );
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let alloc = selector
        .select_node_list(&mut ctx, "p", 0, &SelectOptions::default())
        .await
        .unwrap();

    assert_eq!(backend.calls(), vec!["suspend:v1", "suspend:v2"]);
    assert_eq!(alloc.preempted, vec!["v1".to_string(), "v2".to_string()]);
    assert_eq!(ctx.counters.preemptees, 2);
    assert_eq!(alloc.per_req[0].0, vec![NodeTasks { node: 0, tasks: 1 }]);
    assert_eq!(alloc.per_req[1].0, vec![NodeTasks { node: 1, tasks: 1 }]);

    ctx.start_job("p", alloc.partition, &alloc.per_req).unwrap();
    ctx.check_conservation().unwrap();
}

#[tokio::test]
async fn failed_distribution_after_preemption_resumes_victims() {
    // Folding req 1's memory into req 0 rounds up to 1 MB per req-0 task,
    // so the node's single MB holds only one of the two req-0 tasks.
    let mut ctx = make_ctx(&[4]);
    ctx.nodes.get_mut(0).unwrap().configured.memory_mb = 1;
    ctx.policy.resume_on_failed_preempt = true;
    run_victim(&mut ctx, "v", 5, 0, 2);
    run_victim(&mut ctx, "w", 10, 0, 1);
    add_multi_req_preemptor(
        &mut ctx,
        "p",
        vec![
            Req::new(0, ResourceVector::procs(1), 2),
            Req::new(1, ResourceVector::new(1, 1, 0, 0), 1),
        ],
        50,
    );
    ctx.jobs.get_mut("p").unwrap().flags.shared_mem = true;
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let err = selector
        .select_node_list(&mut ctx, "p", 0, &SelectOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Distribution);
    assert_eq!(
        backend.calls(),
        vec!["suspend:v", "suspend:w", "resume:w", "resume:v"]
    );
    assert_eq!(ctx.jobs.get("v").unwrap().state, JobState::Running);
    assert_eq!(ctx.jobs.get("w").unwrap().state, JobState::Running);
    assert_eq!(accounting.lien_count().await, 0);
    let p = ctx.jobs.get("p").unwrap();
    assert_eq!(p.reqs[0].per_task.memory_mb, 0);
    assert!(!p.has_allocation());
    assert_eq!(ctx.nodes.get(0).unwrap().available().procs, 1);
    ctx.check_conservation().unwrap();
}

#[tokio::test]
async fn preempt_cap_reached_midway_rolls_back() {
    let mut ctx = make_ctx(&[2]);
    ctx.policy.max_job_preempt_per_iteration = 1;
    ctx.policy.resume_on_failed_preempt = true;
    run_victim(&mut ctx, "a", 5, 0, 1);
    run_victim(&mut ctx, "b", 10, 0, 1);
    add_preemptor(&mut ctx, "j1", 2, 1, 50);
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let err = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::PolicyBlocked);
    assert_eq!(backend.calls(), vec!["suspend:a", "resume:a"]);
    assert_eq!(ctx.jobs.get("a").unwrap().state, JobState::Running);
    assert_eq!(ctx.jobs.get("b").unwrap().state, JobState::Running);
    assert!(!accounting.has_lien("j1").await);
    assert_eq!(ctx.nodes.get(0).unwrap().available().procs, 0);
    ctx.check_conservation().unwrap();
}

#[tokio::test]
async fn negative_task_demand_places_nothing() {
    let mut ctx = make_ctx(&[4]);
    ctx.jobs.insert(make_job("j1", -2, 3, 10));
    let backend = RecordingBackend::default();
    let accounting = InMemoryAccounting::new();
    let selector = NodeListSelector::new(&StaticFeasibility, &backend, &accounting);

    let err = selector
        .select_node_list(&mut ctx, "j1", 0, &SelectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Infeasible);

    let forced = ctx.start_job("j1", 0, &[NodeList(vec![NodeTasks { node: 0, tasks: 3 }])]);
    assert!(forced.is_err());
    let n0 = ctx.nodes.get(0).unwrap();
    assert_eq!(n0.available().procs, 4);
    assert!(n0.available().procs <= n0.configured.procs);
    ctx.check_conservation().unwrap();
}
