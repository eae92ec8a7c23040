//! Domain records for the scheduler state.
//!
//! Nodes, jobs, partitions and VMs are owned by the registries in
//! [`crate::registry`]. Records refer to each other by registry index
//! (nodes) or id (jobs) so they can be cloned and moved freely.

use std::collections::{BTreeMap, BTreeSet};

use hpc_core::{JobState, NodeAccessPolicy, NodeState, ResourceVector};
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Unique identifier for a compute node.
pub type NodeId = String;

/// Unique identifier for a job.
pub type JobId = String;

/// Partition index. Partition 0 is the global partition.
pub type PartitionId = usize;

/// Index of the global partition containing every node.
pub const GLOBAL_PARTITION: PartitionId = 0;

// ── Node lists ─────────────────────────────────────────────────────

/// A node (by registry index) and a task count on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTasks {
    pub node: usize,
    pub tasks: u32,
}

/// Ordered list of node/task pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeList(pub Vec<NodeTasks>);

impl NodeList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, node: usize, tasks: u32) {
        self.0.push(NodeTasks { node, tasks });
    }

    pub fn total_tasks(&self) -> u32 {
        self.0.iter().map(|nt| nt.tasks).sum()
    }

    pub fn node_count(&self) -> u32 {
        self.0.iter().filter(|nt| nt.tasks > 0).count() as u32
    }

    pub fn contains(&self, node: usize) -> bool {
        self.0.iter().any(|nt| nt.node == node)
    }

    pub fn tasks_on(&self, node: usize) -> u32 {
        self.0
            .iter()
            .filter(|nt| nt.node == node)
            .map(|nt| nt.tasks)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeTasks> {
        self.0.iter()
    }

    /// Add `tasks` to an existing entry for `node`, or append one.
    pub fn add(&mut self, node: usize, tasks: u32) {
        match self.0.iter_mut().find(|nt| nt.node == node) {
            Some(nt) => nt.tasks += tasks,
            None => self.push(node, tasks),
        }
    }
}

impl FromIterator<NodeTasks> for NodeList {
    fn from_iter<I: IntoIterator<Item = NodeTasks>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ── Node ───────────────────────────────────────────────────────────

/// Resources a job holds on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAllocation {
    pub job_id: JobId,
    pub tasks: u32,
    pub resources: ResourceVector,
}

/// A compute node.
///
/// `dedicated` is the sum of all allocation footprints, so
/// `dedicated + available() == configured` holds by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Position in the node registry; defines selection order.
    pub index: usize,
    pub partition: PartitionId,
    pub state: NodeState,
    pub substate: Option<String>,
    /// State as last reported by each resource manager.
    pub rm_state: BTreeMap<usize, NodeState>,
    pub configured: ResourceVector,
    pub dedicated: ResourceVector,
    /// Availability reported by the RM, if any.
    pub reported: Option<ResourceVector>,
    pub access_policy: NodeAccessPolicy,
    pub features: BTreeSet<String>,
    pub arch: Option<String>,
    pub opsys: Option<String>,
    pub allocations: Vec<NodeAllocation>,
    pub cpu_load: f64,
    pub priority: i64,
    pub speed: f64,
    pub message: Option<String>,
    /// Unix time of the last state transition.
    pub state_mtime: u64,
    /// Unix time of the last RM update.
    pub update_time: u64,
}

impl Node {
    pub fn new(id: &str, configured: ResourceVector) -> Self {
        Self {
            id: id.to_string(),
            index: 0,
            partition: GLOBAL_PARTITION,
            state: NodeState::Idle,
            substate: None,
            rm_state: BTreeMap::new(),
            configured,
            dedicated: ResourceVector::default(),
            reported: None,
            access_policy: NodeAccessPolicy::Shared,
            features: BTreeSet::new(),
            arch: None,
            opsys: None,
            allocations: Vec::new(),
            cpu_load: 0.0,
            priority: 0,
            speed: 1.0,
            message: None,
            state_mtime: 0,
            update_time: 0,
        }
    }

    /// Unclaimed resources: `configured - dedicated`.
    pub fn available(&self) -> ResourceVector {
        &self.configured - &self.dedicated
    }

    /// Resources usable right now: unclaimed, further limited by what the
    /// RM reports as available.
    pub fn usable(&self) -> ResourceVector {
        let available = self.available();
        match &self.reported {
            Some(reported) => available.min(reported),
            None => available,
        }
    }

    /// True if any job other than `job_id` holds resources here.
    pub fn claimed_by_other(&self, job_id: &str) -> bool {
        self.allocations.iter().any(|a| a.job_id != job_id)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Change state, stamping `state_mtime` on transitions.
    pub fn set_state(&mut self, state: NodeState, now: u64) {
        if self.state != state {
            self.state = state;
            self.state_mtime = now;
        }
    }

    /// Dedicate `resources` to `job_id`. Fails without side effects if the
    /// node does not have them available or any component is negative.
    pub fn claim(&mut self, job_id: &str, tasks: u32, resources: ResourceVector) -> StateResult<()> {
        if !resources.is_non_negative() {
            return Err(StateError::InvalidAllocation(format!(
                "node {}: negative footprint {resources} for job {job_id}",
                self.id
            )));
        }
        let available = self.available();
        if !resources.fits_within(&available) {
            return Err(StateError::OverCommit {
                node: self.id.clone(),
                requested: resources.to_string(),
                available: available.to_string(),
            });
        }
        self.dedicated += &resources;
        match self.allocations.iter_mut().find(|a| a.job_id == job_id) {
            Some(existing) => {
                existing.tasks += tasks;
                existing.resources += &resources;
            }
            None => self.allocations.push(NodeAllocation {
                job_id: job_id.to_string(),
                tasks,
                resources,
            }),
        }
        Ok(())
    }

    /// Return everything `job_id` holds on this node.
    pub fn release(&mut self, job_id: &str) -> Option<NodeAllocation> {
        let pos = self.allocations.iter().position(|a| a.job_id == job_id)?;
        let alloc = self.allocations.remove(pos);
        self.dedicated = self.dedicated.saturating_sub(&alloc.resources);
        Some(alloc)
    }

    /// Derive Idle/Busy from the allocation table for nodes in a usable state.
    pub fn refresh_load_state(&mut self, now: u64) {
        if !self.state.is_usable() {
            return;
        }
        let next = if self.allocations.is_empty() {
            NodeState::Idle
        } else if self.available().procs <= 0 {
            NodeState::Busy
        } else {
            NodeState::Running
        };
        self.set_state(next, now);
    }
}

// ── Job ────────────────────────────────────────────────────────────

/// Credentials a job runs under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user: Option<String>,
    pub group: Option<String>,
    pub account: Option<String>,
    pub class: Option<String>,
    pub qos: Option<String>,
}

impl Credential {
    /// True if `owner` names this job's user, group or account.
    pub fn matches_owner(&self, owner: &str) -> bool {
        [&self.user, &self.group, &self.account]
            .into_iter()
            .flatten()
            .any(|c| c == owner)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFlags {
    /// Job may preempt others.
    pub preemptor: bool,
    /// Job may be preempted.
    pub preemptee: bool,
    /// Job may start with fewer resources than requested.
    pub best_effort: bool,
    pub restartable: bool,
    pub suspendable: bool,
    pub checkpointable: bool,
    /// Start immediately, cancelling jobs in the way if allowed.
    pub run_now: bool,
    /// All reqs share one memory footprint per node.
    pub shared_mem: bool,
    pub preempted: bool,
    pub preempt_completed: bool,
    pub user_hold: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostListMode {
    /// Job must run on exactly these hosts.
    #[default]
    Exact,
    /// Job must run on these hosts, possibly more.
    Superset,
    /// Job must run on a subset of these hosts.
    Subset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostList {
    pub nodes: Vec<NodeId>,
    pub mode: HostListMode,
}

/// One homogeneous resource requirement of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Req {
    pub index: usize,
    /// Per-task demand. `UNLIMITED` in a dimension takes the whole node.
    pub per_task: ResourceVector,
    pub task_count: u32,
    /// Target node count. 0 means tasks only.
    pub node_count: u32,
    /// Exact tasks per node. 0 means unconstrained.
    pub tasks_per_node: u32,
    /// Nodes are taken whole; a node contributes only if no job holds it.
    pub whole_node: bool,
    pub features: BTreeSet<String>,
    pub arch: Option<String>,
    pub opsys: Option<String>,
    pub excluded_hosts: BTreeSet<NodeId>,
    /// Candidate node sets, tried in order. Each entry is a node feature.
    pub node_sets: Vec<String>,
    pub allocated: NodeList,
}

impl Req {
    pub fn new(index: usize, per_task: ResourceVector, task_count: u32) -> Self {
        Self {
            index,
            per_task,
            task_count,
            node_count: 0,
            tasks_per_node: 0,
            whole_node: false,
            features: BTreeSet::new(),
            arch: None,
            opsys: None,
            excluded_hosts: BTreeSet::new(),
            node_sets: Vec::new(),
            allocated: NodeList::new(),
        }
    }

    /// Procs needed for the whole req, treating whole-node demand as one.
    pub fn total_procs(&self) -> i64 {
        i64::from(self.task_count) * self.per_task.procs.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: Option<String>,
    pub reqs: Vec<Req>,
    pub priority: i64,
    /// Start priority overrides per partition.
    pub partition_priority: BTreeMap<PartitionId, i64>,
    pub credential: Credential,
    pub flags: JobFlags,
    pub state: JobState,
    pub required_hosts: Option<HostList>,
    /// Partition names the job may run in. Empty means any.
    pub partition_mask: BTreeSet<String>,
    /// Partition the current allocation was made in.
    pub alloc_partition: Option<PartitionId>,
    /// Number of preemptions this job has initiated.
    pub preempt_count: u32,
    /// Unix time of the last completed preemption by this job.
    pub preempt_time: Option<u64>,
    /// Set while the job is the active preemptor of a selection.
    pub is_preempting: bool,
    pub wall_limit_secs: Option<u64>,
    pub queue_time: Option<u64>,
    pub start_time: Option<u64>,
    pub completion_time: Option<u64>,
    pub comment: Option<String>,
    /// Index of the RM that reports this job.
    pub rm_index: usize,
}

impl Job {
    pub fn new(id: &str, reqs: Vec<Req>, priority: i64) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            reqs,
            priority,
            partition_priority: BTreeMap::new(),
            credential: Credential::default(),
            flags: JobFlags::default(),
            state: JobState::Idle,
            required_hosts: None,
            partition_mask: BTreeSet::new(),
            alloc_partition: None,
            preempt_count: 0,
            preempt_time: None,
            is_preempting: false,
            wall_limit_secs: None,
            queue_time: None,
            start_time: None,
            completion_time: None,
            comment: None,
            rm_index: 0,
        }
    }

    /// Start priority in `partition`, falling back to the base priority.
    pub fn effective_priority(&self, partition: PartitionId) -> i64 {
        self.partition_priority
            .get(&partition)
            .copied()
            .unwrap_or(self.priority)
    }

    pub fn total_tasks(&self) -> u32 {
        self.reqs.iter().map(|r| r.task_count).sum()
    }

    /// Union of nodes allocated across every req.
    pub fn allocated_nodes(&self) -> BTreeSet<usize> {
        self.reqs
            .iter()
            .flat_map(|r| r.allocated.iter().map(|nt| nt.node))
            .collect()
    }

    pub fn has_allocation(&self) -> bool {
        self.reqs.iter().any(|r| !r.allocated.is_empty())
    }

    /// Same QoS as `other`, when both have one.
    pub fn same_qos(&self, other: &Job) -> bool {
        match (&self.credential.qos, &other.credential.qos) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

// ── Partition ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFlags {
    /// Treat every node in the partition as shared.
    pub force_shared: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub name: String,
    /// Member node indices, ascending.
    pub nodes: Vec<usize>,
    pub configured: ResourceVector,
    /// Aggregate usable resources of member nodes in a usable state.
    pub available: ResourceVector,
    pub flags: PartitionFlags,
}

impl Partition {
    pub fn new(id: PartitionId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            nodes: Vec::new(),
            configured: ResourceVector::default(),
            available: ResourceVector::default(),
            flags: PartitionFlags::default(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.id == GLOBAL_PARTITION
    }
}

// ── Virtual machine ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub state: NodeState,
    pub configured: ResourceVector,
    pub available: ResourceVector,
    pub opsys: Option<String>,
    /// Physical node hosting this VM.
    pub container_node: Option<NodeId>,
    pub update_time: u64,
}

impl Vm {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: NodeState::Unknown,
            configured: ResourceVector::default(),
            available: ResourceVector::default(),
            opsys: None,
            container_node: None,
            update_time: 0,
        }
    }
}

// ── Reservations ───────────────────────────────────────────────────

/// Reservation whose owner may preempt other jobs on its nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerPreemptRsv {
    pub id: String,
    /// User, group or account that owns the reservation.
    pub owner: String,
    pub start: u64,
    pub end: u64,
}

impl OwnerPreemptRsv {
    pub fn is_active(&self, now: u64) -> bool {
        self.start <= now && now < self.end
    }

    pub fn grants(&self, job: &Job, now: u64) -> bool {
        self.is_active(now) && job.credential.matches_owner(&self.owner)
    }
}
