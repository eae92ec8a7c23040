//! In-memory registries for nodes, jobs, partitions and VMs.
//!
//! Each registry keeps records in insertion order (the order the RM first
//! reported them) with a hash index for id lookups. Node registry order is
//! the selection order used by every placement pass.

use std::collections::HashMap;

use hpc_core::{NodeState, ResourceVector};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::*;

// ── Nodes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
    by_id: HashMap<NodeId, usize>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, replacing any existing node with the same id in place.
    /// Returns the node's index.
    pub fn insert(&mut self, mut node: Node) -> usize {
        if let Some(&idx) = self.by_id.get(&node.id) {
            node.index = idx;
            self.nodes[idx] = node;
            return idx;
        }
        let idx = self.nodes.len();
        node.index = idx;
        self.by_id.insert(node.id.clone(), idx);
        debug!(node = %node.id, index = idx, "node registered");
        self.nodes.push(node);
        idx
    }

    /// Look up a node by id, creating an empty one if it is new.
    pub fn get_or_create(&mut self, id: &str) -> &mut Node {
        let idx = match self.by_id.get(id) {
            Some(&idx) => idx,
            None => self.insert(Node::new(id, ResourceVector::default())),
        };
        &mut self.nodes[idx]
    }

    pub fn get(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.nodes.get_mut(index)
    }

    pub fn by_id(&self, id: &str) -> Option<&Node> {
        self.by_id.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn by_id_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.by_id.get(id).map(|&idx| &mut self.nodes[idx])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn require(&self, id: &str) -> StateResult<&Node> {
        self.by_id(id)
            .ok_or_else(|| StateError::NodeNotFound(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ── Jobs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Vec<Job>,
    by_id: HashMap<JobId, usize>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: Job) -> usize {
        if let Some(&idx) = self.by_id.get(&job.id) {
            self.jobs[idx] = job;
            return idx;
        }
        let idx = self.jobs.len();
        self.by_id.insert(job.id.clone(), idx);
        self.jobs.push(job);
        idx
    }

    pub fn get_or_create(&mut self, id: &str) -> &mut Job {
        let idx = match self.by_id.get(id) {
            Some(&idx) => idx,
            None => self.insert(Job::new(id, vec![Req::new(0, ResourceVector::procs(1), 1)], 0)),
        };
        &mut self.jobs[idx]
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.by_id.get(id).map(|&idx| &self.jobs[idx])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.by_id.get(id).map(|&idx| &mut self.jobs[idx])
    }

    pub fn require(&self, id: &str) -> StateResult<&Job> {
        self.get(id)
            .ok_or_else(|| StateError::JobNotFound(id.to_string()))
    }

    pub fn require_mut(&mut self, id: &str) -> StateResult<&mut Job> {
        match self.by_id.get(id) {
            Some(&idx) => Ok(&mut self.jobs[idx]),
            None => Err(StateError::JobNotFound(id.to_string())),
        }
    }

    /// Remove a job, preserving the order of the rest.
    pub fn remove(&mut self, id: &str) -> Option<Job> {
        let idx = self.by_id.remove(id)?;
        let job = self.jobs.remove(idx);
        for (i, j) in self.jobs.iter().enumerate().skip(idx) {
            self.by_id.insert(j.id.clone(), i);
        }
        Some(job)
    }

    /// Jobs in table order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

// ── Partitions ─────────────────────────────────────────────────────

/// Partitions by id. Partition 0 is always present and spans every node.
#[derive(Debug, Clone)]
pub struct PartitionRegistry {
    partitions: Vec<Partition>,
}

impl Default for PartitionRegistry {
    fn default() -> Self {
        Self {
            partitions: vec![Partition::new(GLOBAL_PARTITION, "ALL")],
        }
    }
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a partition by name, creating it if absent.
    pub fn get_or_create(&mut self, name: &str) -> PartitionId {
        if let Some(p) = self.partitions.iter().find(|p| p.name == name) {
            return p.id;
        }
        let id = self.partitions.len();
        self.partitions.push(Partition::new(id, name));
        id
    }

    pub fn get(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(id)
    }

    pub fn get_mut(&mut self, id: PartitionId) -> Option<&mut Partition> {
        self.partitions.get_mut(id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn global(&self) -> &Partition {
        &self.partitions[GLOBAL_PARTITION]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Recompute membership and aggregate counters from the node table.
    pub fn refresh(&mut self, nodes: &NodeRegistry) {
        for p in &mut self.partitions {
            p.nodes.clear();
            p.configured = ResourceVector::default();
            p.available = ResourceVector::default();
        }
        for node in nodes.iter() {
            let usable = node.state.is_usable();
            let available = node.usable();
            let mut targets = vec![GLOBAL_PARTITION];
            if node.partition != GLOBAL_PARTITION {
                targets.push(node.partition);
            }
            for pid in targets {
                let Some(p) = self.partitions.get_mut(pid) else {
                    continue;
                };
                p.nodes.push(node.index);
                p.configured += &node.configured;
                if usable {
                    p.available += &available;
                }
            }
        }
    }
}

// ── VMs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct VmRegistry {
    vms: Vec<Vm>,
    by_id: HashMap<String, usize>,
}

impl VmRegistry {
    pub fn get_or_create(&mut self, id: &str) -> &mut Vm {
        let idx = match self.by_id.get(id) {
            Some(&idx) => idx,
            None => {
                let idx = self.vms.len();
                self.by_id.insert(id.to_string(), idx);
                self.vms.push(Vm::new(id));
                idx
            }
        };
        &mut self.vms[idx]
    }

    pub fn get(&self, id: &str) -> Option<&Vm> {
        self.by_id.get(id).map(|&idx| &self.vms[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vm> {
        self.vms.iter()
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    /// VMs hosted on `node` that are not down.
    pub fn active_on(&self, node: &str) -> impl Iterator<Item = &Vm> {
        self.vms.iter().filter(move |vm| {
            vm.container_node.as_deref() == Some(node) && vm.state != NodeState::Down
        })
    }
}
