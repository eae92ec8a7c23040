//! Shared enums used across the scheduler crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a state or policy token is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseTokenError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseTokenError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ── Node state ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    None,
    Down,
    Idle,
    Busy,
    Running,
    Drained,
    Draining,
    Flush,
    Reserved,
    Unknown,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::None => "None",
            NodeState::Down => "Down",
            NodeState::Idle => "Idle",
            NodeState::Busy => "Busy",
            NodeState::Running => "Running",
            NodeState::Drained => "Drained",
            NodeState::Draining => "Draining",
            NodeState::Flush => "Flush",
            NodeState::Reserved => "Reserved",
            NodeState::Unknown => "Unknown",
        }
    }

    /// States in which a node can accept new tasks.
    pub fn is_usable(&self) -> bool {
        matches!(self, NodeState::Idle | NodeState::Running | NodeState::Busy)
    }

    /// States in which a node is hosting work.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            NodeState::Busy | NodeState::Running | NodeState::Draining
        )
    }
}

impl FromStr for NodeState {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s.to_ascii_lowercase().as_str() {
            "none" => NodeState::None,
            "down" => NodeState::Down,
            "idle" => NodeState::Idle,
            "busy" => NodeState::Busy,
            "running" | "active" => NodeState::Running,
            "drained" => NodeState::Drained,
            "draining" => NodeState::Draining,
            "flush" => NodeState::Flush,
            "reserved" => NodeState::Reserved,
            "unknown" => NodeState::Unknown,
            _ => return Err(ParseTokenError::new("node state", s)),
        };
        Ok(state)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Job state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    #[default]
    Idle,
    Starting,
    Running,
    Suspended,
    Completed,
    Removed,
    Hold,
    Vacated,
    Deferred,
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "Idle",
            JobState::Starting => "Starting",
            JobState::Running => "Running",
            JobState::Suspended => "Suspended",
            JobState::Completed => "Completed",
            JobState::Removed => "Removed",
            JobState::Hold => "Hold",
            JobState::Vacated => "Vacated",
            JobState::Deferred => "Deferred",
            JobState::Unknown => "Unknown",
        }
    }

    /// Job holds node resources.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Starting | JobState::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Removed | JobState::Vacated
        )
    }
}

impl FromStr for JobState {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s.to_ascii_lowercase().as_str() {
            "idle" => JobState::Idle,
            "starting" => JobState::Starting,
            "running" => JobState::Running,
            "suspended" => JobState::Suspended,
            "completed" => JobState::Completed,
            "removed" | "cancelled" => JobState::Removed,
            "hold" => JobState::Hold,
            "vacated" => JobState::Vacated,
            "deferred" => JobState::Deferred,
            "unknown" => JobState::Unknown,
            _ => return Err(ParseTokenError::new("job state", s)),
        };
        Ok(state)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Access policy ──────────────────────────────────────────────────

/// How a node may be shared between jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAccessPolicy {
    #[default]
    Shared,
    SharedOnly,
    SingleJob,
    SingleTask,
    SingleUser,
    UniqueUser,
}

impl NodeAccessPolicy {
    /// Policies under which a node hosts at most one job.
    pub fn is_exclusive(&self) -> bool {
        matches!(
            self,
            NodeAccessPolicy::SingleJob | NodeAccessPolicy::SingleTask
        )
    }
}

impl FromStr for NodeAccessPolicy {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let policy = match s.to_ascii_lowercase().as_str() {
            "shared" => NodeAccessPolicy::Shared,
            "sharedonly" => NodeAccessPolicy::SharedOnly,
            "singlejob" => NodeAccessPolicy::SingleJob,
            "singletask" => NodeAccessPolicy::SingleTask,
            "singleuser" => NodeAccessPolicy::SingleUser,
            "uniqueuser" => NodeAccessPolicy::UniqueUser,
            _ => return Err(ParseTokenError::new("node access policy", s)),
        };
        Ok(policy)
    }
}

// ── Preemption mode ────────────────────────────────────────────────

/// Action taken against a preemptee. Ordered from most to least preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreemptMode {
    Checkpoint,
    Suspend,
    Requeue,
    Cancel,
}

impl PreemptMode {
    /// Resulting job state after a successful preemption.
    pub fn resulting_state(&self) -> JobState {
        match self {
            PreemptMode::Checkpoint | PreemptMode::Requeue => JobState::Idle,
            PreemptMode::Suspend => JobState::Suspended,
            PreemptMode::Cancel => JobState::Removed,
        }
    }

    /// Pick the first mode in preference order the victim supports,
    /// starting from `preferred`. Cancel is always available.
    pub fn negotiate(preferred: PreemptMode, checkpointable: bool, suspendable: bool, restartable: bool) -> PreemptMode {
        let supported = |m: PreemptMode| match m {
            PreemptMode::Checkpoint => checkpointable,
            PreemptMode::Suspend => suspendable,
            PreemptMode::Requeue => restartable,
            PreemptMode::Cancel => true,
        };
        [
            PreemptMode::Checkpoint,
            PreemptMode::Suspend,
            PreemptMode::Requeue,
            PreemptMode::Cancel,
        ]
        .into_iter()
        .skip_while(|m| *m != preferred)
        .find(|m| supported(*m))
        .unwrap_or(PreemptMode::Cancel)
    }
}

impl fmt::Display for PreemptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PreemptMode::Checkpoint => "checkpoint",
            PreemptMode::Suspend => "suspend",
            PreemptMode::Requeue => "requeue",
            PreemptMode::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

// ── Allocation rejection ───────────────────────────────────────────

/// Reason a node could not contribute tasks to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocRejection {
    State,
    Resource,
    Policy,
    Partition,
    Features,
    HostList,
    NodeSet,
}

impl AllocRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocRejection::State => "state",
            AllocRejection::Resource => "resource",
            AllocRejection::Policy => "policy",
            AllocRejection::Partition => "partition",
            AllocRejection::Features => "features",
            AllocRejection::HostList => "hostlist",
            AllocRejection::NodeSet => "nodeset",
        }
    }
}

/// Histogram of rejection reasons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts(BTreeMap<AllocRejection, u32>);

impl RejectionCounts {
    pub fn record(&mut self, reason: AllocRejection) {
        *self.0.entry(reason).or_insert(0) += 1;
    }

    pub fn get(&self, reason: AllocRejection) -> u32 {
        self.0.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge(&mut self, other: &RejectionCounts) {
        for (reason, count) in &other.0 {
            *self.0.entry(*reason).or_insert(0) += count;
        }
    }
}

impl fmt::Display for RejectionCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (reason, count) in &self.0 {
            write!(f, "[{}: {}]", reason.as_str(), count)?;
        }
        Ok(())
    }
}
