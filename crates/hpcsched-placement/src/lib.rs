//! Resource matching and preemption for the batch scheduler.
//!
//! Given a job and a partition, this crate decides which nodes the job
//! runs on, preempting lower-priority work when idle resources fall short.
//! It reads and mutates a [`hpcsched_state::SchedulerContext`] and talks to
//! the outside world only through three traits: [`FeasibilityOracle`],
//! [`PreemptBackend`] and [`AccountingManager`].
//!
//! # Architecture
//!
//! ```text
//!                 NodeListSelector::select_node_list
//!                               │
//!        ┌──────────────┬───────┴────────┬────────────────┐
//!        ▼              ▼                ▼                ▼
//!   feasible.rs      idle.rs        preempt.rs       distribute.rs
//!   static node      idle task      victim list      per-req task
//!   filtering        selection      + selection      distribution
//!                                        │
//!                           ┌────────────┴────────────┐
//!                           ▼                         ▼
//!                     accounting.rs              executor.rs
//!                     lien register/delete       preempt/resume
//! ```
//!
//! # Components
//!
//! - **`select`**: Orchestrator and rollback on failure
//! - **`feasible`**: Feasible node lists from static constraints
//! - **`idle`**: Idle task selection, node admission, TPN rounding
//! - **`preempt`**: Preemptee candidate list and minimal victim set
//! - **`executor`**: Preempt/resume one victim and update bookkeeping
//! - **`accounting`**: Accounting manager liens
//! - **`distribute`**: Task distribution and the shared-memory transform

pub mod accounting;
pub mod distribute;
pub mod error;
pub mod executor;
pub mod feasible;
pub mod idle;
pub mod preempt;
pub mod select;

pub use accounting::{AccountingFuture, AccountingManager, InMemoryAccounting};
pub use distribute::{SharedMemTransform, distribute};
pub use error::{FailureKind, PlacementError, PlacementResult};
pub use executor::{BackendFuture, PreemptBackend, PreemptRecord, preempt_job, resume_job};
pub use feasible::{FeasibilityOracle, StaticFeasibility};
pub use idle::{Availability, IdleSelection, Targets, node_admits, select_idle_tasks, select_idle_tasks_in};
pub use preempt::{
    PreemptCandidate, PreemptFilter, PreemptList, PreemptSelection, SelectedVictim, get_preempt_list,
    is_eligible, select_preemptees,
};
pub use select::{Allocation, NodeListSelector, SelectOptions};
