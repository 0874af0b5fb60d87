//! Engine modules: the "brain" that turns a desired graph into backend work.
//!
//! The engine sits between the staging graph (what the caller wants) and
//! the backend (which tools to run). `planner` diffs probed against staging
//! into an ordered `ActionPlan`; `commit` executes that plan action by
//! action.

pub mod action;
pub mod commit;
pub mod planner;

pub use action::{Action, ActionPlan, ActionStage, PartitionSlot};
pub use commit::{
    ActionRecord, ActionState, CancelFlag, CommitCallbacks, CommitError, LoggingCommitCallbacks,
};
pub use planner::{Change, NodeChange, PlanError, diff, plan};
