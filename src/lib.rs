//! devgraph library
//!
//! A staged device-graph storage engine: probe the system into a graph,
//! stage changes on a copy, plan the difference as ordered actions and
//! commit them through a backend.

pub mod backend;
pub mod changes;
pub mod cli;
pub mod devicegraph;
pub mod devices;
pub mod engine;
pub mod environment;
pub mod error;
pub mod fstab;
pub mod process_guard;
pub mod prober;
pub mod sanity;
pub mod storage;
pub mod types;

// Re-export main types for convenience
pub use backend::{Backend, SystemBackend};
pub use changes::{ChangeSet, StagingOp};
pub use devicegraph::{Device, DeviceKind, Devicegraph, GraphError, NodeId, Relation, Removal};
pub use devices::{
    find_by_name, BlkDevice, BlkFilesystem, Disk, MountPoint, Partition, PartitionSpec,
    StagingError,
};
pub use engine::{
    Action, ActionPlan, ActionRecord, ActionState, CancelFlag, CommitCallbacks, CommitError,
    LoggingCommitCallbacks, PlanError,
};
pub use environment::Environment;
pub use error::{DevgraphError, Result};
pub use prober::{
    LoggingProbeCallbacks, ProbeCallbacks, ProbeError, Prober, SnapshotProber, StaticProber,
    SystemProber,
};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use storage::{CommitOutcome, Storage};
pub use types::{BlockDeviceKind, FsType, PartitionId, PartitionType, PtType};
