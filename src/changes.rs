//! Change requests: staging operations read from a JSON file.
//!
//! ```json
//! [
//!   { "op": "set-id", "device": "/dev/sdc1", "id": "linux" },
//!   { "op": "create-filesystem", "device": "/dev/sdc1", "fs_type": "reiserfs",
//!     "label": "TEST", "tune_options": "-m 10" },
//!   { "op": "create-mount-point", "device": "/dev/sdc1", "path": "/test" }
//! ]
//! ```
//!
//! Every operation goes through the same typed mutators a library caller
//! would use, so a change file can never stage anything the API rejects.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::devicegraph::Devicegraph;
use crate::devices::{
    self, BlkDevice, BlkFilesystem, Disk, MountPoint, Partition, PartitionSpec, StagingError,
};
use crate::types::{FsType, PartitionId, PartitionType};

/// One staging operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum StagingOp {
    SetId {
        device: String,
        #[serde(deserialize_with = "partition_id")]
        id: PartitionId,
    },
    CreatePartition {
        disk: String,
        number: u32,
        start: u64,
        size: u64,
        #[serde(default)]
        partition_type: PartitionType,
        #[serde(default = "default_id", deserialize_with = "partition_id")]
        id: PartitionId,
    },
    DeletePartition {
        device: String,
    },
    ResizePartition {
        device: String,
        size: u64,
    },
    CreateFilesystem {
        device: String,
        fs_type: FsType,
        #[serde(default)]
        label: String,
        #[serde(default)]
        tune_options: String,
    },
    RemoveFilesystem {
        device: String,
    },
    SetLabel {
        device: String,
        label: String,
    },
    SetTune {
        device: String,
        tune_options: String,
    },
    CreateMountPoint {
        device: String,
        path: String,
        #[serde(default)]
        mount_options: Vec<String>,
        #[serde(default)]
        automount: bool,
    },
    RemoveMountPoint {
        path: String,
    },
    SetMountOptions {
        path: String,
        mount_options: Vec<String>,
    },
    SetAutomount {
        path: String,
        automount: bool,
    },
}

fn default_id() -> PartitionId {
    PartitionId::LINUX
}

/// Accept `"linux"`, `"0x83"` or a plain number.
fn partition_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PartitionId, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Code(u32),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Code(code) => Ok(PartitionId(code)),
        Raw::Text(text) => PartitionId::from_str(&text).map_err(serde::de::Error::custom),
    }
}

fn device(graph: &Devicegraph, name: &str) -> Result<BlkDevice, StagingError> {
    devices::find_by_name(graph, name)
        .ok_or_else(|| StagingError::InvalidValue(format!("no block device named {}", name)))
}

fn partition(graph: &Devicegraph, name: &str) -> Result<Partition, StagingError> {
    Partition::find_by_name(graph, name)?
        .ok_or_else(|| StagingError::InvalidValue(format!("{} is not a partition", name)))
}

fn filesystem(graph: &Devicegraph, name: &str) -> Result<BlkFilesystem, StagingError> {
    device(graph, name)?
        .blk_filesystem(graph)?
        .ok_or_else(|| StagingError::InvalidValue(format!("{} has no filesystem", name)))
}

fn mount_point(graph: &Devicegraph, path: &str) -> Result<MountPoint, StagingError> {
    MountPoint::find_by_path(graph, path)
        .ok_or_else(|| StagingError::InvalidValue(format!("no mount point at {}", path)))
}

impl StagingOp {
    /// Apply to `graph`. A rejected operation leaves `graph` unchanged.
    pub fn apply(&self, graph: &mut Devicegraph) -> Result<(), StagingError> {
        match self {
            Self::SetId { device, id } => partition(graph, device)?.set_id(graph, *id),
            Self::CreatePartition {
                disk,
                number,
                start,
                size,
                partition_type,
                id,
            } => {
                let host = Disk::find_by_name(graph, disk)?
                    .ok_or_else(|| StagingError::InvalidValue(format!("{} is not a disk", disk)))?;
                host.create_partition(
                    graph,
                    PartitionSpec {
                        number: *number,
                        start: *start,
                        size: *size,
                        partition_type: *partition_type,
                        id: *id,
                    },
                )?;
                Ok(())
            }
            Self::DeletePartition { device } => {
                let part = partition(graph, device)?;
                part.disk(graph)?.delete_partition(graph, part)
            }
            Self::ResizePartition { device, size } => partition(graph, device)?.resize(graph, *size),
            Self::CreateFilesystem {
                device: name,
                fs_type,
                label,
                tune_options,
            } => {
                let fs = device(graph, name)?.create_blk_filesystem(graph, *fs_type)?;
                let configured = (|| -> Result<(), StagingError> {
                    if !label.is_empty() {
                        fs.set_label(graph, label)?;
                    }
                    if !tune_options.is_empty() {
                        fs.set_tune_options(graph, tune_options)?;
                    }
                    Ok(())
                })();
                if configured.is_err() {
                    device(graph, name)?.remove_blk_filesystem(graph)?;
                }
                configured
            }
            Self::RemoveFilesystem { device: name } => {
                device(graph, name)?.remove_blk_filesystem(graph)
            }
            Self::SetLabel { device, label } => filesystem(graph, device)?.set_label(graph, label),
            Self::SetTune {
                device,
                tune_options,
            } => filesystem(graph, device)?.set_tune_options(graph, tune_options),
            Self::CreateMountPoint {
                device,
                path,
                mount_options,
                automount,
            } => {
                let mp = filesystem(graph, device)?.create_mount_point(graph, path)?;
                let configured = mp
                    .set_mount_options(graph, mount_options)
                    .and_then(|()| mp.set_automount(graph, *automount));
                if configured.is_err() {
                    mp.remove(graph)?;
                }
                configured
            }
            Self::RemoveMountPoint { path } => mount_point(graph, path)?.remove(graph),
            Self::SetMountOptions {
                path,
                mount_options,
            } => mount_point(graph, path)?.set_mount_options(graph, mount_options),
            Self::SetAutomount { path, automount } => {
                mount_point(graph, path)?.set_automount(graph, *automount)
            }
        }
    }
}

impl fmt::Display for StagingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetId { device, id } => write!(f, "set id of {} to {}", device, id),
            Self::CreatePartition { disk, number, .. } => {
                write!(f, "create partition {} on {}", number, disk)
            }
            Self::DeletePartition { device } => write!(f, "delete partition {}", device),
            Self::ResizePartition { device, size } => write!(f, "resize {} to {} bytes", device, size),
            Self::CreateFilesystem { device, fs_type, .. } => {
                write!(f, "create {} on {}", fs_type, device)
            }
            Self::RemoveFilesystem { device } => write!(f, "remove filesystem of {}", device),
            Self::SetLabel { device, label } => write!(f, "set label of {} to {:?}", device, label),
            Self::SetTune { device, .. } => write!(f, "set tune options of {}", device),
            Self::CreateMountPoint { device, path, .. } => {
                write!(f, "mount {} at {}", device, path)
            }
            Self::RemoveMountPoint { path } => write!(f, "remove mount point {}", path),
            Self::SetMountOptions { path, .. } => write!(f, "set mount options of {}", path),
            Self::SetAutomount { path, automount } => {
                write!(f, "set automount of {} to {}", path, automount)
            }
        }
    }
}

/// An ordered list of staging operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    pub ops: Vec<StagingOp>,
}

impl ChangeSet {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read changes from {:?}", path.as_ref()))?;
        let changes: Self =
            serde_json::from_str(&content).context("Failed to parse change request JSON")?;
        Ok(changes)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize changes")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write changes to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Apply every operation in order, stopping at the first rejection.
    /// Operations before the rejected one stay applied.
    pub fn apply(&self, graph: &mut Devicegraph) -> Result<()> {
        for (i, op) in self.ops.iter().enumerate() {
            debug!(op = %op, "applying change");
            op.apply(graph)
                .with_context(|| format!("change #{} ({}) rejected", i + 1, op))?;
        }
        Ok(())
    }
}
