//! Node payloads of the device graph.
//!
//! `Device` is a closed tagged variant: the storage vocabulary is fixed, so
//! kind-specific attributes live in plain structs and capability checks live
//! on the vocabulary types in `crate::types`.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::Display;

use crate::types::{BlockDeviceKind, FsType, PartitionId, PartitionType, PtType};

/// Identity of a node, stable for the lifetime of the graph holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Discriminant of `Device`, used in errors and relationship validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DeviceKind {
    BlockDevice,
    Partition,
    BlkFilesystem,
    MountPoint,
}

/// A whole block device: disk, loop device, MD array, device mapper target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceAttrs {
    /// Device path, e.g. `/dev/sdc`
    pub name: String,
    /// Size in bytes
    pub size: u64,
    pub kind: BlockDeviceKind,
    /// Partition table on the device, if any
    #[serde(default)]
    pub pt_type: Option<PtType>,
}

/// A partition. Is-a block device: it can carry a filesystem itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAttrs {
    /// Device path, e.g. `/dev/sdc1`
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Offset from the start of the host device in bytes
    pub start: u64,
    pub number: u32,
    #[serde(default)]
    pub partition_type: PartitionType,
    pub id: PartitionId,
}

/// A filesystem on a block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemAttrs {
    pub kind: FsType,
    #[serde(default)]
    pub label: String,
    /// Assigned by the backend at creation; empty until probed
    #[serde(default)]
    pub uuid: String,
    /// Backend-specific tuning flags, e.g. `-m 10`
    #[serde(default)]
    pub tune_options: String,
}

/// A mount point of a filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPointAttrs {
    /// Absolute target path
    pub path: String,
    /// Mount options; empty means the kernel defaults
    #[serde(default)]
    pub mount_options: Vec<String>,
    /// Whether the mount point is registered in fstab to be mounted at boot
    #[serde(default)]
    pub automount: bool,
}

/// A storage object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Device {
    BlockDevice(BlockDeviceAttrs),
    Partition(PartitionAttrs),
    BlkFilesystem(FilesystemAttrs),
    MountPoint(MountPointAttrs),
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::BlockDevice(_) => DeviceKind::BlockDevice,
            Self::Partition(_) => DeviceKind::Partition,
            Self::BlkFilesystem(_) => DeviceKind::BlkFilesystem,
            Self::MountPoint(_) => DeviceKind::MountPoint,
        }
    }

    /// Device path for block devices and partitions.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::BlockDevice(d) => Some(&d.name),
            Self::Partition(p) => Some(&p.name),
            _ => None,
        }
    }

    /// Whether this node is something a filesystem can sit on.
    pub fn is_blk_device(&self) -> bool {
        matches!(self, Self::BlockDevice(_) | Self::Partition(_))
    }

    pub fn as_block_device(&self) -> Option<&BlockDeviceAttrs> {
        match self {
            Self::BlockDevice(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_partition(&self) -> Option<&PartitionAttrs> {
        match self {
            Self::Partition(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_filesystem(&self) -> Option<&FilesystemAttrs> {
        match self {
            Self::BlkFilesystem(fs) => Some(fs),
            _ => None,
        }
    }

    pub fn as_mount_point(&self) -> Option<&MountPointAttrs> {
        match self {
            Self::MountPoint(mp) => Some(mp),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockDevice(d) => {
                write!(f, "{} {} size={}", d.kind, d.name, d.size)?;
                if let Some(pt) = d.pt_type {
                    write!(f, " pt={}", pt)?;
                }
                Ok(())
            }
            Self::Partition(p) => write!(
                f,
                "partition {} nr={} start={} size={} id={}",
                p.name, p.number, p.start, p.size, p.id
            ),
            Self::BlkFilesystem(fs) => {
                write!(f, "{}", fs.kind)?;
                if !fs.label.is_empty() {
                    write!(f, " label={:?}", fs.label)?;
                }
                if !fs.uuid.is_empty() {
                    write!(f, " uuid={}", fs.uuid)?;
                }
                if !fs.tune_options.is_empty() {
                    write!(f, " tune={:?}", fs.tune_options)?;
                }
                Ok(())
            }
            Self::MountPoint(mp) => {
                write!(f, "mount point {}", mp.path)?;
                if !mp.mount_options.is_empty() {
                    write!(f, " opts={}", mp.mount_options.join(","))?;
                }
                if mp.automount {
                    write!(f, " (fstab)")?;
                }
                Ok(())
            }
        }
    }
}

/// A node: identity, optional clone origin and payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Id of the node this one was copied from when its graph was cloned.
    /// `None` for nodes created in this graph.
    #[serde(default)]
    pub origin: Option<NodeId>,
    pub device: Device,
}
