//! Typed handles into a device graph.
//!
//! A handle is a `(GraphId, NodeId)` pair with a kind promise. It does not
//! borrow the graph: every accessor takes the graph it was obtained from, and
//! a handle used against another graph fails with `GraphError::ForeignHandle`.
//! Mutators take `&mut Devicegraph`, which in a session is only ever the
//! staging graph.
//!
//! Every mutator validates before it touches the graph, so a rejected call
//! leaves the graph exactly as it was.

use thiserror::Error;
use tracing::debug;

use crate::devicegraph::{
    Device, DeviceKind, Devicegraph, FilesystemAttrs, GraphError, GraphId, MountPointAttrs, NodeId,
    PartitionAttrs, Relation, Removal,
};
use crate::types::{FsType, PartitionId, PartitionType, PtType};

/// Errors raised by staging mutators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StagingError {
    /// The device is already in use in a way that excludes the request
    #[error("{device}: {reason}")]
    Conflict { device: String, reason: String },

    /// The mount path is already staged
    #[error("mount point {0} is already staged")]
    DuplicateMountPoint(String),

    /// The target does not support this option
    #[error("{target} does not support {option}")]
    UnsupportedOption { target: String, option: String },

    /// The value is malformed or out of range
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl StagingError {
    fn conflict(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            device: device.into(),
            reason: reason.into(),
        }
    }

    fn unsupported(target: impl ToString, option: impl Into<String>) -> Self {
        Self::UnsupportedOption {
            target: target.to_string(),
            option: option.into(),
        }
    }
}

type StagingResult<T> = Result<T, StagingError>;

/// Device path of partition `number` on `disk`.
///
/// Devices whose name ends in a digit (nvme, loop, md) use a `p` separator.
pub fn partition_name(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

/// Look up a block device or partition by device path.
pub fn find_by_name(graph: &Devicegraph, name: &str) -> Option<BlkDevice> {
    graph.find_by_name(name).map(|id| BlkDevice {
        graph: graph.id(),
        id,
    })
}

fn wrong_kind(id: NodeId, expected: DeviceKind, found: &Device) -> GraphError {
    GraphError::WrongKind {
        id,
        expected,
        found: found.kind(),
    }
}

// ============================================================================
// BlkDevice
// ============================================================================

/// Anything a filesystem can sit on: a whole block device or a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlkDevice {
    graph: GraphId,
    id: NodeId,
}

impl BlkDevice {
    /// Wrap a node id, checking that it is a block device of `graph`.
    pub fn from_node(graph: &Devicegraph, id: NodeId) -> Result<Self, GraphError> {
        graph.resolve(graph.id(), id, DeviceKind::BlockDevice)?;
        Ok(Self {
            graph: graph.id(),
            id,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    fn device<'g>(&self, graph: &'g Devicegraph) -> Result<&'g Device, GraphError> {
        graph.resolve(self.graph, self.id, DeviceKind::BlockDevice)
    }

    pub fn name<'g>(&self, graph: &'g Devicegraph) -> Result<&'g str, GraphError> {
        let device = self.device(graph)?;
        device
            .name()
            .ok_or_else(|| wrong_kind(self.id, DeviceKind::BlockDevice, device))
    }

    pub fn size(&self, graph: &Devicegraph) -> Result<u64, GraphError> {
        match self.device(graph)? {
            Device::BlockDevice(d) => Ok(d.size),
            Device::Partition(p) => Ok(p.size),
            other => Err(wrong_kind(self.id, DeviceKind::BlockDevice, other)),
        }
    }

    /// This device as a partition, if it is one.
    pub fn to_partition(&self, graph: &Devicegraph) -> Result<Option<Partition>, GraphError> {
        Ok(self.device(graph)?.as_partition().map(|_| Partition {
            graph: self.graph,
            id: self.id,
        }))
    }

    /// This device as a partitionable disk, if it is one.
    pub fn to_disk(&self, graph: &Devicegraph) -> Result<Option<Disk>, GraphError> {
        Ok(self
            .device(graph)?
            .as_block_device()
            .filter(|d| d.kind.is_partitionable())
            .map(|_| Disk {
                graph: self.graph,
                id: self.id,
            }))
    }

    /// The filesystem on this device, if any.
    pub fn blk_filesystem(&self, graph: &Devicegraph) -> Result<Option<BlkFilesystem>, GraphError> {
        self.device(graph)?;
        Ok(graph.device_filesystem(self.id).map(|id| BlkFilesystem {
            graph: self.graph,
            id,
        }))
    }

    /// Stage a new filesystem of `kind` on this device.
    ///
    /// # Errors
    ///
    /// - `Conflict` if the device already has a filesystem, carries a
    ///   partition table or is an extended partition
    /// - `UnsupportedOption` if `kind` cannot be created
    pub fn create_blk_filesystem(
        &self,
        graph: &mut Devicegraph,
        kind: FsType,
    ) -> StagingResult<BlkFilesystem> {
        let device = self.device(graph)?;
        let name = device.name().unwrap_or_default().to_string();

        if graph.device_filesystem(self.id).is_some() {
            return Err(StagingError::conflict(name, "device already has a filesystem"));
        }
        match device {
            Device::BlockDevice(d) if d.pt_type.is_some() => {
                return Err(StagingError::conflict(
                    name,
                    "device carries a partition table",
                ));
            }
            Device::Partition(p) if p.partition_type == PartitionType::Extended => {
                return Err(StagingError::conflict(
                    name,
                    "extended partitions cannot hold a filesystem",
                ));
            }
            _ => {}
        }
        if !kind.is_creatable() {
            return Err(StagingError::unsupported(kind, "filesystem creation"));
        }

        let fs = graph.add_node(Device::BlkFilesystem(FilesystemAttrs {
            kind,
            label: String::new(),
            uuid: String::new(),
            tune_options: String::new(),
        }))?;
        if let Err(err) = graph.add_edge(self.id, fs, Relation::FormattedAs) {
            graph.remove_node(fs, Removal::Cascade)?;
            return Err(err.into());
        }
        debug!(device = %name, fs = %kind, "staged filesystem");
        Ok(BlkFilesystem {
            graph: self.graph,
            id: fs,
        })
    }

    /// Remove the filesystem of this device together with its mount points.
    ///
    /// Removing from a device without filesystem is a no-op.
    pub fn remove_blk_filesystem(&self, graph: &mut Devicegraph) -> StagingResult<()> {
        self.device(graph)?;
        if let Some(fs) = graph.device_filesystem(self.id) {
            graph.remove_node(fs, Removal::Cascade)?;
        }
        Ok(())
    }
}

// ============================================================================
// Disk
// ============================================================================

/// Layout of a partition to stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSpec {
    pub number: u32,
    /// Offset in bytes
    pub start: u64,
    /// Size in bytes
    pub size: u64,
    pub partition_type: PartitionType,
    pub id: PartitionId,
}

/// A partitionable block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Disk {
    graph: GraphId,
    id: NodeId,
}

impl Disk {
    pub fn find_by_name(graph: &Devicegraph, name: &str) -> Result<Option<Self>, GraphError> {
        match find_by_name(graph, name) {
            Some(device) => device.to_disk(graph),
            None => Ok(None),
        }
    }

    /// Every partitionable device of the graph, in id order.
    pub fn all(graph: &Devicegraph) -> Vec<Self> {
        graph
            .nodes()
            .filter(|n| {
                n.device
                    .as_block_device()
                    .is_some_and(|d| d.kind.is_partitionable())
            })
            .map(|n| Self {
                graph: graph.id(),
                id: n.id,
            })
            .collect()
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn as_blk_device(&self) -> BlkDevice {
        BlkDevice {
            graph: self.graph,
            id: self.id,
        }
    }

    pub fn name<'g>(&self, graph: &'g Devicegraph) -> Result<&'g str, GraphError> {
        self.as_blk_device().name(graph)
    }

    pub fn pt_type(&self, graph: &Devicegraph) -> Result<Option<PtType>, GraphError> {
        let device = graph.resolve(self.graph, self.id, DeviceKind::BlockDevice)?;
        device
            .as_block_device()
            .map(|d| d.pt_type)
            .ok_or_else(|| wrong_kind(self.id, DeviceKind::BlockDevice, device))
    }

    /// Partitions hosted by this disk, ordered by partition number.
    pub fn partitions(&self, graph: &Devicegraph) -> Result<Vec<Partition>, GraphError> {
        graph.resolve(self.graph, self.id, DeviceKind::BlockDevice)?;
        let mut parts: Vec<(u32, NodeId)> = graph
            .children(self.id, Relation::Hosts)
            .into_iter()
            .filter_map(|id| {
                graph
                    .device(id)
                    .ok()
                    .and_then(Device::as_partition)
                    .map(|p| (p.number, id))
            })
            .collect();
        parts.sort();
        Ok(parts
            .into_iter()
            .map(|(_, id)| Partition {
                graph: self.graph,
                id,
            })
            .collect())
    }

    /// Stage a new partition.
    ///
    /// # Errors
    ///
    /// - `UnsupportedOption` if the disk has no partition table, or the table
    ///   flavour does not know the requested slot type or id
    /// - `InvalidValue` for a zero size, a range outside the disk or an
    ///   unusable partition number
    /// - `Conflict` if the number is taken or the range overlaps a sibling
    pub fn create_partition(
        &self,
        graph: &mut Devicegraph,
        spec: PartitionSpec,
    ) -> StagingResult<Partition> {
        let device = graph.resolve(self.graph, self.id, DeviceKind::BlockDevice)?;
        let disk = device
            .as_block_device()
            .ok_or_else(|| wrong_kind(self.id, DeviceKind::BlockDevice, device))?
            .clone();
        let pt_type = disk
            .pt_type
            .ok_or_else(|| StagingError::unsupported(&disk.name, "partitions (no partition table)"))?;

        if spec.size == 0 {
            return Err(StagingError::InvalidValue("partition size must be > 0".into()));
        }
        let end = spec
            .start
            .checked_add(spec.size)
            .filter(|end| *end <= disk.size)
            .ok_or_else(|| {
                StagingError::InvalidValue(format!(
                    "partition {}+{} exceeds {} ({} bytes)",
                    spec.start, spec.size, disk.name, disk.size
                ))
            })?;
        if spec.number == 0 {
            return Err(StagingError::InvalidValue("partition numbers start at 1".into()));
        }

        let siblings: Vec<PartitionAttrs> = self
            .partitions(graph)?
            .iter()
            .filter_map(|p| graph.device(p.id).ok().and_then(Device::as_partition).cloned())
            .collect();
        if siblings.iter().any(|p| p.number == spec.number) {
            return Err(StagingError::conflict(
                &disk.name,
                format!("partition number {} is in use", spec.number),
            ));
        }

        let id = match (pt_type, spec.partition_type) {
            (PtType::Gpt, PartitionType::Primary) => spec.id,
            (PtType::Gpt, other) => {
                return Err(StagingError::unsupported(
                    "gpt partition table",
                    format!("{} partitions", other),
                ));
            }
            (PtType::Msdos, PartitionType::Logical) => {
                if spec.number <= pt_type.max_primary() {
                    return Err(StagingError::InvalidValue(format!(
                        "logical partitions are numbered above {}",
                        pt_type.max_primary()
                    )));
                }
                spec.id
            }
            (PtType::Msdos, slot) => {
                if spec.number > pt_type.max_primary() {
                    return Err(StagingError::InvalidValue(format!(
                        "{} partition number {} exceeds {}",
                        slot,
                        spec.number,
                        pt_type.max_primary()
                    )));
                }
                if slot == PartitionType::Extended {
                    if siblings
                        .iter()
                        .any(|p| p.partition_type == PartitionType::Extended)
                    {
                        return Err(StagingError::conflict(
                            &disk.name,
                            "an extended partition already exists",
                        ));
                    }
                    PartitionId::EXTENDED
                } else {
                    spec.id
                }
            }
        };
        if !id.is_valid_for(pt_type) {
            return Err(StagingError::unsupported(
                format!("{} partition table", pt_type),
                format!("partition id {}", id),
            ));
        }

        let overlaps = |p: &PartitionAttrs| spec.start < p.start + p.size && p.start < end;
        let clash = match spec.partition_type {
            PartitionType::Logical => {
                let extended = siblings
                    .iter()
                    .find(|p| p.partition_type == PartitionType::Extended)
                    .ok_or_else(|| {
                        StagingError::conflict(&disk.name, "logical partition needs an extended partition")
                    })?;
                if spec.start < extended.start || end > extended.start + extended.size {
                    return Err(StagingError::InvalidValue(format!(
                        "logical partition must lie inside {}",
                        extended.name
                    )));
                }
                siblings
                    .iter()
                    .filter(|p| p.partition_type == PartitionType::Logical)
                    .find(|p| overlaps(*p))
            }
            _ => siblings
                .iter()
                .filter(|p| p.partition_type != PartitionType::Logical)
                .find(|p| overlaps(*p)),
        };
        if let Some(other) = clash {
            return Err(StagingError::conflict(
                &disk.name,
                format!("range overlaps {}", other.name),
            ));
        }

        let name = partition_name(&disk.name, spec.number);
        let part = graph.add_node(Device::Partition(PartitionAttrs {
            name: name.clone(),
            size: spec.size,
            start: spec.start,
            number: spec.number,
            partition_type: spec.partition_type,
            id,
        }))?;
        if let Err(err) = graph.add_edge(self.id, part, Relation::Hosts) {
            graph.remove_node(part, Removal::Cascade)?;
            return Err(err.into());
        }
        debug!(partition = %name, "staged partition");
        Ok(Partition {
            graph: self.graph,
            id: part,
        })
    }

    /// Remove a partition with everything on it.
    ///
    /// Deleting an extended partition also deletes its logical partitions.
    pub fn delete_partition(&self, graph: &mut Devicegraph, partition: Partition) -> StagingResult<()> {
        let host = partition.disk(graph)?;
        if host != *self {
            return Err(StagingError::conflict(
                partition.name(graph)?,
                format!("partition is not on {}", self.name(graph)?),
            ));
        }
        let mut doomed = vec![partition.id];
        if partition.partition_type(graph)? == PartitionType::Extended {
            for logical in self.partitions(graph)? {
                if logical.partition_type(graph)? == PartitionType::Logical {
                    doomed.push(logical.id);
                }
            }
        }
        for id in doomed {
            graph.remove_node(id, Removal::Cascade)?;
        }
        Ok(())
    }
}

// ============================================================================
// Partition
// ============================================================================

/// A partition on a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    graph: GraphId,
    id: NodeId,
}

impl Partition {
    pub fn find_by_name(graph: &Devicegraph, name: &str) -> Result<Option<Self>, GraphError> {
        match find_by_name(graph, name) {
            Some(device) => device.to_partition(graph),
            None => Ok(None),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn as_blk_device(&self) -> BlkDevice {
        BlkDevice {
            graph: self.graph,
            id: self.id,
        }
    }

    fn attrs<'g>(&self, graph: &'g Devicegraph) -> Result<&'g PartitionAttrs, GraphError> {
        let device = graph.resolve(self.graph, self.id, DeviceKind::Partition)?;
        device
            .as_partition()
            .ok_or_else(|| wrong_kind(self.id, DeviceKind::Partition, device))
    }

    fn attrs_mut<'g>(&self, graph: &'g mut Devicegraph) -> Result<&'g mut PartitionAttrs, GraphError> {
        graph.resolve(self.graph, self.id, DeviceKind::Partition)?;
        match graph.device_mut(self.id)? {
            Device::Partition(p) => Ok(p),
            other => Err(wrong_kind(self.id, DeviceKind::Partition, other)),
        }
    }

    pub fn name<'g>(&self, graph: &'g Devicegraph) -> Result<&'g str, GraphError> {
        self.attrs(graph).map(|p| p.name.as_str())
    }

    pub fn number(&self, graph: &Devicegraph) -> Result<u32, GraphError> {
        self.attrs(graph).map(|p| p.number)
    }

    pub fn start(&self, graph: &Devicegraph) -> Result<u64, GraphError> {
        self.attrs(graph).map(|p| p.start)
    }

    pub fn size(&self, graph: &Devicegraph) -> Result<u64, GraphError> {
        self.attrs(graph).map(|p| p.size)
    }

    pub fn partition_type(&self, graph: &Devicegraph) -> Result<PartitionType, GraphError> {
        self.attrs(graph).map(|p| p.partition_type)
    }

    pub fn partition_id(&self, graph: &Devicegraph) -> Result<PartitionId, GraphError> {
        self.attrs(graph).map(|p| p.id)
    }

    /// The disk hosting this partition.
    pub fn disk(&self, graph: &Devicegraph) -> Result<Disk, GraphError> {
        self.attrs(graph)?;
        graph
            .parent(self.id, Relation::Hosts)
            .map(|id| Disk {
                graph: self.graph,
                id,
            })
            .ok_or(GraphError::NotFound(self.id))
    }

    /// Stage a new partition id.
    ///
    /// # Errors
    ///
    /// `UnsupportedOption` if the host's table flavour has no code for `id`
    /// or the partition is an extended container.
    pub fn set_id(&self, graph: &mut Devicegraph, id: PartitionId) -> StagingResult<()> {
        let attrs = self.attrs(graph)?;
        if attrs.partition_type == PartitionType::Extended {
            return Err(StagingError::unsupported(&attrs.name, "changing the id of an extended partition"));
        }
        let pt_type = self.disk(graph)?.pt_type(graph)?;
        if let Some(pt_type) = pt_type {
            if !id.is_valid_for(pt_type) {
                return Err(StagingError::unsupported(
                    format!("{} partition table", pt_type),
                    format!("partition id {}", id),
                ));
            }
        }
        self.attrs_mut(graph)?.id = id;
        Ok(())
    }

    /// Stage a new size. The start stays where it is.
    pub fn resize(&self, graph: &mut Devicegraph, size: u64) -> StagingResult<()> {
        let attrs = self.attrs(graph)?.clone();
        if size == 0 {
            return Err(StagingError::InvalidValue("partition size must be > 0".into()));
        }
        let disk = self.disk(graph)?;
        let disk_size = disk.as_blk_device().size(graph)?;
        let end = attrs.start.saturating_add(size);
        if end > disk_size {
            return Err(StagingError::InvalidValue(format!(
                "{} would end beyond its disk",
                attrs.name
            )));
        }
        for sibling in disk.partitions(graph)? {
            let other = sibling.attrs(graph)?;
            if other.number == attrs.number {
                continue;
            }
            let same_layer = (other.partition_type == PartitionType::Logical)
                == (attrs.partition_type == PartitionType::Logical);
            let inside_extended = attrs.partition_type == PartitionType::Extended
                && other.partition_type == PartitionType::Logical;
            if inside_extended && other.start + other.size > end {
                return Err(StagingError::conflict(
                    &attrs.name,
                    format!("shrinking would cut {}", other.name),
                ));
            }
            if same_layer && attrs.start < other.start + other.size && other.start < end {
                return Err(StagingError::conflict(
                    &attrs.name,
                    format!("range overlaps {}", other.name),
                ));
            }
        }
        self.attrs_mut(graph)?.size = size;
        Ok(())
    }
}

// ============================================================================
// BlkFilesystem
// ============================================================================

/// A filesystem on a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlkFilesystem {
    graph: GraphId,
    id: NodeId,
}

impl BlkFilesystem {
    /// Every filesystem of the graph, in id order.
    pub fn all(graph: &Devicegraph) -> Vec<Self> {
        graph
            .nodes()
            .filter(|n| n.device.as_filesystem().is_some())
            .map(|n| Self {
                graph: graph.id(),
                id: n.id,
            })
            .collect()
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    fn attrs<'g>(&self, graph: &'g Devicegraph) -> Result<&'g FilesystemAttrs, GraphError> {
        let device = graph.resolve(self.graph, self.id, DeviceKind::BlkFilesystem)?;
        device
            .as_filesystem()
            .ok_or_else(|| wrong_kind(self.id, DeviceKind::BlkFilesystem, device))
    }

    fn attrs_mut<'g>(&self, graph: &'g mut Devicegraph) -> Result<&'g mut FilesystemAttrs, GraphError> {
        graph.resolve(self.graph, self.id, DeviceKind::BlkFilesystem)?;
        match graph.device_mut(self.id)? {
            Device::BlkFilesystem(fs) => Ok(fs),
            other => Err(wrong_kind(self.id, DeviceKind::BlkFilesystem, other)),
        }
    }

    pub fn kind(&self, graph: &Devicegraph) -> Result<FsType, GraphError> {
        self.attrs(graph).map(|fs| fs.kind)
    }

    pub fn label<'g>(&self, graph: &'g Devicegraph) -> Result<&'g str, GraphError> {
        self.attrs(graph).map(|fs| fs.label.as_str())
    }

    pub fn uuid<'g>(&self, graph: &'g Devicegraph) -> Result<&'g str, GraphError> {
        self.attrs(graph).map(|fs| fs.uuid.as_str())
    }

    pub fn tune_options<'g>(&self, graph: &'g Devicegraph) -> Result<&'g str, GraphError> {
        self.attrs(graph).map(|fs| fs.tune_options.as_str())
    }

    /// The device this filesystem sits on.
    pub fn blk_device(&self, graph: &Devicegraph) -> Result<BlkDevice, GraphError> {
        self.attrs(graph)?;
        graph
            .filesystem_device(self.id)
            .map(|id| BlkDevice {
                graph: self.graph,
                id,
            })
            .ok_or(GraphError::NotFound(self.id))
    }

    pub fn mount_points(&self, graph: &Devicegraph) -> Result<Vec<MountPoint>, GraphError> {
        self.attrs(graph)?;
        Ok(graph
            .children(self.id, Relation::MountedAt)
            .into_iter()
            .map(|id| MountPoint {
                graph: self.graph,
                id,
            })
            .collect())
    }

    /// Stage a new label.
    ///
    /// # Errors
    ///
    /// `UnsupportedOption` if the kind has no labels, `InvalidValue` if the
    /// label is too long for the kind.
    pub fn set_label(&self, graph: &mut Devicegraph, label: &str) -> StagingResult<()> {
        let kind = self.kind(graph)?;
        let max = kind
            .max_label_len()
            .ok_or_else(|| StagingError::unsupported(kind, "labels"))?;
        if label.len() > max {
            return Err(StagingError::InvalidValue(format!(
                "{} labels are at most {} bytes, got {:?}",
                kind, max, label
            )));
        }
        if label.chars().any(char::is_control) {
            return Err(StagingError::InvalidValue(format!(
                "label {:?} contains control characters",
                label
            )));
        }
        self.attrs_mut(graph)?.label = label.to_string();
        Ok(())
    }

    /// Stage backend tuning flags, e.g. `-m 10`. An empty string clears them.
    ///
    /// # Errors
    ///
    /// `UnsupportedOption` if the kind takes no tuning flags, `InvalidValue`
    /// if the string does not start with a flag.
    pub fn set_tune_options(&self, graph: &mut Devicegraph, options: &str) -> StagingResult<()> {
        let kind = self.kind(graph)?;
        let options = options.trim();
        if !options.is_empty() {
            if !kind.supports_tune_options() {
                return Err(StagingError::unsupported(kind, "tune options"));
            }
            if !options.starts_with('-') {
                return Err(StagingError::InvalidValue(format!(
                    "tune options must start with a flag, got {:?}",
                    options
                )));
            }
        }
        self.attrs_mut(graph)?.tune_options = options.to_string();
        Ok(())
    }

    /// Stage a mount point for this filesystem.
    ///
    /// New mount points are not registered for boot; use
    /// `MountPoint::set_automount` for that.
    ///
    /// # Errors
    ///
    /// - `DuplicateMountPoint` if the path is already staged
    /// - `UnsupportedOption` if the kind cannot be mounted
    /// - `InvalidValue` if the path is not absolute
    pub fn create_mount_point(&self, graph: &mut Devicegraph, path: &str) -> StagingResult<MountPoint> {
        let kind = self.kind(graph)?;
        if !kind.is_mountable() {
            return Err(StagingError::unsupported(kind, "mount points"));
        }
        validate_mount_path(path)?;
        if graph.find_mount_point(path).is_some() {
            return Err(StagingError::DuplicateMountPoint(path.to_string()));
        }

        let mp = graph.add_node(Device::MountPoint(MountPointAttrs {
            path: path.to_string(),
            mount_options: Vec::new(),
            automount: false,
        }))?;
        if let Err(err) = graph.add_edge(self.id, mp, Relation::MountedAt) {
            graph.remove_node(mp, Removal::Cascade)?;
            return Err(err.into());
        }
        debug!(path, "staged mount point");
        Ok(MountPoint {
            graph: self.graph,
            id: mp,
        })
    }
}

fn validate_mount_path(path: &str) -> StagingResult<()> {
    if !path.starts_with('/') {
        return Err(StagingError::InvalidValue(format!(
            "mount path {:?} is not absolute",
            path
        )));
    }
    if path.chars().any(char::is_whitespace) {
        return Err(StagingError::InvalidValue(format!(
            "mount path {:?} contains whitespace",
            path
        )));
    }
    if path.split('/').any(|c| c == "..") || (path.len() > 1 && path.ends_with('/')) {
        return Err(StagingError::InvalidValue(format!(
            "mount path {:?} is not normalized",
            path
        )));
    }
    Ok(())
}

// ============================================================================
// MountPoint
// ============================================================================

/// A mount point of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountPoint {
    graph: GraphId,
    id: NodeId,
}

impl MountPoint {
    pub fn find_by_path(graph: &Devicegraph, path: &str) -> Option<Self> {
        graph.find_mount_point(path).map(|id| Self {
            graph: graph.id(),
            id,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    fn attrs<'g>(&self, graph: &'g Devicegraph) -> Result<&'g MountPointAttrs, GraphError> {
        let device = graph.resolve(self.graph, self.id, DeviceKind::MountPoint)?;
        device
            .as_mount_point()
            .ok_or_else(|| wrong_kind(self.id, DeviceKind::MountPoint, device))
    }

    fn attrs_mut<'g>(&self, graph: &'g mut Devicegraph) -> Result<&'g mut MountPointAttrs, GraphError> {
        graph.resolve(self.graph, self.id, DeviceKind::MountPoint)?;
        match graph.device_mut(self.id)? {
            Device::MountPoint(mp) => Ok(mp),
            other => Err(wrong_kind(self.id, DeviceKind::MountPoint, other)),
        }
    }

    pub fn path<'g>(&self, graph: &'g Devicegraph) -> Result<&'g str, GraphError> {
        self.attrs(graph).map(|mp| mp.path.as_str())
    }

    pub fn mount_options<'g>(&self, graph: &'g Devicegraph) -> Result<&'g [String], GraphError> {
        self.attrs(graph).map(|mp| mp.mount_options.as_slice())
    }

    pub fn automount(&self, graph: &Devicegraph) -> Result<bool, GraphError> {
        self.attrs(graph).map(|mp| mp.automount)
    }

    pub fn filesystem(&self, graph: &Devicegraph) -> Result<BlkFilesystem, GraphError> {
        self.attrs(graph)?;
        graph
            .parent(self.id, Relation::MountedAt)
            .map(|id| BlkFilesystem {
                graph: self.graph,
                id,
            })
            .ok_or(GraphError::NotFound(self.id))
    }

    /// Stage mount options. An empty list means kernel defaults.
    pub fn set_mount_options(&self, graph: &mut Devicegraph, options: &[String]) -> StagingResult<()> {
        self.attrs(graph)?;
        for option in options {
            if option.is_empty() || option.contains(',') || option.chars().any(char::is_whitespace) {
                return Err(StagingError::InvalidValue(format!(
                    "mount option {:?} must be a single non-empty word",
                    option
                )));
            }
        }
        self.attrs_mut(graph)?.mount_options = options.to_vec();
        Ok(())
    }

    /// Stage whether the mount point gets an fstab entry.
    pub fn set_automount(&self, graph: &mut Devicegraph, automount: bool) -> StagingResult<()> {
        self.attrs_mut(graph)?.automount = automount;
        Ok(())
    }

    /// Remove the mount point.
    pub fn remove(&self, graph: &mut Devicegraph) -> StagingResult<()> {
        self.attrs(graph)?;
        graph.remove_node(self.id, Removal::Strict)?;
        Ok(())
    }
}
