//! Action Planner: diff the probed graph against staging.
//!
//! Nodes are matched through the origin ids recorded when staging was cloned,
//! confirmed by a correlation key (device name, containing device plus kind,
//! mount path) and a matched parent. A staging node that fails to match is
//! created; a probed node nobody matches is deleted. A fresh node sharing a
//! key with a probed node therefore expands to delete + create.
//!
//! # What This Explicitly Refuses To Do
//!
//! - Creating or removing whole block devices (that is hardware)
//! - Changing a device's kind, size or partition table type
//! - Moving a partition's start or changing its slot type
//! - Resizing a partition whose filesystem is kept (no filesystem resize)

use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use super::action::{Action, ActionPlan, ActionStage, PartitionSlot};
use crate::devicegraph::{Device, DeviceKind, Devicegraph, GraphError, Node, NodeId, Relation};
use crate::types::FsType;

/// Errors raised while planning.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// No safe action sequence bridges the two states
    #[error("cannot plan change of {subject}: {reason}")]
    Unplannable { subject: String, reason: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl PlanError {
    fn unplannable(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unplannable {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

/// How a node differs between probed and staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    Unchanged,
    Modified,
    Created,
    Deleted,
}

/// Classification of one node. Ids refer to the graph the node lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeChange {
    pub change: Change,
    pub probed: Option<NodeId>,
    pub staging: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Device(String),
    Filesystem(String, FsType),
    MountPoint(String),
}

fn correlation_key(graph: &Devicegraph, node: &Node) -> Option<Key> {
    match &node.device {
        Device::BlockDevice(d) => Some(Key::Device(d.name.clone())),
        Device::Partition(p) => Some(Key::Device(p.name.clone())),
        Device::BlkFilesystem(fs) => {
            let device = graph.filesystem_device(node.id)?;
            let name = graph.device(device).ok()?.name()?;
            Some(Key::Filesystem(name.to_string(), fs.kind))
        }
        Device::MountPoint(mp) => Some(Key::MountPoint(mp.path.clone())),
    }
}

fn structural_parent(graph: &Devicegraph, node: &Node) -> Option<NodeId> {
    match node.device.kind() {
        DeviceKind::BlockDevice => None,
        DeviceKind::Partition => graph.parent(node.id, Relation::Hosts),
        DeviceKind::BlkFilesystem => graph.parent(node.id, Relation::FormattedAs),
        DeviceKind::MountPoint => graph.parent(node.id, Relation::MountedAt),
    }
}

fn layer(kind: DeviceKind) -> u8 {
    match kind {
        DeviceKind::BlockDevice => 0,
        DeviceKind::Partition => 1,
        DeviceKind::BlkFilesystem => 2,
        DeviceKind::MountPoint => 3,
    }
}

/// Whether two matched payloads differ in anything the backend can change.
/// UUIDs are assigned by the backend and never compared.
fn differs(probed: &Device, staging: &Device) -> bool {
    match (probed, staging) {
        (Device::BlkFilesystem(p), Device::BlkFilesystem(s)) => {
            p.kind != s.kind
                || p.label != s.label
                || (!s.tune_options.is_empty() && p.tune_options != s.tune_options)
        }
        (p, s) => p != s,
    }
}

/// Staging → probed id mapping.
fn match_nodes(probed: &Devicegraph, staging: &Devicegraph) -> HashMap<NodeId, NodeId> {
    let mut ordered: Vec<&Node> = staging.nodes().collect();
    ordered.sort_by_key(|n| (layer(n.device.kind()), n.id));

    let mut matched: HashMap<NodeId, NodeId> = HashMap::new();
    for node in ordered {
        let Some(origin) = node.origin else {
            continue;
        };
        let Ok(original) = probed.node(origin) else {
            continue;
        };
        if original.device.kind() != node.device.kind() {
            continue;
        }
        if correlation_key(staging, node) != correlation_key(probed, original) {
            continue;
        }
        let parent_matches = match (
            structural_parent(staging, node),
            structural_parent(probed, original),
        ) {
            (None, None) => true,
            (Some(sp), Some(pp)) => matched.get(&sp) == Some(&pp),
            _ => false,
        };
        if parent_matches {
            matched.insert(node.id, origin);
        }
    }
    matched
}

/// Classify every node of both graphs.
///
/// Staging nodes come first in id order, then deleted probed nodes in id
/// order.
pub fn diff(probed: &Devicegraph, staging: &Devicegraph) -> Vec<NodeChange> {
    let matched = match_nodes(probed, staging);
    let mut changes = Vec::with_capacity(staging.len());

    for node in staging.nodes() {
        let change = match matched.get(&node.id) {
            Some(&origin) => {
                let modified = probed
                    .device(origin)
                    .map(|p| differs(p, &node.device))
                    .unwrap_or(true);
                NodeChange {
                    change: if modified {
                        Change::Modified
                    } else {
                        Change::Unchanged
                    },
                    probed: Some(origin),
                    staging: Some(node.id),
                }
            }
            None => NodeChange {
                change: Change::Created,
                probed: None,
                staging: Some(node.id),
            },
        };
        changes.push(change);
    }

    let kept: std::collections::HashSet<NodeId> = matched.values().copied().collect();
    for node in probed.nodes().filter(|n| !kept.contains(&n.id)) {
        changes.push(NodeChange {
            change: Change::Deleted,
            probed: Some(node.id),
            staging: None,
        });
    }
    changes
}

/// Action together with its position in the plan.
struct Planned {
    stage: ActionStage,
    /// Actions of one disk stay together within a stage
    group: String,
    /// Partition number or mount depth, signed for descending order
    rank: i64,
    node: u32,
    action: Action,
}

impl Planned {
    fn new(action: Action, node: NodeId) -> Self {
        Self {
            stage: action.stage(),
            group: String::new(),
            rank: 0,
            node: node.0,
            action,
        }
    }

    fn grouped(mut self, group: &str, rank: i64) -> Self {
        self.group = group.to_string();
        self.rank = rank;
        self
    }

    fn cmp_position(&self, other: &Self) -> Ordering {
        (self.stage, &self.group, self.rank, self.node).cmp(&(
            other.stage,
            &other.group,
            other.rank,
            other.node,
        ))
    }
}

fn depth(path: &str) -> i64 {
    path.split('/').filter(|c| !c.is_empty()).count() as i64
}

fn filesystem_device_name(graph: &Devicegraph, fs: NodeId) -> Result<String, PlanError> {
    let device = graph
        .filesystem_device(fs)
        .ok_or(GraphError::NotFound(fs))?;
    graph
        .device(device)?
        .name()
        .map(str::to_string)
        .ok_or_else(|| GraphError::NotFound(device).into())
}

fn mount_point_device(graph: &Devicegraph, mp: NodeId) -> Result<(String, FsType), PlanError> {
    let fs = graph
        .parent(mp, Relation::MountedAt)
        .ok_or(GraphError::NotFound(mp))?;
    let kind = graph
        .device(fs)?
        .as_filesystem()
        .map(|f| f.kind)
        .ok_or(GraphError::NotFound(fs))?;
    Ok((filesystem_device_name(graph, fs)?, kind))
}

fn partition_slot(graph: &Devicegraph, part: NodeId) -> Result<PartitionSlot, PlanError> {
    let attrs = graph
        .device(part)?
        .as_partition()
        .ok_or(GraphError::NotFound(part))?;
    let host = graph
        .parent(part, Relation::Hosts)
        .ok_or(GraphError::NotFound(part))?;
    let disk = graph
        .device(host)?
        .as_block_device()
        .ok_or(GraphError::NotFound(host))?;
    let pt_type = disk.pt_type.ok_or_else(|| {
        PlanError::unplannable(&disk.name, "partitions on a device without partition table")
    })?;
    Ok(PartitionSlot {
        disk: disk.name.clone(),
        pt_type,
        number: attrs.number,
        name: attrs.name.clone(),
    })
}

fn check_modification(
    probed: &Devicegraph,
    staging: &Devicegraph,
    matched: &HashMap<NodeId, NodeId>,
    p: &Node,
    s: &Node,
) -> Result<(), PlanError> {
    match (&p.device, &s.device) {
        (Device::BlockDevice(pd), Device::BlockDevice(sd)) => {
            if pd.kind != sd.kind {
                return Err(PlanError::unplannable(&sd.name, "device kind cannot change"));
            }
            if pd.size != sd.size {
                return Err(PlanError::unplannable(&sd.name, "disk size is fixed by hardware"));
            }
            if pd.pt_type != sd.pt_type {
                return Err(PlanError::unplannable(
                    &sd.name,
                    "partition table type cannot change",
                ));
            }
        }
        (Device::Partition(pp), Device::Partition(sp)) => {
            if pp.start != sp.start {
                return Err(PlanError::unplannable(&sp.name, "partition start cannot move"));
            }
            if pp.partition_type != sp.partition_type {
                return Err(PlanError::unplannable(
                    &sp.name,
                    "partition slot type cannot change",
                ));
            }
            if pp.size != sp.size {
                let keeps_filesystem = staging
                    .device_filesystem(s.id)
                    .is_some_and(|fs| matched.contains_key(&fs));
                let had_filesystem = probed.device_filesystem(p.id).is_some();
                if keeps_filesystem && had_filesystem {
                    return Err(PlanError::unplannable(
                        &sp.name,
                        "resizing would need a filesystem resize",
                    ));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Compute the ordered action list that turns `probed` into `staging`.
///
/// Deterministic: the same pair of graphs always yields the same plan.
pub fn plan(probed: &Devicegraph, staging: &Devicegraph) -> Result<ActionPlan, PlanError> {
    let matched = match_nodes(probed, staging);
    let changes = diff(probed, staging);
    let mut planned: Vec<Planned> = Vec::new();

    for change in &changes {
        match (change.change, change.probed, change.staging) {
            (Change::Deleted, Some(pid), _) => {
                plan_deletion(probed, probed.node(pid)?, &mut planned)?;
            }
            (Change::Created, _, Some(sid)) => {
                plan_creation(staging, staging.node(sid)?, &mut planned)?;
            }
            (Change::Modified, Some(pid), Some(sid)) => {
                let p = probed.node(pid)?;
                let s = staging.node(sid)?;
                check_modification(probed, staging, &matched, p, s)?;
                plan_modification(staging, p, s, &mut planned)?;
            }
            _ => {}
        }
    }

    planned.sort_by(Planned::cmp_position);
    let actions: Vec<Action> = planned.into_iter().map(|p| p.action).collect();
    debug!(actions = actions.len(), "plan calculated");
    Ok(ActionPlan { actions })
}

fn plan_deletion(
    probed: &Devicegraph,
    node: &Node,
    out: &mut Vec<Planned>,
) -> Result<(), PlanError> {
    match &node.device {
        Device::BlockDevice(d) => Err(PlanError::unplannable(
            &d.name,
            "removing a whole device is a hardware change",
        )),
        Device::Partition(_) => {
            let slot = partition_slot(probed, node.id)?;
            let disk = slot.disk.clone();
            let rank = -i64::from(slot.number);
            out.push(Planned::new(Action::DeletePartition { slot }, node.id).grouped(&disk, rank));
            Ok(())
        }
        Device::BlkFilesystem(fs) => {
            let device = filesystem_device_name(probed, node.id)?;
            out.push(Planned::new(
                Action::DeleteFilesystem {
                    device,
                    fs_type: fs.kind,
                },
                node.id,
            ));
            Ok(())
        }
        Device::MountPoint(mp) => {
            let (device, _) = mount_point_device(probed, node.id)?;
            let rank = -depth(&mp.path);
            if mp.automount {
                out.push(
                    Planned::new(
                        Action::RemoveFstabEntry {
                            device: device.clone(),
                            path: mp.path.clone(),
                        },
                        node.id,
                    )
                    .grouped("", rank),
                );
            }
            out.push(
                Planned::new(
                    Action::Unmount {
                        device,
                        path: mp.path.clone(),
                    },
                    node.id,
                )
                .grouped("", rank),
            );
            Ok(())
        }
    }
}

fn plan_creation(
    staging: &Devicegraph,
    node: &Node,
    out: &mut Vec<Planned>,
) -> Result<(), PlanError> {
    match &node.device {
        Device::BlockDevice(d) => Err(PlanError::unplannable(
            &d.name,
            "adding a whole device is a hardware change",
        )),
        Device::Partition(p) => {
            let slot = partition_slot(staging, node.id)?;
            let disk = slot.disk.clone();
            let rank = i64::from(slot.number);
            out.push(
                Planned::new(
                    Action::CreatePartition {
                        slot,
                        start: p.start,
                        size: p.size,
                        partition_type: p.partition_type,
                        id: p.id,
                    },
                    node.id,
                )
                .grouped(&disk, rank),
            );
            Ok(())
        }
        Device::BlkFilesystem(fs) => {
            out.push(Planned::new(
                Action::CreateFilesystem {
                    device: filesystem_device_name(staging, node.id)?,
                    fs_type: fs.kind,
                    label: fs.label.clone(),
                    tune_options: fs.tune_options.clone(),
                },
                node.id,
            ));
            Ok(())
        }
        Device::MountPoint(mp) => {
            let (device, fs_type) = mount_point_device(staging, node.id)?;
            let rank = depth(&mp.path);
            out.push(
                Planned::new(
                    Action::Mount {
                        device: device.clone(),
                        fs_type,
                        path: mp.path.clone(),
                        options: mp.mount_options.clone(),
                    },
                    node.id,
                )
                .grouped("", rank),
            );
            if mp.automount {
                out.push(
                    Planned::new(
                        Action::AddFstabEntry {
                            device,
                            fs_type,
                            path: mp.path.clone(),
                            options: mp.mount_options.clone(),
                        },
                        node.id,
                    )
                    .grouped("", rank),
                );
            }
            Ok(())
        }
    }
}

fn plan_modification(
    staging: &Devicegraph,
    p: &Node,
    s: &Node,
    out: &mut Vec<Planned>,
) -> Result<(), PlanError> {
    match (&p.device, &s.device) {
        (Device::Partition(pp), Device::Partition(sp)) => {
            let slot = partition_slot(staging, s.id)?;
            let disk = slot.disk.clone();
            let rank = i64::from(slot.number);
            if pp.size != sp.size {
                out.push(
                    Planned::new(
                        Action::ResizePartition {
                            slot: slot.clone(),
                            start: sp.start,
                            old_size: pp.size,
                            size: sp.size,
                        },
                        s.id,
                    )
                    .grouped(&disk, rank),
                );
            }
            if pp.id != sp.id {
                out.push(
                    Planned::new(Action::SetPartitionId { slot, id: sp.id }, s.id)
                        .grouped(&disk, rank),
                );
            }
        }
        (Device::BlkFilesystem(pf), Device::BlkFilesystem(sf)) => {
            let device = filesystem_device_name(staging, s.id)?;
            if pf.label != sf.label {
                out.push(Planned::new(
                    Action::SetLabel {
                        device: device.clone(),
                        fs_type: sf.kind,
                        label: sf.label.clone(),
                    },
                    s.id,
                ));
            }
            if !sf.tune_options.is_empty() && pf.tune_options != sf.tune_options {
                out.push(Planned::new(
                    Action::Tune {
                        device,
                        fs_type: sf.kind,
                        tune_options: sf.tune_options.clone(),
                    },
                    s.id,
                ));
            }
        }
        (Device::MountPoint(pm), Device::MountPoint(sm)) => {
            let (device, fs_type) = mount_point_device(staging, s.id)?;
            let rank = depth(&sm.path);
            let options_changed = pm.mount_options != sm.mount_options;
            if options_changed {
                out.push(
                    Planned::new(
                        Action::Remount {
                            device: device.clone(),
                            path: sm.path.clone(),
                            options: sm.mount_options.clone(),
                        },
                        s.id,
                    )
                    .grouped("", rank),
                );
            }
            let fstab = match (pm.automount, sm.automount) {
                (false, true) => Some(Action::AddFstabEntry {
                    device,
                    fs_type,
                    path: sm.path.clone(),
                    options: sm.mount_options.clone(),
                }),
                (true, false) => Some(Action::RemoveFstabEntry {
                    device,
                    path: sm.path.clone(),
                }),
                (true, true) if options_changed => Some(Action::UpdateFstabEntry {
                    device,
                    fs_type,
                    path: sm.path.clone(),
                    options: sm.mount_options.clone(),
                }),
                _ => None,
            };
            if let Some(action) = fstab {
                out.push(Planned::new(action, s.id).grouped("", rank));
            }
        }
        _ => {}
    }
    Ok(())
}
