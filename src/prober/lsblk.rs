//! `lsblk --json` output and the graph builder fed by it.
//!
//! `build_graph` is pure: it takes parsed rows plus the mount table and fstab
//! entries, so the whole probe pipeline is testable without a live system.

use serde::{Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::{ProbeCallbacks, ProbeError};
use crate::devicegraph::{
    BlockDeviceAttrs, Device, Devicegraph, FilesystemAttrs, MountPointAttrs, NodeId, PartitionAttrs,
    Relation,
};
use crate::fstab::FstabEntry;
use crate::types::{
    BlockDeviceKind, FsType, PartitionId, PartitionType, PtType, is_container_signature,
};

/// lsblk reports `START` in 512-byte sectors regardless of `--bytes`.
pub const SECTOR_SIZE: u64 = 512;

/// Columns requested from lsblk, in the order `LsblkRow` expects them.
pub const LSBLK_COLUMNS: &str = "NAME,PATH,TYPE,SIZE,START,PARTN,PARTTYPE,PTTYPE,PKNAME,FSTYPE,LABEL,UUID";

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkRow>,
}

/// One device row of `lsblk --json --list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LsblkRow {
    /// Kernel name, e.g. `sda1`
    pub name: String,
    /// Device path, e.g. `/dev/sda1`
    #[serde(default)]
    pub path: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "number_or_string")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "number_or_string")]
    pub start: Option<u64>,
    #[serde(default, deserialize_with = "number_or_string")]
    pub partn: Option<u64>,
    #[serde(default)]
    pub parttype: Option<String>,
    #[serde(default)]
    pub pttype: Option<String>,
    /// Kernel name of the parent device
    #[serde(default)]
    pub pkname: Option<String>,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

impl LsblkRow {
    fn device_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", self.name))
    }

    fn is_partition(&self) -> bool {
        self.kind == "part"
    }
}

/// Older util-linux prints numbers as JSON strings.
fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Raw::Text(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Parse `lsblk --json --list` output.
pub fn parse_lsblk(json: &str) -> Result<Vec<LsblkRow>, ProbeError> {
    serde_json::from_str::<LsblkOutput>(json)
        .map(|o| o.blockdevices)
        .map_err(|e| ProbeError::Parse {
            what: "lsblk output".into(),
            message: e.to_string(),
        })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn partition_number(row: &LsblkRow) -> Option<u32> {
    if let Some(n) = row.partn {
        return u32::try_from(n).ok();
    }
    let digits: String = row
        .name
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

fn partition_id(parttype: Option<&str>, pt_type: PtType) -> PartitionId {
    match (parttype, pt_type) {
        (None, _) => PartitionId::UNKNOWN,
        (Some(code), PtType::Msdos) => {
            let hex = code.trim_start_matches("0x");
            u32::from_str_radix(hex, 16)
                .map(PartitionId)
                .unwrap_or(PartitionId::UNKNOWN)
        }
        (Some(guid), PtType::Gpt) => PartitionId::from_gpt_guid(guid),
    }
}

fn is_extended_code(id: PartitionId) -> bool {
    matches!(id.0, 0x05 | 0x0f | 0x85)
}

/// Ask the callbacks whether a recoverable problem may be skipped.
fn recoverable(
    callbacks: &dyn ProbeCallbacks,
    device: &str,
    message: String,
) -> Result<(), ProbeError> {
    if callbacks.error(&message, device) {
        Ok(())
    } else {
        Err(ProbeError::Aborted {
            device: device.to_string(),
            message,
        })
    }
}

/// Build a graph from probe data.
///
/// Passes: block devices, partitions with their hosts, filesystems on leaf
/// devices, mount points from the mount table joined with fstab.
pub fn build_graph(
    rows: &[LsblkRow],
    mounts: &[FstabEntry],
    fstab: &[FstabEntry],
    callbacks: &dyn ProbeCallbacks,
) -> Result<Devicegraph, ProbeError> {
    let mut graph = Devicegraph::new();
    let paths: HashMap<&str, String> = rows
        .iter()
        .map(|r| (r.name.as_str(), r.device_path()))
        .collect();
    let mut nodes: HashMap<String, NodeId> = HashMap::new();

    // Pass 1: whole block devices
    for row in rows.iter().filter(|r| !r.is_partition()) {
        let name = row.device_path();
        if nodes.contains_key(&name) {
            return Err(ProbeError::Inconsistent(format!("duplicate device {}", name)));
        }
        let kind = BlockDeviceKind::from_lsblk_type(&row.kind);
        let pt_type = match non_empty(&row.pttype) {
            Some(pt) => match pt.parse::<PtType>() {
                Ok(pt) => Some(pt),
                Err(_) => {
                    recoverable(callbacks, &name, format!("unsupported partition table '{}'", pt))?;
                    continue;
                }
            },
            None => None,
        };
        let id = graph.add_node(Device::BlockDevice(BlockDeviceAttrs {
            name: name.clone(),
            size: row.size.unwrap_or(0),
            kind,
            pt_type: pt_type.filter(|_| kind.is_partitionable()),
        }))?;
        nodes.insert(name, id);
    }

    // Pass 2: partitions and their hosts
    for row in rows.iter().filter(|r| r.is_partition()) {
        let name = row.device_path();
        if nodes.contains_key(&name) {
            return Err(ProbeError::Inconsistent(format!("duplicate device {}", name)));
        }
        let host_name = non_empty(&row.pkname)
            .and_then(|pk| paths.get(pk))
            .ok_or_else(|| {
                ProbeError::Inconsistent(format!("partition {} references a missing disk", name))
            })?;
        let Some(&host) = nodes.get(host_name) else {
            // Host was skipped in pass 1 on the caller's request
            recoverable(callbacks, &name, format!("host {} was not probed", host_name))?;
            continue;
        };
        let host_attrs = graph.device(host)?.as_block_device().cloned();
        let Some(pt_type) = host_attrs
            .filter(|h| h.kind.is_partitionable())
            .and_then(|h| h.pt_type)
        else {
            recoverable(
                callbacks,
                &name,
                format!("host {} has no partition table engine support", host_name),
            )?;
            continue;
        };
        let Some(number) = partition_number(row) else {
            recoverable(callbacks, &name, "partition number unknown".into())?;
            continue;
        };

        let id = partition_id(non_empty(&row.parttype), pt_type);
        let partition_type = match pt_type {
            PtType::Msdos if number > pt_type.max_primary() => PartitionType::Logical,
            PtType::Msdos if is_extended_code(id) => PartitionType::Extended,
            _ => PartitionType::Primary,
        };
        let part = graph.add_node(Device::Partition(PartitionAttrs {
            name: name.clone(),
            size: row.size.unwrap_or(0),
            start: row.start.unwrap_or(0) * SECTOR_SIZE,
            number,
            partition_type,
            id,
        }))?;
        graph.add_edge(host, part, Relation::Hosts)?;
        nodes.insert(name, part);
    }

    // Pass 3: filesystems on leaf devices
    let hosts: HashSet<NodeId> = graph
        .edges()
        .iter()
        .filter(|e| e.relation == Relation::Hosts)
        .map(|e| e.from)
        .collect();
    for row in rows {
        let Some(signature) = non_empty(&row.fstype) else {
            continue;
        };
        let name = row.device_path();
        let Some(&device) = nodes.get(&name) else {
            continue;
        };
        if hosts.contains(&device) || is_container_signature(signature) {
            continue;
        }
        let Some(kind) = FsType::from_signature(signature) else {
            recoverable(callbacks, &name, format!("unsupported filesystem '{}'", signature))?;
            continue;
        };
        let fs = graph.add_node(Device::BlkFilesystem(FilesystemAttrs {
            kind,
            label: non_empty(&row.label).unwrap_or_default().to_string(),
            uuid: non_empty(&row.uuid).unwrap_or_default().to_string(),
            tune_options: String::new(),
        }))?;
        graph.add_edge(device, fs, Relation::FormattedAs)?;
    }

    // Pass 4: active mounts, joined with fstab. A later mount on the same
    // path covers the earlier one, so only the last is kept.
    let mut active: Vec<Option<(&FstabEntry, NodeId)>> = Vec::new();
    let mut by_path: HashMap<&str, usize> = HashMap::new();
    for mount in mounts.iter().filter(|m| m.spec.starts_with("/dev/")) {
        let Some(&device) = nodes.get(&mount.spec) else {
            continue;
        };
        let Some(fs) = graph.device_filesystem(device) else {
            continue;
        };
        if let Some(earlier) = by_path.insert(mount.file.as_str(), active.len()) {
            if let Some((covered, _)) = active[earlier].take() {
                recoverable(
                    callbacks,
                    &covered.spec,
                    format!("{} is mounted over by {}", mount.file, mount.spec),
                )?;
            }
        }
        active.push(Some((mount, fs)));
    }

    for (mount, fs) in active.into_iter().flatten() {
        let (label, uuid) = graph
            .device(fs)?
            .as_filesystem()
            .map(|f| (f.label.clone(), f.uuid.clone()))
            .unwrap_or_default();
        let entry = fstab
            .iter()
            .find(|e| e.file == mount.file && e.matches_device(&mount.spec, &uuid, &label));
        let mp = graph.add_node(Device::MountPoint(MountPointAttrs {
            path: mount.file.clone(),
            mount_options: match entry {
                Some(entry) => entry.mount_options(),
                None => mount.kernel_mount_options(),
            },
            automount: entry.is_some_and(|e| !e.is_noauto()),
        }))?;
        graph.add_edge(fs, mp, Relation::MountedAt)?;
    }

    debug!(nodes = graph.len(), "probe graph built");
    Ok(graph)
}
