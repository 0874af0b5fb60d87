//! Device graph: arena of storage objects plus typed relations between them.
//!
//! The graph owns a `NodeId → Node` map and an edge list. Relations are
//! restricted to a fixed table:
//!
//! | Relation      | From                  | To            | Cardinality        |
//! |---------------|-----------------------|---------------|--------------------|
//! | `Hosts`       | partitionable device  | Partition     | one host per part  |
//! | `FormattedAs` | BlockDevice/Partition | BlkFilesystem | 0..1 per device    |
//! | `MountedAt`   | BlkFilesystem         | MountPoint    | 0..n per fs        |
//!
//! Every relation points strictly "up" the layer order (device → filesystem →
//! mount point), so an edge set accepted by the table cannot form a cycle.

pub mod node;

pub use node::{
    BlockDeviceAttrs, Device, DeviceKind, FilesystemAttrs, MountPointAttrs, Node, NodeId,
    PartitionAttrs,
};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use strum::Display;
use thiserror::Error;

use crate::types::FsType;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a graph instance. Handles carry it so a handle obtained from
/// one graph cannot silently address a node of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

impl GraphId {
    fn next() -> Self {
        Self(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph-{}", self.0)
    }
}

/// Kind of a structural relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Partitionable device → partition
    Hosts,
    /// Block device or partition → filesystem
    FormattedAs,
    /// Filesystem → mount point
    MountedAt,
}

/// A directed edge between two nodes of the same graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub relation: Relation,
}

/// Whether dependents go with a removed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Fail if anything depends on the node
    Strict,
    /// Remove the node and everything reachable below it
    Cascade,
}

/// Errors raised by structural graph operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// No node with this id in the graph
    #[error("node {0} does not exist in this devicegraph")]
    NotFound(NodeId),

    /// Handle belongs to a different graph instance
    #[error("handle for node {id} belongs to {handle_graph}, not {graph}")]
    ForeignHandle {
        id: NodeId,
        handle_graph: GraphId,
        graph: GraphId,
    },

    /// Node exists but has another kind than the handle expects
    #[error("node {id} is a {found}, expected a {expected}")]
    WrongKind {
        id: NodeId,
        expected: DeviceKind,
        found: DeviceKind,
    },

    /// Removal would orphan dependents
    #[error("removing node {id} would orphan {dependents} dependent node(s)")]
    DanglingReference { id: NodeId, dependents: usize },

    /// Edge violates the relationship table
    #[error("invalid {relation} relationship {from_kind} {from} -> {to_kind} {to}: {reason}")]
    InvalidRelationship {
        from: NodeId,
        to: NodeId,
        from_kind: DeviceKind,
        to_kind: DeviceKind,
        relation: Relation,
        reason: String,
    },

    /// Another block device already uses this name
    #[error("a device named {0} already exists")]
    DuplicateName(String),

    /// Another mount point already uses this path
    #[error("mount point {0} already exists")]
    DuplicatePath(String),
}

/// The device graph. Used both for the probed and the staging state.
#[derive(Debug, Deserialize)]
#[serde(try_from = "GraphRepr")]
pub struct Devicegraph {
    id: GraphId,
    nodes: BTreeMap<NodeId, Node>,
    edges: Vec<Edge>,
    next_node: u32,
}

impl Default for Devicegraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Devicegraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            id: GraphId::next(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            next_node: 1,
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::NotFound(id))
    }

    pub fn device(&self, id: NodeId) -> Result<&Device, GraphError> {
        self.node(id).map(|n| &n.device)
    }

    pub(crate) fn device_mut(&mut self, id: NodeId) -> Result<&mut Device, GraphError> {
        self.nodes
            .get_mut(&id)
            .map(|n| &mut n.device)
            .ok_or(GraphError::NotFound(id))
    }

    /// Resolve a handle: same graph, existing node, expected kind.
    pub(crate) fn resolve(
        &self,
        graph: GraphId,
        id: NodeId,
        expected: DeviceKind,
    ) -> Result<&Device, GraphError> {
        if graph != self.id {
            return Err(GraphError::ForeignHandle {
                id,
                handle_graph: graph,
                graph: self.id,
            });
        }
        let device = self.device(id)?;
        let found = device.kind();
        let compatible = found == expected
            || (expected == DeviceKind::BlockDevice && found == DeviceKind::Partition);
        if !compatible {
            return Err(GraphError::WrongKind { id, expected, found });
        }
        Ok(device)
    }

    /// Insert a node and return its identity.
    ///
    /// Block device names and mount point paths must be unique in the graph.
    pub fn add_node(&mut self, device: Device) -> Result<NodeId, GraphError> {
        self.check_unique(&device)?;
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(
            id,
            Node {
                id,
                origin: None,
                device,
            },
        );
        Ok(id)
    }

    fn check_unique(&self, device: &Device) -> Result<(), GraphError> {
        if let Some(name) = device.name() {
            if self.find_by_name(name).is_some() {
                return Err(GraphError::DuplicateName(name.to_string()));
            }
        }
        if let Device::MountPoint(mp) = device {
            if self.find_mount_point(&mp.path).is_some() {
                return Err(GraphError::DuplicatePath(mp.path.clone()));
            }
        }
        Ok(())
    }

    /// Insert an edge after validating it against the relationship table.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, relation: Relation) -> Result<(), GraphError> {
        let from_kind = self.device(from)?.kind();
        let to_kind = self.device(to)?.kind();
        let invalid = |reason: &str| GraphError::InvalidRelationship {
            from,
            to,
            from_kind,
            to_kind,
            relation,
            reason: reason.to_string(),
        };

        if from == to {
            return Err(invalid("a node cannot relate to itself"));
        }

        match relation {
            Relation::Hosts => {
                let host = self.device(from)?.as_block_device();
                match (host, to_kind) {
                    (Some(host), DeviceKind::Partition) if host.kind.is_partitionable() => {}
                    (Some(_), DeviceKind::Partition) => {
                        return Err(invalid("host device kind cannot hold partitions"));
                    }
                    _ => return Err(invalid("only block devices host partitions")),
                }
                if self.parent(to, Relation::Hosts).is_some() {
                    return Err(invalid("partition already has a host"));
                }
            }
            Relation::FormattedAs => {
                if !matches!(from_kind, DeviceKind::BlockDevice | DeviceKind::Partition)
                    || to_kind != DeviceKind::BlkFilesystem
                {
                    return Err(invalid("only block devices are formatted as filesystems"));
                }
                if !self.children(from, Relation::FormattedAs).is_empty() {
                    return Err(invalid("block device already has a filesystem"));
                }
                if self.parent(to, Relation::FormattedAs).is_some() {
                    return Err(invalid("filesystem already sits on a block device"));
                }
            }
            Relation::MountedAt => {
                if from_kind != DeviceKind::BlkFilesystem || to_kind != DeviceKind::MountPoint {
                    return Err(invalid("only filesystems are mounted at mount points"));
                }
                if self.parent(to, Relation::MountedAt).is_some() {
                    return Err(invalid("mount point already belongs to a filesystem"));
                }
            }
        }

        self.edges.push(Edge { from, to, relation });
        Ok(())
    }

    /// Targets of outgoing edges of one relation kind, in ascending id order.
    pub fn children(&self, id: NodeId, relation: Relation) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .edges
            .iter()
            .filter(|e| e.from == id && e.relation == relation)
            .map(|e| e.to)
            .collect();
        out.sort();
        out
    }

    /// Source of the incoming edge of one relation kind, if any.
    pub fn parent(&self, id: NodeId, relation: Relation) -> Option<NodeId> {
        self.edges
            .iter()
            .find(|e| e.to == id && e.relation == relation)
            .map(|e| e.from)
    }

    /// Every node reachable from `id` through outgoing edges, excluding `id`.
    pub fn descendants(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for edge in self.edges.iter().filter(|e| e.from == current) {
                if seen.insert(edge.to) {
                    stack.push(edge.to);
                }
            }
        }
        seen
    }

    /// Remove a node.
    ///
    /// With `Removal::Strict` the call fails with `DanglingReference` if any
    /// node depends on it. With `Removal::Cascade` the dependents are removed
    /// too. Returns the removed nodes.
    pub fn remove_node(&mut self, id: NodeId, removal: Removal) -> Result<Vec<Node>, GraphError> {
        self.node(id)?;
        let dependents = self.descendants(id);
        if removal == Removal::Strict && !dependents.is_empty() {
            return Err(GraphError::DanglingReference {
                id,
                dependents: dependents.len(),
            });
        }

        let mut doomed = dependents;
        doomed.insert(id);
        self.edges
            .retain(|e| !doomed.contains(&e.from) && !doomed.contains(&e.to));
        Ok(doomed
            .into_iter()
            .filter_map(|victim| self.nodes.remove(&victim))
            .collect())
    }

    /// Find a block device or partition by device path.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.device.name() == Some(name))
            .map(|n| n.id)
    }

    /// Find a mount point by target path.
    pub fn find_mount_point(&self, path: &str) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.device.as_mount_point().is_some_and(|mp| mp.path == path))
            .map(|n| n.id)
    }

    /// Block device a filesystem sits on.
    pub fn filesystem_device(&self, fs: NodeId) -> Option<NodeId> {
        self.parent(fs, Relation::FormattedAs)
    }

    /// Filesystem a block device is formatted as.
    pub fn device_filesystem(&self, device: NodeId) -> Option<NodeId> {
        self.children(device, Relation::FormattedAs).first().copied()
    }

    /// Filesystem kinds present in the graph, i.e. the tool families needed
    /// to manage it.
    pub fn required_features(&self) -> BTreeSet<FsType> {
        self.nodes
            .values()
            .filter_map(|n| n.device.as_filesystem())
            .map(|fs| fs.kind)
            .collect()
    }

    /// Canonical identity-free description, for structural comparison.
    ///
    /// Each node is rendered with its correlation key and attributes. UUIDs and
    /// tune options are omitted: neither can be read back from a device.
    pub fn structure(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .nodes
            .values()
            .map(|n| match &n.device {
                Device::BlockDevice(d) => format!(
                    "blk {} {} {} {}",
                    d.name,
                    d.kind,
                    d.size,
                    d.pt_type.map(|p| p.to_string()).unwrap_or_default()
                ),
                Device::Partition(p) => format!(
                    "part {} on {} nr={} start={} size={} type={} id={}",
                    p.name,
                    self.parent(n.id, Relation::Hosts)
                        .and_then(|h| self.device(h).ok())
                        .and_then(Device::name)
                        .unwrap_or("?"),
                    p.number,
                    p.start,
                    p.size,
                    p.partition_type,
                    p.id
                ),
                Device::BlkFilesystem(fs) => format!(
                    "fs {} on {} label={:?}",
                    fs.kind,
                    self.filesystem_device(n.id)
                        .and_then(|d| self.device(d).ok())
                        .and_then(Device::name)
                        .unwrap_or("?"),
                    fs.label
                ),
                Device::MountPoint(mp) => format!(
                    "mp {} of {} opts={} auto={}",
                    mp.path,
                    self.parent(n.id, Relation::MountedAt)
                        .and_then(|fs| self.filesystem_device(fs))
                        .and_then(|d| self.device(d).ok())
                        .and_then(Device::name)
                        .unwrap_or("?"),
                    mp.mount_options.join(","),
                    mp.automount
                ),
            })
            .collect();
        lines.sort();
        lines
    }

    /// Whether two graphs describe the same storage layout.
    pub fn structurally_eq(&self, other: &Devicegraph) -> bool {
        self.structure() == other.structure()
    }

    /// Copy under a new identity without origin records, as a fresh probe
    /// would produce it.
    pub fn snapshot(&self) -> Self {
        let mut copy = self.clone();
        for node in copy.nodes.values_mut() {
            node.origin = None;
        }
        copy
    }
}

impl Clone for Devicegraph {
    /// Structurally identical copy under a new graph identity.
    ///
    /// Node numbers are kept and every copied node records the node it was
    /// copied from in `origin`; nodes created later in the copy have none.
    fn clone(&self) -> Self {
        Self {
            id: GraphId::next(),
            nodes: self
                .nodes
                .iter()
                .map(|(id, n)| {
                    (
                        *id,
                        Node {
                            id: *id,
                            origin: Some(*id),
                            device: n.device.clone(),
                        },
                    )
                })
                .collect(),
            edges: self.edges.clone(),
            next_node: self.next_node,
        }
    }
}

impl fmt::Display for Devicegraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Devicegraph {} ({} nodes)", self.id, self.nodes.len())?;
        for node in self.nodes.values() {
            writeln!(f, "  {} {}", node.id, node.device)?;
        }
        for edge in &self.edges {
            writeln!(f, "  {} --{}--> {}", edge.from, edge.relation, edge.to)?;
        }
        Ok(())
    }
}

// ============================================================================
// Serialization
// ============================================================================

/// Owned wire form; deserialized graphs are rebuilt through `add_edge` so a
/// hand-edited snapshot cannot smuggle in an invalid relation.
#[derive(Deserialize)]
struct GraphRepr {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

#[derive(Serialize)]
struct GraphReprRef<'a> {
    nodes: Vec<&'a Node>,
    edges: &'a [Edge],
}

impl Serialize for Devicegraph {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        GraphReprRef {
            nodes: self.nodes.values().collect(),
            edges: &self.edges,
        }
        .serialize(serializer)
    }
}

impl TryFrom<GraphRepr> for Devicegraph {
    type Error = GraphError;

    fn try_from(repr: GraphRepr) -> Result<Self, Self::Error> {
        let mut graph = Devicegraph::new();
        for node in repr.nodes {
            graph.check_unique(&node.device)?;
            graph.next_node = graph.next_node.max(node.id.0 + 1);
            graph.nodes.insert(node.id, node);
        }
        for edge in repr.edges {
            graph.add_edge(edge.from, edge.to, edge.relation)?;
        }
        Ok(graph)
    }
}
