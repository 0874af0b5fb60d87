//! Shared fixtures: an in-memory "system" whose prober and backend share state.
//!
//! `FakeBackend` applies every action to the shared graph the way the real
//! tools would change a disk, so probing after a commit shows the result.
//! Tuning flags cannot be read back from a real device and are dropped here
//! as well.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use devgraph::devicegraph::{
    BlockDeviceAttrs, Device, Devicegraph, FilesystemAttrs, MountPointAttrs, PartitionAttrs,
    Relation,
};
use devgraph::prober::{ProbeCallbacks, ProbeError, Prober};
use devgraph::{
    find_by_name, Action, ActionPlan, Backend, BlockDeviceKind, Disk, Environment, FsType,
    MountPoint, Partition, PartitionId, PartitionSpec, PartitionType, PtType, Storage,
};

pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

type FailWhen = Box<dyn Fn(&Action) -> bool>;

#[derive(Default)]
struct State {
    graph: Devicegraph,
    executed: Vec<Action>,
    preflight_calls: usize,
    probes: usize,
    fail_when: Option<FailWhen>,
    missing_tools: Vec<String>,
    probe_fails: bool,
}

/// Handle to the fake system; clones share state.
#[derive(Clone, Default)]
pub struct FakeSystem {
    state: Rc<RefCell<State>>,
}

impl FakeSystem {
    pub fn new(graph: Devicegraph) -> Self {
        let system = Self::default();
        system.state.borrow_mut().graph = graph;
        system
    }

    /// Storage session with a unique key over this system.
    pub fn storage(&self, key: &str, read_only: bool) -> Storage {
        let env = Environment::new(read_only).with_session_key(key);
        Storage::with_parts(
            env,
            Box::new(FakeProber(self.clone())),
            Box::new(FakeBackend(self.clone())),
        )
        .expect("session key already in use")
    }

    pub fn graph(&self) -> Devicegraph {
        self.state.borrow().graph.snapshot()
    }

    pub fn executed(&self) -> Vec<Action> {
        self.state.borrow().executed.clone()
    }

    pub fn probes(&self) -> usize {
        self.state.borrow().probes
    }

    pub fn preflight_calls(&self) -> usize {
        self.state.borrow().preflight_calls
    }

    pub fn fail_when(&self, predicate: impl Fn(&Action) -> bool + 'static) {
        self.state.borrow_mut().fail_when = Some(Box::new(predicate));
    }

    pub fn set_missing_tools(&self, tools: &[&str]) {
        self.state.borrow_mut().missing_tools = tools.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_probe_fails(&self, fails: bool) {
        self.state.borrow_mut().probe_fails = fails;
    }
}

pub struct FakeProber(FakeSystem);

impl Prober for FakeProber {
    fn probe(&mut self, callbacks: &dyn ProbeCallbacks) -> Result<Devicegraph, ProbeError> {
        callbacks.begin();
        let mut state = self.0.state.borrow_mut();
        if state.probe_fails {
            return Err(ProbeError::Io("lsblk: device vanished".into()));
        }
        state.probes += 1;
        callbacks.end();
        Ok(state.graph.snapshot())
    }
}

pub struct FakeBackend(FakeSystem);

impl Backend for FakeBackend {
    fn preflight(&self, _plan: &ActionPlan, _env: &Environment) -> Vec<String> {
        let mut state = self.0.state.borrow_mut();
        state.preflight_calls += 1;
        state.missing_tools.clone()
    }

    fn execute(&mut self, action: &Action, _env: &Environment) -> anyhow::Result<()> {
        let mut state = self.0.state.borrow_mut();
        if state.fail_when.as_ref().is_some_and(|f| f(action)) {
            anyhow::bail!("{} failed (exit code 1): simulated failure", action);
        }
        state.executed.push(action.clone());
        apply(&mut state.graph, action).with_context(|| format!("fake system rejected: {}", action))
    }
}

fn mount_point(graph: &Devicegraph, path: &str) -> anyhow::Result<MountPoint> {
    MountPoint::find_by_path(graph, path).with_context(|| format!("{} is not mounted", path))
}

fn partition(graph: &Devicegraph, name: &str) -> anyhow::Result<Partition> {
    Partition::find_by_name(graph, name)?.with_context(|| format!("no partition {}", name))
}

/// What the real tool would leave on disk after `action`.
fn apply(graph: &mut Devicegraph, action: &Action) -> anyhow::Result<()> {
    match action {
        Action::RemoveFstabEntry { path, .. } => {
            mount_point(graph, path)?.set_automount(graph, false)?;
        }
        Action::Unmount { path, .. } => mount_point(graph, path)?.remove(graph)?,
        Action::DeleteFilesystem { device, .. } => {
            find_by_name(graph, device)
                .context("no device")?
                .remove_blk_filesystem(graph)?;
        }
        Action::DeletePartition { slot } => {
            let part = partition(graph, &slot.name)?;
            part.disk(graph)?.delete_partition(graph, part)?;
        }
        Action::ResizePartition { slot, size, .. } => {
            partition(graph, &slot.name)?.resize(graph, *size)?;
        }
        Action::CreatePartition {
            slot,
            start,
            size,
            partition_type,
            id,
        } => {
            let disk = Disk::find_by_name(graph, &slot.disk)?.context("no disk")?;
            disk.create_partition(
                graph,
                PartitionSpec {
                    number: slot.number,
                    start: *start,
                    size: *size,
                    partition_type: *partition_type,
                    id: *id,
                },
            )?;
        }
        Action::SetPartitionId { slot, id } => partition(graph, &slot.name)?.set_id(graph, *id)?,
        Action::CreateFilesystem {
            device,
            fs_type,
            label,
            ..
        } => {
            let fs = find_by_name(graph, device)
                .context("no device")?
                .create_blk_filesystem(graph, *fs_type)?;
            if !label.is_empty() {
                fs.set_label(graph, label)?;
            }
        }
        Action::SetLabel { device, label, .. } => {
            find_by_name(graph, device)
                .context("no device")?
                .blk_filesystem(graph)?
                .context("no filesystem")?
                .set_label(graph, label)?;
        }
        Action::Tune { .. } => {}
        Action::Mount {
            device,
            path,
            options,
            ..
        } => {
            let mp = find_by_name(graph, device)
                .context("no device")?
                .blk_filesystem(graph)?
                .context("no filesystem")?
                .create_mount_point(graph, path)?;
            mp.set_mount_options(graph, options)?;
        }
        Action::Remount { path, options, .. } => {
            mount_point(graph, path)?.set_mount_options(graph, options)?;
        }
        Action::AddFstabEntry { path, .. } | Action::UpdateFstabEntry { path, .. } => {
            mount_point(graph, path)?.set_automount(graph, true)?;
        }
    }
    Ok(())
}

// =============================================================================
// Graph fixtures
// =============================================================================

/// `/dev/sda` (gpt): sda1 vfat ESP at /boot, sda2 ext4 "root" at / (both in fstab).
/// `/dev/sdc` (msdos): sdc1 LVM id without filesystem, sdc2 xfs "data" mounted
/// at /data without fstab entry.
pub fn sample_system() -> Devicegraph {
    let mut g = Devicegraph::new();

    let sda = disk(&mut g, "/dev/sda", 64 * GIB, PtType::Gpt);
    let sda1 = part(&mut g, sda, "/dev/sda1", 1, MIB, 512 * MIB, PartitionId::ESP);
    let sda2 = part(&mut g, sda, "/dev/sda2", 2, 513 * MIB, 32 * GIB, PartitionId::LINUX);
    let boot = filesystem(&mut g, sda1, FsType::Vfat, "EFI");
    mount(&mut g, boot, "/boot", true);
    let root = filesystem(&mut g, sda2, FsType::Ext4, "root");
    mount(&mut g, root, "/", true);

    let sdc = disk(&mut g, "/dev/sdc", 16 * GIB, PtType::Msdos);
    part(&mut g, sdc, "/dev/sdc1", 1, MIB, 4 * GIB, PartitionId::LVM);
    let sdc2 = part(&mut g, sdc, "/dev/sdc2", 2, MIB + 4 * GIB, 4 * GIB, PartitionId::LINUX);
    let data = filesystem(&mut g, sdc2, FsType::Xfs, "data");
    mount(&mut g, data, "/data", false);

    g
}

pub fn disk(g: &mut Devicegraph, name: &str, size: u64, pt_type: PtType) -> devgraph::NodeId {
    g.add_node(Device::BlockDevice(BlockDeviceAttrs {
        name: name.into(),
        size,
        kind: BlockDeviceKind::Disk,
        pt_type: Some(pt_type),
    }))
    .unwrap()
}

pub fn part(
    g: &mut Devicegraph,
    disk: devgraph::NodeId,
    name: &str,
    number: u32,
    start: u64,
    size: u64,
    id: PartitionId,
) -> devgraph::NodeId {
    let p = g
        .add_node(Device::Partition(PartitionAttrs {
            name: name.into(),
            size,
            start,
            number,
            partition_type: PartitionType::Primary,
            id,
        }))
        .unwrap();
    g.add_edge(disk, p, Relation::Hosts).unwrap();
    p
}

pub fn filesystem(
    g: &mut Devicegraph,
    device: devgraph::NodeId,
    kind: FsType,
    label: &str,
) -> devgraph::NodeId {
    let fs = g
        .add_node(Device::BlkFilesystem(FilesystemAttrs {
            kind,
            label: label.into(),
            uuid: format!("uuid-{}", label),
            tune_options: String::new(),
        }))
        .unwrap();
    g.add_edge(device, fs, Relation::FormattedAs).unwrap();
    fs
}

pub fn mount(g: &mut Devicegraph, fs: devgraph::NodeId, path: &str, automount: bool) -> devgraph::NodeId {
    let mp = g
        .add_node(Device::MountPoint(MountPointAttrs {
            path: path.into(),
            mount_options: Vec::new(),
            automount,
        }))
        .unwrap();
    g.add_edge(fs, mp, Relation::MountedAt).unwrap();
    mp
}
