//! Staging tests
//!
//! Mutations through device handles on a session's staging graph: accepted
//! changes show up in the plan, rejected ones leave staging untouched.

mod common;

use common::{sample_system, FakeSystem, GIB, MIB};
use devgraph::devicegraph::GraphError;
use devgraph::{
    find_by_name, Action, ChangeSet, DevgraphError, Disk, FsType, MountPoint, Partition,
    PartitionId, PartitionSpec, PartitionType, StagingError, StagingOp,
};

// =============================================================================
// Rejected mutations
// =============================================================================

#[test]
fn test_second_filesystem_on_device_conflicts() {
    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-second-fs", false);
    storage.probe().unwrap();

    let staging = storage.get_staging().unwrap();
    let before = staging.structure();
    let sdc2 = find_by_name(staging, "/dev/sdc2").unwrap();
    let err = sdc2.create_blk_filesystem(staging, FsType::Ext4).unwrap_err();

    assert!(matches!(err, StagingError::Conflict { ref device, .. } if device == "/dev/sdc2"));
    assert_eq!(staging.structure(), before);
    assert!(storage.calculate_plan().unwrap().is_empty());
}

#[test]
fn test_duplicate_mount_point_is_rejected() {
    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-duplicate-mount", false);
    storage.probe().unwrap();

    let staging = storage.get_staging().unwrap();
    let fs = find_by_name(staging, "/dev/sdc1")
        .unwrap()
        .create_blk_filesystem(staging, FsType::Ext4)
        .unwrap();
    let err = fs.create_mount_point(staging, "/data").unwrap_err();
    assert_eq!(err, StagingError::DuplicateMountPoint("/data".into()));

    // Only the filesystem creation is planned.
    let plan = storage.calculate_plan().unwrap();
    assert_eq!(plan.len(), 1);
    assert!(matches!(plan.actions[0], Action::CreateFilesystem { .. }));
}

#[test]
fn test_unsupported_options_are_rejected() {
    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-unsupported", false);
    storage.probe().unwrap();

    let staging = storage.get_staging().unwrap();
    let swap = find_by_name(staging, "/dev/sdc1")
        .unwrap()
        .create_blk_filesystem(staging, FsType::Swap)
        .unwrap();
    assert!(matches!(
        swap.create_mount_point(staging, "/swap"),
        Err(StagingError::UnsupportedOption { .. })
    ));
    assert!(matches!(
        swap.set_tune_options(staging, "-m 10"),
        Err(StagingError::UnsupportedOption { .. })
    ));

    let data = find_by_name(staging, "/dev/sdc2")
        .unwrap()
        .blk_filesystem(staging)
        .unwrap()
        .unwrap();
    assert!(matches!(
        data.set_label(staging, "a-label-far-too-long-for-xfs"),
        Err(StagingError::InvalidValue(_))
    ));
    assert_eq!(data.label(staging).unwrap(), "data");
}

#[test]
fn test_handle_from_probed_is_foreign_to_staging() {
    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-foreign", false);
    storage.probe().unwrap();

    let probed_sdc1 = find_by_name(storage.get_probed().unwrap(), "/dev/sdc1").unwrap();
    let staging = storage.get_staging().unwrap();
    let err = probed_sdc1
        .create_blk_filesystem(staging, FsType::Ext4)
        .unwrap_err();
    assert!(matches!(
        err,
        StagingError::Graph(GraphError::ForeignHandle { .. })
    ));
}

#[test]
fn test_overlapping_partition_is_rejected() {
    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-overlap", false);
    storage.probe().unwrap();

    let staging = storage.get_staging().unwrap();
    let sdc = Disk::find_by_name(staging, "/dev/sdc").unwrap().unwrap();
    let err = sdc
        .create_partition(
            staging,
            PartitionSpec {
                number: 3,
                start: 2 * GIB,
                size: GIB,
                partition_type: PartitionType::Primary,
                id: PartitionId::LINUX,
            },
        )
        .unwrap_err();
    assert!(matches!(err, StagingError::Conflict { .. }));
    assert_eq!(sdc.partitions(staging).unwrap().len(), 2);
}

// =============================================================================
// Accepted mutations
// =============================================================================

#[test]
fn test_staged_partition_gets_device_name() {
    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-new-partition", false);
    storage.probe().unwrap();

    let staging = storage.get_staging().unwrap();
    let sdc = Disk::find_by_name(staging, "/dev/sdc").unwrap().unwrap();
    let part = sdc
        .create_partition(
            staging,
            PartitionSpec {
                number: 3,
                start: MIB + 8 * GIB,
                size: 2 * GIB,
                partition_type: PartitionType::Primary,
                id: PartitionId::LINUX,
            },
        )
        .unwrap();
    assert_eq!(part.name(staging).unwrap(), "/dev/sdc3");
    assert!(Partition::find_by_name(staging, "/dev/sdc3").unwrap().is_some());

    let texts: Vec<String> = storage
        .calculate_plan()
        .unwrap()
        .iter()
        .map(Action::text)
        .collect();
    assert_eq!(texts, vec!["Create partition /dev/sdc3 (2.00 GiB) with id linux"]);
}

#[test]
fn test_removing_filesystem_drops_its_mount_points() {
    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-remove-fs", false);
    storage.probe().unwrap();

    let staging = storage.get_staging().unwrap();
    find_by_name(staging, "/dev/sdc2")
        .unwrap()
        .remove_blk_filesystem(staging)
        .unwrap();
    assert!(MountPoint::find_by_path(staging, "/data").is_none());

    let plan = storage.calculate_plan().unwrap();
    assert!(plan.is_destructive());
    assert_eq!(plan.len(), 2);
    assert!(matches!(plan.actions[0], Action::Unmount { .. }));
    assert!(matches!(plan.actions[1], Action::DeleteFilesystem { .. }));
}

#[test]
fn test_discard_staging_forgets_changes() {
    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-discard", false);
    storage.probe().unwrap();

    let staging = storage.get_staging().unwrap();
    let mp = MountPoint::find_by_path(staging, "/data").unwrap();
    mp.set_automount(staging, true).unwrap();
    assert_eq!(storage.calculate_plan().unwrap().len(), 1);

    storage.discard_staging();
    assert!(storage.calculate_plan().unwrap().is_empty());
    let staging = storage.get_staging().unwrap();
    let mp = MountPoint::find_by_path(staging, "/data").unwrap();
    assert!(!mp.automount(staging).unwrap());
}

// =============================================================================
// Change requests
// =============================================================================

#[test]
fn test_change_request_from_json() {
    let json = r#"[
        { "op": "set-id", "device": "/dev/sdc1", "id": "linux" },
        { "op": "create-filesystem", "device": "/dev/sdc1", "fs_type": "ext4", "label": "scratch" },
        { "op": "create-mount-point", "device": "/dev/sdc1", "path": "/scratch", "automount": true }
    ]"#;
    let changes: ChangeSet = serde_json::from_str(json).unwrap();
    assert_eq!(changes.ops.len(), 3);

    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-change-request", false);
    storage.probe().unwrap();
    changes.apply(storage.get_staging().unwrap()).unwrap();

    let texts: Vec<String> = storage
        .calculate_plan()
        .unwrap()
        .iter()
        .map(Action::text)
        .collect();
    assert_eq!(texts.len(), 4);
    assert!(texts[0].starts_with("Set id of partition /dev/sdc1"));
    assert!(texts[1].starts_with("Create ext4 on /dev/sdc1"));
    assert!(texts[2].starts_with("Mount /dev/sdc1 at /scratch"));
    assert!(texts[3].contains("/etc/fstab"));
}

#[test]
fn test_rejected_change_names_the_operation() {
    let changes = ChangeSet {
        ops: vec![StagingOp::RemoveMountPoint {
            path: "/nowhere".into(),
        }],
    };
    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-rejected-change", false);
    storage.probe().unwrap();

    let err = changes.apply(storage.get_staging().unwrap()).unwrap_err();
    assert!(format!("{:#}", err).contains("change #1"));
    assert!(storage.calculate_plan().unwrap().is_empty());
}

#[test]
fn test_staging_before_probe_fails() {
    let system = FakeSystem::new(sample_system());
    let mut storage = system.storage("staging-before-probe", false);
    assert!(matches!(storage.get_staging(), Err(DevgraphError::NotProbed)));
}
