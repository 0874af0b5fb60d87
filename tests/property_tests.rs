//! Property-Based Tests for devgraph
//!
//! These tests verify:
//! - Enum string round-trips (parse → to_string → parse)
//! - A clone of the probed graph never plans an action
//! - Plans are ordered by stage and deterministic
//! - Committing staged edits and re-probing reproduces the staged structure

mod common;

use common::{sample_system, FakeSystem};
use devgraph::engine::{diff, plan, Change};
use devgraph::{find_by_name, FsType, MountPoint, PartitionId, Storage};
use proptest::prelude::*;

// =============================================================================
// Enum Property Tests
// =============================================================================

fn fs_type_strategy() -> impl Strategy<Value = FsType> {
    prop_oneof![
        Just(FsType::Ext2),
        Just(FsType::Ext3),
        Just(FsType::Ext4),
        Just(FsType::Btrfs),
        Just(FsType::Reiserfs),
        Just(FsType::Xfs),
        Just(FsType::Swap),
        Just(FsType::Vfat),
        Just(FsType::Ntfs),
        Just(FsType::Jfs),
    ]
}

/// Kinds a mount point can be staged on.
fn mountable_strategy() -> impl Strategy<Value = FsType> {
    prop_oneof![
        Just(FsType::Ext4),
        Just(FsType::Btrfs),
        Just(FsType::Xfs),
        Just(FsType::Vfat),
    ]
}

proptest! {
    /// FsType: to_string → parse round-trip is identity
    #[test]
    fn fs_type_roundtrip(fs in fs_type_strategy()) {
        let parsed: FsType = fs.to_string().parse().expect("Should parse");
        prop_assert_eq!(fs, parsed);
    }

    /// PartitionId: any code survives Display → parse
    #[test]
    fn partition_id_roundtrip(code in 0u32..0x100) {
        let id = PartitionId(code);
        let parsed: PartitionId = id.to_string().parse().expect("Should parse");
        prop_assert_eq!(id, parsed);
    }
}

// =============================================================================
// Planner Property Tests
// =============================================================================

/// Edits a user might stage on the sample system.
#[derive(Debug, Clone)]
struct Edits {
    data_label: Option<String>,
    data_options: Option<Vec<String>>,
    data_automount: Option<bool>,
    scratch: Option<(FsType, bool)>,
}

fn edits_strategy() -> impl Strategy<Value = Edits> {
    let options = proptest::sample::subsequence(vec!["noatime", "nodev", "nosuid", "ro"], 0..=3)
        .prop_map(|opts| opts.into_iter().map(String::from).collect::<Vec<_>>());
    (
        proptest::option::of("[a-z0-9]{1,12}"),
        proptest::option::of(options),
        proptest::option::of(any::<bool>()),
        proptest::option::of((mountable_strategy(), any::<bool>())),
    )
        .prop_map(|(data_label, data_options, data_automount, scratch)| Edits {
            data_label,
            data_options,
            data_automount,
            scratch,
        })
}

fn apply_edits(storage: &mut Storage, edits: &Edits) {
    let staging = storage.get_staging().expect("staging");
    let data = find_by_name(staging, "/dev/sdc2")
        .and_then(|d| d.blk_filesystem(staging).ok().flatten())
        .expect("data filesystem");
    if let Some(label) = &edits.data_label {
        data.set_label(staging, label).expect("label fits xfs");
    }
    let mp = MountPoint::find_by_path(staging, "/data").expect("/data");
    if let Some(options) = &edits.data_options {
        mp.set_mount_options(staging, options).expect("options");
    }
    if let Some(automount) = edits.data_automount {
        mp.set_automount(staging, automount).expect("automount");
    }
    if let Some((kind, automount)) = edits.scratch {
        let fs = find_by_name(staging, "/dev/sdc1")
            .expect("sdc1")
            .create_blk_filesystem(staging, kind)
            .expect("filesystem");
        let mp = fs.create_mount_point(staging, "/scratch").expect("mount point");
        mp.set_automount(staging, automount).expect("automount");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// An untouched clone is Unchanged everywhere and plans nothing
    #[test]
    fn clone_plans_nothing(_seed in any::<u8>()) {
        let probed = sample_system();
        let staging = probed.clone();
        prop_assert!(plan(&probed, &staging).expect("plannable").is_empty());
        prop_assert!(diff(&probed, &staging)
            .iter()
            .all(|change| change.change == Change::Unchanged));
    }

    /// Stages never go backwards and planning twice gives the same list
    #[test]
    fn plan_is_ordered_and_deterministic(edits in edits_strategy()) {
        let system = FakeSystem::new(sample_system());
        let mut storage = system.storage("property-ordered", false);
        storage.probe().expect("probe");
        apply_edits(&mut storage, &edits);

        let first = storage.calculate_plan().expect("plannable");
        let second = storage.calculate_plan().expect("plannable");
        prop_assert_eq!(&first, &second);
        prop_assert!(first
            .actions
            .windows(2)
            .all(|pair| pair[0].stage() <= pair[1].stage()));
    }

    /// Commit then re-probe: the probed graph matches what was staged
    #[test]
    fn commit_round_trip(edits in edits_strategy()) {
        let system = FakeSystem::new(sample_system());
        let mut storage = system.storage("property-round-trip", false);
        storage.probe().expect("probe");
        apply_edits(&mut storage, &edits);
        let staged = storage.get_staging().expect("staging").structure();

        storage.commit().expect("commit");

        prop_assert_eq!(storage.get_probed().expect("probed").structure(), staged);
        prop_assert!(storage.calculate_plan().expect("plannable").is_empty());
    }
}
