//! Actions: single backend operations derived from a graph diff.
//!
//! Each action carries everything its backend operation needs, so executing
//! a plan never looks back into either graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::{FsType, PartitionId, PartitionType, PtType};

/// Execution stage of an action. Plans are sorted by stage first.
///
/// The order tears down from the top of the stack (fstab, mounts) to the
/// bottom (partitions), then builds back up. A device's own modifications
/// come before anything created on top of it.
///
/// Within one stage, partition actions are grouped by disk and ordered by
/// partition number (descending for deletions), and mount actions by path
/// depth. Node id only breaks the remaining ties, so the actions of one disk
/// stay together even when its nodes were created interleaved with another's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionStage {
    RemoveFstabEntry,
    Unmount,
    DeleteFilesystem,
    DeletePartition,
    ResizePartition,
    CreatePartition,
    SetPartitionId,
    CreateFilesystem,
    SetLabel,
    Tune,
    Mount,
    Remount,
    WriteFstabEntry,
}

/// Location of a partition in its table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSlot {
    /// Host device path, e.g. `/dev/sdc`
    pub disk: String,
    pub pt_type: PtType,
    pub number: u32,
    /// Partition device path, e.g. `/dev/sdc1`
    pub name: String,
}

/// One backend operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    RemoveFstabEntry {
        device: String,
        path: String,
    },
    Unmount {
        device: String,
        path: String,
    },
    DeleteFilesystem {
        device: String,
        fs_type: FsType,
    },
    DeletePartition {
        slot: PartitionSlot,
    },
    ResizePartition {
        slot: PartitionSlot,
        start: u64,
        old_size: u64,
        size: u64,
    },
    CreatePartition {
        slot: PartitionSlot,
        start: u64,
        size: u64,
        partition_type: PartitionType,
        id: PartitionId,
    },
    SetPartitionId {
        slot: PartitionSlot,
        id: PartitionId,
    },
    CreateFilesystem {
        device: String,
        fs_type: FsType,
        label: String,
        tune_options: String,
    },
    SetLabel {
        device: String,
        fs_type: FsType,
        label: String,
    },
    Tune {
        device: String,
        fs_type: FsType,
        tune_options: String,
    },
    Mount {
        device: String,
        fs_type: FsType,
        path: String,
        options: Vec<String>,
    },
    Remount {
        device: String,
        path: String,
        options: Vec<String>,
    },
    AddFstabEntry {
        device: String,
        fs_type: FsType,
        path: String,
        options: Vec<String>,
    },
    UpdateFstabEntry {
        device: String,
        fs_type: FsType,
        path: String,
        options: Vec<String>,
    },
}

impl Action {
    pub fn stage(&self) -> ActionStage {
        match self {
            Self::RemoveFstabEntry { .. } => ActionStage::RemoveFstabEntry,
            Self::Unmount { .. } => ActionStage::Unmount,
            Self::DeleteFilesystem { .. } => ActionStage::DeleteFilesystem,
            Self::DeletePartition { .. } => ActionStage::DeletePartition,
            Self::ResizePartition { .. } => ActionStage::ResizePartition,
            Self::CreatePartition { .. } => ActionStage::CreatePartition,
            Self::SetPartitionId { .. } => ActionStage::SetPartitionId,
            Self::CreateFilesystem { .. } => ActionStage::CreateFilesystem,
            Self::SetLabel { .. } => ActionStage::SetLabel,
            Self::Tune { .. } => ActionStage::Tune,
            Self::Mount { .. } => ActionStage::Mount,
            Self::Remount { .. } => ActionStage::Remount,
            Self::AddFstabEntry { .. } | Self::UpdateFstabEntry { .. } => {
                ActionStage::WriteFstabEntry
            }
        }
    }

    /// Device path the action operates on.
    pub fn device(&self) -> &str {
        match self {
            Self::DeletePartition { slot }
            | Self::ResizePartition { slot, .. }
            | Self::CreatePartition { slot, .. }
            | Self::SetPartitionId { slot, .. } => &slot.name,
            Self::RemoveFstabEntry { device, .. }
            | Self::Unmount { device, .. }
            | Self::DeleteFilesystem { device, .. }
            | Self::CreateFilesystem { device, .. }
            | Self::SetLabel { device, .. }
            | Self::Tune { device, .. }
            | Self::Mount { device, .. }
            | Self::Remount { device, .. }
            | Self::AddFstabEntry { device, .. }
            | Self::UpdateFstabEntry { device, .. } => device,
        }
    }

    /// Filesystem kind whose tools the action needs, if any.
    pub fn feature(&self) -> Option<FsType> {
        match self {
            Self::CreateFilesystem { fs_type, .. }
            | Self::SetLabel { fs_type, .. }
            | Self::Tune { fs_type, .. } => Some(*fs_type),
            _ => None,
        }
    }

    /// Whether the action destroys data.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::DeleteFilesystem { .. }
                | Self::DeletePartition { .. }
                | Self::CreateFilesystem { .. }
        )
    }

    /// Human-readable description.
    pub fn text(&self) -> String {
        match self {
            Self::RemoveFstabEntry { path, .. } => {
                format!("Remove mount point {} from /etc/fstab", path)
            }
            Self::Unmount { device, path } => format!("Unmount {} at {}", device, path),
            Self::DeleteFilesystem { device, fs_type } => {
                format!("Delete {} on {}", fs_type, device)
            }
            Self::DeletePartition { slot } => format!("Delete partition {}", slot.name),
            Self::ResizePartition {
                slot,
                old_size,
                size,
                ..
            } => {
                let verb = if size < old_size { "Shrink" } else { "Grow" };
                format!(
                    "{} partition {} from {} to {}",
                    verb,
                    slot.name,
                    format_size(*old_size),
                    format_size(*size)
                )
            }
            Self::CreatePartition {
                slot,
                size,
                partition_type,
                id,
                ..
            } => {
                let kind = match partition_type {
                    PartitionType::Primary => String::new(),
                    other => format!("{} ", other),
                };
                format!(
                    "Create {}partition {} ({}) with id {}",
                    kind,
                    slot.name,
                    format_size(*size),
                    id
                )
            }
            Self::SetPartitionId { slot, id } => {
                format!("Set id of partition {} to {}", slot.name, id)
            }
            Self::CreateFilesystem {
                device,
                fs_type,
                label,
                tune_options,
            } => {
                let mut text = format!("Create {} on {}", fs_type, device);
                if !label.is_empty() {
                    text.push_str(&format!(" with label \"{}\"", label));
                }
                if !tune_options.is_empty() {
                    text.push_str(&format!(" tuned with \"{}\"", tune_options));
                }
                text
            }
            Self::SetLabel {
                device,
                fs_type,
                label,
            } => format!("Set label of {} on {} to \"{}\"", fs_type, device, label),
            Self::Tune {
                device,
                fs_type,
                tune_options,
            } => format!("Tune {} on {} with \"{}\"", fs_type, device, tune_options),
            Self::Mount {
                device,
                path,
                options,
                ..
            } => {
                let mut text = format!("Mount {} at {}", device, path);
                if !options.is_empty() {
                    text.push_str(&format!(" with options {}", options.join(",")));
                }
                text
            }
            Self::Remount {
                path, options, ..
            } => format!("Remount {} with options {}", path, join_options(options)),
            Self::AddFstabEntry { path, .. } => format!("Add mount point {} to /etc/fstab", path),
            Self::UpdateFstabEntry { path, options, .. } => format!(
                "Update /etc/fstab entry of {} to options {}",
                path,
                join_options(options)
            ),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Options as written to mount(8) and fstab.
pub fn join_options(options: &[String]) -> String {
    if options.is_empty() {
        "defaults".to_string()
    } else {
        options.join(",")
    }
}

/// Render a byte count with a binary unit, e.g. `1.00 GiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// An ordered action list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub actions: Vec<Action>,
}

impl ActionPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    /// Returns true if any action destroys data.
    pub fn is_destructive(&self) -> bool {
        self.actions.iter().any(Action::is_destructive)
    }

    /// Filesystem kinds whose tools the plan needs.
    pub fn required_features(&self) -> BTreeSet<FsType> {
        self.actions.iter().filter_map(Action::feature).collect()
    }

    /// Returns a summary of the plan for logging/display.
    pub fn summary(&self) -> String {
        if self.actions.is_empty() {
            return "Action plan: nothing to do".to_string();
        }
        let mut lines = vec![format!("Action plan ({} actions):", self.actions.len())];
        for (i, action) in self.actions.iter().enumerate() {
            lines.push(format!("  {}. {}", i + 1, action));
        }
        lines.join("\n")
    }
}

impl<'a> IntoIterator for &'a ActionPlan {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> PartitionSlot {
        PartitionSlot {
            disk: "/dev/sdc".into(),
            pt_type: PtType::Msdos,
            number: 1,
            name: "/dev/sdc1".into(),
        }
    }

    #[test]
    fn test_action_texts() {
        let create = Action::CreateFilesystem {
            device: "/dev/sdc1".into(),
            fs_type: FsType::Reiserfs,
            label: "TEST".into(),
            tune_options: "-m 10".into(),
        };
        assert_eq!(
            create.text(),
            "Create reiserfs on /dev/sdc1 with label \"TEST\" tuned with \"-m 10\""
        );
        let set_id = Action::SetPartitionId {
            slot: slot(),
            id: PartitionId::LINUX,
        };
        assert_eq!(set_id.to_string(), "Set id of partition /dev/sdc1 to linux");
        let resize = Action::ResizePartition {
            slot: slot(),
            start: 1 << 20,
            old_size: 2 << 30,
            size: 1 << 30,
        };
        assert_eq!(
            resize.text(),
            "Shrink partition /dev/sdc1 from 2.00 GiB to 1.00 GiB"
        );
    }

    #[test]
    fn test_stage_order_tears_down_before_building() {
        assert!(ActionStage::Unmount < ActionStage::DeleteFilesystem);
        assert!(ActionStage::DeletePartition < ActionStage::CreatePartition);
        assert!(ActionStage::SetPartitionId < ActionStage::CreateFilesystem);
        assert!(ActionStage::CreateFilesystem < ActionStage::Mount);
    }

    #[test]
    fn test_plan_summary_and_features() {
        let plan = ActionPlan {
            actions: vec![
                Action::SetPartitionId {
                    slot: slot(),
                    id: PartitionId::LINUX,
                },
                Action::CreateFilesystem {
                    device: "/dev/sdc1".into(),
                    fs_type: FsType::Xfs,
                    label: String::new(),
                    tune_options: String::new(),
                },
            ],
        };
        assert!(plan.summary().contains("2. Create xfs on /dev/sdc1"));
        assert_eq!(plan.required_features().into_iter().collect::<Vec<_>>(), vec![FsType::Xfs]);
        assert!(plan.is_destructive());
        assert_eq!(ActionPlan::default().summary(), "Action plan: nothing to do");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1 << 20), "1.00 MiB");
        assert_eq!(format_size(3 << 29), "1.50 GiB");
    }
}
