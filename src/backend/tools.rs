//! Type-safe arguments for the storage tools the backend drives.
//!
//! Every external program call goes through a struct implementing `ToolArgs`.
//! The struct IS the contract: flag spelling per filesystem family lives in
//! exactly one `to_cli_args` instead of being scattered as string vectors.
//!
//! # Invariants
//!
//! - Tools run with `LC_ALL=C` so their output and errors are parseable.
//! - Sizes handed to `sfdisk` are in 512-byte sectors.

use crate::engine::action::Action;
use crate::prober::lsblk::{LSBLK_COLUMNS, SECTOR_SIZE};
use crate::types::{FsType, PartitionType};

/// Trait for typed tool arguments.
///
/// - `to_cli_args()`: arguments exactly as the tool expects them.
/// - `get_env_vars()`: environment the tool runs with.
/// - `tool_name()`: program name without path; resolved at execution time.
/// - `stdin()`: script fed to the tool, if it reads one.
pub trait ToolArgs {
    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![("LC_ALL".to_string(), "C".to_string())]
    }

    fn tool_name(&self) -> &'static str;

    fn stdin(&self) -> Option<String> {
        None
    }
}

/// `lsblk` in JSON mode with the columns the prober parses.
#[derive(Debug, Clone)]
pub struct LsblkArgs {
    pub columns: &'static str,
}

impl Default for LsblkArgs {
    fn default() -> Self {
        Self {
            columns: LSBLK_COLUMNS,
        }
    }
}

impl ToolArgs for LsblkArgs {
    fn to_cli_args(&self) -> Vec<String> {
        // Without --list partitions are nested under their disk's "children".
        vec![
            "--json".to_string(),
            "--list".to_string(),
            "--bytes".to_string(),
            "--output".to_string(),
            self.columns.to_string(),
        ]
    }

    fn tool_name(&self) -> &'static str {
        "lsblk"
    }
}

/// Filesystem creation.
///
/// # Flag Mapping
///
/// | Kind     | Program        | Force      | Label |
/// |----------|----------------|------------|-------|
/// | ext2/3/4 | `mkfs.extN`    | `-F`       | `-L`  |
/// | reiserfs | `mkfs.reiserfs`| `-ff`      | `-l`  |
/// | xfs      | `mkfs.xfs`     | `-f`       | `-L`  |
/// | btrfs    | `mkfs.btrfs`   | `-f`       | `-L`  |
/// | swap     | `mkswap`       |            | `-L`  |
/// | vfat     | `mkfs.vfat`    |            | `-n`  |
/// | ntfs     | `mkfs.ntfs`    | `-Q`       | `-L`  |
/// | jfs      | `mkfs.jfs`     | `-q`       | `-L`  |
#[derive(Debug, Clone)]
pub struct MkfsArgs {
    pub fs_type: FsType,
    pub device: String,
    pub label: String,
}

impl ToolArgs for MkfsArgs {
    fn to_cli_args(&self) -> Vec<String> {
        let (force, label_flag): (&[&str], &str) = match self.fs_type {
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => (&["-F"], "-L"),
            FsType::Reiserfs => (&["-ff"], "-l"),
            FsType::Xfs | FsType::Btrfs => (&["-f"], "-L"),
            FsType::Swap => (&[], "-L"),
            FsType::Vfat => (&[], "-n"),
            FsType::Ntfs => (&["-Q"], "-L"),
            FsType::Jfs => (&["-q"], "-L"),
            FsType::Iso9660 | FsType::Udf => (&[], ""),
        };
        let mut args: Vec<String> = force.iter().map(|s| s.to_string()).collect();
        if !self.label.is_empty() && !label_flag.is_empty() {
            args.push(label_flag.to_string());
            args.push(self.label.clone());
        }
        args.push(self.device.clone());
        args
    }

    fn tool_name(&self) -> &'static str {
        match self.fs_type {
            FsType::Ext2 => "mkfs.ext2",
            FsType::Ext3 => "mkfs.ext3",
            FsType::Ext4 => "mkfs.ext4",
            FsType::Btrfs => "mkfs.btrfs",
            FsType::Reiserfs => "mkfs.reiserfs",
            FsType::Xfs => "mkfs.xfs",
            FsType::Swap => "mkswap",
            FsType::Vfat => "mkfs.vfat",
            FsType::Ntfs => "mkfs.ntfs",
            FsType::Jfs => "mkfs.jfs",
            FsType::Iso9660 => "mkisofs",
            FsType::Udf => "mkudffs",
        }
    }
}

/// Tuning flags passed verbatim to the family's tuning tool, device last.
#[derive(Debug, Clone)]
pub struct TuneArgs {
    pub fs_type: FsType,
    pub device: String,
    pub options: String,
}

impl ToolArgs for TuneArgs {
    fn to_cli_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.options.split_whitespace().map(String::from).collect();
        args.push(self.device.clone());
        args
    }

    fn tool_name(&self) -> &'static str {
        match self.fs_type {
            FsType::Reiserfs => "reiserfstune",
            FsType::Xfs => "xfs_admin",
            _ => "tune2fs",
        }
    }
}

/// Relabel an existing filesystem.
#[derive(Debug, Clone)]
pub struct LabelArgs {
    pub fs_type: FsType,
    pub device: String,
    pub label: String,
}

impl ToolArgs for LabelArgs {
    fn to_cli_args(&self) -> Vec<String> {
        let device = self.device.clone();
        let label = self.label.clone();
        match self.fs_type {
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => vec!["-L".into(), label, device],
            FsType::Reiserfs => vec!["-l".into(), label, device],
            // xfs_admin treats "--" as "clear the label"
            FsType::Xfs if label.is_empty() => vec!["-L".into(), "--".into(), device],
            FsType::Xfs => vec!["-L".into(), label, device],
            FsType::Btrfs => vec!["filesystem".into(), "label".into(), device, label],
            FsType::Swap => vec!["-L".into(), label, device],
            FsType::Jfs => vec!["-L".into(), label, device],
            _ => vec![device, label],
        }
    }

    fn tool_name(&self) -> &'static str {
        match self.fs_type {
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => "tune2fs",
            FsType::Reiserfs => "reiserfstune",
            FsType::Xfs => "xfs_admin",
            FsType::Btrfs => "btrfs",
            FsType::Vfat => "fatlabel",
            FsType::Swap => "swaplabel",
            FsType::Ntfs => "ntfslabel",
            FsType::Jfs => "jfs_tune",
            FsType::Iso9660 | FsType::Udf => "true",
        }
    }
}

/// Remove every signature from a device.
#[derive(Debug, Clone)]
pub struct WipefsArgs {
    pub device: String,
}

impl ToolArgs for WipefsArgs {
    fn to_cli_args(&self) -> Vec<String> {
        vec!["--all".to_string(), self.device.clone()]
    }

    fn tool_name(&self) -> &'static str {
        "wipefs"
    }
}

/// Write the type code of partition `number`.
#[derive(Debug, Clone)]
pub struct SfdiskPartTypeArgs {
    pub disk: String,
    pub number: u32,
    pub code: String,
}

impl ToolArgs for SfdiskPartTypeArgs {
    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--part-type".to_string(),
            self.disk.clone(),
            self.number.to_string(),
            self.code.clone(),
        ]
    }

    fn tool_name(&self) -> &'static str {
        "sfdisk"
    }
}

#[derive(Debug, Clone)]
pub struct SfdiskDeleteArgs {
    pub disk: String,
    pub number: u32,
}

impl ToolArgs for SfdiskDeleteArgs {
    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--delete".to_string(),
            self.disk.clone(),
            self.number.to_string(),
        ]
    }

    fn tool_name(&self) -> &'static str {
        "sfdisk"
    }
}

/// Create or resize partition `number` from a one-line sfdisk script.
///
/// Fields left out of the script keep their current value, so a resize
/// passes only start and size.
#[derive(Debug, Clone)]
pub struct SfdiskPartitionArgs {
    pub disk: String,
    pub number: u32,
    /// Bytes
    pub start: u64,
    /// Bytes
    pub size: u64,
    pub code: Option<String>,
    pub partition_type: Option<PartitionType>,
}

impl ToolArgs for SfdiskPartitionArgs {
    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--no-reread".to_string(),
            "-N".to_string(),
            self.number.to_string(),
            self.disk.clone(),
        ]
    }

    fn tool_name(&self) -> &'static str {
        "sfdisk"
    }

    fn stdin(&self) -> Option<String> {
        let mut script = format!(
            "start={}, size={}",
            self.start / SECTOR_SIZE,
            self.size / SECTOR_SIZE
        );
        // msdos extended containers are recognised by their type code alone
        let code = match self.partition_type {
            Some(PartitionType::Extended) => Some("5".to_string()),
            _ => self.code.clone(),
        };
        if let Some(code) = code {
            script.push_str(&format!(", type={}", code));
        }
        script.push('\n');
        Some(script)
    }
}

#[derive(Debug, Clone)]
pub struct MountArgs {
    pub device: String,
    pub path: String,
    pub fs_type: FsType,
    pub options: Vec<String>,
}

impl ToolArgs for MountArgs {
    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["-t".to_string(), self.fs_type.mount_type().to_string()];
        if !self.options.is_empty() {
            args.push("-o".to_string());
            args.push(self.options.join(","));
        }
        args.push(self.device.clone());
        args.push(self.path.clone());
        args
    }

    fn tool_name(&self) -> &'static str {
        "mount"
    }
}

#[derive(Debug, Clone)]
pub struct RemountArgs {
    pub path: String,
    pub options: Vec<String>,
}

impl ToolArgs for RemountArgs {
    fn to_cli_args(&self) -> Vec<String> {
        let mut options = vec!["remount".to_string()];
        options.extend(self.options.iter().cloned());
        vec!["-o".to_string(), options.join(","), self.path.clone()]
    }

    fn tool_name(&self) -> &'static str {
        "mount"
    }
}

#[derive(Debug, Clone)]
pub struct UmountArgs {
    pub path: String,
}

impl ToolArgs for UmountArgs {
    fn to_cli_args(&self) -> Vec<String> {
        vec![self.path.clone()]
    }

    fn tool_name(&self) -> &'static str {
        "umount"
    }
}

/// Programs `action` will run. fstab edits need none.
pub fn binaries_for(action: &Action) -> Vec<&'static str> {
    let device = String::new();
    match action {
        Action::RemoveFstabEntry { .. }
        | Action::AddFstabEntry { .. }
        | Action::UpdateFstabEntry { .. } => Vec::new(),
        Action::Unmount { .. } => vec!["umount"],
        Action::Mount { .. } | Action::Remount { .. } => vec!["mount"],
        Action::DeleteFilesystem { .. } => vec!["wipefs"],
        Action::DeletePartition { .. }
        | Action::ResizePartition { .. }
        | Action::CreatePartition { .. }
        | Action::SetPartitionId { .. } => vec!["sfdisk"],
        Action::CreateFilesystem {
            fs_type,
            tune_options,
            ..
        } => {
            let mut tools = vec![
                MkfsArgs {
                    fs_type: *fs_type,
                    device: device.clone(),
                    label: String::new(),
                }
                .tool_name(),
            ];
            if !tune_options.is_empty() {
                tools.push(
                    TuneArgs {
                        fs_type: *fs_type,
                        device,
                        options: String::new(),
                    }
                    .tool_name(),
                );
            }
            tools
        }
        Action::SetLabel { fs_type, .. } => vec![
            LabelArgs {
                fs_type: *fs_type,
                device,
                label: String::new(),
            }
            .tool_name(),
        ],
        Action::Tune { fs_type, .. } => vec![
            TuneArgs {
                fs_type: *fs_type,
                device,
                options: String::new(),
            }
            .tool_name(),
        ],
    }
}
