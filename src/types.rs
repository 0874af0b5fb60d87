//! Storage vocabulary types
//!
//! Filesystem kinds, block device kinds, partition table flavours and
//! partition id codes. Every value that crosses the graph, the planner and
//! the backend is one of these enums rather than a free-form string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};

/// Filesystem kind of a `BlkFilesystem` node.
///
/// The set matches what the prober recognises on block devices. Capability
/// queries (`supports_label`, `supports_tune_options`, ...) are what the
/// staging mutators validate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    #[strum(serialize = "ext2")]
    Ext2,
    #[strum(serialize = "ext3")]
    Ext3,
    #[strum(serialize = "ext4")]
    Ext4,
    #[strum(serialize = "btrfs")]
    Btrfs,
    #[strum(serialize = "reiserfs")]
    Reiserfs,
    #[strum(serialize = "xfs")]
    Xfs,
    #[strum(serialize = "swap")]
    Swap,
    #[strum(to_string = "vfat", serialize = "fat32", serialize = "fat")]
    Vfat,
    #[strum(to_string = "ntfs", serialize = "ntfs3")]
    Ntfs,
    #[strum(serialize = "jfs")]
    Jfs,
    #[strum(serialize = "iso9660")]
    Iso9660,
    #[strum(serialize = "udf")]
    Udf,
}

impl FsType {
    /// Whether the engine can create this filesystem kind.
    ///
    /// Optical formats are only ever probed, never created.
    pub fn is_creatable(self) -> bool {
        !matches!(self, Self::Iso9660 | Self::Udf)
    }

    /// Whether a filesystem of this kind can carry a label.
    pub fn supports_label(self) -> bool {
        self.max_label_len().is_some()
    }

    /// Maximum label length in bytes, `None` if labels are not supported.
    pub fn max_label_len(self) -> Option<usize> {
        match self {
            Self::Ext2 | Self::Ext3 | Self::Ext4 => Some(16),
            Self::Btrfs => Some(255),
            Self::Reiserfs => Some(16),
            Self::Xfs => Some(12),
            Self::Swap => Some(15),
            Self::Vfat => Some(11),
            Self::Ntfs => Some(128),
            Self::Jfs => Some(16),
            Self::Iso9660 | Self::Udf => None,
        }
    }

    /// Whether backend tuning flags mean anything for this kind.
    pub fn supports_tune_options(self) -> bool {
        matches!(
            self,
            Self::Ext2 | Self::Ext3 | Self::Ext4 | Self::Reiserfs | Self::Xfs
        )
    }

    /// Whether a filesystem of this kind can be given a mount point.
    pub fn is_mountable(self) -> bool {
        !matches!(self, Self::Swap)
    }

    /// Type name passed to `mount -t` and written to fstab.
    pub fn mount_type(self) -> &'static str {
        match self {
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
            Self::Ext4 => "ext4",
            Self::Btrfs => "btrfs",
            Self::Reiserfs => "reiserfs",
            Self::Xfs => "xfs",
            Self::Swap => "swap",
            Self::Vfat => "vfat",
            Self::Ntfs => "ntfs",
            Self::Jfs => "jfs",
            Self::Iso9660 => "iso9660",
            Self::Udf => "udf",
        }
    }

    /// Parse a signature name as reported by blkid/lsblk.
    ///
    /// Returns `None` for unknown names. Callers distinguish "not a filesystem"
    /// signatures (LUKS, LVM PV, MD member) with `is_container_signature`.
    pub fn from_signature(name: &str) -> Option<Self> {
        FsType::from_str(name.trim()).ok()
    }
}

/// Signatures that mark a block device as used by something other than a
/// filesystem. The prober ignores these silently.
pub fn is_container_signature(name: &str) -> bool {
    matches!(
        name,
        "crypto_LUKS" | "LVM2_member" | "linux_raid_member" | "bcache" | "zfs_member"
    )
}

/// Kind of a plain block device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BlockDeviceKind {
    Disk,
    Loop,
    Md,
    Dm,
    Rom,
    Other,
}

impl BlockDeviceKind {
    /// Map an lsblk `TYPE` column value.
    pub fn from_lsblk_type(value: &str) -> Self {
        match value {
            "disk" => Self::Disk,
            "loop" => Self::Loop,
            "lvm" | "crypt" | "dm" | "mpath" => Self::Dm,
            "rom" => Self::Rom,
            v if v.starts_with("raid") || v == "md" => Self::Md,
            _ => Self::Other,
        }
    }

    /// Whether this kind of device can hold a partition table.
    pub fn is_partitionable(self) -> bool {
        matches!(self, Self::Disk | Self::Loop | Self::Md)
    }
}

/// Partition table flavour of a partitionable device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum PtType {
    #[strum(to_string = "msdos", serialize = "dos")]
    Msdos,
    #[strum(serialize = "gpt")]
    Gpt,
}

impl PtType {
    /// Highest partition number usable by a primary partition.
    pub fn max_primary(self) -> u32 {
        match self {
            Self::Msdos => 4,
            Self::Gpt => 128,
        }
    }
}

/// Slot type of a partition within its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionType {
    #[default]
    Primary,
    Extended,
    Logical,
}

/// Partition id code.
///
/// Numeric msdos type byte for values up to 0xff; larger values are
/// engine-internal codes for GPT-only types. GPT GUIDs are mapped onto the
/// same codes so one `set_id` works for either table flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl PartitionId {
    pub const DOS12: Self = Self(0x01);
    pub const EXTENDED: Self = Self(0x05);
    pub const NTFS: Self = Self(0x07);
    pub const DOS32: Self = Self(0x0c);
    pub const PREP: Self = Self(0x41);
    pub const SWAP: Self = Self(0x82);
    pub const LINUX: Self = Self(0x83);
    pub const LVM: Self = Self(0x8e);
    pub const ESP: Self = Self(0xef);
    pub const RAID: Self = Self(0xfd);
    pub const UNKNOWN: Self = Self(0x100);
    pub const BIOS_BOOT: Self = Self(0x101);
    pub const WINDOWS_BASIC_DATA: Self = Self(0x102);
    pub const MICROSOFT_RESERVED: Self = Self(0x103);

    const GPT_TYPES: &'static [(PartitionId, &'static str)] = &[
        (Self::LINUX, "0FC63DAF-8483-4772-8E79-3D69D8477DE4"),
        (Self::SWAP, "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F"),
        (Self::LVM, "E6D6D379-F507-44C2-A23C-238F2A3DF928"),
        (Self::RAID, "A19D880F-05FC-4D3B-A006-743F0F84911E"),
        (Self::ESP, "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"),
        (Self::PREP, "9E1A2D38-C612-4316-AA26-8B49521E5A8B"),
        (Self::BIOS_BOOT, "21686148-6449-6E6F-744E-656564454649"),
        (Self::WINDOWS_BASIC_DATA, "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7"),
        (Self::MICROSOFT_RESERVED, "E3C9E316-0B5C-4DB8-817D-F92DF00215AE"),
    ];

    /// msdos type byte, if this id has one.
    pub fn msdos_code(self) -> Option<u8> {
        u8::try_from(self.0).ok()
    }

    /// GPT type GUID, if this id maps to one.
    pub fn gpt_guid(self) -> Option<&'static str> {
        Self::GPT_TYPES
            .iter()
            .find(|(id, _)| *id == self)
            .map(|(_, guid)| *guid)
    }

    /// Map a GPT type GUID back to an id code (`UNKNOWN` if unmapped).
    pub fn from_gpt_guid(guid: &str) -> Self {
        Self::GPT_TYPES
            .iter()
            .find(|(_, g)| g.eq_ignore_ascii_case(guid.trim()))
            .map(|(id, _)| *id)
            .unwrap_or(Self::UNKNOWN)
    }

    /// Whether this id can be written to a table of the given flavour.
    pub fn is_valid_for(self, pt_type: PtType) -> bool {
        match pt_type {
            PtType::Msdos => self.msdos_code().is_some(),
            PtType::Gpt => self.gpt_guid().is_some(),
        }
    }

    /// The value `sfdisk --part-type` expects for a table of the given flavour.
    pub fn table_code(self, pt_type: PtType) -> Option<String> {
        match pt_type {
            PtType::Msdos => self.msdos_code().map(|code| format!("{:x}", code)),
            PtType::Gpt => self.gpt_guid().map(str::to_string),
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LINUX => write!(f, "linux"),
            Self::SWAP => write!(f, "swap"),
            Self::LVM => write!(f, "lvm"),
            Self::RAID => write!(f, "raid"),
            Self::ESP => write!(f, "esp"),
            Self::BIOS_BOOT => write!(f, "bios-boot"),
            Self::UNKNOWN => write!(f, "unknown"),
            other => write!(f, "0x{:02x}", other.0),
        }
    }
}

/// Error for partition id strings that are neither a known name nor hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid partition id '{0}' (expected a name like 'linux' or a hex code like '0x83')")]
pub struct PartitionIdError(pub String);

impl FromStr for PartitionId {
    type Err = PartitionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let named = match lowered.as_str() {
            "linux" => Some(Self::LINUX),
            "swap" => Some(Self::SWAP),
            "lvm" => Some(Self::LVM),
            "raid" => Some(Self::RAID),
            "esp" | "efi" => Some(Self::ESP),
            "prep" => Some(Self::PREP),
            "bios-boot" | "bios_boot" => Some(Self::BIOS_BOOT),
            "ntfs" => Some(Self::NTFS),
            "extended" => Some(Self::EXTENDED),
            "windows-basic-data" => Some(Self::WINDOWS_BASIC_DATA),
            "microsoft-reserved" => Some(Self::MICROSOFT_RESERVED),
            _ => None,
        };
        if let Some(id) = named {
            return Ok(id);
        }
        if lowered.contains('-') && lowered.len() == 36 {
            return Ok(Self::from_gpt_guid(&lowered));
        }
        let hex = lowered.strip_prefix("0x").unwrap_or(&lowered);
        u32::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| PartitionIdError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_fs_type_display_and_parse() {
        assert_eq!(FsType::Reiserfs.to_string(), "reiserfs");
        assert_eq!(FsType::from_str("ext4").unwrap(), FsType::Ext4);
        assert_eq!(FsType::from_str("fat32").unwrap(), FsType::Vfat);
        assert_eq!(FsType::from_str("ntfs3").unwrap(), FsType::Ntfs);
        assert_eq!(FsType::Vfat.to_string(), "vfat");
    }

    #[test]
    fn test_fs_type_capabilities() {
        assert!(FsType::Reiserfs.supports_tune_options());
        assert!(!FsType::Vfat.supports_tune_options());
        assert!(!FsType::Swap.is_mountable());
        assert!(!FsType::Iso9660.is_creatable());
        assert!(!FsType::Udf.supports_label());
        assert_eq!(FsType::Xfs.max_label_len(), Some(12));
    }

    #[test]
    fn test_every_creatable_fs_has_label_support() {
        for fs in FsType::iter().filter(|fs| fs.is_creatable()) {
            assert!(fs.supports_label(), "{} should support labels", fs);
        }
    }

    #[test]
    fn test_container_signatures_are_not_filesystems() {
        for sig in ["crypto_LUKS", "LVM2_member", "linux_raid_member"] {
            assert!(is_container_signature(sig));
            assert!(FsType::from_signature(sig).is_none());
        }
    }

    #[test]
    fn test_block_device_kind_from_lsblk() {
        assert_eq!(BlockDeviceKind::from_lsblk_type("disk"), BlockDeviceKind::Disk);
        assert_eq!(BlockDeviceKind::from_lsblk_type("raid1"), BlockDeviceKind::Md);
        assert_eq!(BlockDeviceKind::from_lsblk_type("crypt"), BlockDeviceKind::Dm);
        assert!(BlockDeviceKind::Loop.is_partitionable());
        assert!(!BlockDeviceKind::Dm.is_partitionable());
    }

    #[test]
    fn test_pt_type_parses_lsblk_dos() {
        assert_eq!(PtType::from_str("dos").unwrap(), PtType::Msdos);
        assert_eq!(PtType::Msdos.to_string(), "msdos");
    }

    #[test]
    fn test_partition_id_parse() {
        assert_eq!("linux".parse::<PartitionId>().unwrap(), PartitionId::LINUX);
        assert_eq!("0x83".parse::<PartitionId>().unwrap(), PartitionId::LINUX);
        assert_eq!("8e".parse::<PartitionId>().unwrap(), PartitionId::LVM);
        assert_eq!(
            "0fc63daf-8483-4772-8e79-3d69d8477de4".parse::<PartitionId>().unwrap(),
            PartitionId::LINUX
        );
        assert!("not-an-id".parse::<PartitionId>().is_err());
    }

    #[test]
    fn test_partition_id_table_codes() {
        assert_eq!(PartitionId::LINUX.table_code(PtType::Msdos).as_deref(), Some("83"));
        assert_eq!(
            PartitionId::SWAP.table_code(PtType::Gpt).as_deref(),
            Some("0657FD6D-A4AB-43C4-84E5-0933C84B4F4F")
        );
        assert!(PartitionId::BIOS_BOOT.table_code(PtType::Msdos).is_none());
        assert!(!PartitionId(0x42).is_valid_for(PtType::Gpt));
    }

    #[test]
    fn test_partition_id_display() {
        assert_eq!(PartitionId::LINUX.to_string(), "linux");
        assert_eq!(PartitionId(0x07).to_string(), "0x07");
    }
}
