//! Pre-flight sanity checks for the runtime environment
//!
//! - Tools a plan needs are present (before any action runs)
//! - Running with root privileges (EUID 0) for real commits

use std::path::Path;
use std::process::Command;
use tracing::debug;

use crate::process_guard::CommandProcessGroup;

/// Result of environment verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }
}

/// Check if a program is available.
///
/// Names containing a `/` are checked as paths, bare names through `which`.
pub fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    Command::new("which")
        .arg(name)
        .in_new_process_group()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Check if running as root (EUID 0)
pub fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Verify `programs` (already resolved against any tool directory).
pub fn verify_tools<I, S>(programs: I) -> SanityCheckResult
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let missing_binaries: Vec<String> = programs
        .into_iter()
        .filter(|p| !binary_exists(p.as_ref()))
        .map(|p| p.as_ref().to_string())
        .collect();
    debug!(missing = ?missing_binaries, "tool check finished");
    SanityCheckResult {
        missing_binaries,
        is_root: is_running_as_root(),
    }
}

/// Map binary names to the package usually providing them
pub fn get_package_for_binary(binary: &str) -> &'static str {
    let name = binary.rsplit('/').next().unwrap_or(binary);
    match name {
        "lsblk" | "sfdisk" | "wipefs" | "mount" | "umount" | "mkswap" | "swaplabel" => {
            "util-linux"
        }
        "mkfs.ext2" | "mkfs.ext3" | "mkfs.ext4" | "tune2fs" => "e2fsprogs",
        "mkfs.xfs" | "xfs_admin" => "xfsprogs",
        "mkfs.btrfs" | "btrfs" => "btrfs-progs",
        "mkfs.reiserfs" | "reiserfstune" => "reiserfsprogs",
        "mkfs.vfat" | "fatlabel" => "dosfstools",
        "mkfs.ntfs" | "ntfslabel" => "ntfs-3g",
        "mkfs.jfs" | "jfs_tune" => "jfsutils",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_binary_exists_sh() {
        assert!(binary_exists("sh"));
    }

    #[test]
    fn test_binary_exists_nonexistent() {
        assert!(!binary_exists("this_binary_definitely_does_not_exist_12345"));
    }

    #[test]
    fn test_binary_exists_by_path() {
        let dir = TempDir::new().unwrap();
        let tool = dir.path().join("mkfs.xfs");
        assert!(!binary_exists(&tool.display().to_string()));
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        assert!(binary_exists(&tool.display().to_string()));
    }

    #[test]
    fn test_verify_tools_reports_missing() {
        let result = verify_tools(["sh", "no_such_mkfs_tool"]);
        assert_eq!(result.missing_binaries, vec!["no_such_mkfs_tool"]);
        assert!(!result.is_ok());
    }

    #[test]
    fn test_package_mapping() {
        assert_eq!(get_package_for_binary("sfdisk"), "util-linux");
        assert_eq!(get_package_for_binary("/opt/tools/mkfs.ext4"), "e2fsprogs");
        assert_eq!(get_package_for_binary("reiserfstune"), "reiserfsprogs");
    }
}
