//! Backend: the component that actually touches storage.
//!
//! The commit executor hands every action to a `Backend`. `SystemBackend`
//! maps actions onto typed tool invocations (`tools`) run through
//! `runner::run_tool_safe`; fstab edits are done in-process.

pub mod runner;
pub mod tools;

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::engine::action::{Action, ActionPlan};
use crate::environment::Environment;
use crate::fstab::{Fstab, FstabEntry};
use crate::sanity;
use runner::{resolve_program, run_tool_safe};
use tools::{
    LabelArgs, MkfsArgs, MountArgs, RemountArgs, SfdiskDeleteArgs, SfdiskPartTypeArgs,
    SfdiskPartitionArgs, ToolArgs, TuneArgs, UmountArgs, WipefsArgs,
};

/// Executes single actions against real or simulated storage.
pub trait Backend {
    /// Problems that make `plan` impossible to run, as missing program names.
    /// Called once before the first action; never in dry-run.
    fn preflight(&self, _plan: &ActionPlan, _env: &Environment) -> Vec<String> {
        Vec::new()
    }

    /// Perform one action.
    fn execute(&mut self, action: &Action, env: &Environment) -> Result<()>;
}

/// Backend driving the host's storage tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBackend;

impl SystemBackend {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, args: &dyn ToolArgs, env: &Environment, context: &str) -> Result<()> {
        run_tool_safe(args, env.tool_dir.as_deref())?.ensure_success(context)
    }

    fn edit_fstab(&self, path: &Path, edit: impl FnOnce(&mut Fstab)) -> Result<()> {
        let mut fstab = Fstab::load(path)?;
        edit(&mut fstab);
        fstab.save()
    }
}

impl Backend for SystemBackend {
    fn preflight(&self, plan: &ActionPlan, env: &Environment) -> Vec<String> {
        let programs: BTreeSet<String> = plan
            .iter()
            .flat_map(tools::binaries_for)
            .map(|name| resolve_program(name, env.tool_dir.as_deref()))
            .collect();
        sanity::verify_tools(programs).missing_binaries
    }

    fn execute(&mut self, action: &Action, env: &Environment) -> Result<()> {
        let text = action.text();
        debug!(action = %text, "executing");
        match action {
            Action::RemoveFstabEntry { path, .. } => {
                self.edit_fstab(&env.fstab_path, |fstab| {
                    fstab.remove(path);
                })?;
            }
            Action::AddFstabEntry {
                device,
                fs_type,
                path,
                options,
            }
            | Action::UpdateFstabEntry {
                device,
                fs_type,
                path,
                options,
            } => {
                let entry =
                    FstabEntry::new(device, path, fs_type.mount_type()).with_options(options);
                self.edit_fstab(&env.fstab_path, |fstab| fstab.upsert(entry))?;
            }
            Action::Unmount { path, .. } => {
                self.run(&UmountArgs { path: path.clone() }, env, &text)?;
            }
            Action::DeleteFilesystem { device, .. } => {
                self.run(
                    &WipefsArgs {
                        device: device.clone(),
                    },
                    env,
                    &text,
                )?;
            }
            Action::DeletePartition { slot } => {
                self.run(
                    &SfdiskDeleteArgs {
                        disk: slot.disk.clone(),
                        number: slot.number,
                    },
                    env,
                    &text,
                )?;
            }
            Action::ResizePartition {
                slot, start, size, ..
            } => {
                let args = SfdiskPartitionArgs {
                    disk: slot.disk.clone(),
                    number: slot.number,
                    start: *start,
                    size: *size,
                    code: None,
                    partition_type: None,
                };
                self.run(&args, env, &text)?;
            }
            Action::CreatePartition {
                slot,
                start,
                size,
                partition_type,
                id,
            } => {
                let args = SfdiskPartitionArgs {
                    disk: slot.disk.clone(),
                    number: slot.number,
                    start: *start,
                    size: *size,
                    code: id.table_code(slot.pt_type),
                    partition_type: Some(*partition_type),
                };
                self.run(&args, env, &text)?;
            }
            Action::SetPartitionId { slot, id } => {
                let code = id.table_code(slot.pt_type).with_context(|| {
                    format!("partition id {} has no {} code", id, slot.pt_type)
                })?;
                let args = SfdiskPartTypeArgs {
                    disk: slot.disk.clone(),
                    number: slot.number,
                    code,
                };
                self.run(&args, env, &text)?;
            }
            Action::CreateFilesystem {
                device,
                fs_type,
                label,
                tune_options,
            } => {
                let mkfs = MkfsArgs {
                    fs_type: *fs_type,
                    device: device.clone(),
                    label: label.clone(),
                };
                self.run(&mkfs, env, &text)?;
                if !tune_options.is_empty() {
                    let tune = TuneArgs {
                        fs_type: *fs_type,
                        device: device.clone(),
                        options: tune_options.clone(),
                    };
                    self.run(&tune, env, &text)?;
                }
            }
            Action::SetLabel {
                device,
                fs_type,
                label,
            } => {
                let args = LabelArgs {
                    fs_type: *fs_type,
                    device: device.clone(),
                    label: label.clone(),
                };
                self.run(&args, env, &text)?;
            }
            Action::Tune {
                device,
                fs_type,
                tune_options,
            } => {
                let args = TuneArgs {
                    fs_type: *fs_type,
                    device: device.clone(),
                    options: tune_options.clone(),
                };
                self.run(&args, env, &text)?;
            }
            Action::Mount {
                device,
                fs_type,
                path,
                options,
            } => {
                fs::create_dir_all(path)
                    .with_context(|| format!("Failed to create mount point {}", path))?;
                let args = MountArgs {
                    device: device.clone(),
                    path: path.clone(),
                    fs_type: *fs_type,
                    options: options.clone(),
                };
                self.run(&args, env, &text)?;
            }
            Action::Remount { path, options, .. } => {
                let args = RemountArgs {
                    path: path.clone(),
                    options: options.clone(),
                };
                self.run(&args, env, &text)?;
            }
        }
        info!(action = %text, "action done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::action::PartitionSlot;
    use crate::types::{FsType, PartitionId, PtType};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Tool directory whose programs append their name and args to a log.
    fn fake_tools(dir: &Path, names: &[&str]) -> std::path::PathBuf {
        let log = dir.join("calls.log");
        for name in names {
            let path = dir.join(name);
            fs::write(
                &path,
                format!(
                    "#!/bin/sh\necho \"{} $*\" >> {}\ncat > /dev/null\n",
                    name,
                    log.display()
                ),
            )
            .unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        log
    }

    fn env_in(dir: &TempDir) -> Environment {
        Environment {
            fstab_path: dir.path().join("fstab"),
            tool_dir: Some(dir.path().to_path_buf()),
            ..Environment::default()
        }
    }

    #[test]
    fn test_fstab_actions_edit_the_file() {
        let dir = TempDir::new().unwrap();
        let env = env_in(&dir);
        let mut backend = SystemBackend::new();

        backend
            .execute(
                &Action::AddFstabEntry {
                    device: "/dev/sdc1".into(),
                    fs_type: FsType::Xfs,
                    path: "/srv".into(),
                    options: vec!["noatime".into()],
                },
                &env,
            )
            .unwrap();
        let fstab = Fstab::load(&env.fstab_path).unwrap();
        let entry = fstab.find("/srv").unwrap();
        assert_eq!(entry.spec, "/dev/sdc1");
        assert_eq!(entry.vfstype, "xfs");

        backend
            .execute(
                &Action::RemoveFstabEntry {
                    device: "/dev/sdc1".into(),
                    path: "/srv".into(),
                },
                &env,
            )
            .unwrap();
        assert!(Fstab::load(&env.fstab_path).unwrap().find("/srv").is_none());
    }

    #[test]
    fn test_create_filesystem_runs_mkfs_then_tune() {
        let dir = TempDir::new().unwrap();
        let log = fake_tools(dir.path(), &["mkfs.reiserfs", "reiserfstune"]);
        let env = env_in(&dir);

        SystemBackend::new()
            .execute(
                &Action::CreateFilesystem {
                    device: "/dev/sdc1".into(),
                    fs_type: FsType::Reiserfs,
                    label: "TEST".into(),
                    tune_options: "-m 10".into(),
                },
                &env,
            )
            .unwrap();

        let calls = fs::read_to_string(log).unwrap();
        assert_eq!(
            calls,
            "mkfs.reiserfs -ff -l TEST /dev/sdc1\nreiserfstune -m 10 /dev/sdc1\n"
        );
    }

    #[test]
    fn test_set_partition_id_uses_table_code() {
        let dir = TempDir::new().unwrap();
        let log = fake_tools(dir.path(), &["sfdisk"]);
        let env = env_in(&dir);

        SystemBackend::new()
            .execute(
                &Action::SetPartitionId {
                    slot: PartitionSlot {
                        disk: "/dev/sdc".into(),
                        pt_type: PtType::Msdos,
                        number: 1,
                        name: "/dev/sdc1".into(),
                    },
                    id: PartitionId::LINUX,
                },
                &env,
            )
            .unwrap();
        assert_eq!(
            fs::read_to_string(log).unwrap(),
            "sfdisk --part-type /dev/sdc 1 83\n"
        );
    }

    #[test]
    fn test_failing_tool_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wipefs");
        fs::write(&path, "#!/bin/sh\necho 'device busy' >&2\nexit 1\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        let env = env_in(&dir);

        let err = SystemBackend::new()
            .execute(
                &Action::DeleteFilesystem {
                    device: "/dev/sdc1".into(),
                    fs_type: FsType::Ext4,
                },
                &env,
            )
            .unwrap_err();
        assert!(format!("{:#}", err).contains("device busy"));
    }

    #[test]
    fn test_preflight_lists_missing_tools() {
        let dir = TempDir::new().unwrap();
        fake_tools(dir.path(), &["mkfs.xfs"]);
        let env = env_in(&dir);
        let plan = ActionPlan {
            actions: vec![
                Action::CreateFilesystem {
                    device: "/dev/sdc1".into(),
                    fs_type: FsType::Xfs,
                    label: String::new(),
                    tune_options: String::new(),
                },
                Action::Mount {
                    device: "/dev/sdc1".into(),
                    fs_type: FsType::Xfs,
                    path: "/srv".into(),
                    options: Vec::new(),
                },
            ],
        };
        let missing = SystemBackend::new().preflight(&plan, &env);
        assert_eq!(missing, vec![dir.path().join("mount").display().to_string()]);
    }
}
