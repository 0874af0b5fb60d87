//! Session environment and its JSON configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Where a storage session runs and how far it may go.
///
/// `read_only` is the dry-run switch: planning works as usual but the commit
/// executor performs no backend I/O and reports every action as succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    pub read_only: bool,
    /// Identity a session locks; two live sessions may not share it
    pub session_key: String,
    /// fstab read by the prober and edited by commits
    pub fstab_path: PathBuf,
    /// Kernel mount table read by the prober
    pub mounts_path: PathBuf,
    /// Directory to take backend tools from instead of `PATH`
    pub tool_dir: Option<PathBuf>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            read_only: false,
            session_key: "default".to_string(),
            fstab_path: PathBuf::from("/etc/fstab"),
            mounts_path: PathBuf::from("/proc/self/mounts"),
            tool_dir: None,
        }
    }
}

impl Environment {
    pub fn new(read_only: bool) -> Self {
        Self {
            read_only,
            ..Self::default()
        }
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = key.into();
        self
    }

    /// Save the environment as a JSON config file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize environment to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write environment to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load an environment from a JSON config file. Missing keys take defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read environment from {:?}", path.as_ref()))?;

        let env: Self =
            serde_json::from_str(&content).context("Failed to parse environment JSON")?;

        Ok(env)
    }

    /// Validate the environment
    pub fn validate(&self) -> Result<()> {
        let key = self.session_key.trim();
        if key.is_empty() {
            anyhow::bail!("session_key must not be empty");
        }
        if key.chars().any(char::is_whitespace) {
            anyhow::bail!("session_key must not contain whitespace");
        }
        if !self.fstab_path.is_absolute() {
            anyhow::bail!("fstab_path must be absolute, got {:?}", self.fstab_path);
        }
        if !self.mounts_path.is_absolute() {
            anyhow::bail!("mounts_path must be absolute, got {:?}", self.mounts_path);
        }
        if let Some(dir) = &self.tool_dir {
            if !dir.is_dir() {
                anyhow::bail!("tool_dir {:?} is not a directory", dir);
            }
        }
        Ok(())
    }
}
