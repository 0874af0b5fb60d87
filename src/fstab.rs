//! Mount table files: `/etc/fstab` and `/proc/self/mounts`.
//!
//! Both share the six-column format `spec file vfstype mntops freq passno`
//! with octal escapes (`\040`) for whitespace in paths. `Fstab` keeps comment
//! and blank lines so an edited file differs from the original only in the
//! entries that were touched.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// One line of a mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// Device spec: a path, `UUID=...` or `LABEL=...`
    pub spec: String,
    /// Mount target
    pub file: String,
    pub vfstype: String,
    pub options: Vec<String>,
    pub freq: u32,
    pub passno: u32,
}

impl FstabEntry {
    pub fn new(spec: impl Into<String>, file: impl Into<String>, vfstype: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            file: file.into(),
            vfstype: vfstype.into(),
            options: Vec::new(),
            freq: 0,
            passno: 0,
        }
    }

    pub fn with_options(mut self, options: &[String]) -> Self {
        self.options = options.to_vec();
        self
    }

    /// Parse one non-comment line. Missing trailing columns get defaults.
    pub fn parse(line: &str) -> Option<Self> {
        let mut cols = line.split_whitespace();
        let spec = unescape(cols.next()?);
        let file = unescape(cols.next()?);
        let vfstype = cols.next()?.to_string();
        let options = cols
            .next()
            .map(|o| {
                o.split(',')
                    .filter(|s| !s.is_empty() && *s != "defaults")
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let freq = cols.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let passno = cols.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        Some(Self {
            spec,
            file,
            vfstype,
            options,
            freq,
            passno,
        })
    }

    /// Render as a table line.
    pub fn to_line(&self) -> String {
        let options = if self.options.is_empty() {
            "defaults".to_string()
        } else {
            self.options.join(",")
        };
        format!(
            "{}  {}  {}  {}  {} {}",
            escape(&self.spec),
            escape(&self.file),
            self.vfstype,
            options,
            self.freq,
            self.passno
        )
    }

    /// Whether the entry is excluded from boot-time mounting.
    pub fn is_noauto(&self) -> bool {
        self.options.iter().any(|o| o == "noauto")
    }

    /// Options without the ones that only steer boot-time handling.
    pub fn mount_options(&self) -> Vec<String> {
        self.options
            .iter()
            .filter(|o| !matches!(o.as_str(), "noauto" | "auto" | "nofail"))
            .cloned()
            .collect()
    }

    /// Options of a mount table row without the ones the kernel reports for
    /// every mount of that kind.
    pub fn kernel_mount_options(&self) -> Vec<String> {
        self.mount_options()
            .into_iter()
            .filter(|o| !is_kernel_default(o))
            .collect()
    }

    /// Whether `spec` designates the device with this name, UUID or label.
    pub fn matches_device(&self, name: &str, uuid: &str, label: &str) -> bool {
        if let Some(value) = self.spec.strip_prefix("UUID=") {
            return !uuid.is_empty() && value.eq_ignore_ascii_case(uuid);
        }
        if let Some(value) = self.spec.strip_prefix("LABEL=") {
            return !label.is_empty() && value == label;
        }
        self.spec == name
    }
}

/// Parse every entry of a mount table, skipping comments and blank lines.
pub fn parse_entries(content: &str) -> Vec<FstabEntry> {
    content
        .lines()
        .filter(|l| !is_comment(l))
        .filter_map(FstabEntry::parse)
        .collect()
}

/// Read `/proc/self/mounts` style file.
pub fn read_mount_table(path: &Path) -> Result<Vec<FstabEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read mount table {:?}", path))?;
    Ok(parse_entries(&content))
}

/// Shown in `/proc/self/mounts` without being asked for.
fn is_kernel_default(option: &str) -> bool {
    matches!(
        option,
        "rw" | "relatime"
            | "seclabel"
            | "data=ordered"
            | "attr2"
            | "inode64"
            | "noquota"
            | "space_cache"
            | "space_cache=v2"
            | "subvolid=5"
            | "subvol=/"
    ) || option.starts_with("logbufs=")
        || option.starts_with("logbsize=")
        || option.starts_with("fmask=")
        || option.starts_with("dmask=")
        || option.starts_with("codepage=")
        || option.starts_with("iocharset=")
        || option.starts_with("shortname=")
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.is_empty() || trimmed.starts_with('#')
}

#[derive(Debug, Clone)]
enum Line {
    Entry(FstabEntry),
    Verbatim(String),
}

/// An fstab file loaded for editing.
#[derive(Debug, Clone)]
pub struct Fstab {
    path: PathBuf,
    lines: Vec<Line>,
}

impl Fstab {
    /// Load the file; a missing file is an empty table.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read fstab {:?}", path));
            }
        };
        let lines = content
            .lines()
            .map(|l| match (is_comment(l), FstabEntry::parse(l)) {
                (false, Some(entry)) => Line::Entry(entry),
                _ => Line::Verbatim(l.to_string()),
            })
            .collect();
        Ok(Self { path, lines })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> impl Iterator<Item = &FstabEntry> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry(e) => Some(e),
            Line::Verbatim(_) => None,
        })
    }

    pub fn find(&self, file: &str) -> Option<&FstabEntry> {
        self.entries().find(|e| e.file == file)
    }

    /// Add an entry, replacing an existing one for the same mount target.
    pub fn upsert(&mut self, entry: FstabEntry) {
        for line in &mut self.lines {
            if let Line::Entry(existing) = line {
                if existing.file == entry.file {
                    *existing = entry;
                    return;
                }
            }
        }
        self.lines.push(Line::Entry(entry));
    }

    /// Remove the entry for a mount target. Returns whether one existed.
    pub fn remove(&mut self, file: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|l| !matches!(l, Line::Entry(e) if e.file == file));
        self.lines.len() != before
    }

    /// Write the table back through a sibling temp file and rename.
    pub fn save(&self) -> Result<()> {
        let mut content: String = self
            .lines
            .iter()
            .map(|l| match l {
                Line::Entry(e) => e.to_line(),
                Line::Verbatim(v) => v.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        content.push('\n');

        let tmp = self.path.with_extension("devgraph.tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace fstab {:?}", self.path))?;
        Ok(())
    }
}

fn unescape(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut octal = String::new();
        while octal.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    octal.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&octal, 8) {
            Ok(byte) if octal.len() == 3 => output.push(byte as char),
            _ => {
                output.push('\\');
                output.push_str(&octal);
            }
        }
    }
    output
}

fn escape(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            ' ' => output.push_str("\\040"),
            '\t' => output.push_str("\\011"),
            '\n' => output.push_str("\\012"),
            '\\' => output.push_str("\\134"),
            other => output.push(other),
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "\
# /etc/fstab: static file system information.
UUID=1234-abcd  /               ext4  defaults           0 1
/dev/sdb1       /mnt/my\\040disk  xfs   noatime,nofail     0 2

/dev/sdc1       /backup         btrfs noauto,compress=zstd 0 0
";

    #[test]
    fn test_parse_entries_skips_comments() {
        let entries = parse_entries(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].spec, "UUID=1234-abcd");
        assert!(entries[0].options.is_empty());
        assert_eq!(entries[0].passno, 1);
        assert_eq!(entries[1].file, "/mnt/my disk");
        assert!(entries[2].is_noauto());
        assert_eq!(entries[2].mount_options(), vec!["compress=zstd".to_string()]);
    }

    #[test]
    fn test_kernel_mount_options_drop_defaults() {
        let entry =
            FstabEntry::parse("/dev/sdc1 /srv xfs rw,noatime,attr2,inode64,logbufs=8,nodev 0 0")
                .unwrap();
        assert_eq!(entry.kernel_mount_options(), vec!["noatime", "nodev"]);
    }

    #[test]
    fn test_matches_device() {
        let entries = parse_entries(SAMPLE);
        assert!(entries[0].matches_device("/dev/sda2", "1234-ABCD", ""));
        assert!(!entries[0].matches_device("/dev/sda2", "", ""));
        assert!(entries[1].matches_device("/dev/sdb1", "", ""));
        let by_label = FstabEntry::new("LABEL=TEST", "/test", "reiserfs");
        assert!(by_label.matches_device("/dev/sdc1", "", "TEST"));
    }

    #[test]
    fn test_line_roundtrip_escapes_whitespace() {
        let entry = FstabEntry::new("/dev/sdb1", "/mnt/my disk", "xfs")
            .with_options(&["noatime".to_string()]);
        let line = entry.to_line();
        assert!(line.contains("/mnt/my\\040disk"));
        assert_eq!(FstabEntry::parse(&line), Some(entry));
    }

    #[test]
    fn test_edit_preserves_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fstab");
        fs::write(&path, SAMPLE).unwrap();

        let mut fstab = Fstab::load(&path).unwrap();
        assert!(fstab.remove("/backup"));
        assert!(!fstab.remove("/backup"));
        fstab.upsert(FstabEntry::new("/dev/sdc1", "/test", "reiserfs"));
        fstab.upsert(
            FstabEntry::new("/dev/sdb1", "/mnt/my disk", "xfs").with_options(&["ro".to_string()]),
        );
        fstab.save().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# /etc/fstab"));
        let reloaded = Fstab::load(&path).unwrap();
        assert_eq!(reloaded.entries().count(), 3);
        assert_eq!(reloaded.find("/mnt/my disk").unwrap().options, vec!["ro"]);
        assert_eq!(reloaded.find("/test").unwrap().vfstype, "reiserfs");
        assert!(reloaded.find("/backup").is_none());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let fstab = Fstab::load(dir.path().join("absent")).unwrap();
        assert_eq!(fstab.entries().count(), 0);
    }
}
