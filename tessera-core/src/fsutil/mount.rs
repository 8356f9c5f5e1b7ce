use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

const MOUNTS_FILE: &str = "/proc/mounts";

/// Mount points of the running system, from `/proc/mounts`.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    points: BTreeSet<PathBuf>,
}

impl MountTable {
    /// The process-wide table, read once on first use. A missing mounts
    /// file yields an empty table.
    pub fn system() -> &'static MountTable {
        static TABLE: OnceLock<MountTable> = OnceLock::new();
        TABLE.get_or_init(|| match std::fs::read_to_string(MOUNTS_FILE) {
            Ok(content) => MountTable::parse(&content),
            Err(e) => {
                debug!(error = %e, "Cannot read {}, assuming no mounts", MOUNTS_FILE);
                MountTable::default()
            }
        })
    }

    /// Parses `/proc/mounts` content. The `/` entry is skipped: overlay
    /// roots show up there and would otherwise cover every path.
    pub fn parse(content: &str) -> Self {
        let mut points = BTreeSet::new();
        for line in content.lines().filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.splitn(4, ' ').collect();
            if fields.len() < 4 {
                warn!(line = %line, "Skipping malformed mounts entry");
                continue;
            }
            if fields[1] == "/" {
                continue;
            }
            points.insert(PathBuf::from(unescape(fields[1])));
        }
        Self { points }
    }

    pub fn from_points<I: IntoIterator<Item = PathBuf>>(points: I) -> Self {
        Self { points: points.into_iter().collect() }
    }

    /// Restricts the table to mount points strictly below `root`. Mounts
    /// enclosing the root itself do not affect a build rooted there.
    pub fn within(&self, root: &Path) -> Self {
        Self {
            points: self
                .points
                .iter()
                .filter(|p| p.starts_with(root) && p.as_path() != root)
                .cloned()
                .collect(),
        }
    }

    pub fn is_mountpoint(&self, path: &Path) -> bool {
        self.points.contains(path)
    }

    /// True when `path` is a mount point or lies inside one.
    pub fn is_mounted(&self, path: &Path) -> bool {
        self.points.iter().any(|p| path.starts_with(p))
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// Octal escapes used by the kernel for spaces, tabs and backslashes.
fn unescape(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "overlay / overlay rw,relatime 0 0\n\
proc /proc proc rw,nosuid 0 0\n\
tmpfs /build/root/mnt/cache tmpfs rw 0 0\n\
/dev/sda1 /etc/resolv.conf ext4 rw 0 0\n\
/dev/sdb1 /data/with\\040space ext4 rw 0 0\n";

    #[test]
    fn test_parse_skips_root() {
        let table = MountTable::parse(SAMPLE);
        assert!(!table.is_mountpoint(Path::new("/")));
        assert!(table.is_mountpoint(Path::new("/proc")));
        assert!(table.is_mountpoint(Path::new("/data/with space")));
        assert!(!table.is_mounted(Path::new("/etc/hosts")));
    }

    #[test]
    fn test_is_mounted_descendants() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.is_mounted(Path::new("/proc/self/status")));
        assert!(!table.is_mounted(Path::new("/procfs")));
    }

    #[test]
    fn test_within_root() {
        let table = MountTable::parse(SAMPLE).within(Path::new("/build/root"));
        assert!(table.is_mountpoint(Path::new("/build/root/mnt/cache")));
        assert!(!table.is_mountpoint(Path::new("/proc")));

        let outer = MountTable::from_points([PathBuf::from("/tmp")]).within(Path::new("/tmp"));
        assert!(outer.is_empty());
    }
}
