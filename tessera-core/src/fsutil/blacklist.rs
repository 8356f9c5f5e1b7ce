use super::is_descendant;
use crate::paths::INTERNAL_DIR;
use std::path::Path;

/// Paths never copied, scanned or diffed. Docker keeps most of these
/// read-only or bind-mounted inside containers.
pub const DEFAULT_BLACKLIST: &[&str] = &[
    INTERNAL_DIR,
    "/dev",
    "/.dockerinit",
    "/srv",
    "/mnt",
    "/.dockerenv",
    "/dev/console",
    "/dev/pts",
    "/dev/shm",
    "/etc/hosts",
    "/etc/hostname",
    "/etc/mtab",
    "/etc/resolv.conf",
    "/proc",
    "/sys",
];

/// An immutable set of excluded host paths. A path is excluded when it is
/// one of the entries or lies below one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    paths: Vec<String>,
}

impl Blacklist {
    /// The default list plus `extra`.
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::empty().extend(DEFAULT_BLACKLIST.iter().copied()).extend(extra)
    }

    /// Excludes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a new blacklist with `extra` appended.
    pub fn extend<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for p in extra {
            let p = p.into();
            if !p.is_empty() && !self.paths.contains(&p) {
                self.paths.push(p);
            }
        }
        self
    }

    pub fn with_path(self, path: &Path) -> Self {
        self.extend([path.to_string_lossy().into_owned()])
    }

    pub fn contains(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.paths.iter().any(|b| is_descendant(&path, b))
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_entries_and_descendants() {
        let bl = Blacklist::new(["/ctx"]);
        assert!(bl.contains(Path::new("/proc")));
        assert!(bl.contains(Path::new("/proc/1/status")));
        assert!(bl.contains(Path::new("/ctx/Dockerfile")));
        assert!(!bl.contains(Path::new("/etc/passwd")));
        assert!(!bl.contains(Path::new("/procfs")));
    }

    #[test]
    fn test_empty_excludes_nothing() {
        let bl = Blacklist::empty();
        assert!(!bl.contains(Path::new("/proc")));
        assert!(bl.paths().is_empty());
    }

    #[test]
    fn test_extend_dedups() {
        let bl = Blacklist::empty().extend(["/a", "/a", ""]).with_path(Path::new("/b"));
        assert_eq!(bl.paths(), &["/a".to_string(), "/b".to_string()]);
    }
}
