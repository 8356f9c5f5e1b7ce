//! Path and filesystem helpers shared by the snapshot engine and the copier.
//!
//! In-image paths are plain `/`-separated strings. Host paths stay `Path`s
//! until they are trimmed against a build root.

mod blacklist;
mod copier;
mod mount;

pub use blacklist::{Blacklist, DEFAULT_BLACKLIST};
pub use copier::{Copier, Owner};
pub use mount::MountTable;

use std::fs::Metadata;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Component, Path};

/// Lexically cleans a `/`-separated path: collapses separators, drops `.`
/// and resolves `..` against preceding components.
pub fn clean_path(p: &str) -> String {
    let absolute = p.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in p.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().map(|l| *l != "..").unwrap_or(false) {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Returns the cleaned absolute form of `p`, treating relative paths as
/// relative to `/`.
pub fn abs_path(p: &str) -> String {
    clean_path(&format!("/{}", p))
}

/// Strips leading separators. Trailing separators are kept.
pub fn rel_path(p: &str) -> &str {
    p.trim_start_matches('/')
}

/// Splits `p` into its non-empty components.
pub fn split_path(p: &str) -> Vec<&str> {
    p.split('/').filter(|s| !s.is_empty() && *s != ".").collect()
}

/// Joins `rel` onto `base` and cleans the result.
pub fn join_path(base: &str, rel: &str) -> String {
    clean_path(&format!("{}/{}", base, rel))
}

/// Splits an absolute in-image path into its parent directory (with a
/// trailing `/`) and base name.
pub fn split_base(p: &str) -> (&str, &str) {
    match p.rfind('/') {
        Some(idx) => (&p[..=idx], &p[idx + 1..]),
        None => ("", p),
    }
}

/// Returns `path` relative to `root` as an absolute in-image path.
///
/// `trim_root("/r/a/b", "/r")` is `/a/b`; `trim_root("/r", "/r")` is `/`.
pub fn trim_root(path: &Path, root: &Path) -> io::Result<String> {
    let rest = path.strip_prefix(root).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not under root {}", path.display(), root.display()),
        )
    })?;
    let mut out = String::from("/");
    for component in rest.components() {
        if let Component::Normal(part) = component {
            if out.len() > 1 {
                out.push('/');
            }
            out.push_str(&part.to_string_lossy());
        }
    }
    Ok(out)
}

/// True when `path` equals `ancestor` or lies below it. Both are treated as
/// absolute; an empty ancestor matches everything.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if path.is_empty() {
        return ancestor.is_empty();
    }
    let path = abs_path(path);
    let ancestor = abs_path(ancestor);
    if ancestor == "/" || path == ancestor {
        return true;
    }
    path.starts_with(&ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/')
}

/// Devices, fifos and sockets. Overlay filesystems ignore these and so do
/// layers.
pub fn is_special(md: &Metadata) -> bool {
    let ft = md.file_type();
    ft.is_char_device() || ft.is_block_device() || ft.is_fifo() || ft.is_socket()
}

/// `lstat` that maps "not found" to `None`.
pub fn lstat_opt(path: &Path) -> io::Result<Option<Metadata>> {
    match std::fs::symlink_metadata(path) {
        Ok(md) => Ok(Some(md)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abs_and_rel_path() {
        assert_eq!(abs_path("./test1/test2/"), "/test1/test2");
        assert_eq!(abs_path("home/test/"), "/home/test");
        assert_eq!(abs_path("/home/test/"), "/home/test");
        assert_eq!(abs_path(""), "/");
        assert_eq!(rel_path("/test1/test2/"), "test1/test2/");
        assert_eq!(rel_path("home/test/"), "home/test/");
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/a/./b/../c//d"), "/a/c/d");
        assert_eq!(clean_path("/.."), "/");
        assert_eq!(clean_path("a/../.."), "..");
        assert_eq!(clean_path(""), ".");
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/test1/test2/"), vec!["test1", "test2"]);
        assert_eq!(split_path("home/test/"), vec!["home", "test"]);
        assert!(split_path("/").is_empty());
    }

    #[test]
    fn test_split_base() {
        assert_eq!(split_base("/a/b"), ("/a/", "b"));
        assert_eq!(split_base("/b"), ("/", "b"));
    }

    #[test]
    fn test_trim_root() {
        let root = Path::new("/test/root/");
        assert_eq!(trim_root(Path::new("/test/root/test1/test2/"), root).unwrap(), "/test1/test2");
        assert_eq!(trim_root(Path::new("/test/root/"), root).unwrap(), "/");
        assert!(trim_root(Path::new("/test/root2/test1"), root).is_err());
    }

    #[test]
    fn test_is_descendant() {
        let cases = [
            ("/a/b", "/a/b", true),
            ("/a/b/", "a/b", true),
            ("a/b", "/a/b/", true),
            ("a/b", "a", true),
            ("a/b/c", "/a/", true),
            ("a/b", "/", true),
            ("a/b", "", true),
            ("/", "/", true),
            ("/x/y/z", "y", false),
            ("/x", "/x/y/z", false),
            ("", "/x", false),
            ("/x_/y", "/x", false),
            ("/x", "/a", false),
        ];
        for (path, ancestor, expected) in cases {
            assert_eq!(is_descendant(path, ancestor), expected, "{} under {}", path, ancestor);
        }
    }
}
