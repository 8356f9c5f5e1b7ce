use super::{SnapshotError, MAX_LINKS, WHITEOUT_META_PREFIX};
use crate::fsutil::{is_special, Blacklist, MountTable};
use std::collections::VecDeque;
use std::fs::{self, Metadata};
use std::path::{Component, Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// True for AUFS metadata, blacklisted paths, special files and mount
/// points. Skipped directories are not descended into.
pub fn should_skip(
    path: &Path,
    md: Option<&Metadata>,
    blacklist: &Blacklist,
    mounts: &MountTable,
) -> bool {
    let meta = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with(WHITEOUT_META_PREFIX))
        .unwrap_or(false);
    meta || blacklist.contains(path)
        || md.map(is_special).unwrap_or(false)
        || mounts.is_mountpoint(path)
}

/// Lists `root` and everything below it in lexical order, parents first,
/// without following symlinks.
pub fn walk(
    root: &Path,
    blacklist: &Blacklist,
    mounts: &MountTable,
) -> Result<Vec<(PathBuf, Metadata)>, SnapshotError> {
    let mut out = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let md = e.metadata().ok();
            e.depth() == 0 || !should_skip(e.path(), md.as_ref(), blacklist, mounts)
        });
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            SnapshotError::io(path, e.into())
        })?;
        let md = entry.metadata().map_err(|e| SnapshotError::io(entry.path(), e.into()))?;
        out.push((entry.into_path(), md));
    }
    Ok(out)
}

/// Removes everything under `root` that can be removed, skipping
/// blacklisted paths and mount points and continuing past failures.
/// Returns the paths that could not be removed.
pub fn remove_all_children(root: &Path, blacklist: &Blacklist, mounts: &MountTable) -> Vec<PathBuf> {
    let mut failed = Vec::new();
    match fs::read_dir(root) {
        Ok(entries) => {
            for entry in entries.flatten() {
                remove_recursive(&entry.path(), blacklist, mounts, &mut failed);
            }
        }
        Err(e) => {
            warn!(path = %root.display(), error = %e, "Failed to list root for removal");
            failed.push(root.to_path_buf());
        }
    }
    failed
}

// Returns true if `path` and everything below it is gone.
fn remove_recursive(
    path: &Path,
    blacklist: &Blacklist,
    mounts: &MountTable,
    failed: &mut Vec<PathBuf>,
) -> bool {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to stat path for removal");
            failed.push(path.to_path_buf());
            return false;
        }
    };
    if should_skip(path, Some(&md), blacklist, mounts) {
        return false;
    }

    if !md.is_dir() {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
            failed.push(path.to_path_buf());
            return false;
        }
        return true;
    }

    let mut all_removed = true;
    match fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries.flatten() {
                if !remove_recursive(&entry.path(), blacklist, mounts, failed) {
                    all_removed = false;
                }
            }
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read directory");
            failed.push(path.to_path_buf());
            return false;
        }
    }
    if !all_removed {
        return false;
    }
    if let Err(e) = fs::remove_dir(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove directory");
        failed.push(path.to_path_buf());
        return false;
    }
    true
}

/// Resolves every symlink in `p` as if `root` were `/`, returning the
/// resulting absolute in-root path. Absolute link targets must lie under
/// `root` on the host. The path must exist.
pub fn eval_symlinks(p: &str, root: &Path) -> Result<String, SnapshotError> {
    let mut pending: VecDeque<String> = split_owned(p);
    let mut resolved: Vec<String> = Vec::new();
    let mut links = 0usize;

    while let Some(part) = pending.pop_front() {
        match part.as_str() {
            "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => resolved.push(part),
        }

        let host = host_path(root, &resolved);
        let md = fs::symlink_metadata(&host).map_err(|e| SnapshotError::io(&host, e))?;
        if !md.file_type().is_symlink() {
            continue;
        }

        links += 1;
        if links > MAX_LINKS {
            return Err(SnapshotError::TooManyLinks { path: p.to_string() });
        }
        let target = fs::read_link(&host).map_err(|e| SnapshotError::io(&host, e))?;
        resolved.pop();
        if target.is_absolute() {
            let inner = target.strip_prefix(root).map_err(|_| SnapshotError::LinkOutsideRoot {
                link: host.clone(),
                target: target.clone(),
            })?;
            resolved.clear();
            let mut rest: VecDeque<String> = split_owned(&inner.to_string_lossy());
            rest.extend(pending.drain(..));
            pending = rest;
        } else {
            let mut rest: VecDeque<String> = split_owned(&target.to_string_lossy());
            rest.extend(pending.drain(..));
            pending = rest;
        }
    }
    Ok(format!("/{}", resolved.join("/")))
}

fn split_owned(p: &str) -> VecDeque<String> {
    Path::new(p)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect()
}

fn host_path(root: &Path, parts: &[String]) -> PathBuf {
    let mut host = root.to_path_buf();
    host.extend(parts);
    host
}
