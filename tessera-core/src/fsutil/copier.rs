use super::{is_special, lstat_opt, Blacklist};
use std::fs;
use std::io;
use std::os::unix::fs::{chown, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Ownership applied to copied files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Keep the source's uid/gid.
    Preserve,
    Fixed { uid: u32, gid: u32 },
}

/// Copies files and directory trees on the host, skipping blacklisted paths.
#[derive(Debug, Clone)]
pub struct Copier {
    blacklist: Blacklist,
}

impl Copier {
    pub fn new(blacklist: Blacklist) -> Self {
        Self { blacklist }
    }

    /// A copier for files checkpointed out of a previous stage. Those were
    /// filtered when checkpointed, so nothing is excluded.
    pub fn internal() -> Self {
        Self { blacklist: Blacklist::empty() }
    }

    /// Copies the file at `src` to `dst`, replacing `dst` if it exists.
    /// Missing parents of `dst` are created. Symlinks are recreated with
    /// their original target; special files are skipped.
    pub fn copy_file(&self, src: &Path, dst: &Path, owner: Owner) -> io::Result<()> {
        if let Some(parent) = dst.parent() {
            mkdir_all(parent, owner)?;
        }
        self.copy_file_inner(src, dst, owner)
    }

    /// Recursively copies the contents of directory `src` into `dst`,
    /// creating `dst` if needed. If `dst` lies inside `src`, even through a
    /// symlink, it is never descended into, so `COPY --from=stage / /`
    /// terminates.
    pub fn copy_dir(&self, src: &Path, dst: &Path, owner: Owner) -> io::Result<()> {
        if self.blacklist.contains(src) {
            info!("* Ignoring copy of directory {} because it is blacklisted", src.display());
            return Ok(());
        }
        mkdir_all(dst, owner)?;
        let orig_dst = fs::canonicalize(dst)?;
        self.copy_dir_contents(src, dst, &orig_dst, owner)
    }

    fn copy_file_inner(&self, src: &Path, dst: &Path, owner: Owner) -> io::Result<()> {
        let md = fs::symlink_metadata(src)?;
        if self.blacklist.contains(src) {
            info!("* Ignoring copy of file {} because it is blacklisted", src.display());
            return Ok(());
        }
        if is_special(&md) {
            return Ok(());
        }
        if md.file_type().is_symlink() {
            return copy_symlink(src, dst);
        }

        if let Some(existing) = lstat_opt(dst)? {
            if existing.file_type().is_symlink() {
                fs::remove_file(dst)?;
            } else {
                fs::set_permissions(dst, fs::Permissions::from_mode(0o777))?;
            }
        }

        let mut r = fs::File::open(src)?;
        let mut w = fs::OpenOptions::new().write(true).create(true).truncate(true).open(dst)?;
        io::copy(&mut r, &mut w)?;

        let (uid, gid) = resolve_owner(owner, &md);
        // chmod after chown, or setuid bits get cleared.
        chown(dst, Some(uid), Some(gid))?;
        fs::set_permissions(dst, fs::Permissions::from_mode(md.mode() & 0o7777))?;
        crate::tario::set_mtime(dst, md.mtime())
    }

    fn copy_dir_contents(
        &self,
        src: &Path,
        dst: &Path,
        orig_dst: &Path,
        owner: Owner,
    ) -> io::Result<()> {
        let mut entries = fs::read_dir(src)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let curr_src = entry.path();
            if self.blacklist.contains(&curr_src) {
                info!("* Ignoring copy of {} because it is blacklisted", curr_src.display());
                continue;
            }
            let is_dir = entry.file_type()?.is_dir();
            if is_dir && fs::canonicalize(&curr_src)? == orig_dst {
                continue;
            }
            let curr_dst = dst.join(entry.file_name());
            if is_dir {
                copy_dir_node(&curr_src, &curr_dst, owner)?;
                self.copy_dir_contents(&curr_src, &curr_dst, orig_dst, owner)?;
            } else {
                self.copy_file_inner(&curr_src, &curr_dst, owner)?;
            }
        }
        Ok(())
    }
}

fn resolve_owner(owner: Owner, md: &fs::Metadata) -> (u32, u32) {
    match owner {
        Owner::Preserve => (md.uid(), md.gid()),
        Owner::Fixed { uid, gid } => (uid, gid),
    }
}

fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    if lstat_opt(dst)?.is_some() {
        fs::remove_file(dst)?;
    }
    let target = fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)
}

/// Creates `dst` with the mode of `src`, or updates an existing directory.
fn copy_dir_node(src: &Path, dst: &Path, owner: Owner) -> io::Result<()> {
    let md = fs::symlink_metadata(src)?;
    match lstat_opt(dst)? {
        None => fs::create_dir(dst)?,
        Some(existing) if !existing.is_dir() => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", dst.display()),
            ));
        }
        Some(_) => {}
    }
    let (uid, gid) = resolve_owner(owner, &md);
    chown(dst, Some(uid), Some(gid))?;
    fs::set_permissions(dst, fs::Permissions::from_mode(md.mode() & 0o7777))
}

/// Like `create_dir_all`, chowning every directory it creates. With
/// [`Owner::Preserve`] created directories keep the process owner.
fn mkdir_all(dst: &Path, owner: Owner) -> io::Result<()> {
    let mut curr = PathBuf::from("/");
    for component in dst.components() {
        match component {
            Component::Normal(part) => curr.push(part),
            Component::ParentDir => {
                curr.pop();
                continue;
            }
            _ => continue,
        }
        if lstat_opt(&curr)?.is_some() {
            continue;
        }
        fs::create_dir(&curr)?;
        fs::set_permissions(&curr, fs::Permissions::from_mode(0o755))?;
        if let Owner::Fixed { uid, gid } = owner {
            chown(&curr, Some(uid), Some(gid))?;
        }
    }
    Ok(())
}
