use super::{eval_symlinks, SnapshotError};
use crate::fsutil::{join_path, rel_path, Blacklist, Copier, Owner};
use crate::tario;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::info;

/// True for destinations that name a directory: a trailing `/`, `.` or `..`.
pub fn is_dir_format(dst: &str) -> bool {
    dst.ends_with('/') || dst == "." || dst == ".."
}

/// Resolves a `user[:group]` specifier to numeric ids. Names are looked up
/// in `etc/passwd` and `etc/group` under `root`. A user without a group
/// uses the user's primary group, or the uid itself when numeric.
pub fn resolve_chown(spec: &str, root: &Path) -> Result<Option<(u32, u32)>, SnapshotError> {
    if spec.is_empty() {
        return Ok(None);
    }
    let (user, group) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };

    let (uid, primary_gid) = match user.parse::<u32>() {
        Ok(uid) => (uid, uid),
        Err(_) => lookup(&root.join("etc/passwd"), user)?
            .map(|fields| (fields.0, fields.1))
            .ok_or_else(|| invalid(format!("unknown user {}", user)))?,
    };
    let gid = match group {
        None => primary_gid,
        Some(g) => match g.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => lookup(&root.join("etc/group"), g)?
                .map(|fields| fields.0)
                .ok_or_else(|| invalid(format!("unknown group {}", g)))?,
        },
    };
    Ok(Some((uid, gid)))
}

// Reads `name:x:id:id2:...` databases, returning the third and fourth fields.
fn lookup(db: &Path, name: &str) -> Result<Option<(u32, u32)>, SnapshotError> {
    let content = fs::read_to_string(db).map_err(|e| SnapshotError::io(db, e))?;
    for line in content.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 3 && fields[0] == name {
            let id = fields[2].parse().map_err(|_| invalid(format!("bad id in {}", db.display())))?;
            let second = fields.get(3).and_then(|f| f.parse().ok()).unwrap_or(id);
            return Ok(Some((id, second)));
        }
    }
    Ok(None)
}

fn invalid(reason: String) -> SnapshotError {
    SnapshotError::InvalidCopy { reason }
}

/// One validated COPY or ADD: sources relative to `src_root`, copied to an
/// absolute in-image destination.
#[derive(Debug, Clone)]
pub struct CopyOperation {
    src_root: PathBuf,
    srcs: Vec<String>,
    dst: String,
    owner: Option<(u32, u32)>,
    /// Copies out of a previous stage's checkpoint ignore the blacklist and
    /// keep file ownership.
    internal: bool,
    blacklist: Blacklist,
    /// ADD extracts local archives instead of copying them.
    from_add: bool,
}

impl CopyOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        srcs: Vec<String>,
        src_root: impl Into<PathBuf>,
        work_dir: &str,
        dst: &str,
        owner: Option<(u32, u32)>,
        internal: bool,
        blacklist: Blacklist,
        from_add: bool,
    ) -> Result<Self, SnapshotError> {
        if srcs.is_empty() {
            return Err(invalid("srcs cannot be empty".into()));
        }
        if srcs.len() > 1 && !is_dir_format(dst) {
            return Err(invalid(
                "copying multiple sources, destination must end with \"/\"".into(),
            ));
        }
        if !dst.starts_with('/') && !work_dir.starts_with('/') {
            return Err(invalid(
                "dst is not an absolute path, an absolute working directory is required".into(),
            ));
        }

        Ok(Self {
            src_root: src_root.into(),
            srcs: srcs.iter().map(|s| rel_path(s).to_string()).collect(),
            dst: resolve_destination(work_dir, dst),
            owner,
            internal,
            blacklist,
            from_add,
        })
    }

    pub fn src_root(&self) -> &Path {
        &self.src_root
    }

    pub fn srcs(&self) -> &[String] {
        &self.srcs
    }

    pub fn dst(&self) -> &str {
        &self.dst
    }

    pub fn owner(&self) -> Option<(u32, u32)> {
        self.owner
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Paths skipped while copying. Internal copies skip nothing.
    pub fn blacklist(&self) -> Blacklist {
        if self.internal {
            Blacklist::empty()
        } else {
            self.blacklist.clone()
        }
    }

    /// Ownership given to copied files.
    pub fn file_owner(&self) -> Owner {
        match (self.owner, self.internal) {
            (Some((uid, gid)), _) => Owner::Fixed { uid, gid },
            (None, true) => Owner::Preserve,
            (None, false) => Owner::Fixed { uid: 0, gid: 0 },
        }
    }

    /// True when ADD will extract this source instead of copying it.
    pub fn is_archive(&self, src: &str) -> bool {
        self.from_add && is_archive_name(src)
    }

    /// Performs the copy on disk, with the destination rooted at `dst_root`.
    pub fn execute(&self, dst_root: &Path) -> Result<(), SnapshotError> {
        let copier = Copier::new(self.blacklist());
        let owner = self.file_owner();
        let dst = dst_root.join(rel_path(&self.dst));

        for src in &self.srcs {
            let resolved = eval_symlinks(src, &self.src_root)?;
            let src_path = self.src_root.join(rel_path(&resolved));
            let md = fs::symlink_metadata(&src_path).map_err(|e| SnapshotError::io(&src_path, e))?;

            if self.is_archive(&resolved) && md.is_file() {
                extract_archive(&src_path, &dst, owner, &self.blacklist())?;
                continue;
            }

            if md.is_dir() {
                copier.copy_dir(&src_path, &dst, owner)
            } else if is_dir_format(&self.dst) {
                let name = src_path.file_name().map(PathBuf::from).unwrap_or_default();
                copier.copy_file(&src_path, &dst.join(name), owner)
            } else {
                copier.copy_file(&src_path, &dst, owner)
            }
            .map_err(|e| SnapshotError::io(&src_path, e))?;
        }
        Ok(())
    }
}

fn resolve_destination(work_dir: &str, dst: &str) -> String {
    if dst.starts_with('/') {
        return dst.to_string();
    }
    let mut abs = join_path(work_dir, dst);
    if is_dir_format(dst) && !abs.ends_with('/') {
        abs.push('/');
    }
    abs
}

fn is_archive_name(src: &str) -> bool {
    src.ends_with(".tar") || src.ends_with(".tar.gz") || src.ends_with(".tgz")
}

/// Extracts a local `.tar`, `.tar.gz` or `.tgz` into `dst`, creating it if
/// needed. Entries landing on a blacklisted path are skipped, and a fixed
/// owner is applied to every extracted entry.
pub(crate) fn extract_archive(
    src: &Path,
    dst: &Path,
    owner: Owner,
    blacklist: &Blacklist,
) -> Result<(), SnapshotError> {
    match fs::metadata(dst) {
        Ok(md) if !md.is_dir() => {
            return Err(invalid(format!(
                "target untar path exists and is not a directory: {}",
                dst.display()
            )));
        }
        Ok(_) => {}
        Err(_) => fs::create_dir_all(dst).map_err(|e| SnapshotError::io(dst, e))?,
    }

    info!("* Extracting {} into {}", src.display(), dst.display());
    let file = fs::File::open(src).map_err(|e| SnapshotError::io(src, e))?;
    if src.to_string_lossy().ends_with(".tar") {
        unpack_entries(tar::Archive::new(file), src, dst, owner, blacklist)
    } else {
        unpack_entries(tar::Archive::new(tario::gzip_reader(file)), src, dst, owner, blacklist)
    }
}

fn unpack_entries<R: Read>(
    mut archive: tar::Archive<R>,
    src: &Path,
    dst: &Path,
    owner: Owner,
    blacklist: &Blacklist,
) -> Result<(), SnapshotError> {
    let io_err = |e: io::Error| SnapshotError::io(src, e);
    archive.set_preserve_permissions(true);
    for entry in archive.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        let target = dst.join(entry.path().map_err(io_err)?);
        if blacklist.contains(&target) {
            info!("* Ignoring extraction of {} because it is blacklisted", target.display());
            continue;
        }
        // Entries escaping `dst` are not unpacked.
        if !entry.unpack_in(dst).map_err(io_err)? {
            continue;
        }
        if let Owner::Fixed { uid, gid } = owner {
            std::os::unix::fs::lchown(&target, Some(uid), Some(gid))
                .map_err(|e| SnapshotError::io(&target, e))?;
        }
    }
    Ok(())
}
