use super::copy_op::extract_archive;
use super::{
    eval_symlinks, is_dir_format, remove_all_children, should_skip, walk, CopyOperation, Layer,
    SnapshotError, Tree, TreeNode, MAX_ANCESTOR_DEPTH, WHITEOUT_PREFIX,
};
use crate::fsutil::{
    abs_path, join_path, lstat_opt, rel_path, split_base, split_path, trim_root, Blacklist,
    Copier, MountTable, Owner,
};
use crate::tario::{self, EntryKind, FileHeader};
use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default pause before scanning, since some filesystems only keep mtimes
/// in whole seconds.
pub const DEFAULT_SCAN_DELAY: Duration = Duration::from_secs(1);

/// An in-memory view of the filesystem under `root`, plus the layers that
/// produced it.
///
/// Every layer added through [`MemFs::update_from_tar`],
/// [`MemFs::add_layer_by_scan`] or [`MemFs::add_layer_by_copy_ops`] is merged
/// into the view, so later layers only carry what changed.
#[derive(Debug)]
pub struct MemFs {
    root: PathBuf,
    tree: Tree,
    blacklist: Blacklist,
    mounts: MountTable,
    layers: Vec<Layer>,
    scan_delay: Duration,
    settled: bool,
}

impl MemFs {
    pub fn new(root: impl Into<PathBuf>, blacklist: Blacklist) -> Result<Self, SnapshotError> {
        let root = root.into();
        let md = fs::symlink_metadata(&root).map_err(|e| SnapshotError::io(&root, e))?;
        let hdr = create_header(&root, &root, "/", &md)?;
        let mounts = MountTable::system().within(&root);
        Ok(Self {
            tree: Tree::new(TreeNode { src: root.clone(), hdr }),
            root,
            blacklist,
            mounts,
            layers: Vec::new(),
            scan_delay: DEFAULT_SCAN_DELAY,
            settled: false,
        })
    }

    pub fn with_scan_delay(mut self, delay: Duration) -> Self {
        self.scan_delay = delay;
        self
    }

    pub fn with_mounts(mut self, mounts: MountTable) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Forgets the merged view. Layers already produced are kept.
    pub fn reset(&mut self) {
        self.tree.reset();
    }

    /// Copies `sources` (relative to the root, globs allowed) to the same
    /// relative locations under `new_root`, preserving ownership.
    pub fn checkpoint(&self, new_root: &Path, sources: &[String]) -> Result<(), SnapshotError> {
        info!("* Moving directories {:?} to {}", sources, new_root.display());
        let copier = Copier::new(self.blacklist.clone());

        for source in sources {
            let joined = self.root.join(rel_path(source));
            let matches: Vec<PathBuf> = glob::glob(&joined.to_string_lossy())
                .map(|paths| paths.filter_map(|p| p.ok()).collect())
                .unwrap_or_default();
            let resolved = if matches.is_empty() { vec![joined] } else { matches };

            for src in resolved {
                let trimmed = trim_root(&src, &self.root).map_err(|e| SnapshotError::io(&src, e))?;
                let dst = new_root.join(rel_path(&trimmed));
                let md = fs::metadata(&src).map_err(|e| SnapshotError::io(&src, e))?;
                if md.is_dir() {
                    copier.copy_dir(&src, &dst, Owner::Preserve)
                } else {
                    copier.copy_file(&src, &dst, Owner::Preserve)
                }
                .map_err(|e| SnapshotError::io(&src, e))?;
            }
        }
        Ok(())
    }

    /// Removes everything under the root except blacklisted paths and
    /// mount points. Returns the paths that could not be removed.
    pub fn remove(&self) -> Vec<PathBuf> {
        remove_all_children(&self.root, &self.blacklist, &self.mounts)
    }

    /// Merges a gzipped layer tarball, optionally extracting it onto the root.
    pub fn update_from_tar_path(&mut self, path: &Path, untar: bool) -> Result<&Layer, SnapshotError> {
        let file = fs::File::open(path).map_err(|e| SnapshotError::io(path, e))?;
        self.update_from_tar(tario::gzip_reader(file), untar)
    }

    /// Merges an uncompressed tar stream into the view as a new layer. With
    /// `untar`, entries are also written to disk under the root; parent
    /// directory mtimes are restored afterwards.
    pub fn update_from_tar<R: Read>(&mut self, r: R, untar: bool) -> Result<&Layer, SnapshotError> {
        let start = Instant::now();
        let mut archive = tar::Archive::new(r);
        let mut layer = Layer::new();
        let mut hardlinks: Vec<(PathBuf, String, FileHeader)> = Vec::new();
        let mut mtimes: BTreeMap<PathBuf, i64> = BTreeMap::new();
        let mut count = 0usize;

        let entries = archive.entries().map_err(|e| SnapshotError::io(&self.root, e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| SnapshotError::io(&self.root, e))?;
            let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let linkname = entry
                .link_name_bytes()
                .map(|l| String::from_utf8_lossy(&l).into_owned())
                .unwrap_or_default();

            let dst = abs_path(&raw_name);
            let path = self.root.join(rel_path(&dst));
            let kind = EntryKind::from_tar(entry.header().entry_type());
            if kind == EntryKind::Special
                || should_skip(&path, None, &self.blacklist, &self.mounts)
                || self.mounts.is_mounted(&path)
            {
                continue;
            }

            if untar && path != self.root {
                if let Some(parent) = path.parent() {
                    if !mtimes.contains_key(parent) {
                        if let Some(md) = lstat_opt(parent).map_err(|e| SnapshotError::io(parent, e))? {
                            mtimes.insert(parent.to_path_buf(), md.mtime());
                        }
                    }
                }
            }

            let mut hdr = FileHeader::from_tar(entry.header(), header_name(&dst, kind), linkname)
                .map_err(|e| SnapshotError::io(&path, e))?;

            if kind == EntryKind::Hardlink {
                // Layer tars store hard link targets without the leading slash.
                hdr.linkname = abs_path(&hdr.linkname);
                hardlinks.push((path, dst, hdr));
            } else {
                if untar {
                    self.untar_one_item(&path, &dst, &hdr, &mut entry)?;
                }
                if self.is_stale_whiteout(&dst) {
                    debug!(path = %dst, "Ignoring whiteout of path missing from memfs");
                } else {
                    self.maybe_add_to_layer(&mut layer, &path, &dst, hdr, false)?;
                }
            }
            count += 1;
        }

        for (path, dst, hdr) in hardlinks {
            if untar {
                self.untar_one_item(&path, &dst, &hdr, &mut io::empty())?;
            }
            self.maybe_add_to_layer(&mut layer, &path, &dst, hdr, false)?;
        }

        for (path, mtime) in &mtimes {
            tario::set_mtime(path, *mtime).map_err(|e| SnapshotError::io(path, e))?;
        }

        if untar {
            info!(
                "* Untarred {} files to {} in {:?}",
                count,
                self.root.display(),
                start.elapsed()
            );
        }
        info!("* Merged {} headers from tar to memfs", layer.len());
        Ok(self.push_layer(layer))
    }

    /// Scans the root for differences against the view and writes them to
    /// `builder` as a new layer, whiting out deleted paths.
    pub fn add_layer_by_scan<W: Write>(
        &mut self,
        builder: &mut tar::Builder<W>,
    ) -> Result<&Layer, SnapshotError> {
        self.sync();
        let start = Instant::now();
        info!("* Collecting filesystem diff");

        let mut layer = Layer::new();
        let root = self.root.clone();
        for (src, md) in walk(&root, &self.blacklist, &self.mounts)? {
            let dst = trim_root(&src, &root).map_err(|e| SnapshotError::io(&src, e))?;
            let hdr = create_header(&root, &src, &dst, &md)?;
            self.maybe_add_to_layer(&mut layer, &src, &dst, hdr, true)?;
        }
        info!(
            "* Finished collecting diff in {:?}: {} files found",
            start.elapsed(),
            layer.len()
        );

        let layer = self.commit_layer(layer, builder)?;
        info!("* Created layer by scanning filesystem; {} files found", layer.len());
        Ok(layer)
    }

    /// Builds a layer from copy operations without touching the root, and
    /// writes it to `builder`.
    pub fn add_layer_by_copy_ops<W: Write>(
        &mut self,
        ops: &[CopyOperation],
        builder: &mut tar::Builder<W>,
    ) -> Result<&Layer, SnapshotError> {
        self.sync();
        let mut layer = Layer::new();
        // Extracted archives must outlive the commit, which reads their files.
        let mut staging = Vec::new();
        for op in ops {
            self.add_to_layer(&mut layer, op, &mut staging)?;
        }
        let layer = self.commit_layer(layer, builder)?;
        info!("* Created copy layer with {} files", layer.len());
        Ok(layer)
    }

    /// Flushes dirty pages and waits out the scan delay on the runtime's
    /// timer. The next diff then skips its own blocking wait.
    pub async fn settle(&mut self) {
        let start = Instant::now();
        if let Err(e) = tokio::task::spawn_blocking(|| unsafe { libc::sync() }).await {
            warn!("sync before scan failed: {}", e);
        }
        if let Some(rest) = self.scan_delay.checked_sub(start.elapsed()) {
            tokio::time::sleep(rest).await;
        }
        self.settled = true;
    }

    // Flushes dirty pages so mtimes are current, then waits out the rest of
    // the scan delay, unless `settle` already did both.
    fn sync(&mut self) {
        if std::mem::take(&mut self.settled) {
            return;
        }
        let start = Instant::now();
        unsafe { libc::sync() };
        if let Some(rest) = self.scan_delay.checked_sub(start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    fn commit_layer<W: Write>(
        &mut self,
        layer: Layer,
        builder: &mut tar::Builder<W>,
    ) -> Result<&Layer, SnapshotError> {
        layer.commit(builder)?;
        Ok(self.push_layer(layer))
    }

    fn push_layer(&mut self, layer: Layer) -> &Layer {
        self.layers.push(layer);
        &self.layers[self.layers.len() - 1]
    }

    fn is_stale_whiteout(&self, dst: &str) -> bool {
        let (dir, base) = split_base(dst);
        match base.strip_prefix(WHITEOUT_PREFIX) {
            Some(deleted) => !self.tree.contains(&format!("{}{}", dir, deleted)),
            None => false,
        }
    }

    /// Adds `hdr` to `layer` when it differs from the view, along with its
    /// ancestors. With `create_whiteout`, children of a directory that are
    /// gone from disk get one whiteout per deleted subtree.
    fn maybe_add_to_layer(
        &mut self,
        layer: &mut Layer,
        src: &Path,
        dst: &str,
        hdr: FileHeader,
        create_whiteout: bool,
    ) -> Result<(), SnapshotError> {
        let existing = self.tree.get(dst).map(|n| n.hdr.clone());
        let updated = match &existing {
            None => true,
            Some(old) => !tario::is_similar_header(old, &hdr)?,
        };
        let children = match &existing {
            Some(old) if create_whiteout && hdr.is_dir() && old.is_dir() => self.tree.children(dst),
            _ => Vec::new(),
        };

        if updated && dst != "/" {
            self.add_ancestors(layer, dst, false, 0, 0, 0)?;
            layer.add_header(src, dst, hdr).apply(&mut self.tree)?;
        }

        for child in children {
            let on_disk = self.root.join(rel_path(&child));
            if lstat_opt(&on_disk).map_err(|e| SnapshotError::io(&on_disk, e))?.is_none() {
                layer.add_whiteout(&child)?.apply(&mut self.tree)?;
                self.add_ancestors(layer, &child, false, 0, 0, 0)?;
            }
        }
        Ok(())
    }

    /// Adds every ancestor of `dst` to `layer`, following symlinks within
    /// the view and creating missing directories owned by `uid:gid`. With
    /// `inclusive`, `dst` itself is treated as a directory too. Returns the
    /// path `dst` resolves to.
    fn add_ancestors(
        &mut self,
        layer: &mut Layer,
        dst: &str,
        inclusive: bool,
        depth: usize,
        uid: u32,
        gid: u32,
    ) -> Result<String, SnapshotError> {
        if depth >= MAX_ANCESTOR_DEPTH {
            return Err(SnapshotError::SymlinkLoop { path: dst.to_string() });
        }

        let parts: Vec<String> = split_path(dst).into_iter().map(String::from).collect();
        let end = if inclusive { parts.len() } else { parts.len().saturating_sub(1) };
        let mut last_ancestor = self.tree.root().hdr.clone();
        let mut curr = "/".to_string();

        let mut i = 0;
        while i < end {
            let path = join_path(&curr, &parts[i]);
            let node = match self.tree.get(&path) {
                Some(node) => node.clone(),
                None => break,
            };
            layer.add_header(&node.src, &path, node.hdr.clone()).apply(&mut self.tree)?;

            match node.hdr.kind {
                EntryKind::Directory => {
                    last_ancestor = node.hdr;
                    curr = path;
                }
                EntryKind::Symlink => {
                    let remaining = parts[i + 1..].join("/");
                    let base = if node.hdr.linkname.starts_with('/') {
                        node.hdr.linkname.clone()
                    } else {
                        join_path(&curr, &node.hdr.linkname)
                    };
                    let target = join_path(&base, &remaining);
                    return self.add_ancestors(layer, &target, inclusive, depth + 1, uid, gid);
                }
                _ => return Err(SnapshotError::NotADirectory { path }),
            }
            i += 1;
        }

        let now = chrono::Utc::now().timestamp();
        for j in i..end {
            let path = abs_path(&parts[..=j].join("/"));
            let mut hdr = last_ancestor.clone();
            hdr.name = header_name(&path, EntryKind::Directory);
            hdr.kind = EntryKind::Directory;
            hdr.size = 0;
            hdr.linkname.clear();
            hdr.mtime = now;
            hdr.uid = uid as u64;
            hdr.gid = gid as u64;
            layer.add_header(Path::new(""), &path, hdr).apply(&mut self.tree)?;
        }

        Ok(dst.to_string())
    }

    /// Replays one copy operation against the view. A directory source has
    /// its contents copied into the destination; a file lands at the
    /// destination, or inside it when the destination names a directory.
    /// ADD archives are extracted into a directory pushed onto `staging`
    /// and their contents copied like a directory source.
    fn add_to_layer(
        &mut self,
        layer: &mut Layer,
        op: &CopyOperation,
        staging: &mut Vec<tempfile::TempDir>,
    ) -> Result<(), SnapshotError> {
        let owner = op.file_owner();
        let (uid, gid) = match owner {
            Owner::Fixed { uid, gid } => (uid, gid),
            Owner::Preserve => (0, 0),
        };

        let single_file = match op.srcs() {
            [src] => {
                let path = op.src_root().join(src);
                !fs::metadata(&path).map_err(|e| SnapshotError::io(&path, e))?.is_dir() && !op.is_archive(src)
            }
            _ => false,
        };

        let dst = if single_file && !is_dir_format(op.dst()) {
            let (parent, base) = split_base(op.dst());
            let parent = self.add_ancestors(layer, &abs_path(parent), true, 0, uid, gid)?;
            join_path(&parent, base)
        } else {
            let mut resolved = self.add_ancestors(layer, &abs_path(op.dst()), true, 0, uid, gid)?;
            if !resolved.ends_with('/') {
                resolved.push('/');
            }
            resolved
        };

        let blacklist = op.blacklist();
        let no_mounts = MountTable::default();
        for src in op.srcs() {
            let resolved = eval_symlinks(src, op.src_root())?;
            let mut src_path = op.src_root().join(rel_path(&resolved));
            if op.is_archive(&resolved) && fs::metadata(&src_path).map(|md| md.is_file()).unwrap_or(false) {
                let dir = tempfile::Builder::new()
                    .prefix("add")
                    .tempdir()
                    .map_err(|e| SnapshotError::io(&src_path, e))?;
                extract_archive(&src_path, dir.path(), Owner::Preserve, &Blacklist::empty())?;
                src_path = dir.path().to_path_buf();
                staging.push(dir);
            }

            for (curr_src, md) in walk(&src_path, &blacklist, &no_mounts)? {
                let curr_dst = if curr_src == src_path {
                    if md.is_dir() {
                        continue;
                    } else if !dst.ends_with('/') {
                        dst.clone()
                    } else {
                        let name = curr_src
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        join_path(&dst, &name)
                    }
                } else {
                    let suffix = curr_src.strip_prefix(&src_path).unwrap_or(&curr_src);
                    join_path(&dst, &suffix.to_string_lossy())
                };

                let mut hdr = create_header(&self.root, &curr_src, &curr_dst, &md)?;
                if let Owner::Fixed { uid, gid } = owner {
                    hdr.uid = uid as u64;
                    hdr.gid = gid as u64;
                }
                self.maybe_add_to_layer(layer, &curr_src, &curr_dst, hdr, false)?;
            }
        }
        Ok(())
    }

    /// Writes one tar entry to `path`, replacing whatever differs on disk.
    /// Existing directories are updated in place.
    fn untar_one_item(
        &self,
        path: &Path,
        dst: &str,
        hdr: &FileHeader,
        r: &mut dyn Read,
    ) -> Result<(), SnapshotError> {
        let io_err = |e: io::Error| SnapshotError::io(path, e);
        let base = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if let Some(deleted) = base.strip_prefix(WHITEOUT_PREFIX) {
            let target = path.with_file_name(deleted);
            return remove_path(&target).map_err(|e| SnapshotError::io(&target, e));
        }

        if let Some(local) = lstat_opt(path).map_err(io_err)? {
            let local_hdr = create_header(&self.root, path, dst, &local)?;
            if tario::is_similar_header(&local_hdr, hdr)? {
                return Ok(());
            }
            if local.is_dir() && hdr.is_dir() {
                return Ok(tario::apply_header(path, hdr)?);
            }
            remove_path(path).map_err(io_err)?;
        }

        match hdr.kind {
            EntryKind::Directory => {
                fs::create_dir(path).map_err(io_err)?;
                tario::apply_header(path, hdr)?;
            }
            EntryKind::Symlink => {
                let target = if hdr.linkname.starts_with('/') {
                    self.root.join(rel_path(&hdr.linkname))
                } else {
                    PathBuf::from(&hdr.linkname)
                };
                std::os::unix::fs::symlink(&target, path).map_err(io_err)?;
            }
            EntryKind::Hardlink => {
                let target = self.root.join(rel_path(&hdr.linkname));
                fs::hard_link(&target, path).map_err(io_err)?;
                tario::apply_header(path, hdr)?;
            }
            EntryKind::Regular => {
                let mut file = fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(hdr.mode)
                    .open(path)
                    .map_err(io_err)?;
                io::copy(r, &mut file).map_err(io_err)?;
                drop(file);
                tario::apply_header(path, hdr)?;
            }
            EntryKind::Special => {}
        }
        Ok(())
    }
}

/// Header name for an in-image path: relative, with a trailing `/` for
/// directories. The root becomes `/`.
fn header_name(dst: &str, kind: EntryKind) -> String {
    let mut name = rel_path(dst).to_string();
    if kind == EntryKind::Directory && !name.ends_with('/') {
        name.push('/');
    }
    name
}

/// Builds the header for host path `src` landing at `dst`. Absolute symlink
/// targets inside `root` are rewritten relative to it; targets outside are
/// kept as they are.
fn create_header(root: &Path, src: &Path, dst: &str, md: &Metadata) -> Result<FileHeader, SnapshotError> {
    let kind = FileHeader::from_metadata("", md).kind;
    let mut hdr = FileHeader::from_metadata(header_name(dst, kind), md);
    if hdr.is_symlink() {
        let target = fs::read_link(src).map_err(|e| SnapshotError::io(src, e))?;
        hdr.linkname = if target.is_absolute() {
            trim_root(&target, root).unwrap_or_else(|_| target.to_string_lossy().into_owned())
        } else {
            target.to_string_lossy().into_owned()
        };
    }
    Ok(hdr)
}

fn remove_path(path: &Path) -> io::Result<()> {
    match lstat_opt(path)? {
        Some(md) if md.is_dir() => fs::remove_dir_all(path),
        Some(_) => fs::remove_file(path),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::LayerEntry;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn memfs(root: &Path) -> MemFs {
        MemFs::new(root, Blacklist::empty())
            .unwrap()
            .with_scan_delay(Duration::ZERO)
            .with_mounts(MountTable::default())
    }

    fn me() -> Option<(u32, u32)> {
        Some(unsafe { (libc::geteuid(), libc::getegid()) })
    }

    fn scan(fs: &mut MemFs) -> (usize, Vec<u8>) {
        let mut builder = tar::Builder::new(Vec::new());
        let len = fs.add_layer_by_scan(&mut builder).unwrap().len();
        (len, builder.into_inner().unwrap())
    }

    fn tar_names(data: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| String::from_utf8_lossy(&e.unwrap().path_bytes()).into_owned())
            .collect()
    }

    #[test]
    fn test_scan_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/c.txt"), b"hello").unwrap();
        symlink("c.txt", root.join("a/b/link")).unwrap();

        let mut fs = memfs(root);
        let (len, data) = scan(&mut fs);
        assert_eq!(len, 4);
        assert_eq!(tar_names(&data), vec!["a/", "a/b/", "a/b/c.txt", "a/b/link"]);

        let (len, data) = scan(&mut fs);
        assert_eq!(len, 0);
        assert!(tar_names(&data).is_empty());
        assert_eq!(fs.layers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_waits_on_runtime_timer() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("f"), b"one").unwrap();
        let mut fs = memfs(tmp.path()).with_scan_delay(Duration::from_secs(30));

        let wall = std::time::Instant::now();
        let timer = tokio::time::Instant::now();
        fs.settle().await;
        assert!(timer.elapsed() >= Duration::from_secs(30));

        // The diff right after does not wait again.
        let (len, _) = scan(&mut fs);
        assert_eq!(len, 1);
        assert!(wall.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_scan_detects_modification() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("f"), b"one").unwrap();

        let mut fs = memfs(root);
        scan(&mut fs);
        fs::write(root.join("f"), b"three").unwrap();
        let (len, data) = scan(&mut fs);
        assert_eq!(len, 1);
        assert_eq!(tar_names(&data), vec!["f"]);
    }

    #[test]
    fn test_scan_whiteout_once_per_subtree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("test1/test2")).unwrap();
        fs::create_dir_all(root.join("test1/test4/test5")).unwrap();
        fs::write(root.join("test1/test2/test3.txt"), b"hello").unwrap();
        fs::write(root.join("test1/test4/test5/test6.txt"), b"hello").unwrap();
        tario::set_mtime(root, 1000).unwrap();

        let mut fs = memfs(root);
        let (len, _) = scan(&mut fs);
        assert_eq!(len, 6);

        fs::remove_dir_all(root.join("test1")).unwrap();
        let (len, data) = scan(&mut fs);
        assert_eq!(len, 1);
        assert_eq!(tar_names(&data), vec![".wh.test1"]);
        assert!(!fs.tree().contains("/test1"));
        assert!(!fs.tree().contains("/test1/test2"));
    }

    #[test]
    fn test_copy_ops_do_not_touch_disk() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let ctx = tmp.path().join("ctx");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(ctx.join("dir")).unwrap();
        fs::write(ctx.join("dir/x"), b"x").unwrap();
        fs::write(ctx.join("file"), b"f").unwrap();

        let op = CopyOperation::new(
            vec!["file".into(), "dir".into()],
            &ctx,
            "/",
            "/app/",
            me(),
            false,
            Blacklist::empty(),
            false,
        )
        .unwrap();

        let mut fs = memfs(&root);
        let mut builder = tar::Builder::new(Vec::new());
        let layer = fs.add_layer_by_copy_ops(&[op], &mut builder).unwrap();
        assert!(layer.get("/app").is_some());
        assert!(layer.get("/app/file").is_some());
        assert!(layer.get("/app/x").is_some());
        assert!(!root.join("app").exists());
        assert_eq!(
            tar_names(&builder.into_inner().unwrap()),
            vec!["app/", "app/file", "app/x"]
        );
    }

    #[test]
    fn test_copy_into_symlinked_directory_resolves_target() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let ctx = tmp.path().join("ctx");
        fs::create_dir_all(root.join("real")).unwrap();
        symlink(root.join("real"), root.join("link")).unwrap();
        fs::create_dir_all(ctx.join("dir")).unwrap();
        fs::write(ctx.join("dir/x"), b"x").unwrap();

        let mut fs = memfs(&root);
        scan(&mut fs);
        assert_eq!(fs.tree().get("/link").unwrap().hdr.linkname, "/real");

        let op = CopyOperation::new(
            vec!["dir".into()],
            &ctx,
            "/",
            "/link/sub",
            me(),
            false,
            Blacklist::empty(),
            false,
        )
        .unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let layer = fs.add_layer_by_copy_ops(&[op], &mut builder).unwrap();

        assert!(layer.get("/link").is_some());
        assert!(layer.get("/real/sub").is_some());
        assert!(layer.get("/real/sub/x").is_some());
        assert!(fs.tree().contains("/real/sub/x"));
        assert!(!fs.tree().contains("/link/sub"));
    }

    #[test]
    fn test_untar_round_trip() {
        let tmp = TempDir::new().unwrap();
        let src_root = tmp.path().join("src");
        let dst_root = tmp.path().join("dst");
        fs::create_dir_all(src_root.join("etc/app")).unwrap();
        fs::create_dir_all(&dst_root).unwrap();
        fs::write(src_root.join("etc/app/conf"), b"key=value").unwrap();
        fs::hard_link(src_root.join("etc/app/conf"), src_root.join("etc/conf.link")).unwrap();
        symlink("/etc/app/conf", src_root.join("etc/abs")).unwrap();

        let mut src = memfs(&src_root);
        let (_, data) = scan(&mut src);

        let mut dst = memfs(&dst_root);
        let merged = dst.update_from_tar(&data[..], true).unwrap().len();
        assert_eq!(merged, 5);
        assert_eq!(fs::read(dst_root.join("etc/app/conf")).unwrap(), b"key=value");
        assert_eq!(fs::read_link(dst_root.join("etc/abs")).unwrap(), dst_root.join("etc/app/conf"));

        let (len, _) = scan(&mut dst);
        assert_eq!(len, 0);
    }

    #[test]
    fn test_untar_applies_whiteouts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("gone/inner")).unwrap();

        let mut fs = memfs(root);
        scan(&mut fs);

        let mut builder = tar::Builder::new(Vec::new());
        let mut layer = Layer::new();
        layer.add_whiteout("/gone").unwrap();
        layer.add_whiteout("/never-existed").unwrap();
        layer.commit(&mut builder).unwrap();
        let data = builder.into_inner().unwrap();

        let merged = fs.update_from_tar(&data[..], true).unwrap();
        assert_eq!(merged.len(), 1);
        assert!(matches!(merged.get("/gone"), Some(LayerEntry::Whiteout { .. })));
        assert!(!root.join("gone").exists());
        assert!(!fs.tree().contains("/gone/inner"));
    }

    #[test]
    fn test_checkpoint_copies_sources_with_globs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let saved = tmp.path().join("saved");
        fs::create_dir_all(root.join("app/bin")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("app/bin/tool"), b"tool").unwrap();
        fs::write(root.join("etc/a.conf"), b"a").unwrap();
        fs::write(root.join("etc/b.conf"), b"b").unwrap();
        fs::write(root.join("etc/other"), b"o").unwrap();

        let fs = memfs(&root);
        fs.checkpoint(&saved, &["/app".to_string(), "etc/*.conf".to_string()]).unwrap();

        assert_eq!(fs::read(saved.join("app/bin/tool")).unwrap(), b"tool");
        assert!(saved.join("etc/a.conf").exists());
        assert!(saved.join("etc/b.conf").exists());
        assert!(!saved.join("etc/other").exists());
        assert!(fs.checkpoint(&saved, &["missing".to_string()]).is_err());
    }

    #[test]
    fn test_remove_keeps_blacklisted_paths() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("keep/me")).unwrap();
        fs::create_dir_all(root.join("drop/me")).unwrap();

        let blacklist = Blacklist::empty().with_path(&root.join("keep"));
        let fs = MemFs::new(root, blacklist).unwrap().with_mounts(MountTable::default());
        assert!(fs.remove().is_empty());
        assert!(root.join("keep/me").exists());
        assert!(!root.join("drop").exists());
    }
}
