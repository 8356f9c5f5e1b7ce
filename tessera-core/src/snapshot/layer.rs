use super::{SnapshotError, Tree, TreeNode, WHITEOUT_PREFIX};
use crate::fsutil::{abs_path, rel_path, split_base};
use crate::tario::{self, FileHeader};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One change in a layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerEntry {
    /// A file whose content is read from `src` and lands at `dst`.
    Content { src: PathBuf, dst: String, hdr: FileHeader },
    /// Deletion of `deleted`, written as a `.wh.`-prefixed marker.
    Whiteout { deleted: String, hdr: FileHeader },
}

impl LayerEntry {
    pub fn header(&self) -> &FileHeader {
        match self {
            LayerEntry::Content { hdr, .. } | LayerEntry::Whiteout { hdr, .. } => hdr,
        }
    }

    pub fn is_whiteout(&self) -> bool {
        matches!(self, LayerEntry::Whiteout { .. })
    }

    /// Merges this entry into `tree`.
    pub fn apply(&self, tree: &mut Tree) -> Result<(), SnapshotError> {
        match self {
            LayerEntry::Content { src, dst, hdr } => {
                tree.insert(dst, TreeNode { src: src.clone(), hdr: hdr.clone() })
            }
            LayerEntry::Whiteout { deleted, .. } => tree.remove(deleted),
        }
    }

    pub fn commit<W: Write>(&self, builder: &mut tar::Builder<W>) -> Result<(), SnapshotError> {
        match self {
            LayerEntry::Content { src, hdr, .. } => tario::write_entry(builder, src, hdr)?,
            LayerEntry::Whiteout { hdr, .. } => tario::write_header(builder, hdr)?,
        }
        Ok(())
    }
}

/// An in-memory layer: at most one entry per destination path, committed
/// in path order.
#[derive(Debug, Clone, Default)]
pub struct Layer {
    entries: BTreeMap<String, LayerEntry>,
}

impl Layer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&LayerEntry> {
        self.entries.get(path)
    }

    /// Entries in commit order.
    pub fn entries(&self) -> impl Iterator<Item = &LayerEntry> {
        self.entries.values()
    }

    /// Adds `hdr` for `dst`. A `.wh.`-prefixed basename becomes a whiteout
    /// of its sibling, keyed by the deleted path.
    pub fn add_header(&mut self, src: &Path, dst: &str, hdr: FileHeader) -> &LayerEntry {
        let dst = abs_path(dst);
        let (dir, base) = split_base(&dst);
        let (key, entry) = match base.strip_prefix(WHITEOUT_PREFIX) {
            Some(deleted_base) => {
                let deleted = format!("{}{}", dir, deleted_base);
                let hdr = FileHeader::whiteout(rel_path(&dst));
                (deleted.clone(), LayerEntry::Whiteout { deleted, hdr })
            }
            None => (
                dst.clone(),
                LayerEntry::Content { src: src.to_path_buf(), dst: dst.clone(), hdr },
            ),
        };
        self.entries.insert(key.clone(), entry);
        &self.entries[&key]
    }

    /// Adds a whiteout for `path`, which must not carry the prefix itself.
    pub fn add_whiteout(&mut self, path: &str) -> Result<&LayerEntry, SnapshotError> {
        let deleted = abs_path(path);
        let (dir, base) = split_base(&deleted);
        if base.starts_with(WHITEOUT_PREFIX) {
            return Err(SnapshotError::WhiteoutPrefix { path: deleted });
        }
        let marker = format!("{}{}{}", dir, WHITEOUT_PREFIX, base);
        let hdr = FileHeader::whiteout(rel_path(&marker));
        self.entries.insert(deleted.clone(), LayerEntry::Whiteout { deleted: deleted.clone(), hdr });
        Ok(&self.entries[&deleted])
    }

    /// Writes every entry to `builder` in path order.
    pub fn commit<W: Write>(&self, builder: &mut tar::Builder<W>) -> Result<(), SnapshotError> {
        for entry in self.entries.values() {
            entry.commit(builder)?;
        }
        Ok(())
    }
}
