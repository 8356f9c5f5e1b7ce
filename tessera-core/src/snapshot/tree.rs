use super::SnapshotError;
use crate::fsutil::split_base;
use crate::tario::{EntryKind, FileHeader};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One entry of the merged filesystem view.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    /// Where the content can be read from when the node is committed.
    pub src: PathBuf,
    pub hdr: FileHeader,
}

/// The merged filesystem view, keyed by normalized absolute path.
///
/// Child relationships come from path prefixes, so every key's ancestors
/// are present as long as updates go through [`Tree::insert`] and
/// [`Tree::remove`]. The root `/` always exists.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: BTreeMap<String, TreeNode>,
}

impl Tree {
    pub fn new(root: TreeNode) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), root);
        Self { nodes }
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes["/"]
    }

    pub fn get(&self, path: &str) -> Option<&TreeNode> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Absolute paths of the direct children of `path`, sorted.
    pub fn children(&self, path: &str) -> Vec<String> {
        let prefix = dir_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.len() > prefix.len() && !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Absolute paths strictly below `path`.
    pub fn descendants(&self, path: &str) -> Vec<String> {
        let prefix = dir_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.len() > prefix.len())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Adds or replaces the node at `path`. A directory replacing a
    /// directory keeps its children; anything else drops the old subtree.
    pub fn insert(&mut self, path: &str, node: TreeNode) -> Result<(), SnapshotError> {
        if path == "/" {
            if let Some(root) = self.nodes.get_mut("/") {
                root.hdr = node.hdr;
                root.src = node.src;
            }
            return Ok(());
        }
        let (parent, _) = split_base(path);
        let parent = parent.trim_end_matches('/');
        let parent = if parent.is_empty() { "/" } else { parent };
        match self.nodes.get(parent) {
            None => return Err(SnapshotError::MissingParent { path: path.to_string() }),
            Some(p) if p.hdr.kind == EntryKind::Regular || p.hdr.kind == EntryKind::Hardlink => {
                return Err(SnapshotError::NotADirectory { path: parent.to_string() });
            }
            Some(_) => {}
        }
        let keep_children = node.hdr.is_dir()
            && self.nodes.get(path).map(|old| old.hdr.is_dir()).unwrap_or(false);
        if !keep_children {
            self.remove_descendants(path);
        }
        self.nodes.insert(path.to_string(), node);
        Ok(())
    }

    /// Removes `path` and everything below it.
    pub fn remove(&mut self, path: &str) -> Result<(), SnapshotError> {
        if path == "/" || self.nodes.remove(path).is_none() {
            return Err(SnapshotError::WhiteoutNonexistent { path: path.to_string() });
        }
        self.remove_descendants(path);
        Ok(())
    }

    /// Drops everything but the root.
    pub fn reset(&mut self) {
        self.nodes.retain(|k, _| k == "/");
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    fn remove_descendants(&mut self, path: &str) {
        for key in self.descendants(path) {
            self.nodes.remove(&key);
        }
    }
}

fn dir_prefix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}
