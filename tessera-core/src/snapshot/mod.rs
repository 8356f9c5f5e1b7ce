//! Layered filesystem snapshot engine.
//!
//! [`MemFs`] keeps an in-memory view of the filesystem under a build root
//! and turns changes into image layers, either by scanning the root for
//! differences or by replaying [`CopyOperation`]s without touching disk.

mod copy_op;
mod layer;
mod memfs;
mod tree;
mod walk;

pub use copy_op::{is_dir_format, resolve_chown, CopyOperation};
pub use layer::{Layer, LayerEntry};
pub use memfs::{MemFs, DEFAULT_SCAN_DELAY};
pub use tree::{Tree, TreeNode};
pub use walk::{eval_symlinks, remove_all_children, should_skip, walk};

use crate::tario::TarioError;
use std::io;
use std::path::PathBuf;

/// Basename prefix marking a deleted sibling in a layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Basename prefix of AUFS metadata entries, which are ignored.
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// Maximum symlink redirections while resolving layer ancestors.
pub const MAX_ANCESTOR_DEPTH: usize = 1024;

/// Maximum symlinks followed while resolving a copy source.
pub const MAX_LINKS: usize = 255;

/// Error type for snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("tar: {0}")]
    Tario(#[from] TarioError),

    #[error("symlink loop resolving {path}")]
    SymlinkLoop { path: String },

    #[error("too many links resolving {path}")]
    TooManyLinks { path: String },

    #[error("link {link:?} points outside of root: {target:?}")]
    LinkOutsideRoot { link: PathBuf, target: PathBuf },

    #[error("{path} is not a directory")]
    NotADirectory { path: String },

    #[error("missing intermediate directory for {path}")]
    MissingParent { path: String },

    #[error("whiteout of nonexistent path {path}")]
    WhiteoutNonexistent { path: String },

    #[error("base name of {path} already has the whiteout prefix")]
    WhiteoutPrefix { path: String },

    #[error("invalid copy operation: {reason}")]
    InvalidCopy { reason: String },
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
