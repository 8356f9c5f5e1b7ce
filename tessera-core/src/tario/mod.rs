//! Tar helpers shared by the snapshot engine and the build steps.
//!
//! [`FileHeader`] is the owned header model used throughout the crate; it
//! converts to and from `tar::Header` and `std::fs::Metadata`.

mod apply;
mod compare;
mod gzip;
mod header;
mod write;

pub use apply::{apply_header, set_mtime};
pub use compare::is_similar_header;
pub use gzip::{gzip_reader, gzip_writer, CompressionLevel};
pub use header::{EntryKind, FileHeader};
pub use write::{write_entry, write_header};

use std::io;
use std::path::PathBuf;

/// Error type for tar operations.
#[derive(Debug, thiserror::Error)]
pub enum TarioError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported entry type {kind:?} for {name}")]
    UnsupportedType { name: String, kind: EntryKind },

    #[error("refusing to apply header to symlink {path:?}")]
    Symlink { path: PathBuf },

    #[error("source {path:?} is shorter than its header ({expected} bytes)")]
    ShortSource { path: PathBuf, expected: u64 },
}
