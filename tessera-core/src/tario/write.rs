use super::{EntryKind, FileHeader, TarioError};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Writes `header` and, for regular files, exactly `header.size` bytes read
/// from `src`.
pub fn write_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    src: &Path,
    header: &FileHeader,
) -> Result<(), TarioError> {
    match header.kind {
        EntryKind::Directory | EntryKind::Symlink | EntryKind::Hardlink => {
            write_header(builder, header)
        }
        EntryKind::Regular => {
            let file = File::open(src)?;
            if file.metadata()?.len() < header.size {
                return Err(TarioError::ShortSource {
                    path: src.to_path_buf(),
                    expected: header.size,
                });
            }
            let mut hdr = header.to_tar();
            builder.append_data(&mut hdr, entry_name(header), file.take(header.size))?;
            Ok(())
        }
        EntryKind::Special => {
            Err(TarioError::UnsupportedType { name: header.name.clone(), kind: header.kind })
        }
    }
}

/// Writes a header without content: directories, links and whiteout markers.
pub fn write_header<W: Write>(
    builder: &mut tar::Builder<W>,
    header: &FileHeader,
) -> Result<(), TarioError> {
    let mut hdr = header.to_tar();
    let name = entry_name(header);
    match header.kind {
        EntryKind::Symlink | EntryKind::Hardlink => {
            let target = match header.kind {
                EntryKind::Hardlink => header.linkname.trim_start_matches('/'),
                _ => header.linkname.as_str(),
            };
            builder.append_link(&mut hdr, name, target)?;
        }
        _ => {
            hdr.set_size(0);
            builder.append_data(&mut hdr, name, io::empty())?;
        }
    }
    Ok(())
}

fn entry_name(header: &FileHeader) -> &str {
    header.name.trim_start_matches('/')
}
