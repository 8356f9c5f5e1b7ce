use super::{FileHeader, TarioError};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Applies owner, mode and mtime from `header` to the file at `path`.
///
/// Symlinks are refused: their ownership is handled where they are created.
pub fn apply_header(path: &Path, header: &FileHeader) -> Result<(), TarioError> {
    let md = fs::symlink_metadata(path)?;
    if md.file_type().is_symlink() || header.is_symlink() {
        return Err(TarioError::Symlink { path: path.to_path_buf() });
    }

    std::os::unix::fs::chown(path, Some(header.uid as u32), Some(header.gid as u32))?;
    fs::set_permissions(path, fs::Permissions::from_mode(header.mode))?;
    set_mtime(path, header.mtime)?;
    Ok(())
}

/// Sets both atime and mtime of `path` to `secs` without following symlinks.
pub fn set_mtime(path: &Path, secs: i64) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;
    let ts = libc::timespec { tv_sec: secs as libc::time_t, tv_nsec: 0 };
    let times = [ts, ts];
    // SAFETY: `c_path` is a valid NUL-terminated string and `times` holds two timespecs.
    let ret = unsafe {
        libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW)
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tario::EntryKind;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn test_apply_header_sets_mode_and_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        let md = fs::metadata(&path).unwrap();

        let header = FileHeader {
            name: "f".into(),
            kind: EntryKind::Regular,
            mode: 0o600,
            uid: md.uid() as u64,
            gid: md.gid() as u64,
            size: 1,
            mtime: 1_500_000_000,
            linkname: String::new(),
        };
        apply_header(&path, &header).unwrap();

        let md = fs::metadata(&path).unwrap();
        assert_eq!(md.mode() & 0o7777, 0o600);
        assert_eq!(md.mtime(), 1_500_000_000);
    }

    #[test]
    fn test_apply_header_refuses_symlink() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("l");
        std::os::unix::fs::symlink("/nowhere", &link).unwrap();
        let md = fs::symlink_metadata(&link).unwrap();
        let header = FileHeader::from_metadata("l", &md);
        assert!(matches!(apply_header(&link, &header), Err(TarioError::Symlink { .. })));
    }
}
