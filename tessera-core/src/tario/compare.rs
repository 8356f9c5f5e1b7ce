use super::{EntryKind, FileHeader, TarioError};

/// Reports whether two headers describe the same entry closely enough that
/// the newer one need not be written to a layer.
///
/// This is deliberately weaker than byte equality. Directories compare
/// mtime, owner and mode; regular files add size; hard links add the link
/// target; symlinks compare the link target only. Mtimes are whole seconds.
pub fn is_similar_header(h: &FileHeader, nh: &FileHeader) -> Result<bool, TarioError> {
    if h.kind != nh.kind {
        return Ok(false);
    }
    if h.name.is_empty() && nh.name.is_empty() {
        return Ok(true);
    }

    let same_owner = h.uid == nh.uid && h.gid == nh.gid;
    let same_meta = h.mtime == nh.mtime && same_owner && h.mode == nh.mode;
    match h.kind {
        EntryKind::Symlink => Ok(h.linkname == nh.linkname),
        EntryKind::Hardlink => Ok(same_meta && h.linkname == nh.linkname),
        EntryKind::Directory => Ok(same_meta),
        EntryKind::Regular => Ok(same_meta && h.size == nh.size),
        EntryKind::Special => {
            Err(TarioError::UnsupportedType { name: h.name.clone(), kind: h.kind })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(kind: EntryKind) -> FileHeader {
        FileHeader {
            name: "a/b".into(),
            kind,
            mode: 0o755,
            uid: 1,
            gid: 2,
            size: 10,
            mtime: 1_000,
            linkname: String::new(),
        }
    }

    #[test]
    fn test_regular_file_ignores_content() {
        let a = header(EntryKind::Regular);
        let b = header(EntryKind::Regular);
        assert!(is_similar_header(&a, &b).unwrap());

        let mut bigger = b.clone();
        bigger.size = 11;
        assert!(!is_similar_header(&a, &bigger).unwrap());

        let mut other_owner = b.clone();
        other_owner.uid = 7;
        assert!(!is_similar_header(&a, &other_owner).unwrap());
    }

    #[test]
    fn test_directory_ignores_size() {
        let a = header(EntryKind::Directory);
        let mut b = header(EntryKind::Directory);
        b.size = 4096;
        assert!(is_similar_header(&a, &b).unwrap());

        b.mtime += 1;
        assert!(!is_similar_header(&a, &b).unwrap());
    }

    #[test]
    fn test_symlink_compares_target_only() {
        let mut a = header(EntryKind::Symlink);
        a.linkname = "/p/q".into();
        let mut b = a.clone();
        b.mtime = 5;
        b.uid = 99;
        assert!(is_similar_header(&a, &b).unwrap());

        b.linkname = "/p/r".into();
        assert!(!is_similar_header(&a, &b).unwrap());
    }

    #[test]
    fn test_hardlink_compares_target_and_meta() {
        let mut a = header(EntryKind::Hardlink);
        a.linkname = "/x".into();
        let mut b = a.clone();
        assert!(is_similar_header(&a, &b).unwrap());
        b.mode = 0o700;
        assert!(!is_similar_header(&a, &b).unwrap());
    }

    #[test]
    fn test_kind_mismatch_and_root() {
        assert!(!is_similar_header(&header(EntryKind::Regular), &header(EntryKind::Directory))
            .unwrap());

        let mut a = header(EntryKind::Directory);
        let mut b = header(EntryKind::Directory);
        a.name.clear();
        b.name.clear();
        b.mtime = 0;
        assert!(is_similar_header(&a, &b).unwrap());
    }

    #[test]
    fn test_special_is_error() {
        let a = header(EntryKind::Special);
        assert!(is_similar_header(&a, &a.clone()).is_err());
    }
}
