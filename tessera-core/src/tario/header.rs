use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;

/// Kind of filesystem entry carried by a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    /// Devices, fifos and sockets. Never part of a layer.
    Special,
}

impl EntryKind {
    pub fn from_tar(entry_type: tar::EntryType) -> Self {
        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::Regular,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink => EntryKind::Symlink,
            tar::EntryType::Link => EntryKind::Hardlink,
            _ => EntryKind::Special,
        }
    }

    pub fn to_tar(self) -> tar::EntryType {
        match self {
            EntryKind::Regular => tar::EntryType::Regular,
            EntryKind::Directory => tar::EntryType::Directory,
            EntryKind::Symlink => tar::EntryType::Symlink,
            EntryKind::Hardlink => tar::EntryType::Link,
            EntryKind::Special => tar::EntryType::Fifo,
        }
    }
}

/// Metadata of one layer entry.
///
/// `name` is relative to the layer root; directories end in `/` and the
/// root itself has an empty name. `mode` holds permission and special bits
/// only. `mtime` is in whole seconds, matching tar's resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: i64,
    pub linkname: String,
}

impl FileHeader {
    /// Builds a header from `lstat` metadata. Symlink targets are filled in
    /// by the caller since they depend on the root being snapshotted.
    pub fn from_metadata(name: impl Into<String>, md: &Metadata) -> Self {
        let ft = md.file_type();
        let kind = if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_file() {
            EntryKind::Regular
        } else {
            EntryKind::Special
        };
        Self {
            name: name.into(),
            kind,
            mode: md.mode() & 0o7777,
            uid: md.uid() as u64,
            gid: md.gid() as u64,
            size: if kind == EntryKind::Regular { md.len() } else { 0 },
            mtime: md.mtime(),
            linkname: String::new(),
        }
    }

    /// Builds a header from a tar header plus the already-decoded name and
    /// link target (which may come from GNU or PAX extensions).
    pub fn from_tar(hdr: &tar::Header, name: String, linkname: String) -> io::Result<Self> {
        let kind = EntryKind::from_tar(hdr.entry_type());
        Ok(Self {
            name,
            kind,
            mode: hdr.mode()? & 0o7777,
            uid: hdr.uid()?,
            gid: hdr.gid()?,
            size: if kind == EntryKind::Regular { hdr.size()? } else { 0 },
            mtime: hdr.mtime()? as i64,
            linkname,
        })
    }

    /// Marker entry recording the deletion of a sibling path.
    pub fn whiteout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Regular,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            linkname: String::new(),
        }
    }

    /// A tar header carrying everything but the path and link name, which
    /// the builder sets so long names get the proper extensions.
    pub fn to_tar(&self) -> tar::Header {
        let mut hdr = tar::Header::new_gnu();
        hdr.set_entry_type(self.kind.to_tar());
        hdr.set_mode(self.mode);
        hdr.set_uid(self.uid);
        hdr.set_gid(self.gid);
        hdr.set_size(if self.kind == EntryKind::Regular { self.size } else { 0 });
        hdr.set_mtime(self.mtime.max(0) as u64);
        hdr
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    pub fn is_hardlink(&self) -> bool {
        self.kind == EntryKind::Hardlink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_metadata_kinds() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"hello").unwrap();
        let link = dir.path().join("l");
        std::os::unix::fs::symlink("f", &link).unwrap();

        let f = FileHeader::from_metadata("f", &std::fs::symlink_metadata(&file).unwrap());
        assert_eq!(f.kind, EntryKind::Regular);
        assert_eq!(f.size, 5);

        let d = FileHeader::from_metadata("", &std::fs::symlink_metadata(dir.path()).unwrap());
        assert!(d.is_dir());
        assert_eq!(d.size, 0);

        let l = FileHeader::from_metadata("l", &std::fs::symlink_metadata(&link).unwrap());
        assert!(l.is_symlink());
    }

    #[test]
    fn test_tar_header_conversion_keeps_metadata() {
        let hdr = FileHeader {
            name: "etc/passwd".into(),
            kind: EntryKind::Regular,
            mode: 0o644,
            uid: 12,
            gid: 34,
            size: 99,
            mtime: 1_600_000_000,
            linkname: String::new(),
        };
        let tar_hdr = hdr.to_tar();
        let back = FileHeader::from_tar(&tar_hdr, "etc/passwd".into(), String::new()).unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn test_special_entry_kinds() {
        assert_eq!(EntryKind::from_tar(tar::EntryType::Char), EntryKind::Special);
        assert_eq!(EntryKind::from_tar(tar::EntryType::Link), EntryKind::Hardlink);
    }
}
