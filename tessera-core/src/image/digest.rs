use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Digest of an empty tar archive (two zero blocks).
pub const DIGEST_EMPTY_TAR: &str =
    "sha256:84ff92691f909a05b224e1c56abb4864f01b4f8e3c854e4bb4c7baf1d3f6d652";

const SHA256_PREFIX: &str = "sha256:";

/// A content digest in `sha256:<hex>` form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Validates `s` as `sha256:` followed by 64 lowercase hex characters.
    pub fn parse(s: &str) -> Result<Self> {
        let hex = s.strip_prefix(SHA256_PREFIX).ok_or_else(|| invalid(s, "missing sha256 prefix"))?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(invalid(s, "expected 64 lowercase hex characters"));
        }
        Ok(Self(s.to_string()))
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        Self::parse(&format!("{}{}", SHA256_PREFIX, hex))
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        let mut d = Digester::new();
        d.update(data);
        d.finish()
    }

    pub fn of_reader<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut d = Digester::new();
        io::copy(r, &mut d)?;
        Ok(d.finish())
    }

    /// The part after `algorithm:`.
    pub fn hex(&self) -> &str {
        match self.0.find(':') {
            Some(i) => &self.0[i + 1..],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn invalid(s: &str, reason: &str) -> TesseraError {
    TesseraError::Internal(format!("invalid digest {:?}: {}", s, reason))
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Incremental sha256 digester; also an `io::Write` sink.
#[derive(Default)]
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> Digest {
        Digest(format!("{}{}", SHA256_PREFIX, hex::encode(self.hasher.finalize())))
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Passes writes through to `inner` while digesting them.
pub struct DigestingWriter<W> {
    inner: W,
    digester: Digester,
    written: u64,
}

impl<W: Write> DigestingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, digester: Digester::new(), written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// The inner writer and the digest of everything written to it.
    pub fn into_parts(self) -> (W, Digest) {
        (self.inner, self.digester.finish())
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Content descriptor as used in distribution manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
    pub digest: Digest,
}

/// Identity of one committed layer: the digest of its uncompressed tar
/// (for `diff_ids`) and the descriptor of its gzipped blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestPair {
    pub tar_digest: Digest,
    pub gzip_descriptor: Descriptor,
}

/// Cache ID to the layers produced by that step, shared by all stages of
/// a plan.
pub type DigestPairMap = HashMap<String, Vec<DigestPair>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_of_empty_input() {
        let d = Digest::of_bytes(b"");
        assert_eq!(
            d.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(d.hex().len(), 64);
        assert_eq!(Digest::of_reader(&mut &b""[..]).unwrap(), d);
    }

    #[test]
    fn test_parse_validates() {
        assert!(Digest::parse(DIGEST_EMPTY_TAR).is_ok());
        assert!(Digest::parse("md5:abc").is_err());
        assert!(Digest::parse("sha256:abc").is_err());
        assert!(Digest::parse(&DIGEST_EMPTY_TAR.to_uppercase().replace("SHA256", "sha256")).is_err());
        let hex = Digest::parse(DIGEST_EMPTY_TAR).unwrap().hex().to_string();
        assert_eq!(Digest::from_hex(&hex).unwrap().as_str(), DIGEST_EMPTY_TAR);
    }

    #[test]
    fn test_digesting_writer_passes_through() {
        let mut w = DigestingWriter::new(Vec::new());
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        assert_eq!(w.written(), 11);
        let (inner, digest) = w.into_parts();
        assert_eq!(inner, b"hello world");
        assert_eq!(digest, Digest::of_bytes(b"hello world"));
    }

    #[test]
    fn test_descriptor_json_shape() {
        let desc = Descriptor {
            media_type: "application/octet-stream".into(),
            size: 3,
            digest: Digest::of_bytes(b"abc"),
        };
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["mediaType"], "application/octet-stream");
        assert_eq!(json["size"], 3);
        assert!(json["digest"].as_str().unwrap().starts_with("sha256:"));
    }
}
