use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Gzip level used when committing layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    No,
    Speed,
    Size,
    #[default]
    Default,
}

impl CompressionLevel {
    pub fn to_flate2(self) -> Compression {
        match self {
            CompressionLevel::No => Compression::none(),
            CompressionLevel::Speed => Compression::fast(),
            CompressionLevel::Size => Compression::best(),
            CompressionLevel::Default => Compression::default(),
        }
    }
}

impl FromStr for CompressionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" => Ok(CompressionLevel::No),
            "speed" => Ok(CompressionLevel::Speed),
            "size" => Ok(CompressionLevel::Size),
            "default" => Ok(CompressionLevel::Default),
            other => Err(format!("invalid compression level {}", other)),
        }
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CompressionLevel::No => "no",
            CompressionLevel::Speed => "speed",
            CompressionLevel::Size => "size",
            CompressionLevel::Default => "default",
        };
        f.write_str(s)
    }
}

pub fn gzip_writer<W: Write>(w: W, level: CompressionLevel) -> GzEncoder<W> {
    GzEncoder::new(w, level.to_flate2())
}

pub fn gzip_reader<R: Read>(r: R) -> GzDecoder<R> {
    GzDecoder::new(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!("speed".parse::<CompressionLevel>().unwrap(), CompressionLevel::Speed);
        assert_eq!("size".parse::<CompressionLevel>().unwrap().to_string(), "size");
        assert!("fastest".parse::<CompressionLevel>().is_err());
    }

    #[test]
    fn test_gzip_roundtrip() {
        let mut w = gzip_writer(Vec::new(), CompressionLevel::Size);
        w.write_all(b"layer bytes").unwrap();
        let compressed = w.finish().unwrap();

        let mut out = String::new();
        gzip_reader(&compressed[..]).read_to_string(&mut out).unwrap();
        assert_eq!(out, "layer bytes");
    }
}
