//! Export of a stored image as a `docker load` archive.

use super::{Digest, ImageName};
use crate::error::{Result, TesseraError};
use crate::storage::ImageStore;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::info;

/// One entry of the archive's `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExportManifest {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

/// Streams `name` from `store` into `writer` as a tar containing
/// `manifest.json`, `<config hex>.json` and `<layer hex>/layer.tar` blobs.
pub fn write_image_tar<W: Write>(store: &ImageStore, name: &ImageName, writer: W) -> Result<()> {
    let manifest = store.manifests.load(name)?;
    let mut builder = tar::Builder::new(writer);

    let config_digest = manifest.config_digest();
    let export = ExportManifest {
        config: format!("{}.json", config_digest.hex()),
        repo_tags: vec![name.short_name()],
        layers: manifest.layers.iter().map(|l| format!("{}/layer.tar", l.digest.hex())).collect(),
    };

    let index = serde_json::to_vec(&[&export])?;
    append_bytes(&mut builder, "manifest.json", &index)?;
    append_blob(&mut builder, store, config_digest, &export.config)?;
    for (layer, path) in manifest.layers.iter().zip(&export.layers) {
        append_blob(&mut builder, store, &layer.digest, path)?;
    }

    builder
        .into_inner()
        .and_then(|mut w| w.flush())
        .map_err(|e| TesseraError::io("image tar", e))?;
    info!(image = %name, layers = manifest.layers.len(), "Exported image");
    Ok(())
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, path, data).map_err(|e| TesseraError::io(path, e))
}

fn append_blob<W: Write>(
    builder: &mut tar::Builder<W>,
    store: &ImageStore,
    digest: &Digest,
    path: &str,
) -> Result<()> {
    let size = store.layers.stat_of(digest)?.len();
    let reader = store.layers.reader_of(digest)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, path, reader).map_err(|e| TesseraError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Descriptor, DistributionManifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER};
    use std::io::Read;
    use tempfile::TempDir;

    fn store_blob(store: &ImageStore, dir: &TempDir, data: &[u8]) -> Digest {
        let digest = Digest::of_bytes(data);
        let src = dir.path().join(digest.hex());
        std::fs::write(&src, data).unwrap();
        store.layers.link_digest_from(&digest, &src).unwrap();
        digest
    }

    #[test]
    fn test_export_layout() {
        let dir = TempDir::new().unwrap();
        let store = ImageStore::new(&dir.path().join("store"), 8, 4).unwrap();
        let config = store_blob(&store, &dir, br#"{"rootfs":{"type":"layers","diff_ids":[]}}"#);
        let layer = store_blob(&store, &dir, b"gzipped layer");

        let name = ImageName::new("", "demo", "v1");
        let manifest = DistributionManifest::new(
            Descriptor { media_type: MEDIA_TYPE_CONFIG.into(), size: 1, digest: config.clone() },
            vec![Descriptor { media_type: MEDIA_TYPE_LAYER.into(), size: 13, digest: layer.clone() }],
        );
        store.manifests.save(&name, &manifest).unwrap();

        let mut out = Vec::new();
        write_image_tar(&store, &name, &mut out).unwrap();

        let mut archive = tar::Archive::new(&out[..]);
        let mut entries = Vec::new();
        let mut index = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            if path == "manifest.json" {
                entry.read_to_string(&mut index).unwrap();
            }
            entries.push(path);
        }

        assert_eq!(
            entries,
            vec![
                "manifest.json".to_string(),
                format!("{}.json", config.hex()),
                format!("{}/layer.tar", layer.hex()),
            ]
        );
        let parsed: Vec<ExportManifest> = serde_json::from_str(&index).unwrap();
        assert_eq!(parsed[0].repo_tags, vec!["demo:v1".to_string()]);
    }
}
