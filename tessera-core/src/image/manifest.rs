use super::{Descriptor, Digest};
use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Docker distribution manifest, schema 2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl DistributionManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self { schema_version: 2, media_type: MEDIA_TYPE_MANIFEST.to_string(), config, layers }
    }

    /// Parses manifest bytes served with `content_type`, returning the
    /// manifest and its own descriptor. Parameters after `;` are ignored.
    pub fn parse(content_type: &str, data: &[u8]) -> Result<(Self, Descriptor)> {
        let media_type = content_type.split(';').next().unwrap_or("").trim();
        if media_type != MEDIA_TYPE_MANIFEST {
            return Err(TesseraError::Internal(format!(
                "unsupported manifest mediatype: {}",
                media_type
            )));
        }
        let manifest: Self = serde_json::from_slice(data)?;
        let desc = Descriptor {
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            size: data.len() as u64,
            digest: Digest::of_bytes(data),
        };
        Ok((manifest, desc))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn layer_digests(&self) -> Vec<Digest> {
        self.layers.iter().map(|l| l.digest.clone()).collect()
    }

    pub fn config_digest(&self) -> &Digest {
        &self.config.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DistributionManifest {
        DistributionManifest::new(
            Descriptor {
                media_type: MEDIA_TYPE_CONFIG.into(),
                size: 10,
                digest: Digest::of_bytes(b"config"),
            },
            vec![Descriptor {
                media_type: MEDIA_TYPE_LAYER.into(),
                size: 20,
                digest: Digest::of_bytes(b"layer"),
            }],
        )
    }

    #[test]
    fn test_parse_checks_media_type() {
        let data = sample().to_json().unwrap();
        let (parsed, desc) =
            DistributionManifest::parse(&format!("{}; charset=utf-8", MEDIA_TYPE_MANIFEST), &data)
                .unwrap();
        assert_eq!(parsed, sample());
        assert_eq!(desc.size, data.len() as u64);
        assert_eq!(desc.digest, Digest::of_bytes(&data));

        assert!(DistributionManifest::parse("application/json", &data).is_err());
    }

    #[test]
    fn test_json_uses_camel_case() {
        let json: serde_json::Value = serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["mediaType"], MEDIA_TYPE_MANIFEST);
        assert_eq!(sample().layer_digests(), vec![Digest::of_bytes(b"layer")]);
    }
}
