use crate::error::{Result, TesseraError};
use std::fmt;

pub const DOCKER_HUB_REGISTRY: &str = "index.docker.io";
pub const DOCKER_HUB_NAMESPACE: &str = "library";
pub const SCRATCH: &str = "scratch";

/// An image reference: `[registry/]repository[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    registry: String,
    repository: String,
    tag: String,
}

impl ImageName {
    pub fn new(registry: &str, repository: &str, tag: &str) -> Self {
        Self { registry: registry.to_string(), repository: repository.to_string(), tag: tag.to_string() }
    }

    pub fn scratch() -> Self {
        Self::new("", SCRATCH, "latest")
    }

    /// Parses a reference without applying registry defaults. The tag
    /// defaults to `latest`; a `host:port/` or dotted first component is the
    /// registry.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(TesseraError::InvalidImageName {
                name: input.to_string(),
                reason: "empty name".to_string(),
            });
        }
        let slash = input.rfind('/');
        let (repository, tag) = match input.rfind(':') {
            Some(sep) if slash.map(|s| sep > s).unwrap_or(true) => (&input[..sep], &input[sep + 1..]),
            _ => (input, "latest"),
        };
        if repository.is_empty() || tag.is_empty() {
            return Err(TesseraError::InvalidImageName {
                name: input.to_string(),
                reason: "missing repository or tag".to_string(),
            });
        }

        Ok(match split_registry(repository) {
            Some((registry, repo)) => Self::new(registry, repo, tag),
            None => Self::new("", repository, tag),
        })
    }

    /// Parses a reference to pull: names without a registry resolve to
    /// Docker Hub, and single-component Hub names get the `library/`
    /// namespace.
    pub fn parse_for_pull(input: &str) -> Result<Self> {
        let mut name = Self::parse(input)?;
        if name.is_scratch() {
            return Ok(name);
        }
        if name.registry.is_empty() {
            name.registry = DOCKER_HUB_REGISTRY.to_string();
            if !name.repository.contains('/') {
                name.repository = format!("{}/{}", DOCKER_HUB_NAMESPACE, name.repository);
            }
        }
        Ok(name)
    }

    pub fn with_registry(mut self, registry: &str) -> Self {
        self.registry = registry.to_string();
        self
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_scratch(&self) -> bool {
        self.repository == SCRATCH
    }

    /// Pull-ready: scratch, or all of registry, repository and tag set.
    pub fn is_valid(&self) -> bool {
        self.is_scratch() || (!self.registry.is_empty() && !self.repository.is_empty() && !self.tag.is_empty())
    }

    /// `repository:tag`.
    pub fn short_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_scratch() || self.registry.is_empty() {
            write!(f, "{}", self.short_name())
        } else {
            write!(f, "{}/{}", self.registry, self.short_name())
        }
    }
}

// Splits `host[:port]/rest` when the first component looks like a host:
// word characters, dots and dashes, with either a port or an inner dot.
fn split_registry(repository: &str) -> Option<(&str, &str)> {
    let (host, rest) = repository.split_once('/')?;
    let (hostname, port) = match host.split_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (host, None),
    };
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-';
    if hostname.is_empty() || !hostname.chars().all(word) || rest.is_empty() {
        return None;
    }
    let is_host = match port {
        Some(p) => !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()),
        None => hostname[1..].contains('.'),
    };
    is_host.then_some((host, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let n = ImageName::parse("alpine").unwrap();
        assert_eq!((n.registry(), n.repository(), n.tag()), ("", "alpine", "latest"));

        let n = ImageName::parse("alpine:3.19").unwrap();
        assert_eq!((n.repository(), n.tag()), ("alpine", "3.19"));

        let n = ImageName::parse("localhost:5000/team/app").unwrap();
        assert_eq!((n.registry(), n.repository(), n.tag()), ("localhost:5000", "team/app", "latest"));

        let n = ImageName::parse("gcr.io/proj/app:v1").unwrap();
        assert_eq!((n.registry(), n.repository(), n.tag()), ("gcr.io", "proj/app", "v1"));

        let n = ImageName::parse("team/app:v1").unwrap();
        assert_eq!((n.registry(), n.repository()), ("", "team/app"));

        assert!(ImageName::parse("").is_err());
        assert!(ImageName::parse("app:").is_err());
    }

    #[test]
    fn test_parse_for_pull_defaults_to_hub() {
        let n = ImageName::parse_for_pull("alpine:3").unwrap();
        assert_eq!(n.to_string(), "index.docker.io/library/alpine:3");
        assert!(n.is_valid());

        let n = ImageName::parse_for_pull("team/app").unwrap();
        assert_eq!(n.repository(), "team/app");

        let n = ImageName::parse_for_pull("scratch").unwrap();
        assert!(n.is_scratch());
        assert_eq!(n.to_string(), "scratch:latest");
    }
}
