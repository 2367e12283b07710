//! Base image references.
//!
//! `base-os:20.04`, `nginx`, `ghcr.io/org/image:tag` and
//! `registry:5000/image@sha256:...` are all accepted; the short forms expand
//! the same way Docker expands them.

use std::path::PathBuf;

use a3s_bake_core::error::{BakeError, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Parsed base image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, with optional port
    pub registry: String,
    /// Repository path (`library/nginx` for official images)
    pub repository: String,
    pub tag: Option<String>,
    /// Content digest (`sha256:<hex>`)
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(invalid(reference, "reference contains whitespace"));
        }

        let (name_tag, digest) = match trimmed.rsplit_once('@') {
            Some((name, digest)) => {
                let (algorithm, hex) = digest
                    .split_once(':')
                    .ok_or_else(|| invalid(reference, "digest must be algorithm:hex"))?;
                if algorithm.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid(reference, "digest must be algorithm:hex"));
                }
                (name, Some(digest.to_string()))
            }
            None => (trimmed, None),
        };

        let (name, tag) = split_tag(name_tag);
        if let Some(tag) = tag {
            if !valid_tag(tag) {
                return Err(invalid(reference, &format!("invalid tag '{}'", tag)));
            }
        }

        let (registry, repository) = split_registry(name);
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid(reference, "empty repository component"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid(reference, "repository must be lowercase"));
        }

        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tag if present, otherwise the digest.
    pub fn version(&self) -> &str {
        self.tag
            .as_deref()
            .or(self.digest.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Relative location of this image inside an on-disk base store.
    pub fn store_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.registry);
        for part in self.repository.split('/') {
            path.push(part);
        }
        path.push(self.version().replace(':', "-"));
        path
    }

    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = BakeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split `name:tag`. A colon before the last `/` belongs to a registry port,
/// and a bare `host:5000` is a port rather than a tag.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    let Some(colon) = name_tag[last_segment_start..].rfind(':') else {
        return (name_tag, None);
    };
    let colon = last_segment_start + colon;
    let after = &name_tag[colon + 1..];
    if last_segment_start == 0 && !after.is_empty() && after.chars().all(|c| c.is_ascii_digit()) {
        return (name_tag, None);
    }
    (&name_tag[..colon], Some(after))
}

fn split_registry(name: &str) -> (String, String) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first.to_string(), rest.to_string());
        }
        return (DEFAULT_REGISTRY.to_string(), name.to_string());
    }
    (DEFAULT_REGISTRY.to_string(), format!("library/{}", name))
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn invalid(reference: &str, message: &str) -> BakeError {
    BakeError::Resolution {
        reference: reference.to_string(),
        message: format!("malformed reference: {}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_name_with_tag() {
        let r = ImageReference::parse("base-os:20.04").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/base-os");
        assert_eq!(r.tag.as_deref(), Some("20.04"));
        assert_eq!(r.digest, None);
        assert_eq!(r.full_reference(), "docker.io/library/base-os:20.04");
    }

    #[test]
    fn test_parse_defaults_to_latest() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.version(), "latest");
    }

    #[test]
    fn test_parse_user_repository() {
        let r: ImageReference = "myuser/myimage:v1".parse().unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "myuser/myimage");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/base:1").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "base");
        assert_eq!(r.tag.as_deref(), Some("1"));
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageReference::parse("ghcr.io/org/base@sha256:abcdef0123").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:abcdef0123"));
        assert!(r.store_path().ends_with("sha256-abcdef0123"));
    }

    #[test]
    fn test_store_path() {
        let r = ImageReference::parse("base-os:20.04").unwrap();
        assert_eq!(
            r.store_path(),
            PathBuf::from("docker.io").join("library").join("base-os").join("20.04")
        );
    }

    #[test]
    fn test_malformed_references() {
        for bad in ["", "   ", "base os", "Base-OS:1", "base:", "base:-x", "org//img", "img@sha256", "img@sha256:xyz"] {
            let err = ImageReference::parse(bad).unwrap_err();
            assert!(
                matches!(err, BakeError::Resolution { .. }),
                "expected resolution error for {:?}",
                bad
            );
        }
    }
}
