//! Image reference parsing.
//!
//! Parses image references like `ghcr.io/org/app:v1.2` into structured components.

use refit_core::error::{RefitError, Result};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Host actually serving the default registry's API.
const DEFAULT_REGISTRY_API_HOST: &str = "registry-1.docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v1.2")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `docker.io/nginx` → docker.io/library/nginx:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RefitError::InvalidReference(
                "Empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest_part = &reference[at_pos + 1..];
                match digest_part.split_once(':') {
                    Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => {}
                    _ => {
                        return Err(RefitError::InvalidReference(format!(
                            "Invalid digest format in reference '{}': expected algorithm:hex",
                            reference
                        )))
                    }
                }
                (&reference[..at_pos], Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = Self::split_tag(name_tag);
        if name.is_empty() {
            return Err(RefitError::InvalidReference(format!(
                "Empty repository in reference '{}'",
                reference
            )));
        }
        if matches!(tag, Some(ref t) if t.is_empty()) {
            return Err(RefitError::InvalidReference(format!(
                "Empty tag in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = Self::split_registry_repository(name)?;

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split `name[:tag]`; a colon before the last `/` belongs to a registry port.
    fn split_tag(name_tag: &str) -> (&str, Option<String>) {
        let search_from = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        match name_tag[search_from..].rfind(':') {
            Some(colon) => {
                let colon = search_from + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        }
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry hostname when it contains a dot
        // or colon, or is "localhost"
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(RefitError::InvalidReference(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                let registry = normalize_registry_host(first);
                let repository = if registry == DEFAULT_REGISTRY && !rest.contains('/') {
                    format!("library/{}", rest)
                } else {
                    rest.to_string()
                };
                return Ok((registry, repository));
            }
        }

        // No registry detected, use default
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Single name like "nginx" → "library/nginx" for Docker Hub
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// A digest-pinned reference never has a newer version.
    pub fn is_digest_pinned(&self) -> bool {
        self.digest.is_some()
    }

    pub fn is_default_registry(&self) -> bool {
        self.registry == DEFAULT_REGISTRY
    }

    /// Tag or digest addressed on the manifest endpoint; the digest wins.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Host serving the registry API.
    pub fn api_host(&self) -> &str {
        if self.is_default_registry() {
            DEFAULT_REGISTRY_API_HOST
        } else {
            &self.registry
        }
    }

    /// Pull scope requested from a token service.
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }

    /// Name the engine lists this image under, with the tag spelled out so
    /// a bare `nginx` does not match every local `nginx:*` image.
    pub fn local_name(&self) -> String {
        let mut s = if self.is_default_registry() {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry, self.repository)
        };
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = RefitError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Fold Docker Hub aliases into the canonical `docker.io`.
fn normalize_registry_host(host: &str) -> String {
    let host = host.to_lowercase();
    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            DEFAULT_REGISTRY.to_string()
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("1.25".to_string()));
    }

    #[test]
    fn test_parse_numeric_tag() {
        let r = ImageReference::parse("postgres:16").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/postgres");
        assert_eq!(r.tag, Some("16".to_string()));
        assert_eq!(r.pull_scope(), "repository:library/postgres:pull");
        assert_eq!(r.manifest_reference(), "16");

        let r = ImageReference::parse("redis:7").unwrap();
        assert_eq!(r.repository, "library/redis");
        assert_eq!(r.tag, Some("7".to_string()));
    }

    #[test]
    fn test_parse_user_repo() {
        let r = ImageReference::parse("myuser/myimage:v1.0").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "myuser/myimage");
        assert_eq!(r.tag, Some("v1.0".to_string()));
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = ImageReference::parse("ghcr.io/org/app:v0.1.0").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, Some("v0.1.0".to_string()));
        assert_eq!(r.api_host(), "ghcr.io");
    }

    #[test]
    fn test_parse_single_segment_on_custom_registry_is_verbatim() {
        let r = ImageReference::parse("registry.example/app").unwrap();
        assert_eq!(r.repository, "app");
        assert_eq!(r.pull_scope(), "repository:app:pull");
    }

    #[test]
    fn test_parse_explicit_docker_hub_host() {
        let r = ImageReference::parse("docker.io/nginx:1.25").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");

        let r = ImageReference::parse("index.docker.io/library/redis").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/redis");
        assert_eq!(r.api_host(), "registry-1.docker.io");
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse(
            "ghcr.io/org/app@sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890",
        )
        .unwrap();
        assert_eq!(r.tag, None);
        assert!(r.is_digest_pinned());
        assert_eq!(
            r.manifest_reference(),
            "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890"
        );
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("ghcr.io/org/app:v0.1.0@sha256:abcdef1234567890").unwrap();
        assert_eq!(r.tag, Some("v0.1.0".to_string()));
        assert_eq!(r.digest, Some("sha256:abcdef1234567890".to_string()));
        assert_eq!(r.manifest_reference(), "sha256:abcdef1234567890");
    }

    #[test]
    fn test_parse_localhost_registry() {
        let r = ImageReference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.repository, "myimage");

        let r = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("127.0.0.1:5000/team/app:v1").unwrap();
        assert_eq!(r.registry, "127.0.0.1:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port_no_tag() {
        let r = ImageReference::parse("myregistry.io:5000/myimage").unwrap();
        assert_eq!(r.registry, "myregistry.io:5000");
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("nginx@invaliddigest").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
    }

    #[test]
    fn test_scope_for_default_registry() {
        let r = ImageReference::parse("redis").unwrap();
        assert_eq!(r.pull_scope(), "repository:library/redis:pull");
    }

    #[test]
    fn test_display() {
        let r: ImageReference = "nginx:1.25".parse().unwrap();
        assert_eq!(format!("{}", r), "docker.io/library/nginx:1.25");
    }

    #[test]
    fn test_local_name_spells_out_tag() {
        assert_eq!(ImageReference::parse("nginx").unwrap().local_name(), "nginx:latest");
        assert_eq!(ImageReference::parse("postgres:16").unwrap().local_name(), "postgres:16");
        assert_eq!(
            ImageReference::parse("docker.io/library/redis").unwrap().local_name(),
            "redis:latest"
        );
        assert_eq!(
            ImageReference::parse("myuser/app:v1").unwrap().local_name(),
            "myuser/app:v1"
        );
        assert_eq!(
            ImageReference::parse("localhost:5000/app").unwrap().local_name(),
            "localhost:5000/app:latest"
        );
    }

    #[test]
    fn test_deep_repository_path() {
        let r = ImageReference::parse("ghcr.io/org/sub/image:v1").unwrap();
        assert_eq!(r.repository, "org/sub/image");
    }
}
