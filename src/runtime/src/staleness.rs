//! Image staleness and architecture resolution.
//!
//! Compares the registry's current manifest digest for a tag with the digests
//! of the locally pulled image, and lists the architectures a tag supports.

use std::sync::Arc;
use std::time::Duration;

use refit_core::config::RegistryConfig;
use refit_core::error::Result;

use crate::cache::ArchitectureCache;
use crate::registry::{CredentialProvider, ImageReference, ManifestSource};

/// Outcome of a staleness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staleness {
    /// No local digest matches the registry's digest
    pub stale: bool,
    /// Digest the registry currently serves for the reference. For a
    /// digest-pinned reference this is the pinned digest.
    pub remote_digest: String,
}

/// Digest part of a repo digest (`repo@sha256:...`); bare digests pass through.
pub fn digest_component(repo_digest: &str) -> &str {
    repo_digest
        .rsplit_once('@')
        .map(|(_, digest)| digest)
        .unwrap_or(repo_digest)
        .trim()
}

/// Decides whether images have newer versions upstream.
pub struct StalenessResolver {
    source: Arc<dyn ManifestSource>,
    credentials: Arc<dyn CredentialProvider>,
    cache: ArchitectureCache,
    architecture_timeout: Duration,
    fallback_architecture: String,
}

impl StalenessResolver {
    pub fn new(
        source: Arc<dyn ManifestSource>,
        credentials: Arc<dyn CredentialProvider>,
        config: &RegistryConfig,
    ) -> Self {
        Self {
            source,
            credentials,
            cache: ArchitectureCache::new(config.architecture_cache_ttl()),
            architecture_timeout: config.architecture_timeout(),
            fallback_architecture: config.fallback_architecture.clone(),
        }
    }

    pub fn cache(&self) -> &ArchitectureCache {
        &self.cache
    }

    /// Check `reference` against the local repo digests.
    ///
    /// A digest-pinned reference is never stale and costs no network call.
    /// Manifest client errors are returned unchanged.
    pub async fn is_stale(
        &self,
        reference: &ImageReference,
        local_digests: &[String],
    ) -> Result<Staleness> {
        if let Some(ref pinned) = reference.digest {
            tracing::debug!(reference = %reference, "Digest-pinned reference is never stale");
            return Ok(Staleness {
                stale: false,
                remote_digest: pinned.clone(),
            });
        }

        let credential = self.credentials.resolve(&reference.registry);
        let manifest = self.source.fetch_manifest(reference, &credential).await?;

        let stale = !local_digests
            .iter()
            .any(|local| digest_component(local) == manifest.digest);

        tracing::debug!(
            reference = %reference,
            remote_digest = %manifest.digest,
            local_digests = local_digests.len(),
            stale,
            "Resolved image staleness"
        );

        Ok(Staleness {
            stale,
            remote_digest: manifest.digest,
        })
    }

    /// Architectures `reference` is published for.
    ///
    /// Advisory: any failure is logged and answered with the configured
    /// fallback architecture. The whole lookup is bounded by the
    /// architecture timeout. `no_cache` bypasses and refreshes the cache.
    pub async fn architectures(&self, reference: &ImageReference, no_cache: bool) -> Vec<String> {
        let key = reference.full_reference();

        if no_cache {
            self.cache.invalidate(&key);
        } else if let Some(cached) = self.cache.get(&key) {
            tracing::trace!(reference = %reference, "Architecture cache hit");
            return cached;
        }

        match tokio::time::timeout(self.architecture_timeout, self.lookup_architectures(reference))
            .await
        {
            Ok(Ok(architectures)) if !architectures.is_empty() => {
                self.cache.insert(key, architectures.clone());
                architectures
            }
            Ok(Ok(_)) => {
                tracing::warn!(
                    reference = %reference,
                    fallback = %self.fallback_architecture,
                    "Manifest lists no architectures, using fallback"
                );
                self.fallback()
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    reference = %reference,
                    error = %e,
                    fallback = %self.fallback_architecture,
                    "Architecture lookup failed, using fallback"
                );
                self.fallback()
            }
            Err(_) => {
                tracing::warn!(
                    reference = %reference,
                    timeout_secs = self.architecture_timeout.as_secs(),
                    fallback = %self.fallback_architecture,
                    "Architecture lookup timed out, using fallback"
                );
                self.fallback()
            }
        }
    }

    async fn lookup_architectures(&self, reference: &ImageReference) -> Result<Vec<String>> {
        let credential = self.credentials.resolve(&reference.registry);
        let manifest = self.source.fetch_manifest(reference, &credential).await?;

        if !manifest.platforms.is_empty() {
            return Ok(manifest.architectures());
        }

        // Single-platform manifest: the platform lives in the config blob
        match manifest.config_digest {
            Some(ref config_digest) => Ok(self
                .source
                .fetch_config_platform(reference, &credential, config_digest)
                .await?
                .map(|p| vec![p.architecture])
                .unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    fn fallback(&self) -> Vec<String> {
        vec![self.fallback_architecture.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ManifestDescriptor, ManifestKind, PlatformEntry, StaticCredentialProvider};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use refit_core::error::RefitError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn platform(arch: &str) -> PlatformEntry {
        PlatformEntry {
            architecture: arch.to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }

    /// Scripted manifest source counting every fetch.
    struct FakeSource {
        manifest: Mutex<Result<ManifestDescriptor>>,
        config_platform: Option<PlatformEntry>,
        delay: Option<Duration>,
        fetches: AtomicUsize,
        credentials_seen: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn serving(manifest: ManifestDescriptor) -> Self {
            Self {
                manifest: Mutex::new(Ok(manifest)),
                config_platform: None,
                delay: None,
                fetches: AtomicUsize::new(0),
                credentials_seen: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            let source = Self::serving(list(&[]));
            *source.manifest.lock() = Err(RefitError::ManifestFetchFailed {
                reference: "r".to_string(),
                status: 404,
                www_authenticate: None,
            });
            source
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ManifestSource for FakeSource {
        async fn fetch_manifest(
            &self,
            _reference: &ImageReference,
            credential: &str,
        ) -> Result<ManifestDescriptor> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.credentials_seen.lock().push(credential.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &*self.manifest.lock() {
                Ok(m) => Ok(m.clone()),
                Err(e) => Err(RefitError::Other(e.to_string())),
            }
        }

        async fn fetch_config_platform(
            &self,
            _reference: &ImageReference,
            _credential: &str,
            _config_digest: &str,
        ) -> Result<Option<PlatformEntry>> {
            Ok(self.config_platform.clone())
        }
    }

    fn list(architectures: &[&str]) -> ManifestDescriptor {
        ManifestDescriptor {
            kind: ManifestKind::OciIndex,
            digest: "sha256:bbb".to_string(),
            platforms: architectures.iter().map(|a| platform(a)).collect(),
            config_digest: None,
        }
    }

    fn with_digest(digest: &str) -> ManifestDescriptor {
        ManifestDescriptor {
            digest: digest.to_string(),
            ..list(&["amd64"])
        }
    }

    fn resolver(source: Arc<FakeSource>) -> StalenessResolver {
        StalenessResolver::new(
            source,
            Arc::new(StaticCredentialProvider::new("cred")),
            &RegistryConfig::default(),
        )
    }

    fn reference(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    #[test]
    fn test_digest_component() {
        assert_eq!(digest_component("nginx@sha256:aaa"), "sha256:aaa");
        assert_eq!(digest_component("ghcr.io/org/app@sha256:aaa"), "sha256:aaa");
        assert_eq!(digest_component("sha256:aaa"), "sha256:aaa");
    }

    #[tokio::test]
    async fn test_digest_pinned_is_never_stale_and_offline() {
        let source = Arc::new(FakeSource::serving(with_digest("sha256:other")));
        let resolver = resolver(source.clone());

        let result = resolver
            .is_stale(&reference("ghcr.io/org/app@sha256:pinned"), &[])
            .await
            .unwrap();
        assert!(!result.stale);
        assert_eq!(result.remote_digest, "sha256:pinned");
        assert_eq!(source.fetches(), 0);
    }

    #[tokio::test]
    async fn test_matching_digest_is_fresh() {
        let source = Arc::new(FakeSource::serving(with_digest("sha256:aaa")));
        let resolver = resolver(source);

        let result = resolver
            .is_stale(&reference("app:old"), &["docker.io/library/app@sha256:aaa".to_string()])
            .await
            .unwrap();
        assert_eq!(
            result,
            Staleness {
                stale: false,
                remote_digest: "sha256:aaa".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_different_digest_is_stale() {
        let source = Arc::new(FakeSource::serving(with_digest("sha256:bbb")));
        let resolver = resolver(source);

        let result = resolver
            .is_stale(&reference("app:old"), &["app@sha256:aaa".to_string()])
            .await
            .unwrap();
        assert_eq!(
            result,
            Staleness {
                stale: true,
                remote_digest: "sha256:bbb".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_no_local_digests_is_stale() {
        let source = Arc::new(FakeSource::serving(with_digest("sha256:bbb")));
        let result = resolver(source)
            .is_stale(&reference("app:old"), &[])
            .await
            .unwrap();
        assert!(result.stale);
    }

    #[tokio::test]
    async fn test_repeated_checks_are_idempotent() {
        let source = Arc::new(FakeSource::serving(with_digest("sha256:bbb")));
        let resolver = resolver(source.clone());
        let local = vec!["app@sha256:aaa".to_string()];

        let first = resolver.is_stale(&reference("app:v1"), &local).await.unwrap();
        let second = resolver.is_stale(&reference("app:v1"), &local).await.unwrap();
        assert_eq!(first, second);
        // Staleness is never cached
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_staleness_surfaces_fetch_errors() {
        let source = Arc::new(FakeSource::failing());
        let err = resolver(source)
            .is_stale(&reference("app:v1"), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_credential_is_resolved_per_registry() {
        let source = Arc::new(FakeSource::serving(with_digest("sha256:aaa")));
        resolver(source.clone())
            .is_stale(&reference("ghcr.io/org/app:v1"), &[])
            .await
            .unwrap();
        assert_eq!(source.credentials_seen.lock().as_slice(), ["cred".to_string()]);
    }

    #[tokio::test]
    async fn test_architectures_filtered_and_cached() {
        let source = Arc::new(FakeSource::serving(list(&[
            "amd64", "arm64", "unknown", "", "amd64",
        ])));
        let resolver = resolver(source.clone());
        let r = reference("nginx:1.25");

        let archs = resolver.architectures(&r, false).await;
        assert_eq!(archs, vec!["amd64", "arm64"]);
        let again = resolver.architectures(&r, false).await;
        assert_eq!(again, archs);
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_no_cache_refreshes_entry() {
        let source = Arc::new(FakeSource::serving(list(&["amd64"])));
        let resolver = resolver(source.clone());
        let r = reference("nginx:1.25");

        resolver.architectures(&r, false).await;
        *source.manifest.lock() = Ok(list(&["amd64", "s390x"]));

        assert_eq!(resolver.architectures(&r, false).await, vec!["amd64"]);
        assert_eq!(resolver.architectures(&r, true).await, vec!["amd64", "s390x"]);
        assert_eq!(resolver.architectures(&r, false).await, vec!["amd64", "s390x"]);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_architectures_fall_back_on_error() {
        let source = Arc::new(FakeSource::failing());
        let resolver = resolver(source);
        let r = reference("nginx:1.25");

        assert_eq!(resolver.architectures(&r, false).await, vec!["amd64"]);
        // Fallbacks are not cached
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn test_architectures_fall_back_on_timeout() {
        let mut source = FakeSource::serving(list(&["arm64"]));
        source.delay = Some(Duration::from_secs(30));
        let config = RegistryConfig {
            architecture_timeout_secs: 1,
            fallback_architecture: "arm64".to_string(),
            ..Default::default()
        };
        let resolver = StalenessResolver::new(
            Arc::new(source),
            Arc::new(StaticCredentialProvider::anonymous()),
            &config,
        );

        let archs = resolver.architectures(&reference("nginx"), false).await;
        assert_eq!(archs, vec!["arm64"]);
    }

    #[tokio::test]
    async fn test_single_platform_reads_config_blob() {
        let mut source = FakeSource::serving(ManifestDescriptor {
            kind: ManifestKind::DockerManifestV2,
            digest: "sha256:single".to_string(),
            platforms: Vec::new(),
            config_digest: Some("sha256:cfg".to_string()),
        });
        source.config_platform = Some(platform("ppc64le"));
        let resolver = resolver(Arc::new(source));

        assert_eq!(
            resolver.architectures(&reference("app:v1"), false).await,
            vec!["ppc64le"]
        );
    }

    #[tokio::test]
    async fn test_empty_architecture_list_falls_back() {
        let source = Arc::new(FakeSource::serving(list(&["unknown"])));
        let resolver = resolver(source);
        assert_eq!(resolver.architectures(&reference("app:v1"), false).await, vec!["amd64"]);
    }
}
