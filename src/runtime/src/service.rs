//! Caller-facing operations.
//!
//! `RefitService` wires the manifest client, staleness resolver, engine and
//! orchestrator together and exposes the three operations route handlers
//! and the CLI call: staleness resolution, architecture listing and recreate.

use std::sync::Arc;
use std::time::Duration;

use refit_core::config::RefitConfig;
use refit_core::error::{RefitError, Result};
use refit_core::event::EventPublisher;

use crate::engine::{ContainerEngine, DockerEngine};
use crate::recreate::{RecreateOrchestrator, RecreateOutcome, RecreateRequest};
use crate::registry::{
    CredentialProvider, DefaultCredentialProvider, ImageReference, ManifestClient, ManifestSource,
};
use crate::staleness::{Staleness, StalenessResolver};

pub struct RefitService {
    engine: Arc<dyn ContainerEngine>,
    resolver: Arc<StalenessResolver>,
    orchestrator: RecreateOrchestrator,
    events: EventPublisher,
}

impl RefitService {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        source: Arc<dyn ManifestSource>,
        credentials: Arc<dyn CredentialProvider>,
        events: EventPublisher,
        config: &RefitConfig,
    ) -> Self {
        let resolver = Arc::new(StalenessResolver::new(
            source,
            Arc::clone(&credentials),
            &config.registry,
        ));
        let orchestrator = RecreateOrchestrator::new(
            Arc::clone(&engine),
            Arc::clone(&resolver),
            credentials,
            events.clone(),
            &config.recreate,
        );
        Self {
            engine,
            resolver,
            orchestrator,
            events,
        }
    }

    /// Production wiring: Docker over its unix socket, the HTTP manifest
    /// client and environment/store credentials.
    pub fn from_config(config: &RefitConfig, events: EventPublisher) -> Result<Self> {
        let engine = Arc::new(DockerEngine::new(&config.engine));
        if !engine.socket_exists() {
            tracing::warn!(
                socket = %engine.socket_path().display(),
                "Engine socket not found; engine calls will fail"
            );
        }
        let source = Arc::new(ManifestClient::new(&config.registry)?);
        let credentials = Arc::new(DefaultCredentialProvider::from_default_store());
        Ok(Self::new(engine, source, credentials, events, config))
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn resolver(&self) -> &StalenessResolver {
        &self.resolver
    }

    /// Is the local copy of `image` behind the registry?
    pub async fn resolve_staleness(&self, image: &str, deadline: Option<Duration>) -> Result<Staleness> {
        let reference = ImageReference::parse(image)?;
        let check = async {
            let local_digests: Vec<String> = self
                .engine
                .list_images(&reference.local_name())
                .await?
                .into_iter()
                .flat_map(|record| record.repo_digests)
                .collect();
            self.resolver.is_stale(&reference, &local_digests).await
        };

        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, check).await.unwrap_or_else(|_| {
                Err(RefitError::Timeout(format!(
                    "staleness check of {} exceeded {}s",
                    reference,
                    deadline.as_secs()
                )))
            }),
            None => check.await,
        }
    }

    /// Architectures `image` is published for. Only a malformed reference
    /// is an error; lookup failures degrade to the fallback architecture.
    pub async fn list_architectures(&self, image: &str, no_cache: bool) -> Result<Vec<String>> {
        let reference = ImageReference::parse(image)?;
        Ok(self.resolver.architectures(&reference, no_cache).await)
    }

    pub async fn recreate(
        &self,
        container_id: &str,
        pull_check: bool,
        force: bool,
    ) -> Result<RecreateOutcome> {
        self.recreate_with(
            RecreateRequest::new(container_id)
                .pull_check(pull_check)
                .force(force),
        )
        .await
    }

    pub async fn recreate_with(&self, request: RecreateRequest) -> Result<RecreateOutcome> {
        self.orchestrator.recreate(request).await
    }
}
