//! In-memory engine and registry used by the recreate integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use refit_core::config::{RecreateConfig, RegistryConfig};
use refit_core::error::{RefitError, Result};
use refit_core::event::{BroadcastSink, Event, EventPublisher, EventStream};
use refit_runtime::engine::{ContainerEngine, ContainerSnapshot, CreateSpec, LocalImageRecord};
use refit_runtime::recreate::RecreateOrchestrator;
use refit_runtime::registry::{
    ImageReference, ManifestDescriptor, ManifestKind, ManifestSource, PlatformEntry,
    StaticCredentialProvider,
};
use refit_runtime::staleness::StalenessResolver;
use serde_json::json;

/// Engine call kinds failures can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Inspect,
    Create,
    Start,
    Stop,
    Remove,
    Rename,
    ListImages,
    Pull,
}

/// Which targets an injected fault applies to.
#[derive(Debug, Clone)]
pub enum Target {
    Any,
    Id(String),
    AllBut(String),
}

impl Target {
    fn matches(&self, target: &str) -> bool {
        match self {
            Target::Any => true,
            Target::Id(id) => id == target,
            Target::AllBut(id) => id != target,
        }
    }
}

#[derive(Debug, Clone)]
enum Fault {
    Fail(Target),
    Hang(Target),
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub spec: CreateSpec,
}

#[derive(Default)]
struct EngineState {
    containers: BTreeMap<String, FakeContainer>,
    images: BTreeMap<String, Vec<LocalImageRecord>>,
    next_id: usize,
    faults: Vec<(Op, Fault)>,
    calls: Vec<String>,
    pulls: Vec<String>,
}

/// Container engine held entirely in memory.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a container created from `image`.
    pub fn with_container(self, id: &str, name: &str, image: &str, running: bool) -> Self {
        let spec = CreateSpec {
            config: json!({"Image": image, "Env": ["MODE=prod"]}),
            host_config: json!({"RestartPolicy": {"Name": "unless-stopped"}}),
            networking: json!({}),
        };
        self.state.lock().containers.insert(
            id.to_string(),
            FakeContainer {
                id: id.to_string(),
                name: name.to_string(),
                image: image.to_string(),
                running,
                spec,
            },
        );
        self
    }

    /// Register a locally pulled image with one repo digest.
    pub fn with_image(self, image: &str, repo_digest: &str) -> Self {
        self.state.lock().images.insert(
            image.to_string(),
            vec![LocalImageRecord {
                id: format!("img-{}", image),
                repo_digests: vec![repo_digest.to_string()],
            }],
        );
        self
    }

    /// Make every matching `op` call fail.
    pub fn fail(self, op: Op, target: Target) -> Self {
        self.state.lock().faults.push((op, Fault::Fail(target)));
        self
    }

    /// Make every matching `op` call block until cancelled.
    pub fn hang(self, op: Op, target: Target) -> Self {
        self.state.lock().faults.push((op, Fault::Hang(target)));
        self
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(id).cloned()
    }

    pub fn container_named(&self, name: &str) -> Option<FakeContainer> {
        self.state
            .lock()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state.lock().containers.values().cloned().collect()
    }

    pub fn running(&self) -> Vec<FakeContainer> {
        self.containers().into_iter().filter(|c| c.running).collect()
    }

    /// Engine calls in order, e.g. `"stop orig-1"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn calls_of(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().pulls.clone()
    }

    /// Record the call and apply any injected fault.
    async fn enter(&self, op: Op, name: &str, target: &str) -> Result<()> {
        let fault = {
            let mut state = self.state.lock();
            state.calls.push(format!("{} {}", name, target));
            state.faults.iter().find_map(|(fault_op, fault)| {
                let hit = match fault {
                    Fault::Fail(t) | Fault::Hang(t) => *fault_op == op && t.matches(target),
                };
                hit.then(|| fault.clone())
            })
        };

        match fault {
            Some(Fault::Fail(_)) => Err(RefitError::Engine {
                operation: name.to_string(),
                target: target.to_string(),
                message: "injected failure".to_string(),
            }),
            Some(Fault::Hang(_)) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn with_existing<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock();
        state
            .containers
            .get_mut(id)
            .map(f)
            .ok_or_else(|| RefitError::ContainerNotFound(id.to_string()))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn inspect(&self, id: &str) -> Result<ContainerSnapshot> {
        self.enter(Op::Inspect, "inspect", id).await?;
        self.with_existing(id, |c| ContainerSnapshot {
            id: c.id.clone(),
            name: c.name.clone(),
            image: c.image.clone(),
            running: c.running,
            spec: c.spec.clone(),
        })
    }

    async fn create(&self, name: &str, spec: &CreateSpec) -> Result<String> {
        self.enter(Op::Create, "create", name).await?;
        let mut state = self.state.lock();
        if state.containers.values().any(|c| c.name == name) {
            return Err(RefitError::Engine {
                operation: "create".to_string(),
                target: name.to_string(),
                message: "409 name already in use".to_string(),
            });
        }
        state.next_id += 1;
        let id = format!("clone-{}", state.next_id);
        let image = spec.config["Image"].as_str().unwrap_or_default().to_string();
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                image,
                running: false,
                spec: spec.clone(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.enter(Op::Start, "start", id).await?;
        self.with_existing(id, |c| c.running = true)
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.enter(Op::Stop, "stop", id).await?;
        self.with_existing(id, |c| c.running = false)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.enter(Op::Remove, "remove", id).await?;
        let mut state = self.state.lock();
        let key = state
            .containers
            .values()
            .find(|c| c.id == id || c.name == id)
            .map(|c| c.id.clone())
            .ok_or_else(|| RefitError::ContainerNotFound(id.to_string()))?;
        state.containers.remove(&key);
        Ok(())
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        self.enter(Op::Rename, "rename", id).await?;
        let mut state = self.state.lock();
        if state
            .containers
            .values()
            .any(|c| c.name == new_name && c.id != id)
        {
            return Err(RefitError::Engine {
                operation: "rename".to_string(),
                target: id.to_string(),
                message: "409 name already in use".to_string(),
            });
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RefitError::ContainerNotFound(id.to_string()))?;
        container.name = new_name.to_string();
        Ok(())
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<LocalImageRecord>> {
        self.enter(Op::ListImages, "list_images", reference).await?;
        // Like the engine's `reference` filter, a name without a tag matches
        // every local tag of that repository.
        let untagged = !reference.contains('@')
            && !reference[reference.rfind('/').map_or(0, |p| p + 1)..].contains(':');
        Ok(self
            .state
            .lock()
            .images
            .iter()
            .filter(|(name, _)| {
                name.as_str() == reference
                    || (untagged && name.starts_with(&format!("{}:", reference)))
            })
            .flat_map(|(_, records)| records.clone())
            .collect())
    }

    async fn pull(&self, reference: &ImageReference, _credential: &str) -> Result<()> {
        let image = reference.full_reference();
        self.enter(Op::Pull, "pull", &image).await?;
        self.state.lock().pulls.push(image);
        Ok(())
    }
}

/// Registry serving one fixed digest for every reference.
pub struct FixedRegistry {
    digest: String,
    fetches: AtomicUsize,
}

impl FixedRegistry {
    pub fn new(digest: &str) -> Self {
        Self {
            digest: digest.to_string(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestSource for FixedRegistry {
    async fn fetch_manifest(
        &self,
        _reference: &ImageReference,
        _credential: &str,
    ) -> Result<ManifestDescriptor> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(ManifestDescriptor {
            kind: ManifestKind::OciIndex,
            digest: self.digest.clone(),
            platforms: vec![PlatformEntry {
                architecture: "amd64".to_string(),
                os: "linux".to_string(),
                variant: None,
            }],
            config_digest: None,
        })
    }

    async fn fetch_config_platform(
        &self,
        _reference: &ImageReference,
        _credential: &str,
        _config_digest: &str,
    ) -> Result<Option<PlatformEntry>> {
        Ok(None)
    }
}

/// Orchestrator wired to a fake engine and registry, with every event captured.
pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub registry: Arc<FixedRegistry>,
    pub events: EventPublisher,
    pub orchestrator: RecreateOrchestrator,
    stream: EventStream,
}

impl Harness {
    /// Must be called inside a tokio runtime.
    pub fn new(engine: FakeEngine, remote_digest: &str) -> Self {
        let engine = Arc::new(engine);
        let registry = Arc::new(FixedRegistry::new(remote_digest));
        let sink = BroadcastSink::new(1024);
        let stream = sink.subscribe_filtered(|_| true);
        let events = EventPublisher::spawn(Arc::new(sink), 1024);

        let resolver = Arc::new(StalenessResolver::new(
            registry.clone(),
            Arc::new(StaticCredentialProvider::anonymous()),
            &RegistryConfig::default(),
        ));
        let orchestrator = RecreateOrchestrator::new(
            engine.clone(),
            resolver,
            Arc::new(StaticCredentialProvider::anonymous()),
            events.clone(),
            &RecreateConfig {
                compensation_grace_secs: 5,
                deadline_secs: None,
            },
        );

        Self {
            engine,
            registry,
            events,
            orchestrator,
            stream,
        }
    }

    /// Every event emitted so far.
    pub async fn events(&mut self) -> Vec<Event> {
        self.events.flush().await;
        self.stream.drain()
    }

    /// Names of emitted events, e.g. `container:stop-begin`.
    pub async fn event_names(&mut self) -> Vec<String> {
        self.events().await.into_iter().map(|e| e.name).collect()
    }
}
