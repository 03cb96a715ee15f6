//! Container engine collaborator.
//!
//! The recreate orchestrator only needs a handful of lifecycle calls; they are
//! expressed as the [`ContainerEngine`] trait so tests can drive the state
//! machine against an in-memory engine. [`DockerEngine`] is the production
//! implementation over the Docker Engine API.

pub mod docker;

pub use docker::DockerEngine;

use async_trait::async_trait;
use refit_core::error::Result;
use serde_json::Value;

use crate::registry::ImageReference;

/// Engine-native creation parameters, replayed verbatim by `create`.
///
/// Env, ports, mounts, labels and restart policy all live inside these
/// documents; the orchestrator never looks into them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateSpec {
    /// Container config (image, env, labels, exposed ports, command)
    pub config: Value,
    /// Host config (mounts, port bindings, restart policy, resources)
    pub host_config: Value,
    /// Endpoint settings keyed by network name
    pub networking: Value,
}

/// Point-in-time description of a container, sufficient to recreate it.
///
/// Captured once per recreate and never refreshed.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSnapshot {
    /// Engine-assigned ID
    pub id: String,
    /// Canonical name, without the engine's leading `/`
    pub name: String,
    /// Image reference the container was created from
    pub image: String,
    pub running: bool,
    pub spec: CreateSpec,
}

/// A locally pulled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImageRecord {
    /// Engine image ID
    pub id: String,
    /// Repo digests, e.g. `nginx@sha256:...`
    pub repo_digests: Vec<String>,
}

/// Container engine calls used by refit.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Snapshot a container by ID or name.
    async fn inspect(&self, id: &str) -> Result<ContainerSnapshot>;

    /// Create a container named `name`; returns the new ID.
    async fn create(&self, name: &str, spec: &CreateSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn rename(&self, id: &str, new_name: &str) -> Result<()>;

    /// Local images matching `reference`.
    async fn list_images(&self, reference: &str) -> Result<Vec<LocalImageRecord>>;

    /// Pull `reference` with a Base64 basic-auth payload (empty for anonymous).
    async fn pull(&self, reference: &ImageReference, credential: &str) -> Result<()>;
}
