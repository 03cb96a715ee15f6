//! Refit Runtime - image staleness and container recreate.
//!
//! Talks to container registries to decide whether an image has a newer
//! version without pulling it, and replaces running containers with fresh
//! clones while keeping a working instance on the host.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod engine;
pub mod recreate;
pub mod registry;
pub mod service;
pub mod staleness;

// Re-export common types
pub use cache::ArchitectureCache;
pub use engine::{ContainerEngine, ContainerSnapshot, CreateSpec, DockerEngine, LocalImageRecord};
pub use recreate::{
    CleanupFailure, CompensatingAction, RecreateOrchestrator, RecreateOutcome, RecreatePhase,
    RecreateRequest,
};
pub use registry::{
    CredentialProvider, CredentialStore, DefaultCredentialProvider, ImageReference,
    ManifestClient, ManifestDescriptor, ManifestSource, StaticCredentialProvider,
};
pub use service::RefitService;
pub use staleness::{Staleness, StalenessResolver};

/// Refit Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
