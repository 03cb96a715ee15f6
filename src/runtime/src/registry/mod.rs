//! Container registry access.
//!
//! Reads manifests from Docker Registry HTTP API v2 endpoints without
//! pulling layers:
//! - `reference`: image reference parsing and normalization
//! - `challenge`: `WWW-Authenticate` decoding
//! - `manifest`: media types and manifest decoding
//! - `client`: challenge, token exchange and manifest fetch
//! - `credentials`: credential store and providers

pub mod challenge;
pub mod client;
pub mod credentials;
pub mod manifest;
pub mod reference;

pub use challenge::Challenge;
pub use client::{ManifestClient, ManifestSource};
pub use credentials::{
    basic_payload, CredentialProvider, CredentialStore, DefaultCredentialProvider,
    StaticCredentialProvider,
};
pub use manifest::{ManifestDescriptor, ManifestKind, PlatformEntry};
pub use reference::ImageReference;
