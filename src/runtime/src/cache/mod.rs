//! In-memory caches shared across concurrent calls.
//!
//! - `ArchitectureCache`: TTL cache of per-reference architecture lists

pub mod architecture;

pub use architecture::ArchitectureCache;
