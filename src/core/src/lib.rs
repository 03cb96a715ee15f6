//! Refit Core - Foundational Types and Abstractions
//!
//! Errors, lifecycle events and configuration shared by the refit runtime
//! and command-line front end.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{EngineConfig, EventConfig, LogLevel, RecreateConfig, RefitConfig, RegistryConfig};
pub use error::{Compensation, RecreateFailure, RefitError, Result};
pub use event::{
    BroadcastSink, Event, EventContext, EventPublisher, EventSink, EventStage, LoggingSink,
    Properties, Transition,
};

/// Refit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
