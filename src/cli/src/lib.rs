//! Refit CLI - image staleness checks and container recreate.

pub mod commands;
