//! CLI command definitions and dispatch.

mod archs;
mod check;
mod login;
mod logout;
mod recreate;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use refit_core::config::RefitConfig;
use refit_core::event::{EventPublisher, LoggingSink};
use refit_runtime::RefitService;

/// Registry used by `login`/`logout` when none is given.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Refit - keep running containers on their latest image.
#[derive(Parser)]
#[command(name = "refit", version, about)]
pub struct Cli {
    /// Config file (default: ~/.refit/config.yaml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Check whether the local copy of an image is behind its registry
    Check(check::CheckArgs),
    /// List the architectures an image is published for
    Archs(archs::ArchsArgs),
    /// Replace a container with a fresh clone of itself
    Recreate(recreate::RecreateArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
    /// Remove stored registry credentials
    Logout(logout::LogoutArgs),
}

/// Build the service with events rendered to the log.
pub(crate) fn open_service(
    config: &RefitConfig,
) -> Result<RefitService, Box<dyn std::error::Error>> {
    let events = EventPublisher::spawn(Arc::new(LoggingSink), config.events.queue_capacity);
    Ok(RefitService::from_config(config, events)?)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: RefitConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Check(args) => check::execute(args, &config).await,
        Command::Archs(args) => archs::execute(args, &config).await,
        Command::Recreate(args) => recreate::execute(args, &config).await,
        Command::Login(args) => login::execute(args).await,
        Command::Logout(args) => logout::execute(args).await,
    }
}
