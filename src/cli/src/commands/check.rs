//! `refit check` command - Compare a local image with its registry.

use std::time::Duration;

use clap::Args;
use refit_core::config::RefitConfig;

#[derive(Args)]
pub struct CheckArgs {
    /// Image reference (e.g. "nginx:latest", "ghcr.io/org/app:v1")
    pub image: String,

    /// Give up after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

pub async fn execute(args: CheckArgs, config: &RefitConfig) -> Result<(), Box<dyn std::error::Error>> {
    let service = super::open_service(config)?;
    let result = service
        .resolve_staleness(&args.image, args.timeout.map(Duration::from_secs))
        .await;
    service.events().flush().await;

    let staleness = result?;
    let state = if staleness.stale { "stale" } else { "up-to-date" };
    println!("{}\t{}", state, staleness.remote_digest);
    Ok(())
}
