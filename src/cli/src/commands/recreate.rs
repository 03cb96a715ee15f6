//! `refit recreate` command - Replace a container with a fresh clone.

use std::time::Duration;

use clap::Args;
use refit_core::config::RefitConfig;
use refit_runtime::RecreateRequest;

#[derive(Args)]
pub struct RecreateArgs {
    /// Container name or ID
    pub container: String,

    /// Check the registry and pull a newer image first
    #[arg(long)]
    pub pull: bool,

    /// Recreate even if the image is current
    #[arg(long)]
    pub force: bool,

    /// Overall deadline in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

pub async fn execute(
    args: RecreateArgs,
    config: &RefitConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = super::open_service(config)?;

    let mut request = RecreateRequest::new(&args.container)
        .pull_check(args.pull)
        .force(args.force);
    if let Some(secs) = args.timeout {
        request = request.deadline(Duration::from_secs(secs));
    }

    let result = service.recreate_with(request).await;
    service.events().flush().await;
    let outcome = result?;

    if !outcome.updated {
        println!("unchanged");
        return Ok(());
    }

    println!("{}", outcome.container_id);
    for failure in &outcome.cleanup_failures {
        eprintln!("Warning: {}", failure);
    }
    Ok(())
}
