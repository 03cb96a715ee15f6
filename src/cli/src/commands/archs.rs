//! `refit archs` command - List the architectures of an image.

use clap::Args;
use refit_core::config::RefitConfig;

#[derive(Args)]
pub struct ArchsArgs {
    /// Image reference
    pub image: String,

    /// Skip the architecture cache and query the registry
    #[arg(long)]
    pub no_cache: bool,
}

pub async fn execute(args: ArchsArgs, config: &RefitConfig) -> Result<(), Box<dyn std::error::Error>> {
    let service = super::open_service(config)?;
    let architectures = service
        .list_architectures(&args.image, args.no_cache)
        .await?;

    for arch in architectures {
        println!("{}", arch);
    }
    Ok(())
}
