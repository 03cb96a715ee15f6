//! `refit logout` command - Remove stored registry credentials.

use clap::Args;
use refit_runtime::CredentialStore;

#[derive(Args)]
pub struct LogoutArgs {
    /// Registry server (default: docker.io)
    pub server: Option<String>,
}

pub async fn execute(args: LogoutArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = args
        .server
        .unwrap_or_else(|| super::DEFAULT_REGISTRY.to_string());

    let store = CredentialStore::default_path()?;
    if store.remove(&server)? {
        println!("Removing login credentials for {}", server);
    } else {
        println!("Not logged in to {}", server);
    }
    Ok(())
}
