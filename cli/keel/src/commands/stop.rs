//! Stop command.

use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::output::print_success;

use super::live_installer;

/// Stop the cluster without deleting it.
#[derive(Debug, Args)]
pub struct StopCommand {}

impl StopCommand {
    pub async fn run(self, config: Config) -> Result<()> {
        let cluster = config.cluster_name.clone();
        live_installer("stop", config, true)?.stop().await?;
        print_success(&format!("Cluster {cluster} is stopped. Start it with `keel run`."));
        Ok(())
    }
}
