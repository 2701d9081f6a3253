//! Run command.

use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::output::print_success;

use super::live_installer;

/// Start a stopped cluster.
#[derive(Debug, Args)]
pub struct RunCommand {}

impl RunCommand {
    pub async fn run(self, config: Config) -> Result<()> {
        let cluster = config.cluster_name.clone();
        live_installer("run", config, true)?.run().await?;
        print_success(&format!("Cluster {cluster} is running"));
        Ok(())
    }
}
