//! Uninstall command.

use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::output::print_success;

use super::live_installer;

/// Delete the cluster and local registry.
#[derive(Debug, Args)]
pub struct UninstallCommand {
    /// Also remove the data directory.
    #[arg(long)]
    purge: bool,
}

impl UninstallCommand {
    pub async fn run(self, config: Config) -> Result<()> {
        let data_dir = config.data_dir.clone();
        let installer = live_installer("uninstall", config, true)?;
        installer.uninstall(self.purge).await?;

        if self.purge {
            print_success(&format!("Uninstalled keel and removed {}", data_dir.display()));
        } else {
            print_success(&format!(
                "Uninstalled keel. Data in {} was kept.",
                data_dir.display()
            ));
        }
        Ok(())
    }
}
