//! Reinstall command.

use anyhow::Result;
use clap::Args;

use crate::config::Config;

use super::install::{ParamsArgs, SourceArgs};
use super::{live_installer, print_installed};

/// Delete the cluster and install again.
#[derive(Debug, Args)]
pub struct ReinstallCommand {
    #[command(flatten)]
    source: SourceArgs,

    #[command(flatten)]
    params: ParamsArgs,

    /// Also remove the data directory before installing.
    #[arg(long)]
    purge: bool,

    /// Answer every question with its default.
    #[arg(long, short = 'y')]
    yes: bool,
}

impl ReinstallCommand {
    pub async fn run(self, config: Config) -> Result<()> {
        let request = self.params.request(self.source.source())?;
        let installer = live_installer("reinstall", config, self.yes)?;
        let state = installer.reinstall(&request, self.purge).await?;
        print_installed(&state);
        Ok(())
    }
}
