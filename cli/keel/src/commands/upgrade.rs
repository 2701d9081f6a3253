//! Upgrade command.

use anyhow::Result;
use clap::Args;

use crate::config::Config;

use super::install::{ParamsArgs, SourceArgs};
use super::{live_installer, print_installed};

/// Upgrade an existing installation.
#[derive(Debug, Args)]
pub struct UpgradeCommand {
    #[command(flatten)]
    source: SourceArgs,

    #[command(flatten)]
    params: ParamsArgs,

    /// Answer every question with its default.
    #[arg(long, short = 'y')]
    yes: bool,
}

impl UpgradeCommand {
    pub async fn run(self, config: Config) -> Result<()> {
        let request = self.params.request(self.source.source())?;
        let installer = live_installer("upgrade", config, self.yes)?;
        let state = installer.upgrade(&request).await?;
        print_installed(&state);
        Ok(())
    }
}
