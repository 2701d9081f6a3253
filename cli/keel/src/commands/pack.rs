//! Pack command.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::output::{print_info, print_success};
use crate::source::InstallSource;

use super::live_installer;

/// Write an airgap bundle.
#[derive(Debug, Args)]
pub struct PackCommand {
    /// Bundle file to write.
    #[arg(long, short, default_value = "pack.tar")]
    output: PathBuf,

    /// Release to bundle. Defaults to the latest.
    #[arg(long, conflicts_with = "local")]
    tag: Option<String>,

    /// Bundle a chart checkout instead of a release.
    #[arg(long, value_name = "DIR")]
    local: Option<PathBuf>,
}

impl PackCommand {
    pub async fn run(self, config: Config) -> Result<()> {
        let source = InstallSource::from_flags(self.tag, self.local, None);
        let installer = live_installer("pack", config, true)?;
        let manifest = installer.pack(&source, &self.output).await?;

        print_success(&format!(
            "Wrote bundle for keel {} to {}",
            manifest.app_chart.version,
            self.output.display()
        ));
        print_info(&format!(
            "Install it offline with: keel install --airgap {}",
            self.output.display()
        ));
        Ok(())
    }
}
