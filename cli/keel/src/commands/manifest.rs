//! Create-manifest command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use keel_manifest::generate::ChartVersions;

use crate::config::Config;
use crate::output::print_success;
use crate::source::ManifestSource;

use super::live_installer;

/// Generate an installation manifest from the chart repository or a local
/// chart checkout.
#[derive(Debug, Args)]
pub struct CreateManifestCommand {
    /// Application chart version. Defaults to the latest release.
    #[arg(long, value_name = "VERSION", conflicts_with = "local")]
    app_chart_version: Option<String>,

    /// Infrastructure chart version. Defaults to the one released with the
    /// application chart.
    #[arg(long, value_name = "VERSION", conflicts_with = "local")]
    infra_chart_version: Option<String>,

    /// Generate from a chart checkout.
    #[arg(long, value_name = "DIR")]
    local: Option<PathBuf>,

    /// Tag recorded in the manifest.
    #[arg(long, short)]
    tag: Option<String>,

    /// Write to a file instead of stdout.
    #[arg(long, short)]
    output: Option<PathBuf>,
}

impl CreateManifestCommand {
    fn source(&self) -> ManifestSource {
        match &self.local {
            Some(dir) => ManifestSource::Local(dir.clone()),
            None => ManifestSource::Remote(ChartVersions {
                app: self.app_chart_version.clone(),
                infra: self.infra_chart_version.clone(),
            }),
        }
    }

    pub async fn run(self, config: Config) -> Result<()> {
        let installer = live_installer("create-manifest", config, true)?;
        let manifest = installer
            .create_manifest(&self.source(), self.tag.as_deref())
            .await?;
        let yaml = manifest.to_yaml()?;

        match self.output {
            Some(path) => {
                std::fs::write(&path, yaml)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                print_success(&format!("Wrote manifest to {}", path.display()));
            }
            None => print!("{yaml}"),
        }
        Ok(())
    }
}
