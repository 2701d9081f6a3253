//! CLI commands.

mod install;
mod manifest;
mod pack;
mod reinstall;
mod run;
mod stop;
mod uninstall;
mod upgrade;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use keel_manifest::{InstalledState, INSTALLER_VERSION};

use crate::config::Config;
use crate::context::CommandContext;
use crate::flow::{Collaborators, Installer};
use crate::output::{print_success, print_warning};
use crate::prompt::prompter_for;

pub use install::{ParamsArgs, SourceArgs};

/// keel - install and manage a single-node keel deployment.
#[derive(Debug, Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Installation data directory.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install keel, or upgrade an existing installation in place.
    Install(install::InstallCommand),

    /// Upgrade an existing installation.
    Upgrade(upgrade::UpgradeCommand),

    /// Delete the cluster and install again.
    Reinstall(reinstall::ReinstallCommand),

    /// Delete the cluster and local registry.
    Uninstall(uninstall::UninstallCommand),

    /// Start a stopped cluster.
    #[command(visible_aliases = ["up", "start"])]
    Run(run::RunCommand),

    /// Stop the cluster without deleting it.
    #[command(visible_alias = "down")]
    Stop(stop::StopCommand),

    /// Write an airgap bundle for offline installs.
    Pack(pack::PackCommand),

    /// Generate an installation manifest from the chart repository.
    CreateManifest(manifest::CreateManifestCommand),

    /// Show installer version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self, config: Config) -> Result<()> {
        let config = config.with_data_dir(self.data_dir);

        match self.command {
            Commands::Install(cmd) => cmd.run(config).await,
            Commands::Upgrade(cmd) => cmd.run(config).await,
            Commands::Reinstall(cmd) => cmd.run(config).await,
            Commands::Uninstall(cmd) => cmd.run(config).await,
            Commands::Run(cmd) => cmd.run(config).await,
            Commands::Stop(cmd) => cmd.run(config).await,
            Commands::Pack(cmd) => cmd.run(config).await,
            Commands::CreateManifest(cmd) => cmd.run(config).await,
            Commands::Version => {
                println!("keel {INSTALLER_VERSION}");
                Ok(())
            }
        }
    }
}

/// Installer wired to the real tools.
fn live_installer(command: &'static str, config: Config, assume_defaults: bool) -> Result<Installer> {
    let prompter = prompter_for(&config, assume_defaults);
    let collab = Collaborators::live(&config)?;
    Ok(Installer::new(CommandContext::new(command, config, prompter), collab))
}

fn print_installed(state: &InstalledState) {
    print_success(&format!(
        "keel {} is running at {}",
        state.manifest.app_chart.version,
        state.params.url()
    ));
    if state.params.disabled_auth {
        print_warning("Authentication is disabled. Anyone who can reach this address can use it.");
    }
}
