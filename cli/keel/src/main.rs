//! keel - installer for single-node keel deployments.

use clap::Parser;
use keel::commands::Cli;
use keel::config::Config;
use keel::error::print_error;
use keel::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_env();
    logging::init(&config);

    if let Err(e) = cli.run(config).await {
        print_error(&e);
        std::process::exit(1);
    }
}
