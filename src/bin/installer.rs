use clap::Parser;
use tracing_subscriber::EnvFilter;

use transactional_installer::cli::{self, Cli};
use transactional_installer::config::InstallerConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = InstallerConfig::from_env();
    let code = cli::run(cli, config).await;
    std::process::exit(code);
}
