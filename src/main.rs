use anyhow::{Context, Result};
use log::{error, info};

use energy_collector::cli;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli::build_cli().get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(cli::commands::DEFAULT_CONFIG_PATH);
    let config = cli::load_config(config_path, cli::needs_config(&matches))
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    cli::init_logging(
        matches.get_one::<String>("log-level").map(String::as_str),
        &config.log_level,
    );
    info!(
        "🖥️  Energy Collector v{} ({} equipment configured)",
        energy_collector::VERSION,
        config.equipment.len()
    );

    if let Err(e) = cli::handle_subcommands(&matches, config).await {
        error!("❌ {}", e);
        return Err(e.into());
    }
    Ok(())
}
