use anyhow::Result;
use clap::Parser;

use ipvs_core::config::IpvsConfig;
use ipvs_daemon::cli::DaemonCli;
use ipvs_daemon::daemon::Daemon;
use ipvs_daemon::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = IpvsConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load {}: {}", cli.config.display(), e))?;
    cli.apply_overrides(&mut config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

    if cli.validate {
        println!(
            "{}: configuration OK ({} services)",
            cli.config.display(),
            config.services.len()
        );
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "ipvs-daemon starting"
    );

    let mut daemon = Daemon::build_from_config(config, &cli.local_addrs)?;
    daemon.run().await?;

    tracing::info!("ipvs-daemon shut down");
    Ok(())
}
