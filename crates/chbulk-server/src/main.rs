use anyhow::{Context, Result};
use chbulk_config::Config;
use clap::Parser;
use std::path::PathBuf;

/// Buffering insert proxy for ClickHouse-compatible backends
#[derive(Parser)]
#[command(name = "chbulk")]
#[command(version)]
#[command(about = "Buffering insert proxy for ClickHouse-compatible backends", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config file)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Comma-separated backend server URLs (overrides config file)
    #[arg(short, long, value_name = "URLS")]
    servers: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load_or_default().context("failed to load configuration")?
    };

    apply_cli_overrides(&mut config, &cli);
    config.validate()?;

    chbulk_server::init_tracing(&config);
    chbulk_server::run_with_config(config).await
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    if let Some(servers) = &cli.servers {
        config.clickhouse.servers = servers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if cli.debug {
        config.debug = true;
    }
}
