use std::path::PathBuf;

use clap::Parser;
use fleet_install::{Config, InstallerBuilder, Result};

#[derive(Parser, Debug)]
#[command(name = "fleet-install", version, about = "Installs a multi-host blockchain network")]
struct Args {
    /// TOML configuration file
    #[arg(long, short, default_value = "fleet-install.toml")]
    config: PathBuf,

    /// Overrides `server.bind`
    #[arg(long)]
    bind: Option<String>,

    /// Overrides `server.coordinator_url`
    #[arg(long, env = "FLEET_COORDINATOR_URL")]
    coordinator_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,hyper=warn,sqlx=warn".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::create(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if args.coordinator_url.is_some() {
        config.server.coordinator_url = args.coordinator_url;
    }

    InstallerBuilder::new().config(config).build()?.launch().await
}
