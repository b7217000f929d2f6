//! tablelocal - local table storage emulator
//!
//! Serves the table REST protocol for development and tests.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tablelocal_common::Config;
use tablelocal_common::config::AuthMode;
use tablelocal_server::TableServer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tablelocal-server")]
#[command(about = "Local table storage emulator")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address for the table endpoint
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Directory for persisted tables; in-memory when unset
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Authorization mode: open, dev or shared-key
    #[arg(long)]
    auth_mode: Option<AuthMode>,

    /// Account name
    #[arg(long)]
    account: Option<String>,

    /// Base64 account key
    #[arg(long, env = "TABLELOCAL_ACCOUNT_KEY", hide_env_values = true)]
    account_key: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if let Some(dir) = self.data_dir {
            config.storage.data_dir = Some(dir);
        }
        if let Some(mode) = self.auth_mode {
            config.auth.mode = mode;
        }
        if let Some(account) = self.account {
            config.account.name = account;
        }
        if let Some(key) = self.account_key {
            config.account.key = key;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tablelocal server");
    info!("Data directory: {:?}", config.storage.data_dir);

    let server = TableServer::bind(&config).await?;
    println!("{}", server.connection_string());

    server
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
