use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use wharf_host::ServerConfig;
use wharf_server::supervisor::{WharfServer, DEFAULT_DRAIN_DEADLINE};

#[derive(Parser)]
#[command(
    name = "wharfd",
    about = "Wharf module host -- serves sandboxed WASM tools over MCP and HTTP"
)]
struct Cli {
    /// Path to the server manifest
    #[arg(long, default_value = "config/mcp_manifest.yaml")]
    manifest: PathBuf,

    /// Path to the keystore file, unlocked when WALLET_PASSWORD is set
    #[arg(long, default_value = "config/wallet.json")]
    wallet: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_env("WHARF_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::info!(manifest = %cli.manifest.display(), "Starting wharfd");

    // The keystore is an isolated utility: unlocked and reported at startup,
    // untouched by the request path.
    match std::env::var("WALLET_PASSWORD") {
        Ok(password) if !password.is_empty() => {
            let wallet = wharf_keys::Wallet::load_or_create(&cli.wallet, &password)
                .context("Failed to unlock keystore")?;
            tracing::info!(public_key = %wallet.public_key_hex(), "Keystore unlocked");
        }
        _ => tracing::info!("WALLET_PASSWORD not set; keystore left locked"),
    }

    let config = ServerConfig::from_file(&cli.manifest)
        .with_context(|| format!("Failed to load manifest from {}", cli.manifest.display()))?;

    let server = WharfServer::start(config)
        .await
        .context("Failed to start server")?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    server.serve(DEFAULT_DRAIN_DEADLINE).await
}
