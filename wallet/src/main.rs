use custody_wallet::{api::server, WalletConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    // Initialize logger (set RUST_LOG=debug for verbose output, RUST_LOG=info for normal)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = WalletConfig::from_env()?;

    log::info!("Starting custody wallet daemon on {}", config.bind_address);
    server::start_server(config).await?;
    Ok(())
}
