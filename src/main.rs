use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yield_settlement::{bootstrap, config::Config, server};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,yield_settlement=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting Yield Settlement Engine");

    let config = Config::from_env()?;
    let app = bootstrap::initialize_app(&config)?;

    // Dispute timeouts are enforced in the background
    let _sweeper = app.sweeper.clone().start();

    let router = server::create_app(app.state, &config.cors_origins());
    server::run_server(router, &config.bind_address).await?;

    Ok(())
}
