use clap::Parser;
use imagerepo_mirror::settings::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::parse();
    if let Err(e) = settings.validate() {
        tracing::error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    tokio::select! {
        result = imagerepo_mirror::run(settings) => {
            if let Err(e) = result {
                tracing::error!("Controller error: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, exiting");
        }
    }
}
