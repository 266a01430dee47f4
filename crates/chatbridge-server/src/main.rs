#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Context;
use chatbridge_browser::launch_or_attach;
use chatbridge_core::{ChatBridge, ChatMode, HttpImageResolver};
use chatbridge_server::{build_router, config::AppConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing logger
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chatbridge_server=debug,chatbridge_core=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    tracing::info!("Starting ChatBridge server");

    let config = AppConfig::load()?;

    let session = launch_or_attach(&config.browser_options())
        .await
        .context("Failed to start the browser session")?;
    let mode = match config.mode() {
        ChatMode::Temporary => "temporary chat",
        ChatMode::Persistent => "standard chat",
    };
    tracing::info!(
        "Browser ready on debug port {} | mode: {}",
        config.browser.debug_port,
        mode
    );

    let resolver = HttpImageResolver::new().context("Failed to build the image HTTP client")?;
    let bridge = Arc::new(ChatBridge::new(
        config.bridge_settings(),
        session.surface(),
        Arc::new(resolver),
    ));

    let app = build_router(bridge);

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind to {}", address))?;

    tracing::info!("ChatBridge running on http://{}", address);

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    // Keeps a browser we launched alive until the server stops.
    drop(session);
    Ok(())
}
