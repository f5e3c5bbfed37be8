use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uni_chat_server::{router, AppState, LlmService, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env().context("failed to load server configuration")?;
    info!("Using model: {}", config.model);

    let app = router(AppState::new(LlmService::new(&config)));

    let addr = config.addr()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
