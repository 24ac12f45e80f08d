use std::net::SocketAddr;
use std::sync::Arc;

use app::build_router;
use upstream::HttpUpstream;

pub mod app;
pub mod broadcast;
mod driver;
pub mod multiplexer;
pub mod parser;
pub mod registry;
pub mod session;
pub mod state;
pub mod upstream;

#[cfg(test)]
mod test_support;

pub use broadcast::{SubscriberEvent, Subscription};
pub use multiplexer::{MultiplexerConfig, StreamMultiplexer};
pub use session::{SessionStatus, StreamInfo, StreamStatus};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub upstream_url: String,
    pub multiplexer: MultiplexerConfig,
}

pub async fn run_server(
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let upstream = Arc::new(HttpUpstream::new(&config.upstream_url)?);
    tracing::info!(upstream_url = %config.upstream_url, "using upstream generation service");
    let mux = StreamMultiplexer::new(upstream, config.multiplexer);
    run_server_with_multiplexer(config.host, config.port, mux).await
}

pub async fn run_server_with_multiplexer(
    host: String,
    port: u16,
    mux: StreamMultiplexer,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = build_router(mux.clone());
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %addr,
        completed_ttl_ms = mux.config().completed_ttl.as_millis() as u64,
        "session-stream listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(mux))
        .await?;
    Ok(())
}

async fn shutdown_signal(mux: StreamMultiplexer) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
    mux.shutdown().await;
}
