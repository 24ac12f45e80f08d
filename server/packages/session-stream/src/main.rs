use std::time::Duration;

use clap::Parser;
use session_stream::{run_server, MultiplexerConfig, ServerConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "session-stream")]
#[command(about = "Shares one upstream generation stream per session across subscribers", version)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8005)]
    port: u16,

    /// Base URL of the generation service.
    #[arg(long, env = "PY_SERVICE_URL", default_value = "http://127.0.0.1:8001")]
    upstream_url: String,

    /// How long a completed session stays queryable before it is reclaimed.
    /// Defaults to 60s, or SESSION_STREAM_COMPLETED_TTL_MS when set.
    #[arg(long)]
    completed_ttl_ms: Option<u64>,
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "session-stream failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let mut multiplexer = MultiplexerConfig::from_env();
    if let Some(ttl_ms) = cli.completed_ttl_ms.filter(|ms| *ms > 0) {
        multiplexer = multiplexer.completed_ttl(Duration::from_millis(ttl_ms));
    }

    run_server(ServerConfig {
        host: cli.host,
        port: cli.port,
        upstream_url: cli.upstream_url,
        multiplexer,
    })
    .await
}
