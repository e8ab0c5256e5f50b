use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcp_endpoint_server::{
    config::{Config, DEFAULT_CONFIG_PATH},
    server::run_server,
};

#[derive(Parser)]
#[command(name = "mcp-endpoint")]
#[command(about = "WebSocket endpoint server bridging MCP tool servers and robot callers")]
struct Args {
    /// Configuration file path (INI)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the configured bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // keep the non-blocking writer guard alive for the process lifetime
    let _file_guard = if config.logging.log_dir.is_empty() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        None
    } else {
        let appender =
            tracing_appender::rolling::daily(&config.logging.log_dir, &config.logging.log_file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .init();
        Some(guard)
    };

    info!("starting MCP Endpoint Server");
    info!("config: {}", args.config);
    info!("server: {}:{}", config.server.host, config.server.port);

    run_server(config).await?;

    Ok(())
}
