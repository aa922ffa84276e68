//! Cookie Pool Gateway
//!
//! OpenAI-compatible chat endpoint in front of a cookie-authenticated
//! upstream, spreading load over a pool of session credentials.

use anyhow::{Context, Result};
use clap::Parser;
use cookie_pool_gateway::{
    config::{Environment, Settings},
    logging::SizeBasedRollingWriter,
    server::App,
};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Cookie Pool Gateway
///
/// OpenAI-compatible chat gateway backed by a pool of upstream session cookies.
#[derive(Parser, Debug)]
#[command(name = "cookie-pool-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides PORT env var)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides HOST env var)
    #[arg(long)]
    host: Option<String>,

    /// Log level: trace, debug, info, warn, error (overrides LOG_LEVEL env var)
    #[arg(long)]
    log_level: Option<String>,

    /// Environment (overrides ENVIRONMENT env var)
    #[arg(short, long)]
    env: Option<Environment>,

    /// Log file path for JSON logs (10MB rotation)
    /// Example: --log-file /var/log/gateway/app.log
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Directory holding one credential file per session (overrides CREDENTIALS_DIR)
    #[arg(long)]
    credentials_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configuration comes first so the log level is known
    let mut settings = Settings::load()?;

    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(log_level) = args.log_level {
        settings.log_level = log_level;
    }
    if let Some(env) = args.env {
        settings.environment = env;
    }
    if let Some(dir) = args.credentials_dir {
        settings.credentials_dir = dir;
    }

    init_tracing(&settings.log_level, args.log_file.as_ref())?;
    settings.validate()?;

    tracing::info!(
        app_name = %settings.app_name,
        version = %settings.app_version,
        environment = %settings.environment,
        host = %settings.host,
        port = %settings.port,
        credentials_dir = %settings.credentials_dir.display(),
        "Starting application"
    );

    let app = App::new(settings).await?;
    app.run_with_graceful_shutdown().await?;

    tracing::info!("Application shutdown complete");
    Ok(())
}

/// JSON logs to stdout, plus an optional rolling log file.
/// `RUST_LOG` takes precedence over the configured level.
fn init_tracing(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = fmt::layer().json().with_filter(filter());
    let subscriber = tracing_subscriber::registry().with(console_layer);

    match log_file {
        Some(path) => {
            let writer = SizeBasedRollingWriter::with_defaults(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let file_layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            subscriber.with(file_layer).init();
            tracing::info!(path = %path.display(), "Logging to file with 10MB rotation");
        }
        None => subscriber.init(),
    }
    Ok(())
}
