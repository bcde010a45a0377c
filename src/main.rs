//! bi-forecast CLI entrypoint

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bi_forecast::cli::Cli;
use bi_forecast::config::{self, LoggingConfig};

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let file = logging.open_file()?;

    // Logs go to stderr so JSON printed on stdout stays parseable
    let registry = tracing_subscriber::registry().with(filter);
    if logging.is_json() {
        let file_layer = file.map(|f| fmt::layer().json().with_writer(f));
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(file_layer)
            .init();
    } else {
        let file_layer = file.map(|f| fmt::layer().with_ansi(false).with_writer(f));
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(file_layer)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse first so `--config` also decides how we log
    let cli = Cli::parse();
    init_tracing(&config::logging_for(cli.config.as_deref()))?;

    let code = cli.execute().await?;
    std::process::exit(code);
}
