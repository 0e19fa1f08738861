//! ltpub entry point: parses CLI, sets up logging and starts the async runtime.
//! The main function is intentionally thin and delegates to the runtime in `app`.

mod app;
mod cli;
mod error;
mod publisher;
mod queue;
mod record;
mod signal;
mod sink;
mod supervisor;
mod tail;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = cli::parse()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    app::run(config).await
}
