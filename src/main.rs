mod api;
mod artifacts;
mod cli;
mod config;
mod credentials;
mod error;
mod events;
mod geo;
mod model;
mod poller;
mod storage;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_json = args.json;
    init_logging();

    match cli::run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if is_json {
                // Keep stdout parseable for scripts.
                println!("{}", serde_json::json!({ "error": format!("{e:#}") }));
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
