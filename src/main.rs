use std::sync::Arc;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod agents;
mod config;
mod engine;
mod error;
mod mcp;
mod model;
mod multiplexer;
mod registry;
mod retrieval;
mod server;
mod session;
mod settings;
mod storage;
#[cfg(test)]
mod testing;
mod tools;

use crate::config::{AppConfig, StartArgs};
use crate::model::{LanguageModel, OllamaClient};
use crate::storage::SqliteSessionRepository;

#[derive(Debug, Parser)]
#[command(name = "parley")]
#[command(about = "Local chat, agent and tool-provider backend for Ollama", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP backend.
    Start(StartArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => {
            let config = AppConfig::try_from(args)?;
            let metrics = PrometheusBuilder::new().install_recorder()?;

            let repo = Arc::new(SqliteSessionRepository::initialize(config.database_url.clone()).await?);
            let ollama = Arc::new(OllamaClient::new(config.ollama_url.clone(), config.embedding_model.clone()));
            if let Err(e) = ollama.ping().await {
                warn!(address = %config.ollama_url, error = %e, "model runtime not reachable yet");
            }

            let mut state = server::AppState::new(repo, ollama.clone(), ollama.clone(), ollama, config.defaults.clone());
            state.handshake_timeout = config.handshake_timeout;
            state.metrics = Some(metrics);

            info!(model = config.default_model(), ollama = %config.ollama_url, "starting parley");
            server::serve(config.listen, state).await?;
        }
    }
    Ok(())
}
