use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;

use crate::settings::{GlobalConfigDefaults, ModelParams};

pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    #[arg(long, env = "PARLEY_LISTEN", default_value = "127.0.0.1:7171")]
    pub listen: String,
    /// Base address of the Ollama runtime.
    #[arg(long, env = "OLLAMA_HOST", default_value = DEFAULT_OLLAMA_URL)]
    pub ollama_url: String,
    #[arg(long, env = "PARLEY_DATABASE_URL")]
    pub database_url: Option<String>,
    #[arg(long, env = "PARLEY_DEFAULT_MODEL", default_value = "llama3.2")]
    pub default_model: String,
    #[arg(long, env = "PARLEY_EMBEDDING_MODEL", default_value = "nomic-embed-text")]
    pub embedding_model: String,
    #[arg(long, env = "PARLEY_TEMPERATURE")]
    pub temperature: Option<f32>,
    #[arg(long, env = "PARLEY_TOP_P")]
    pub top_p: Option<f32>,
    /// Seconds allowed for the MCP handshake of process-based tool providers.
    #[arg(long, env = "PARLEY_MCP_HANDSHAKE_TIMEOUT", default_value_t = DEFAULT_HANDSHAKE_TIMEOUT_SECS)]
    pub mcp_handshake_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen: SocketAddr,
    pub ollama_url: String,
    pub database_url: Option<String>,
    pub embedding_model: String,
    pub defaults: GlobalConfigDefaults,
    pub handshake_timeout: Duration,
}

impl AppConfig {
    pub fn default_model(&self) -> &str {
        self.defaults.default_model.as_deref().unwrap_or("llama3.2")
    }
}

impl TryFrom<StartArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: StartArgs) -> anyhow::Result<Self> {
        let listen: SocketAddr = args.listen.parse()?;
        let ollama_url = normalize_base_url(&args.ollama_url)?;
        let model_params = if args.temperature.is_some() || args.top_p.is_some() {
            Some(ModelParams {
                temperature: args.temperature,
                max_tokens: None,
                top_p: args.top_p,
            })
        } else {
            None
        };
        Ok(Self {
            listen,
            ollama_url,
            database_url: args.database_url,
            embedding_model: args.embedding_model,
            defaults: GlobalConfigDefaults {
                default_model: Some(args.default_model),
                model_params,
                retrieval_top_k: None,
            },
            handshake_timeout: Duration::from_secs(args.mcp_handshake_timeout.max(1)),
        })
    }
}

/// Accepts `host:port` as well as full URLs, like `OLLAMA_HOST` does.
pub fn normalize_base_url(raw: &str) -> anyhow::Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let parsed = url::Url::parse(&with_scheme)?;
    if parsed.host_str().is_none() {
        anyhow::bail!("invalid runtime address: {raw}");
    }
    Ok(with_scheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        start: StartArgs,
    }

    #[test]
    fn bare_host_port_gets_a_scheme() {
        assert_eq!(normalize_base_url("localhost:11434").unwrap(), "http://localhost:11434");
        assert_eq!(
            normalize_base_url("https://ollama.internal/").unwrap(),
            "https://ollama.internal"
        );
    }

    #[test]
    fn start_args_build_config() {
        let cli = TestCli::parse_from([
            "parley",
            "--listen",
            "127.0.0.1:9000",
            "--ollama-url",
            "127.0.0.1:11434",
            "--temperature",
            "0.3",
        ]);
        let cfg = AppConfig::try_from(cli.start).unwrap();
        assert_eq!(cfg.listen.port(), 9000);
        assert_eq!(cfg.ollama_url, "http://127.0.0.1:11434");
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(10));
        assert_eq!(
            cfg.defaults.model_params.and_then(|p| p.temperature),
            Some(0.3)
        );
    }
}
