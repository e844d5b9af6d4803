use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rusty_realtime_core::config::{Config, LoggingConfig};
use rusty_realtime_gateway::GatewayState;
use rusty_realtime_media::VoiceActivityGate;
use rusty_realtime_tools::{register_builtin_tools, ToolRegistry};

#[derive(Parser)]
#[command(
    name = "rusty-realtime",
    about = "Realtime voice relay between browser clients and a conversational model, with tool calling",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay gateway
    Serve {
        /// Port to listen on (default: 3000)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show system status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => serve(&config, port, bind).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config.redacted())?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Status => status(&config, &config_path).await,
    }

    Ok(())
}

async fn serve(config: &Config, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        tracing::warn!("{w}");
    }
    if !errors.is_empty() {
        for e in &errors {
            tracing::error!("{e}");
        }
        anyhow::bail!("Invalid configuration");
    }

    let endpoint = config.realtime_endpoint()?;

    let mut tools = ToolRegistry::new();
    register_builtin_tools(&mut tools, &config.tools());
    let tools = Arc::new(tools);
    tracing::info!(tools = ?tools.list(), "Tools ready");

    let session_config = config.session_config(tools.definitions())?;
    let gate = Arc::new(VoiceActivityGate::from_config(&config.vad())?);

    let state = Arc::new(GatewayState::new(endpoint, session_config, tools, gate));
    let port = port.unwrap_or_else(|| config.gateway_port());
    let bind = bind.unwrap_or_else(|| config.gateway_bind());
    tracing::info!(model = %config.realtime_model(), "Starting Rusty Realtime gateway on {bind}:{port}");

    rusty_realtime_gateway::start_gateway(state, &bind, port).await
}

async fn status(config: &Config, config_path: &std::path::Path) {
    let port = config.gateway_port();
    println!("Rusty Realtime v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Model: {}", config.realtime_model());
    println!("Gateway: {}:{port}", config.gateway_bind());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_default();
    let health = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await;
    match health {
        Ok(resp) => match resp.json::<serde_json::Value>().await {
            Ok(body) => println!("Status: running ({} live sessions)", body["sessions"]),
            Err(_) => println!("Status: port {port} is in use by something else"),
        },
        Err(_) => println!("Status: not running"),
    }
}

/// Filter directives: `logging.level`, else `debug` with `--verbose`, else
/// `info`, followed by `logging.filters`.
fn filter_directives(logging: Option<&LoggingConfig>, verbose: bool) -> String {
    let level = logging
        .and_then(|l| l.level.clone())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());

    let mut directives = vec![level];
    if let Some(l) = logging {
        directives.extend(l.filters.iter().cloned());
    }
    directives.join(",")
}

/// Initialize tracing. `RUST_LOG` takes precedence over the config.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(logging, verbose)));

    let json = logging.is_some_and(|l| l.format == "json");
    let stdout = logging.is_some_and(|l| l.output == "stdout");

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}
