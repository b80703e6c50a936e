use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use compile_server::compile_common::PathNormalizer;
use compile_server::config::{ServiceConfig, StorageBackendMode};
use compile_server::service::server::start_server;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

#[derive(Parser)]
#[command(name = "compile-server")]
#[command(version, about = "Compiles remote source packages and streams build progress")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Path to a TOML config file
    #[arg(short, long, global = true, env = "COMPILE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and websocket server
    Serve {
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Storage backend: local, cloud, memory
        #[arg(long)]
        backend: Option<StorageBackendMode>,

        /// Enable dev mode (CORS permissive for a local front-end)
        #[arg(long)]
        dev: bool,
    },
    /// Print the normalized form of a package path
    Normalize {
        path: String,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration
    Validate,
}

/// Install the global subscriber. The returned guard flushes file logs and
/// must live until exit.
fn init_logging(verbose: bool, format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_filter = if verbose {
        "compile_server=debug,compile_common=debug,tower_http=debug,info"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (writer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "compile-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    guard
}

fn cmd_config(config: &ServiceConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command.unwrap_or(ConfigCommands::Show) {
        ConfigCommands::Show => {
            let rendered =
                toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        ConfigCommands::Validate => {
            config.validate()?;
            println!("Configuration is valid.");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            backend,
            dev,
        } => {
            let mut config = ServiceConfig::load_layered(cli.config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(backend) = backend {
                config.storage.backend = backend;
            }
            config.server.dev_mode |= dev;

            let _guard = init_logging(cli.verbose, cli.log_format, config.server.log_dir.as_deref());
            start_server(config).await?;
        }
        Commands::Normalize { path } => {
            let reference = PathNormalizer::new().normalize(path.trim_matches('/'));
            if cli.verbose {
                println!("{} ({})", reference, reference.kind());
            } else {
                println!("{}", reference);
            }
        }
        Commands::Config { command } => {
            let config = ServiceConfig::load_layered(cli.config.as_deref())?;
            cmd_config(&config, command)?;
        }
    }

    Ok(())
}
