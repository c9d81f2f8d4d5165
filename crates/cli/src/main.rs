//! DocChat CLI: the main entry point.
//!
//! Commands:
//! - `serve`        Start the HTTP API server
//! - `ask`          One-shot question over local files, streamed to stdout
//! - `detect-dump`  Report the dialect of a SQL dump
//! - `config`       Show or validate the configuration

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use docchat_config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "docchat",
    about = "DocChat: chat with your documents, spreadsheets, SQL dumps and the web",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Read configuration from this file instead of ~/.docchat/config.toml
    #[arg(short, long, global = true, env = "DOCCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the bind address
        #[arg(long)]
        host: Option<String>,
    },

    /// Ask one question about local files
    Ask {
        /// A file to attach to the throwaway chat (repeatable)
        #[arg(long = "chat-file", value_name = "PATH")]
        chat_files: Vec<PathBuf>,

        /// The question
        question: String,
    },

    /// Print the SQL dialect of a dump: MySQL, Postgres or Unknown
    DetectDump {
        file: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML, secrets redacted
    Show {
        /// Print the built-in defaults instead
        #[arg(long)]
        defaults: bool,
    },
    /// Check the configuration and summarize it
    Validate,
    /// Print the default config file location
    Path,
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose { "docchat=debug,info" } else { "docchat=info,warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load configuration, then start logging the way it asks for.
fn load_config(path: Option<&Path>, verbose: bool) -> anyhow::Result<AppConfig> {
    let config = commands::config_cmd::load(path)?;
    init_tracing(verbose, config.logging.json);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Cli {
        command,
        config: config_path,
        verbose,
    } = Cli::parse();
    let config_path = config_path.as_deref();

    match command {
        Commands::Serve { port, host } => {
            let config = load_config(config_path, verbose)?;
            commands::serve::run(config, host, port).await?;
        }
        Commands::Ask { chat_files, question } => {
            let config = load_config(config_path, verbose)?;
            commands::ask::run(config, chat_files, question).await?;
        }
        Commands::DetectDump { file } => {
            init_tracing(verbose, false);
            commands::detect_dump::run(&file).await?;
        }
        // Config commands report load failures themselves.
        Commands::Config { action } => {
            init_tracing(verbose, false);
            match action {
                ConfigAction::Show { defaults } => commands::config_cmd::show(config_path, defaults)?,
                ConfigAction::Validate => commands::config_cmd::validate(config_path)?,
                ConfigAction::Path => commands::config_cmd::path(),
            }
        }
    }

    Ok(())
}
