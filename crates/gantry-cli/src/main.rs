//! Gantry CLI entrypoint.

use clap::Parser;
use console::style;

mod commands;
mod config;
mod handlers;

#[cfg(test)]
mod cli_tests;

use commands::{Commands, ConfigCommands};
use config::{CliConfig, LogFormat};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Run CI pipelines locally", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "GANTRY_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn dispatch(cli: Cli, config: CliConfig) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Init { path } => handlers::init(&path)?,
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Plan {
            path,
            trigger,
            json,
        } => handlers::plan(&path, &trigger, json)?,
        Commands::Run { path, trigger, run } => {
            return handlers::run(&config, &path, &trigger, &run).await;
        }
        Commands::Schema { kind } => handlers::schema(kind)?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match CliConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}, using defaults", style("warning:").yellow().bold(), e);
            CliConfig::default()
        }
    };

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        config.log_format
    };
    init_tracing(format);

    let code = match dispatch(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            1
        }
    };
    std::process::exit(code);
}
