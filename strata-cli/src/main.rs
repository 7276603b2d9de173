mod session;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use session::{BackendKind, Session};
use std::path::PathBuf;
use std::time::Duration;
use strata_cache::{CacheRegistry, LoggingConfig, StrataConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "strata-cli")]
#[command(about = "Strata CLI - Redis-like shell over the cache backends", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Backend to operate on
    #[arg(short = 'b', long, value_enum, default_value = "memory")]
    backend: BackendKind,

    /// Store name for the sqlite and file backends
    #[arg(short = 'n', long, default_value = "default")]
    name: String,

    /// Put an in-process tier in front of the backend for GET/SET/DEL
    #[arg(long)]
    tiered: bool,

    /// TTL in seconds for values promoted into the in-process tier
    #[arg(long, default_value = "300")]
    promote_ttl: u64,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<StrataConfig> {
    let mut config = match path {
        Some(path) => StrataConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => StrataConfig::default(),
    };
    config.apply_env(|name| std::env::var(name).ok());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    init_tracing(&config.logging);

    let registry = CacheRegistry::connect(config).await;
    let session = Session::open(
        &registry,
        args.backend,
        &args.name,
        args.tiered,
        Duration::from_secs(args.promote_ttl),
    )
    .await?;

    // Check if running in command mode or interactive mode
    let outcome = if !args.command.is_empty() {
        let cmd = &args.command[0];
        let cmd_args: Vec<String> = args.command[1..].to_vec();

        match session.execute_command(cmd, &cmd_args).await {
            Ok(output) => {
                info!("{}", output);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "{}", format!("Error: {}", e).red());
                registry.close().await;
                std::process::exit(1);
            }
        }
    } else {
        run_interactive(&session).await
    };

    registry.close().await;
    outcome
}

async fn run_interactive(session: &Session) -> Result<()> {
    info!(
        "{}",
        format!("Strata CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!("Using {}", session.label());
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;

    loop {
        let prompt = format!("{}> ", format!("strata {}", session.label()).green());
        let readline = rl.readline(&prompt);

        match readline {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }

                rl.add_history_entry(&line)?;

                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                let cmd = &parts[0];
                let args = &parts[1..];

                if cmd.eq_ignore_ascii_case("QUIT") || cmd.eq_ignore_ascii_case("EXIT") {
                    info!("Goodbye!");
                    break;
                }

                match session.execute_command(cmd, args).await {
                    Ok(output) => info!("{}", output),
                    Err(e) => {
                        error!(error = %e, "{}", format!("Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
