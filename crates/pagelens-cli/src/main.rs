#![deny(unsafe_code)]

//! PageLens CLI: run the integration engine against a context from the shell.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use pagelens_config::{AppConfig, LoggingConfig};
use pagelens_core::{Context, Credential, Engine, RegistrySnapshot};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// PageLens: contextual widgets from independently authored integrations.
#[derive(Parser)]
#[command(name = "pagelens", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "pagelens.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one request and print the merged items as JSON.
    Run {
        /// Context JSON file, or `-` for stdin.
        #[arg(long)]
        context: String,

        /// Bearer token presented to the auth gate.
        #[arg(long)]
        token: Option<String>,

        /// Print per-integration diagnostics to stderr.
        #[arg(long)]
        report: bool,
    },

    /// Validate configuration and list integrations.
    Check,

    /// List integrations whose match spec accepts the context, without running them.
    Match {
        /// Context JSON file, or `-` for stdin.
        #[arg(long)]
        context: String,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;
    init_tracing(&config.logging, cli.verbose);

    match cli.command {
        Commands::Run {
            context,
            token,
            report,
        } => cmd_run(&config, &context, token, report).await?,
        Commands::Check => cmd_check(&config, &cli.config).await?,
        Commands::Match { context } => cmd_match(&config, &context).await?,
        Commands::Config { show } => cmd_config(&config, &cli.config, show)?,
    }

    Ok(())
}

/// Level from `-v` when given, otherwise from `[logging] level`.
fn filter_directive(logging: &LoggingConfig, verbose: u8) -> &str {
    match verbose {
        0 => &logging.level,
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(logging: &LoggingConfig, verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(logging, verbose)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "pretty" {
        builder.pretty().init();
    } else {
        builder.compact().init();
    }
}

async fn cmd_run(config: &AppConfig, context_arg: &str, token: Option<String>, report: bool) -> Result<()> {
    let context = read_context(context_arg).await?;
    let engine = Engine::from_config(config).await?;
    let credential = token.map(Credential::bearer).unwrap_or_default();

    info!(context_type = %context.context_type(), "Running request");
    let result = engine.handle_detailed(&credential, &context).await?;

    if report {
        for entry in &result.integrations {
            eprintln!("{}", serde_json::to_string(entry)?);
        }
    }
    println!("{}", serde_json::to_string_pretty(&result.items)?);
    Ok(())
}

async fn cmd_check(config: &AppConfig, config_path: &Path) -> Result<()> {
    let engine = Engine::from_config(config).await?;
    let snapshot = engine.snapshot()?;
    println!(
        "Configuration at '{}' is valid: {} integration(s).",
        config_path.display(),
        snapshot.len()
    );
    print_integrations(&snapshot);
    Ok(())
}

fn print_integrations(snapshot: &RegistrySnapshot) {
    for integration in snapshot.iter() {
        let spec = &integration.match_spec;
        match spec.defect() {
            None => println!("  {:<24} {:<10} ok", integration.name, spec.context_type()),
            Some(defect) => println!(
                "  {:<24} {:<10} invalid match spec: {defect}",
                integration.name,
                spec.context_type()
            ),
        }
    }
}

async fn cmd_match(config: &AppConfig, context_arg: &str) -> Result<()> {
    let context = read_context(context_arg).await?;
    let engine = Engine::from_config(config).await?;
    for integration in engine.snapshot()?.matching(&context) {
        println!("{}", integration.name);
    }
    Ok(())
}

fn cmd_config(config: &AppConfig, config_path: &Path, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn read_context(arg: &str) -> Result<Context> {
    let text = if arg == "-" {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(arg)
            .await
            .with_context(|| format!("reading context file '{arg}'"))?
    };
    Ok(Context::from_json(&text)?)
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path)
            .await
            .with_context(|| format!("loading '{}'", path.display()))
    } else {
        eprintln!("Config file '{}' not found, using defaults", path.display());
        Ok(AppConfig::default())
    }
}
