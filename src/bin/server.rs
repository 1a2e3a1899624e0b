use anyhow::Context;
use clap::{Parser, Subcommand};
use reportportal::config::{Config, LogFormat, LoggingConfig};
use reportportal::metadata::MemoryMetadataStore;
use reportportal::model::ReportRecord;
use reportportal::portal::{self, AppState};
use reportportal::start_server_with_state;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reportportal", version, about = "Hosts and renders report scripts")]
struct Cli {
    /// Configuration file (defaults to ./reportportal.toml when present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the portal
    Serve,
    /// Execute a local script with a stand-in record and print the page
    Render {
        file: PathBuf,
        /// Print the produced blocks as JSON instead of HTML
        #[arg(long)]
        json: bool,
    },
    /// Remove stale staging files once
    Purge,
    /// Probe the entry script of every active report
    Check,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Render { file, json } => render(config, &file, json).await,
        Command::Purge => {
            let state = offline_state(config)?;
            let report = state.purge_stale();
            println!("removed {} stale file(s), {} failure(s)", report.removed, report.failed);
            Ok(())
        }
        Command::Check => {
            let state = AppState::from_config(config).await?;
            let lines = portal::check_reports(&state).await?;
            let mut missing = 0;
            for line in &lines {
                match &line.status {
                    Ok(()) => println!("ok       {:<32} {}", line.report_id, line.key),
                    Err(reason) => {
                        missing += 1;
                        println!("FAILED   {:<32} {} ({})", line.report_id, line.key, reason);
                    }
                }
            }
            println!("{} report(s) checked, {} failing", lines.len(), missing);
            if missing > 0 {
                anyhow::bail!("{} report(s) have no usable entry script", missing);
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let port = start_server_with_state(state, shutdown_rx).await?;
    tracing::info!(port, "report portal started");

    tokio::signal::ctrl_c().await?;
    println!("shutdown requested, stopping server...");
    let _ = shutdown_tx.send(());
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    println!("server stopped");
    Ok(())
}

// Metadata is not needed for local commands.
fn offline_state(config: Config) -> anyhow::Result<AppState> {
    let objects = portal::objects_from_config(&config)?;
    AppState::with_stores(config, Arc::new(MemoryMetadataStore::new()), objects)
}

async fn render(config: Config, file: &Path, json: bool) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = file
        .parent()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .unwrap_or("local");
    let record = ReportRecord::local(name, name);

    let state = offline_state(config)?;
    let fetcher = state.fetcher();
    let staging = state.staging.clone();
    let limits = state.limits();
    let rendered = tokio::task::spawn_blocking(move || {
        portal::render_source(&record, &source, &fetcher, &staging, &limits)
    })
    .await
    .context("render worker failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rendered.output)?);
    } else {
        let view = state.report_view(&rendered);
        let html = state
            .renderer
            .report(&Default::default(), &view, &[])?;
        println!("{}", html);
    }

    match rendered.error {
        Some(e) => Err(anyhow::anyhow!(e)),
        None => Ok(()),
    }
}
