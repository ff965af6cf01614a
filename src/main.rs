mod adapters;
mod clock;
mod config;
mod entities;
mod file_hash;
mod http_server;
mod logging;
mod pipeline;
mod report;
mod staging;
mod state;
mod store;
#[cfg(test)]
mod test_utils;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::Context};

use crate::{
    config::Config,
    http_server::state::AppState,
    logging::init_tracing,
    pipeline::{PipelineContext, PipelineSettings},
    report::{FailureReport, StatusReport},
    staging::Staging,
    store::Store,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The config file to use
    #[arg(short, long, env = "PHOTO_MIGRATOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `photo_migrator=debug,sqlx=warn`
    #[arg(long, default_value = "info", global = true, env = "LOG_LEVEL")]
    log_level: String,

    /// Export spans to this OTLP (gRPC) endpoint
    #[arg(long, global = true, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the migration pipeline until interrupted
    Run {
        /// Also serve `/status` and `/failures` on this port
        #[arg(long, env = "PHOTO_MIGRATOR_HTTP_PORT")]
        http_port: Option<u16>,

        /// Exit once every item is done or permanently failed
        #[arg(long)]
        until_complete: bool,
    },
    /// Print per-state counts
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print permanently failed items and leftover staging files
    Report {
        #[arg(long)]
        json: bool,
    },
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Create a default config file, if it doesn't exist
    CreateDefault,
    /// Print the path to the config file
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let tracer_provider = init_tracing(
        env!("CARGO_PKG_NAME"),
        args.otlp_endpoint.as_deref(),
        &args.log_level,
    )?;

    let result = run_command(args).await;

    if let Some(provider) = tracer_provider
        && let Err(e) = provider.shutdown()
    {
        eprintln!("Failed to flush traces: {e}");
    }
    result
}

async fn run_command(args: Args) -> Result<()> {
    if let Commands::Config(config_commands) = &args.command {
        match config_commands {
            ConfigCommands::CreateDefault => {
                let path = Config::create_default()?;
                println!("{}", path.display());
            }
            ConfigCommands::Path => match Config::config_path() {
                Some(path) => println!("{}", path.display()),
                None => println!("No default config path found"),
            },
        }
        return Ok(());
    }

    tracing::debug!("Loading configuration");
    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .wrap_err("Failed to load photo-migrator config")?;

    let store = Arc::new(Store::open(&config.database_path()).await?);
    let staging_path = config.staging_path();
    let staging = Staging::new(&staging_path)
        .wrap_err_with(|| format!("Failed to create staging dir {}", staging_path.display()))?;
    let mut settings = PipelineSettings::from_config(&config);

    match args.command {
        Commands::Run {
            http_port,
            until_complete,
        } => {
            settings.until_complete = until_complete;
            let source = adapters::source_from_config(&config)?;
            let destination = adapters::destination_from_config(&config)?;
            let limits = settings.retry_limits();
            let ctx = Arc::new(PipelineContext::new(
                store.clone(),
                staging.clone(),
                source,
                destination,
                settings,
            ));

            let shutdown = ctx.shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupted, finishing in-flight items");
                    shutdown.cancel();
                }
            });

            let server = http_port.map(|port| {
                let app_state = Arc::new(AppState {
                    store,
                    staging,
                    limits,
                });
                tokio::spawn(http_server::app::start(
                    port,
                    app_state,
                    ctx.shutdown.clone(),
                ))
            });

            let result = pipeline::run(ctx.clone()).await;
            ctx.shutdown.cancel();
            if let Some(server) = server {
                match server.await {
                    Ok(Err(e)) => tracing::error!(error = ?e, "HTTP server failed"),
                    Err(e) => tracing::error!(%e, "HTTP server task panicked"),
                    Ok(Ok(())) => {}
                }
            }
            result?;
        }
        Commands::Status { json } => {
            let status = StatusReport::gather(&store, settings.retry_limits()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", status.render());
            }
        }
        Commands::Report { json } => {
            let report = FailureReport::gather(&store, &staging, settings.retry_limits()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
        }
        Commands::Config(_) => {}
    }

    Ok(())
}
