//! Orgledger server
//!
//! Runs the background task worker, the periodic billing sweeps and the
//! HTTP surface (health probes and the billing webhook).

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use config::{LogFormat, LogTarget, LoggingConfig};
use orgledger::{api, config, db, services, AppConfig, AppState, Services};
use services::TaskWorker;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return Ok(());
    }

    if args.iter().any(|arg| arg == "--version" || arg == "-V") {
        println!("orgledger {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Sweep once and exit, for running from an external scheduler
    let one_shot = args
        .iter()
        .position(|arg| arg == "--sweep")
        .and_then(|i| args.get(i + 1).cloned());

    // Configuration first, so logging knows its format
    let config = AppConfig::load().context("Failed to load configuration")?;

    // Keep the guard alive so file logs are flushed
    let _log_guard = init_logging(&config.logging);

    info!("orgledger {} starting up", env!("CARGO_PKG_VERSION"));

    ensure_data_directory(&config)?;

    info!("Initializing database connection");
    let db = db::init_pool(&config.database)
        .await
        .context("Failed to initialize database")?;

    let shared = Arc::new(config.clone());
    let (services, receiver) = Services::from_config(db.clone(), shared).context("Failed to initialize services")?;

    let mut worker = TaskWorker::new(services.clone(), receiver);

    if let Some(name) = one_shot {
        let sweep = match name.as_str() {
            "restore" => services::Sweep::Restore,
            "overdue" => services::Sweep::Overdue,
            other => anyhow::bail!("Unknown sweep '{}', expected restore or overdue", other),
        };
        let today = chrono::Utc::now().date_naive();
        let count = services::run_sweep(&services, sweep, today).await?;
        let tasks = worker.drain().await;
        info!(sweep = %sweep, count, tasks, "One-shot sweep finished");
        return Ok(());
    }

    tokio::spawn(worker.run());

    let _sweeps = services::start_sweeps(services.clone(), &config.schedules)?;

    let state = AppState {
        config: config.clone(),
        db,
        services,
    };
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address configuration")?;

    info!("Starting HTTP server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn print_help() {
    println!(
        "orgledger {}

USAGE:
    orgledger [OPTIONS]

OPTIONS:
    -h, --help              Print help information
    -V, --version           Print version information
    --sweep <restore|overdue>
                            Run one billing sweep and exit

CONFIGURATION:
    Configuration is read from ORGLEDGER_CONFIG, ./config/config.yaml or
    ~/.config/orgledger/config.yaml, then overridden from the environment.",
        env!("CARGO_PKG_VERSION")
    );
}

fn init_logging(log_config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_config.level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match &log_config.target {
        LogTarget::Console => {
            init_console_logging(subscriber, &log_config.format);
            None
        }
        LogTarget::File => {
            let (writer, guard) = create_file_writer(log_config);
            init_file_logging(subscriber, &log_config.format, writer);
            Some(guard)
        }
        LogTarget::Both => {
            let (writer, guard) = create_file_writer(log_config);
            let subscriber = subscriber.with(console_layer(&log_config.format));
            init_file_logging(subscriber, &log_config.format, writer);
            Some(guard)
        }
    }
}

/// Create a file writer with optional daily rotation
fn create_file_writer(
    log_config: &LoggingConfig,
) -> (
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
) {
    if let Err(e) = std::fs::create_dir_all(&log_config.log_dir) {
        eprintln!("Warning: Failed to create log directory {:?}: {}", log_config.log_dir, e);
    }

    let file_appender = if log_config.daily_rotation {
        tracing_appender::rolling::daily(&log_config.log_dir, &log_config.log_prefix)
    } else {
        tracing_appender::rolling::never(&log_config.log_dir, &log_config.log_prefix)
    };

    tracing_appender::non_blocking(file_appender)
}

fn console_layer<S>(format: &LogFormat) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    use tracing_subscriber::{fmt, Layer};

    match format {
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
    }
}

fn init_console_logging<S>(subscriber: S, format: &LogFormat)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    use tracing_subscriber::prelude::*;

    subscriber.with(console_layer(format)).init();
}

fn init_file_logging<S>(subscriber: S, format: &LogFormat, writer: tracing_appender::non_blocking::NonBlocking)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    use tracing_subscriber::{fmt, prelude::*};

    match format {
        LogFormat::Json => {
            subscriber
                .with(fmt::layer().json().with_target(true).with_writer(writer))
                .init();
        }
        LogFormat::Compact => {
            subscriber
                .with(fmt::layer().compact().with_target(false).with_writer(writer))
                .init();
        }
        LogFormat::Pretty => {
            subscriber
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_file(false)
                        .with_line_number(false)
                        .with_writer(writer),
                )
                .init();
        }
    }
}

/// Ensure the directory holding the SQLite file exists
fn ensure_data_directory(config: &AppConfig) -> Result<()> {
    if let Some(path) = config.database.url.strip_prefix("sqlite://") {
        let path = path.split('?').next().unwrap_or(path);
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create data directory")?;
                info!("Created data directory: {:?}", parent);
            }
        }
    }
    Ok(())
}
