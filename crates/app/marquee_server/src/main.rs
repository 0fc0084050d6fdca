//! Marquee API server binary.
//!
//! Reads configuration from the environment (and `.env`), connects the store,
//! runs migrations and serves the API until Ctrl-C, then stops every agent.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use marquee_api::config::ApiConfig;
use marquee_api::{AppState, router};
use marquee_core::agent::printer::{FilePrinter, LogPrinter, PrintSink};
use marquee_core::store::memory::MemoryStore;
use marquee_core::store::postgres::PgStore;
use marquee_core::store::{DynStore, wait_until_ready};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

/// CLI arguments; everything else comes from the environment.
#[derive(Parser, Debug)]
#[command(name = "marquee_server", version, about = "Marquee API server")]
struct Args {
    /// Address to listen on. Overrides `BIND_ADDR`.
    #[arg(long)]
    bind: Option<String>,

    /// Database URL, or `memory://`. Overrides `DATABASE_URL`.
    #[arg(long)]
    database_url: Option<String>,

    /// Maximum number of database connections in the pool.
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    /// Append print jobs of in-process agents to this JSON-lines file
    /// instead of logging them.
    #[arg(long, env = "PRINT_SPOOL")]
    print_spool: Option<std::path::PathBuf>,

    /// Validate configuration and exit.
    #[arg(long, default_value_t = false)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,marquee_api=debug,marquee_core=debug".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = ApiConfig::from_env().inspect_err(|e| error!("invalid configuration: {e}"))?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(url) = args.database_url {
        config.database_url = url;
    }

    if args.check_config {
        info!(?config, "configuration is valid");
        println!("configuration ok ({:?})", config.environment);
        return Ok(());
    }

    info!(
        environment = ?config.environment,
        bind_addr = %config.bind_addr,
        "starting marquee_server"
    );

    let store = open_store(&config, args.max_connections).await?;

    let printer: Arc<dyn PrintSink> = match args.print_spool {
        Some(path) => {
            info!(path = %path.display(), "spooling print jobs to file");
            Arc::new(FilePrinter::new(path))
        }
        None => Arc::new(LogPrinter),
    };

    let state = AppState::new(store, config.clone(), printer);
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "REST API listening");

    let bus = state.bus.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open event streams would hold the listener open.
            bus.close_all();
        })
        .await?;

    info!("stopping agents");
    state.agents.shutdown().await;
    info!("marquee_server stopped");
    Ok(())
}

async fn open_store(
    config: &ApiConfig,
    max_connections: u32,
) -> Result<DynStore, Box<dyn std::error::Error>> {
    if config.uses_memory_store() {
        warn!("using the in-memory store; data is lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_lazy(&config.database_url)?;
    let store = Arc::new(PgStore::new(pool));

    // Login reports DATABASE_NOT_READY until the database answers.
    match wait_until_ready(store.as_ref(), config.db_ready_timeout).await {
        Ok(()) => {
            info!("running database migrations");
            store.migrate().await?;
        }
        Err(e) => {
            warn!("database not reachable yet, migrating once it is: {e}");
            let pending = store.clone();
            tokio::spawn(async move {
                while let Err(e) = wait_until_ready(pending.as_ref(), Duration::from_secs(30)).await {
                    warn!("database still not reachable: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                match pending.migrate().await {
                    Ok(()) => info!("database migrations applied"),
                    Err(e) => error!("database migrations failed: {e}"),
                }
            });
        }
    }
    Ok(store)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
