use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use sqlserve::store::{MemoryStore, PgStore, PgStoreConfig, StoreBackend, StoreMode};
use sqlserve::{http, Config, HttpOptions, LogFormat, Service};

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum Backend {
    Mock,
    #[default]
    Postgres,
}

impl From<Backend> for StoreMode {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Mock => StoreMode::Mock,
            Backend::Postgres => StoreMode::Postgres,
        }
    }
}

#[derive(Parser)]
#[command(name = "sqlserve-server")]
#[command(about = "Serves a directory of SQL templates as a JSON query API")]
struct Args {
    #[arg(
        long,
        value_enum,
        default_value = "postgres",
        help = "Store backend: postgres or mock (in-memory, every query returns no rows)"
    )]
    backend: Backend,

    #[arg(long, help = "Path to configuration file (TOML)")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    init_tracing(&config);

    let mode: StoreMode = args.backend.into();
    let store = connect_store(mode, &config).await?;

    let service = Arc::new(Service::build(&config, store).await?);
    let app = http::router(
        Arc::clone(&service),
        HttpOptions {
            keepalive: config.server.keepalive,
            cookie: config.sessions.cookie,
            doc: config.doc.enabled,
        },
    );

    let listener = tokio::net::TcpListener::bind(&config.server.address).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
        }
    }
}

async fn connect_store(mode: StoreMode, config: &Config) -> anyhow::Result<Arc<dyn StoreBackend>> {
    match mode {
        StoreMode::Mock => {
            info!("Starting with mock backend");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreMode::Postgres => {
            info!("Starting with Postgres backend");
            let mut pg = PgStoreConfig::new(&config.database.url);
            pg.max_connections = config.database.max_connections;
            Ok(Arc::new(PgStore::connect(&pg).await?))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
