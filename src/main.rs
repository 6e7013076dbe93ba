//! VillageScope analysis server
//!
//! Serves analysis results from the active run of each analysis type, caching
//! computed responses in memory. Run activation happens through the admin API
//! or the `run_admin` CLI; the registry is re-read periodically so CLI changes
//! take effect without a restart.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, time::interval};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use villagescope_backend::{
    api::{create_router, AppState},
    middleware::AdminToken,
    AnalysisCatalog, AnalysisExecutor, ComputationCache, Database, ResultStore, RunRegistry,
    ServiceConfig,
};

#[derive(Parser, Debug)]
#[command(name = "villagescope", about = "VillageScope analysis server")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, env = "VILLAGESCOPE_CONFIG", default_value = "villagescope.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let config = ServiceConfig::from_path_or_default(&args.config)
        .with_context(|| format!("Invalid configuration ({})", args.config.display()))?;

    info!("VillageScope analysis server starting");

    let db = Arc::new(Database::open(&config.storage).context("Failed to open result database")?);
    let registry = Arc::new(RunRegistry::open(db.clone()).context("Failed to load run registry")?);
    let store = Arc::new(ResultStore::new(db));
    let catalog =
        Arc::new(AnalysisCatalog::from_config(&config).context("Invalid analysis catalog")?);
    info!(
        "Registered {} analysis types: {}",
        catalog.len(),
        catalog.types().collect::<Vec<_>>().join(", ")
    );

    let cache = ComputationCache::new(&config.cache);
    let _sweeper = cache.spawn_sweeper(config.cache.sweep_interval());

    let executor = Arc::new(AnalysisExecutor::new(
        catalog,
        registry.clone(),
        store,
        cache,
    ));

    tokio::spawn(registry_refresh_loop(
        registry,
        Duration::from_secs(config.registry.refresh_interval_secs.max(1)),
    ));

    let admin_token = AdminToken::new(config.server.admin_token.as_deref());
    if !admin_token.is_configured() {
        warn!("ADMIN_TOKEN not set - admin API disabled");
    }

    let app = create_router(AppState {
        executor,
        admin_token,
    })
    .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!("API server listening on {}", config.server.bind_addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Pick up activations made by other processes.
async fn registry_refresh_loop(registry: Arc<RunRegistry>, every: Duration) {
    let mut ticker = interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let registry = registry.clone();
        match tokio::task::spawn_blocking(move || registry.reload()).await {
            Ok(Ok(changed)) if !changed.is_empty() => {
                info!("Registry reload picked up changes for: {}", changed.join(", "));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Registry reload failed: {}", e),
            Err(e) => warn!("Registry reload task panicked: {}", e),
        }
    }
}

/// Initialize tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "villagescope_backend=debug,villagescope=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also the crate-root .env, for runs started from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
