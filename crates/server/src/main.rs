mod api;
mod config;
mod scan;
mod state;
mod utils;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use api::api_router;
use axum::Router;
use config::{config_path_from_env, load_or_create_config, resolve_music_root, resolve_path};
use library::{
    absolute_path, Catalog, EventPublisher, ImageCovers, JobQueue, LocalMedia, Pipeline,
    PipelineConfig, PipelineParts, PoolOptions, WorkerPool, WriteLeases,
};
use parking_lot::RwLock;
use scan::start_index;
use state::AppState;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let index_path = resolve_path(&config_path, &config.index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let covers_dir = absolute_path(&resolve_path(&config_path, &config.covers_path));
    std::fs::create_dir_all(&covers_dir)?;

    let music_root = resolve_music_root(&config_path, &config.music_root).map(|root| absolute_path(&root));
    let uploads_dir = match config.uploads_path.trim() {
        "" => music_root.as_ref().map(|root| root.join("uploads")),
        value => Some(absolute_path(&resolve_path(&config_path, value))),
    };

    let catalog = Catalog::open(&index_path, config.history_keep)?;
    let events = EventPublisher::new(config.event_buffer);
    let (queue, receivers) = JobQueue::new();
    let pipeline = Pipeline::new(PipelineParts {
        catalog,
        media: Arc::new(LocalMedia),
        covers: Arc::new(ImageCovers::new(covers_dir.clone(), config.cover_small_size)),
        leases: WriteLeases::in_memory(config.lease_ttl()),
        queue,
        events: Arc::new(events.clone()),
        config: PipelineConfig {
            roots: music_root.iter().cloned().collect(),
            extensions: config.extensions.clone(),
            covers_dir,
            extract_parallelism: config.extract_parallelism,
            batch_size: config.batch_size,
            duration_tolerance_secs: config.duration_tolerance_secs,
        },
    });

    let pool = WorkerPool::start(
        receivers,
        Arc::new(pipeline.clone()),
        PoolOptions {
            workers: config.workers,
            job_timeout: config.job_timeout(),
        },
    );

    let port = config.port;
    let rescan_grace = config.rescan_grace();
    let state = AppState {
        pipeline,
        events,
        pool: Arc::new(RwLock::new(Some(pool))),
        watcher: Arc::new(RwLock::new(None)),
        config: Arc::new(config),
        uploads_dir,
        shutdown: CancellationToken::new(),
    };

    let rescan = match music_root {
        Some(root) if root.is_dir() => start_index(&state, root),
        Some(root) => {
            warn!("Music directory not found: {}", root.display());
            None
        }
        None => {
            info!("Music directory not configured; set music_root in {:?}", config_path);
            None
        }
    };

    let app = Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    *state.watcher.write() = None;
    if let Some(rescan) = rescan {
        rescan.stop(rescan_grace).await;
    }
    let pool = state.pool.write().take();
    if let Some(pool) = pool {
        pool.shutdown(Duration::from_secs(10)).await;
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
    shutdown.cancel();
}
