use axum::Router;
use cutsmith_engine::{ColorLibrary, ColorResolver};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod db;
mod export;
mod jobs;
mod materializer;
mod surface;
#[cfg(test)]
mod testing;

fn load_resolver(config: &config::Config) -> anyhow::Result<ColorResolver> {
    match &config.color_library {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            let library = ColorLibrary::from_json(&json)?;
            info!("Loaded color library from {:?}", path);
            Ok(ColorResolver::new(library))
        }
        None => Ok(ColorResolver::builtin()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::Config::load()?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(db::Database::open(&config.db_path)?);
    info!("Database initialized at {:?}", config.db_path);

    let resolver = Arc::new(load_resolver(&config)?);

    let surface = Arc::new(surface::BridgeSurface::new(&config.surface_url)?);
    let materializer = Arc::new(materializer::Materializer::new(
        surface,
        db.clone(),
        resolver.clone(),
        config.materializer.clone(),
    ));
    info!(session = %materializer.session_id(), "Materializer session started");

    let job_manager = Arc::new(jobs::JobManager::new(db.clone()));
    let backend = Arc::new(export::BridgeRenderBackend::new(&config.render_url)?);
    let exports = Arc::new(export::ExportScheduler::new(
        backend,
        job_manager,
        db.clone(),
        config.export.clone(),
    ));

    let state = api::AppState {
        db,
        resolver,
        materializer,
        exports,
        guide_fps: config.materializer.fps,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    let app = Router::new()
        .nest("/api", api::router(state))
        .layer(cors);

    info!("Starting daemon server on {}", config.bind);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
