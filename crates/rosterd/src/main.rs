use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod engine;
mod service;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rosterd starting");

    let config = config::Config::from_env();
    config.ensure_dirs();
    tracing::info!(
        students = %config.students_dir.display(),
        attendance = %config.attendance_dir.display(),
        models = %config.model_dir.display(),
        threshold = config.similarity_threshold,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(
        &config.scrfd_model_path(),
        &config.mesh_model_path(),
        config.detection_confidence,
        config.max_faces,
    )
    .context("failed to start landmark engine")?;

    let bind_addr = config.bind_addr;
    let state = Arc::new(service::AppState::new(config, Arc::new(engine)));

    let loader = state.clone();
    let report = tokio::task::spawn_blocking(move || loader.reload_gallery()).await?;
    tracing::info!(
        students = report.students,
        features = report.features,
        "initial gallery loaded"
    );

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("cannot bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "rosterd ready");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("rosterd shutting down");
    Ok(())
}
