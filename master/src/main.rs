mod config;
mod handlers;
mod python;
mod state;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Settings;
use crate::python::PythonExecutor;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("master=debug,common=debug,tower_http=debug,axum=info")
        .init();

    let settings = Settings::from_env()?;
    info!("configuración: {:?}", settings);

    // bucket de salidas de jobs
    let blobs = state::build_blob_store(&settings)?;
    blobs.ensure_bucket(&settings.jobs_bucket).await?;

    let executor = Arc::new(PythonExecutor::new(&settings.python_bin, settings.execution_timeout));
    let bind_addr = settings.bind_addr.clone();
    let state = AppState::new(settings, executor, blobs);

    // router HTTP
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {bind_addr}"))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
