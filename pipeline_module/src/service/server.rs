use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tokio::task;
use tracing::info;

use directory_module::{DirectoryClient, GraphDirectory, RetryPolicy, RetryingDirectory};

use crate::elaborate::{ChatEngine, ElaborationEngine};
use crate::work_queue::{build_queue_from_env, WorkQueue};
use crate::worker::spawn_worker_threads;

use super::config::ServiceConfig;
use super::ingest::ingest_notifications;
use super::state::AppState;
use super::BoxError;

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let config = Arc::new(config);

    let queue: Arc<dyn WorkQueue> = task::spawn_blocking(build_queue_from_env)
        .await
        .map_err(|err| -> BoxError { err.into() })??;
    let directory: Arc<dyn DirectoryClient> = Arc::new(
        task::spawn_blocking(|| {
            GraphDirectory::from_env()
                .map(|inner| RetryingDirectory::new(inner, RetryPolicy::from_env()))
        })
        .await
        .map_err(|err| -> BoxError { err.into() })??,
    );
    let engine: Arc<dyn ElaborationEngine> = Arc::new(ChatEngine::new());

    let mut worker_control = spawn_worker_threads(
        config.clone(),
        queue.clone(),
        directory.clone(),
        engine,
    )?;

    let state = AppState {
        config: config.clone(),
        directory,
        queue,
    };

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!("deflektor service listening on {}", addr);

    let app = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/notifications", post(ingest_notifications))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.notification_body_max_bytes));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    worker_control.stop_and_join();
    serve_result?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
