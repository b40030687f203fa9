//! Router assembly and the HTTP server loop.

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tidegate_core::Gateway;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;

use crate::handlers::{
    bep44, data, data_by_info_hash, data_by_path, events, file_state, get_metainfo, health, info,
    post_metainfo, status, upload,
};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server failed: {0}")]
    Io(#[from] std::io::Error),
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Cancelled on shutdown; every request scope is a child of it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, shutdown: CancellationToken) -> Self {
        Self { gateway, shutdown }
    }
}

/// Builds the gateway's router.
pub fn router(state: AppState) -> Router {
    let max_form_bytes = state.gateway.config().upload.max_form_bytes;
    Router::new()
        // Content
        .route("/data", get(data))
        .route("/data/infohash/{ih}", get(data_by_info_hash))
        .route("/data/infohash/{ih}/", get(data_by_info_hash))
        .route("/data/infohash/{ih}/{*path}", get(data_by_path))
        .route("/info", get(info))
        .route("/metainfo", get(get_metainfo).post(post_metainfo))
        // Progress
        .route("/events", get(events))
        .route(
            "/fileState",
            get(file_state).layer(CompressionLayer::new()),
        )
        // Gateway-wide
        .route("/status", get(status))
        .route("/health", get(health))
        .route(
            "/upload",
            axum::routing::post(upload).layer(DefaultBodyLimit::max(max_form_bytes)),
        )
        .route("/bep44", get(bep44))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves `gateway` on its configured address until `shutdown` fires.
///
/// In-flight requests see `shutdown` through their request scopes, so
/// blocked reads end promptly.
///
/// # Errors
/// - `ServerError::Bind` - Address unavailable
/// - `ServerError::Io` - Accept loop failed
pub async fn run_server(gateway: Arc<Gateway>, shutdown: CancellationToken) -> Result<(), ServerError> {
    let addr = gateway.config().http.addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;
    tracing::info!("Tidegate listening on http://{}", local_addr);

    let app = router(AppState::new(gateway, shutdown.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!("Tidegate server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tidegate_core::GatewayConfig;
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        let gateway = Gateway::from_config(GatewayConfig::for_testing()).unwrap();
        router(AppState::new(Arc::new(gateway), CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = app()
            .oneshot(Request::get("/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_requires_post() {
        let response = app()
            .oneshot(Request::get("/upload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_run_server_stops_on_shutdown() {
        let mut config = GatewayConfig::for_testing();
        config.http.addr = "127.0.0.1:0".to_string();
        let gateway = Arc::new(Gateway::from_config(config).unwrap());
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(run_server(gateway, shutdown.clone()));

        tokio::task::yield_now().await;
        shutdown.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), server)
            .await
            .expect("server stopped")
            .unwrap();
        assert!(result.is_ok());
    }
}
