//! Shared gateway harness for the HTTP tests.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use tidegate_core::cache::MemoryBlobStore;
use tidegate_core::engine::LocalEngine;
use tidegate_core::lookup::{ItemLookup, MultiSourceLookup};
use tidegate_core::storage::{MemoryStorage, PieceStorage};
use tidegate_core::test_fixtures::TorrentFixture;
use tidegate_core::{Gateway, GatewayConfig, GatewayParts, MetainfoCache, NoopPolicy, SessionPolicy};
use tidegate_web::{AppState, router};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub storage: MemoryStorage,
    pub blobs: MemoryBlobStore,
    pub shutdown: CancellationToken,
    pub app: Router,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl TestGateway {
    pub fn new() -> Self {
        Self::build(Arc::new(NoopPolicy), Vec::new())
    }

    pub fn with_policy(policy: Arc<dyn SessionPolicy>) -> Self {
        Self::build(policy, Vec::new())
    }

    pub fn with_lookups(backends: Vec<Arc<dyn ItemLookup>>) -> Self {
        Self::build(Arc::new(NoopPolicy), backends)
    }

    fn build(policy: Arc<dyn SessionPolicy>, backends: Vec<Arc<dyn ItemLookup>>) -> Self {
        let storage = MemoryStorage::new();
        let blobs = MemoryBlobStore::new();
        let shared: Arc<dyn PieceStorage> = Arc::new(storage.clone());
        let gateway = Arc::new(Gateway::new(
            GatewayParts {
                engine: Arc::new(LocalEngine::new(Arc::clone(&shared))),
                storage: shared,
                cache: MetainfoCache::new(Arc::new(blobs.clone())),
                policy,
                lookups: MultiSourceLookup::new(backends, Duration::from_secs(1)),
            },
            GatewayConfig::for_testing(),
        ));
        let shutdown = CancellationToken::new();
        let app = router(AppState::new(Arc::clone(&gateway), shutdown.clone()));
        Self {
            gateway,
            storage,
            blobs,
            shutdown,
            app,
        }
    }

    /// Stores the fixture's pieces and caches its metainfo, as if it had
    /// been downloaded before.
    pub async fn add_fixture(&self, fixture: &TorrentFixture) {
        fixture.store_all(&self.storage).await;
        self.gateway
            .cache()
            .put_metainfo(fixture.info_hash, &fixture.metainfo())
            .await
            .unwrap();
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }
}

pub fn show_fixture() -> TorrentFixture {
    TorrentFixture::multi_file("show", 16, &[("s01/e01.mkv", 20), ("s01/e02.mkv", 30)])
}
