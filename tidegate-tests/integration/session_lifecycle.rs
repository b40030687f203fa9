//! Session leases, cancellation and gateway-wide endpoints

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tidegate_core::storage::{PieceStorage, StorageKey};
use tidegate_core::torrent::PieceIndex;
use tidegate_core::{InfoHash, OperatorPolicy};
use tower::ServiceExt;

use crate::common::{TestGateway, show_fixture};

const UNKNOWN: &str = "0123456789abcdef0123456789abcdef01234567";

#[tokio::test]
async fn test_lease_released_after_response() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let response = gw.get(&format!("/data?ih={}", fixture.info_hash)).await;
    assert_eq!(response.status, StatusCode::OK);

    let registry = gw.gateway.registry();
    assert!(registry.contains(fixture.info_hash));
    assert_eq!(registry.ref_count(fixture.info_hash), 0);
}

#[tokio::test]
async fn test_shutdown_cancels_request_waiting_for_info() {
    let gw = TestGateway::new();
    let info_hash = InfoHash::from_hex(UNKNOWN).unwrap();
    let app = gw.app.clone();
    let pending = tokio::spawn(async move {
        let request = Request::get(format!("/data?ih={UNKNOWN}"))
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap().status()
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gw.gateway.registry().ref_count(info_hash), 1);
    gw.shutdown.cancel();

    let status = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("request finished")
        .unwrap();
    assert_eq!(status.as_u16(), tidegate_web::error::CLIENT_CLOSED_REQUEST);
    assert_eq!(gw.gateway.registry().ref_count(info_hash), 0);
}

#[tokio::test]
async fn test_shutdown_unblocks_body_stalled_on_missing_piece() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    let pieces = gw.storage.open(StorageKey::Torrent(fixture.info_hash));
    pieces
        .write_piece(PieceIndex::new(0), fixture.piece(0))
        .await
        .unwrap();
    pieces.mark_complete(PieceIndex::new(0)).await.unwrap();
    gw.gateway
        .cache()
        .put_metainfo(fixture.info_hash, &fixture.metainfo())
        .await
        .unwrap();

    let request = Request::get(format!("/data?ih={}", fixture.info_hash))
        .body(Body::empty())
        .unwrap();
    let response = gw.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = tokio::spawn(axum::body::to_bytes(response.into_body(), usize::MAX));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!body.is_finished());
    gw.shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), body)
        .await
        .expect("body finished")
        .unwrap();
    assert!(result.is_err());
    assert_eq!(gw.gateway.registry().ref_count(fixture.info_hash), 0);
}

#[tokio::test]
async fn test_idle_torrent_dropped_after_grace() {
    let gw = TestGateway::with_policy(Arc::new(OperatorPolicy::new(Vec::new(), false, true)));
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let response = gw.get(&format!("/info?ih={}", fixture.info_hash)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(gw.gateway.engine().torrent(fixture.info_hash).is_some());

    // Grace is one second in the testing config.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!gw.gateway.registry().contains(fixture.info_hash));
    assert!(gw.gateway.engine().torrent(fixture.info_hash).is_none());
}

#[tokio::test]
async fn test_status_and_health() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;
    gw.get(&format!("/info?ih={}", fixture.info_hash)).await;

    let status = gw.get("/status").await;
    assert_eq!(status.status, StatusCode::OK);
    let text = status.text();
    assert!(text.contains("Sessions: 1"), "{text}");
    assert!(text.contains("Local engine"), "{text}");

    let health = gw.get("/health").await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.text(), "ok\n");
}
