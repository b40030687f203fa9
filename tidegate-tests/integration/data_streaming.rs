//! `/data`, `/info` and `/fileState` against stored content

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::json;

use crate::common::{TestGateway, show_fixture};

#[tokio::test]
async fn test_whole_content_served() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let response = gw.get(&format!("/data?ih={}", fixture.info_hash)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, fixture.content);
    assert_eq!(response.header("content-length"), Some("50"));
    assert_eq!(response.header("accept-ranges"), Some("bytes"));
    assert!(response.header("content-disposition").is_none());
}

#[tokio::test]
async fn test_file_range_served_with_headers() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let request = Request::get(format!("/data?ih={}&path=s01/e02.mkv", fixture.info_hash))
        .header(header::RANGE, "bytes=5-9")
        .body(Body::empty())
        .unwrap();
    let response = gw.send(request).await;

    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.body, fixture.content[25..30]);
    assert_eq!(response.header("content-range"), Some("bytes 5-9/30"));
    assert_eq!(response.header("content-type"), Some("video/x-matroska"));
    assert_eq!(
        response.header("content-disposition"),
        Some("filename=\"s01/e02.mkv\"")
    );
}

#[tokio::test]
async fn test_filename_parameter_sets_disposition() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let response = gw
        .get(&format!(
            "/data?ih={}&path=s01/e01.mkv&filename=pilot.mkv",
            fixture.info_hash
        ))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, fixture.content[..20]);
    assert_eq!(
        response.header("content-disposition"),
        Some("filename=\"pilot.mkv\"")
    );
}

#[tokio::test]
async fn test_path_addressed_data() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let file = gw
        .get(&format!("/data/infohash/{}/s01/e02.mkv", fixture.info_hash))
        .await;
    assert_eq!(file.status, StatusCode::OK);
    assert_eq!(file.body, fixture.content[20..]);

    let whole = gw
        .get(&format!("/data/infohash/{}", fixture.info_hash))
        .await;
    assert_eq!(whole.status, StatusCode::OK);
    assert_eq!(whole.body, fixture.content);
}

#[tokio::test]
async fn test_unsatisfiable_range() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let request = Request::get(format!("/data?ih={}&path=s01/e01.mkv", fixture.info_hash))
        .header(header::RANGE, "bytes=20-")
        .body(Body::empty())
        .unwrap();
    let response = gw.send(request).await;
    assert_eq!(response.status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.header("content-range"), Some("bytes */20"));
}

#[tokio::test]
async fn test_unknown_file_is_not_found() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let response = gw
        .get(&format!("/data?ih={}&path=s02/e01.mkv", fixture.info_hash))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.text(), "file not found\n");
}

#[tokio::test]
async fn test_bad_requests() {
    let gw = TestGateway::new();

    let missing = gw.get("/data").await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert!(missing.text().contains("missing ih"));

    let malformed = gw.get("/data?ih=xyz").await;
    assert_eq!(malformed.status, StatusCode::BAD_REQUEST);
    assert!(malformed.text().contains("Invalid info hash"));

    let bad_magnet = gw.get("/info?magnet=http://example.com").await;
    assert_eq!(bad_magnet.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_nowait_reports_accepted_until_info_known() {
    let gw = TestGateway::new();
    let unknown = "0123456789abcdef0123456789abcdef01234567";

    for endpoint in ["data", "info", "metainfo"] {
        let response = gw.get(&format!("/{endpoint}?ih={unknown}&nowait=true")).await;
        assert_eq!(response.status, StatusCode::ACCEPTED, "{endpoint}");
        assert_eq!(response.text(), "info not ready\n");
    }
}

#[tokio::test]
async fn test_info_returns_raw_info_bytes() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let response = gw.get(&format!("/info?ih={}", fixture.info_hash)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, fixture.info_bytes);
}

#[tokio::test]
async fn test_file_state_after_read() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    // Reading everything marks every stored piece complete.
    let read = gw.get(&format!("/data?ih={}", fixture.info_hash)).await;
    assert_eq!(read.status, StatusCode::OK);

    let response = gw
        .get(&format!("/fileState?ih={}&path=s01/e02.mkv", fixture.info_hash))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let state: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(
        state,
        json!([
            {"bytes": 12, "complete": true},
            {"bytes": 16, "complete": true},
            {"bytes": 2, "complete": true},
        ])
    );

    let missing = gw
        .get(&format!("/fileState?ih={}&path=nope", fixture.info_hash))
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_file_state_gzip_when_accepted() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let request = Request::get(format!(
        "/fileState?ih={}&path=s01/e01.mkv",
        fixture.info_hash
    ))
    .header(header::ACCEPT_ENCODING, "gzip")
    .body(Body::empty())
    .unwrap();
    let response = gw.send(request).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("content-encoding"), Some("gzip"));
}
