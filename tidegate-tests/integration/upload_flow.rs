//! `/upload` through to serving the new torrent

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tidegate_core::OperatorPolicy;
use tidegate_core::gateway::UPLOAD_CREATED_BY;
use tidegate_core::torrent::MetaInfo;

use crate::common::{TestGateway, TestResponse};

const BOUNDARY: &str = "tidegate-test-boundary";

struct Form {
    body: Vec<u8>,
}

impl Form {
    fn new() -> Self {
        Self { body: Vec::new() }
    }

    fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
        self
    }

    fn file(mut self, file_name: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    async fn post(mut self, gw: &TestGateway) -> TestResponse {
        self.body
            .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        let request = Request::post("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(self.body))
            .unwrap();
        gw.send(request).await
    }
}

fn content(seed: u8, length: usize) -> Vec<u8> {
    (0..length).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[tokio::test]
async fn test_upload_folder_then_stream_it() {
    let gw = TestGateway::new();
    let a = content(1, 70_000);
    let b = content(9, 1_000);

    let response = Form::new()
        .text("name", "album")
        .file("album/a.bin", &a)
        .file("album/b.bin", &b)
        .text("strip-top-directory", "true")
        .post(&gw)
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    assert_eq!(response.header("content-type"), Some("application/x-bittorrent"));

    let metainfo = MetaInfo::from_bytes(&response.body).unwrap();
    assert_eq!(metainfo.created_by.as_deref(), Some(UPLOAD_CREATED_BY));
    let info = metainfo.parse_info().unwrap();
    assert_eq!(info.name, "album");
    let paths: Vec<String> = info.files.iter().map(|f| f.display_path()).collect();
    assert_eq!(paths, vec!["a.bin", "b.bin"]);
    assert_eq!(gw.blobs.len(), 1);

    let info_hash = metainfo.info_hash();
    let served = gw
        .get(&format!("/data?ih={info_hash}&path=b.bin"))
        .await;
    assert_eq!(served.status, StatusCode::OK);
    assert_eq!(served.body, b);

    let whole = gw.get(&format!("/data?ih={info_hash}")).await;
    assert_eq!(whole.body.len(), a.len() + b.len());
    assert_eq!(whole.body[..a.len()], a[..]);
}

#[tokio::test]
async fn test_upload_keeps_cached_copy_neutral() {
    let policy = OperatorPolicy::new(vec!["udp://implicit.test:1".to_string()], false, true);
    let gw = TestGateway::with_policy(Arc::new(policy));

    let response = Form::new()
        .text("name", "single")
        .file("clip.bin", &content(3, 5_000))
        .post(&gw)
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text());

    let returned = MetaInfo::from_bytes(&response.body).unwrap();
    assert_eq!(returned.announce.as_deref(), Some("udp://implicit.test:1"));

    let cached = gw
        .gateway
        .cache()
        .get_metainfo(returned.info_hash())
        .await
        .unwrap()
        .expect("upload cached");
    assert!(cached.announce.is_none());
    assert!(cached.announce_list.is_empty());
}

#[tokio::test]
async fn test_upload_requires_name_and_files() {
    let gw = TestGateway::new();

    let unnamed = Form::new().file("clip.bin", b"abc").post(&gw).await;
    assert_eq!(unnamed.status, StatusCode::BAD_REQUEST);
    assert!(unnamed.text().contains("missing name"));

    let empty = Form::new().text("name", "nothing").post(&gw).await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);
    assert!(gw.blobs.is_empty());
}
