//! `/metainfo` reads, posted merges and magnet-addressed sessions

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tidegate_core::torrent::MetaInfo;

use crate::common::{TestGateway, show_fixture};

#[tokio::test]
async fn test_get_bencoded_metainfo() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let response = gw.get(&format!("/metainfo?ih={}", fixture.info_hash)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.header("content-type"),
        Some(tidegate_web::handlers::metainfo::BITTORRENT_MIME)
    );
    let metainfo = MetaInfo::from_bytes(&response.body).unwrap();
    assert_eq!(metainfo.info_hash(), fixture.info_hash);
    assert_eq!(metainfo.info_bytes, fixture.info_bytes);
    assert_eq!(metainfo.announce.as_deref(), Some("http://tracker.test/announce"));
}

#[tokio::test]
async fn test_get_json_metainfo() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let request = Request::get(format!("/metainfo?ih={}", fixture.info_hash))
        .header(header::ACCEPT, "application/json")
        .body(Body::empty())
        .unwrap();
    let response = gw.send(request).await;
    assert_eq!(response.status, StatusCode::OK);

    let value: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert!(value["info"].is_string());
    assert_eq!(value["announce"], "http://tracker.test/announce");
    assert_eq!(
        value["announceList"],
        serde_json::json!([["http://tracker.test/announce"]])
    );
    assert!(value.get("comment").is_none());
    assert!(value.get("urlList").is_none());
}

#[tokio::test]
async fn test_post_merges_and_caches() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    let posted = MetaInfo {
        info_bytes: fixture.info_bytes.clone(),
        announce: Some("http://posted.test/announce".to_string()),
        ..MetaInfo::default()
    };

    let request = Request::post("/metainfo")
        .body(Body::from(posted.to_bytes()))
        .unwrap();
    let response = gw.send(request).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text(), format!("{}\n", fixture.info_hash));

    let cached = gw
        .gateway
        .cache()
        .get_metainfo(fixture.info_hash)
        .await
        .unwrap()
        .expect("merged metainfo cached");
    assert_eq!(cached.info_bytes, fixture.info_bytes);
    assert!(
        cached
            .announce_list
            .iter()
            .flatten()
            .any(|tracker| tracker == "http://posted.test/announce")
    );

    // The session now knows its info, so waiting is not needed.
    let info = gw
        .get(&format!("/info?ih={}&nowait=1", fixture.info_hash))
        .await;
    assert_eq!(info.status, StatusCode::OK);
    assert_eq!(info.body, fixture.info_bytes);
}

#[tokio::test]
async fn test_post_rejects_undecodable_body() {
    let gw = TestGateway::new();

    let garbage = gw
        .send(Request::post("/metainfo").body(Body::from("not bencode")).unwrap())
        .await;
    assert_eq!(garbage.status, StatusCode::BAD_REQUEST);
    assert!(garbage.text().starts_with("error decoding body"));

    let no_info = MetaInfo {
        announce: Some("http://t/announce".to_string()),
        ..MetaInfo::default()
    };
    let response = gw
        .send(
            Request::post("/metainfo")
                .body(Body::from(no_info.to_bytes()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_magnet_trackers_merged_into_session() {
    let gw = TestGateway::new();
    let fixture = show_fixture();
    gw.add_fixture(&fixture).await;

    let magnet = format!(
        "magnet%3A%3Fxt%3Durn%3Abtih%3A{}%26tr%3Dhttp%3A%2F%2Fmagnet.test%2Fannounce",
        fixture.info_hash
    );
    let request = Request::get(format!("/metainfo?magnet={magnet}"))
        .header(header::ACCEPT, "application/json")
        .body(Body::empty())
        .unwrap();
    let response = gw.send(request).await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    assert!(response.text().contains("http://magnet.test/announce"));
    assert!(response.text().contains("http://tracker.test/announce"));
}
