//! `/bep44` locally and across peer gateways

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use tidegate_core::lookup::{HttpLookupBackend, ItemLookup, LookupError, Target};

use crate::common::TestGateway;

/// Backend holding a single item.
struct StaticLookup {
    target: Target,
    salt: Vec<u8>,
    value: Vec<u8>,
}

#[async_trait]
impl ItemLookup for StaticLookup {
    fn name(&self) -> String {
        "static".to_string()
    }

    async fn get(&self, target: Target, salt: &[u8]) -> Result<Vec<u8>, LookupError> {
        if target == self.target && salt == self.salt {
            Ok(self.value.clone())
        } else {
            Err(LookupError::NotFound)
        }
    }
}

fn item() -> StaticLookup {
    StaticLookup {
        target: Target::new([0xab; 20]),
        salt: b"s1".to_vec(),
        value: b"d1:vi42ee".to_vec(),
    }
}

#[tokio::test]
async fn test_local_lookup() {
    let gw = TestGateway::with_lookups(vec![Arc::new(item())]);
    let target = Target::new([0xab; 20]).to_hex();

    let found = gw.get(&format!("/bep44?target={target}&salt=s1")).await;
    assert_eq!(found.status, StatusCode::OK);
    assert_eq!(&found.body[..], b"d1:vi42ee");

    let wrong_salt = gw.get(&format!("/bep44?target={target}&salt=s2")).await;
    assert_eq!(wrong_salt.status, StatusCode::NOT_FOUND);
    assert_eq!(wrong_salt.text(), "not found\n");

    let bad_target = gw.get("/bep44?target=abc").await;
    assert_eq!(bad_target.status, StatusCode::BAD_REQUEST);

    let no_target = gw.get("/bep44").await;
    assert_eq!(no_target.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_lookup_with_non_utf8_salt() {
    let gw = TestGateway::with_lookups(vec![Arc::new(StaticLookup {
        salt: vec![0xff, 0xfe, 0x00],
        ..item()
    })]);
    let target = Target::new([0xab; 20]).to_hex();

    let found = gw.get(&format!("/bep44?target={target}&salt=%FF%FE%00")).await;
    assert_eq!(found.status, StatusCode::OK);
    assert_eq!(&found.body[..], b"d1:vi42ee");
}

#[tokio::test]
async fn test_no_backends_is_not_found() {
    let gw = TestGateway::new();
    let response = gw
        .get(&format!("/bep44?target={}", Target::new([1; 20]).to_hex()))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_lookup_forwarded_to_peer_gateway() {
    let peer = TestGateway::with_lookups(vec![Arc::new(item())]);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer_app = peer.app.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, peer_app).await.unwrap();
    });

    let backend =
        HttpLookupBackend::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
    let gw = TestGateway::with_lookups(vec![Arc::new(backend)]);
    let target = Target::new([0xab; 20]).to_hex();

    let found = gw.get(&format!("/bep44?target={target}&salt=s1")).await;
    assert_eq!(found.status, StatusCode::OK, "{}", found.text());
    assert_eq!(&found.body[..], b"d1:vi42ee");

    let missing = gw.get(&format!("/bep44?target={target}&salt=nope")).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    server.abort();
}
