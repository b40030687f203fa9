//! Gateway-wide endpoints: status, health and item lookup

use axum::extract::{RawQuery, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tidegate_core::lookup::Target;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// `GET /status`
pub async fn status(State(state): State<AppState>) -> ApiResult<String> {
    state
        .gateway
        .status()
        .map_err(|e| ApiError::Internal(format!("rendering status failed: {e}")))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> ApiResult<&'static str> {
    status(State(state)).await.map(|_| "ok\n")
}

/// Query of `/bep44`. Parsed by hand because the salt is arbitrary bytes
/// and need not be UTF-8 once percent-decoded.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LookupQuery {
    pub target: Option<String>,
    pub salt: Vec<u8>,
}

impl LookupQuery {
    pub fn parse(raw: &str) -> Self {
        let mut query = Self::default();
        for pair in raw.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = value.replace('+', " ");
            let decoded = urlencoding::decode_binary(value.as_bytes());
            match key {
                "target" => query.target = Some(String::from_utf8_lossy(&decoded).into_owned()),
                "salt" => query.salt = decoded.into_owned(),
                _ => {}
            }
        }
        query
    }
}

/// `GET /bep44?target=<hex>[&salt=..]`
pub async fn bep44(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> ApiResult<Response> {
    let query = LookupQuery::parse(raw.as_deref().unwrap_or_default());
    let target = query
        .target
        .ok_or_else(|| ApiError::BadRequest("missing target query parameter".to_string()))?;
    let target = Target::from_hex(&target)?;
    let value = state.gateway.lookup(target, &query.salt).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], value).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_query_decodes_binary_salt() {
        let query = LookupQuery::parse("salt=%ff%00a+b&target=0f0f&other=1");
        assert_eq!(query.target.as_deref(), Some("0f0f"));
        assert_eq!(query.salt, b"\xff\x00a b");
    }

    #[test]
    fn test_lookup_query_defaults() {
        assert_eq!(LookupQuery::parse(""), LookupQuery::default());
        assert_eq!(LookupQuery::parse("target").target.as_deref(), Some(""));
    }
}
