//! `/metainfo`: read or extend a session's metainfo

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Json, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use tidegate_core::streaming::{self, InfoWait};
use tidegate_core::torrent::MetaInfo;

use crate::error::{ApiError, ApiResult};
use crate::handlers::data::DataQuery;
use crate::handlers::request::TorrentRequest;
use crate::server::AppState;

/// Media type of bencoded metainfo.
pub const BITTORRENT_MIME: &str = "application/x-bittorrent";

/// JSON rendering of a metainfo. Empty fields are left out.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetaInfoJson {
    /// Base64 of the bencoded info dictionary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announce: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub announce_list: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub url_list: Vec<String>,
}

impl From<&MetaInfo> for MetaInfoJson {
    fn from(metainfo: &MetaInfo) -> Self {
        Self {
            info: metainfo
                .has_info()
                .then(|| BASE64.encode(&metainfo.info_bytes)),
            announce: metainfo.announce.clone(),
            announce_list: metainfo.announce_list.clone(),
            nodes: metainfo.nodes.clone(),
            creation_date: metainfo.creation_date,
            comment: metainfo.comment.clone(),
            created_by: metainfo.created_by.clone(),
            encoding: metainfo.encoding.clone(),
            url_list: metainfo.url_list.clone(),
        }
    }
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}

/// `GET /metainfo?ih=<hex>[&nowait=..]`
pub async fn get_metainfo(
    request: TorrentRequest,
    Query(query): Query<DataQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    match query.info_wait() {
        InfoWait::Block => {
            streaming::wait_for_info(request.torrent.as_ref(), request.cancel_token()).await?;
        }
        InfoWait::NoWait => {
            streaming::ready_info(request.torrent.as_ref())?;
        }
    }
    let metainfo = request.torrent.metainfo();
    if wants_json(&headers) {
        return Ok(Json(MetaInfoJson::from(&metainfo)).into_response());
    }
    Ok(([(header::CONTENT_TYPE, BITTORRENT_MIME)], metainfo.to_bytes()).into_response())
}

/// `POST /metainfo` with a bencoded metainfo body.
///
/// Merges the posted trackers and info into the session named by the
/// metainfo's own info hash and answers with that hash.
pub async fn post_metainfo(State(state): State<AppState>, body: Bytes) -> ApiResult<String> {
    let metainfo = MetaInfo::from_bytes(&body)
        .map_err(|e| ApiError::BadRequest(format!("error decoding body: {e}")))?;
    if !metainfo.has_info() {
        return Err(ApiError::BadRequest(
            "error decoding body: metainfo has no info".to_string(),
        ));
    }
    let request = TorrentRequest::acquire(&state, metainfo.info_hash()).await;
    state
        .gateway
        .put_metainfo(request.torrent.as_ref(), &metainfo)
        .await?;
    tracing::info!("Merged posted metainfo into {}", request.info_hash());
    Ok(format!("{}\n", request.info_hash()))
}
