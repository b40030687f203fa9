//! Content endpoints: `/data` and `/info`

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tidegate_core::InfoHash;
use tidegate_core::streaming::{self, InfoWait};

use crate::error::{ApiError, ApiResult};
use crate::handlers::range::range_response;
use crate::handlers::request::{TorrentRequest, parse_flag};
use crate::server::AppState;

/// Query parameters shared by the content endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct DataQuery {
    /// Display path of one file; the whole content when absent
    pub path: Option<String>,
    /// Name offered to the client in `Content-Disposition`
    pub filename: Option<String>,
    /// Answer 202 instead of waiting for the info
    pub nowait: Option<String>,
}

impl DataQuery {
    pub fn info_wait(&self) -> InfoWait {
        if parse_flag(self.nowait.as_deref()).unwrap_or(false) {
            InfoWait::NoWait
        } else {
            InfoWait::Block
        }
    }
}

/// `GET /data?ih=<hex>[&path=..][&filename=..][&nowait=..]`
pub async fn data(
    request: TorrentRequest,
    Query(query): Query<DataQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let path = query.path.clone();
    serve_content(request, path.as_deref(), &query, &headers).await
}

/// `GET /data/infohash/<hex>/<path...>`
pub async fn data_by_path(
    State(state): State<AppState>,
    Path((info_hash, path)): Path<(String, String)>,
    Query(query): Query<DataQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let request = TorrentRequest::acquire(&state, InfoHash::from_hex(&info_hash)?).await;
    serve_content(request, Some(&path), &query, &headers).await
}

/// `GET /data/infohash/<hex>`, the whole content.
pub async fn data_by_info_hash(
    State(state): State<AppState>,
    Path(info_hash): Path<String>,
    Query(query): Query<DataQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let request = TorrentRequest::acquire(&state, InfoHash::from_hex(&info_hash)?).await;
    serve_content(request, None, &query, &headers).await
}

async fn serve_content(
    request: TorrentRequest,
    path: Option<&str>,
    query: &DataQuery,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let path = path.filter(|p| !p.is_empty());
    let TorrentRequest { torrent, scope } = request;
    let source = streaming::open_content(
        torrent.as_ref(),
        path,
        query.info_wait(),
        scope.cancel_token(),
    )
    .await?;
    tracing::debug!(
        "Serving {} of {} ({} bytes)",
        path.unwrap_or("everything"),
        scope.info_hash(),
        source.range.length
    );
    let disposition = query.filename.as_deref().or(path);
    range_response(source, headers, disposition, scope).await
}

/// `GET /info?ih=<hex>[&nowait=..]`: the raw bencoded info dictionary.
pub async fn info(request: TorrentRequest, Query(query): Query<DataQuery>) -> ApiResult<Response> {
    match query.info_wait() {
        InfoWait::Block => {
            streaming::wait_for_info(request.torrent.as_ref(), request.cancel_token()).await?;
        }
        InfoWait::NoWait => {
            streaming::ready_info(request.torrent.as_ref())?;
        }
    }
    let info_bytes = request.torrent.metainfo().info_bytes;
    if info_bytes.is_empty() {
        return Err(ApiError::NotReady);
    }
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], info_bytes).into_response())
}
