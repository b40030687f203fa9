//! `/fileState`: per-piece completion of one file

use axum::Json;
use axum::extract::Query;
use serde::Deserialize;
use tidegate_core::streaming;
use tidegate_core::torrent::FilePieceState;

use crate::error::{ApiError, ApiResult};
use crate::handlers::request::TorrentRequest;

#[derive(Debug, Deserialize)]
pub struct FileStateQuery {
    pub path: Option<String>,
}

/// `GET /fileState?ih=<hex>&path=<display path>`
///
/// One entry per piece overlapping the file, in piece order.
pub async fn file_state(
    request: TorrentRequest,
    Query(query): Query<FileStateQuery>,
) -> ApiResult<Json<Vec<FilePieceState>>> {
    let path = query
        .path
        .ok_or_else(|| ApiError::BadRequest("missing path query parameter".to_string()))?;
    let info = streaming::wait_for_info(request.torrent.as_ref(), request.cancel_token()).await?;
    let file = info
        .file(&path)
        .ok_or_else(|| ApiError::NotFound("file not found".to_string()))?;
    let torrent = &request.torrent;
    Ok(Json(info.file_piece_states(file, |index| {
        torrent.piece_complete(index)
    })))
}
