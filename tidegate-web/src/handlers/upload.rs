//! `/upload`: create a torrent from a multipart form

use axum::extract::multipart::{Field, Multipart, MultipartError};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tidegate_core::upload::{UploadFile, UploadJob};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::{ApiError, ApiResult};
use crate::handlers::metainfo::BITTORRENT_MIME;
use crate::handlers::request::parse_flag;
use crate::server::AppState;

fn bad_form(error: MultipartError) -> ApiError {
    ApiError::BadRequest(format!("error reading form: {}", error.body_text()))
}

/// `POST /upload`
///
/// Form fields: `name` (required), one or more `files` parts whose file
/// names carry their relative paths, and `strip-top-directory`. Responds
/// with the new torrent's metainfo.
pub async fn upload(State(state): State<AppState>, mut form: Multipart) -> ApiResult<Response> {
    let mut name = None;
    let mut files = Vec::new();
    let mut strip_top_directory = false;

    while let Some(field) = form.next_field().await.map_err(bad_form)? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("name") => name = Some(field.text().await.map_err(bad_form)?),
            Some("files") => files.push(spool_file(field).await?),
            Some("strip-top-directory") => {
                let value = field.text().await.map_err(bad_form)?;
                strip_top_directory = parse_flag(Some(value.trim())).unwrap_or(true);
            }
            other => tracing::debug!("Ignoring upload form field {:?}", other),
        }
    }

    let name = name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing name field".to_string()))?;
    let mut job = UploadJob::new(name, files);
    job.strip_top_directory = strip_top_directory;

    let metainfo = state.gateway.upload(job).await?;
    tracing::info!("Uploaded {}", metainfo.info_hash());
    Ok(([(header::CONTENT_TYPE, BITTORRENT_MIME)], metainfo.to_bytes()).into_response())
}

/// Copies one file part to an anonymous temporary file.
async fn spool_file(mut field: Field<'_>) -> ApiResult<UploadFile> {
    let path: Vec<String> = field
        .file_name()
        .unwrap_or_default()
        .split('/')
        .filter(|component| !component.is_empty())
        .map(str::to_string)
        .collect();
    if path.is_empty() {
        return Err(ApiError::BadRequest("file part has no file name".to_string()));
    }

    let spool = tempfile::tempfile().map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut spool = tokio::fs::File::from_std(spool);
    let mut length = 0u64;
    while let Some(chunk) = field.chunk().await.map_err(bad_form)? {
        spool
            .write_all(&chunk)
            .await
            .map_err(|e| ApiError::Internal(format!("spooling {} failed: {e}", path.join("/"))))?;
        length += chunk.len() as u64;
    }
    spool.flush().await.map_err(|e| ApiError::Internal(e.to_string()))?;
    spool.rewind().await.map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(UploadFile::new(path, length, spool))
}
