//! Per-request torrent scope.
//!
//! Every torrent endpoint resolves its torrent once, through
//! [`TorrentRequest`], and passes it down explicitly. The request holds a
//! session lease and a cancellation token; dropping it releases the lease
//! and cancels anything still waiting on behalf of the request.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;
use tidegate_core::torrent::MagnetLink;
use tidegate_core::{InfoHash, SessionLease, Torrent};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::ApiError;
use crate::server::AppState;

/// Query parameters naming a torrent.
#[derive(Debug, Default, Deserialize)]
pub struct TorrentQuery {
    /// Hex info hash
    pub ih: Option<String>,
    /// Magnet URI, used when `ih` is absent
    pub magnet: Option<String>,
}

/// Keeps a session alive for as long as a response needs it.
pub struct RequestScope {
    lease: SessionLease,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl RequestScope {
    fn new(lease: SessionLease, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        Self {
            lease,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.lease.info_hash()
    }

    /// Fires when the scope is dropped or the server shuts down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("info_hash", &self.info_hash())
            .finish_non_exhaustive()
    }
}

/// The torrent a request operates on.
pub struct TorrentRequest {
    pub torrent: Arc<dyn Torrent>,
    pub scope: RequestScope,
}

impl TorrentRequest {
    /// Acquires the session for `info_hash`.
    pub async fn acquire(state: &AppState, info_hash: InfoHash) -> Self {
        let acquired = state.gateway.acquire(info_hash).await;
        Self {
            torrent: acquired.torrent,
            scope: RequestScope::new(acquired.lease, &state.shutdown),
        }
    }

    /// Acquires the session named by a magnet URI and merges its trackers.
    ///
    /// # Errors
    /// - `ApiError::BadRequest` - Malformed magnet URI
    pub async fn from_magnet(state: &AppState, magnet: &str) -> Result<Self, ApiError> {
        let magnet = MagnetLink::parse(magnet)?;
        let acquired = state.gateway.acquire_magnet(&magnet).await?;
        Ok(Self {
            torrent: acquired.torrent,
            scope: RequestScope::new(acquired.lease, &state.shutdown),
        })
    }

    /// Resolves `ih`, or failing that `magnet`.
    ///
    /// # Errors
    /// - `ApiError::BadRequest` - Neither given, or the given one is malformed
    pub async fn from_query(state: &AppState, query: &TorrentQuery) -> Result<Self, ApiError> {
        match (&query.ih, &query.magnet) {
            (Some(ih), _) => Ok(Self::acquire(state, InfoHash::from_hex(ih)?).await),
            (None, Some(magnet)) => Self::from_magnet(state, magnet).await,
            (None, None) => Err(ApiError::BadRequest(
                "missing ih or magnet query parameter".to_string(),
            )),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.scope.info_hash()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.scope.cancel_token()
    }
}

impl FromRequestParts<AppState> for TorrentRequest {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<TorrentQuery>::try_from_uri(&parts.uri)
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        Self::from_query(state, &query).await
    }
}

/// Parses a boolean query flag: `1`, `t`, `true` and their negatives,
/// case-insensitive.
pub fn parse_flag(value: Option<&str>) -> Option<bool> {
    match value?.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag(Some("TRUE")), Some(true));
        assert_eq!(parse_flag(Some("0")), Some(false));
        assert_eq!(parse_flag(Some("yes")), None);
        assert_eq!(parse_flag(None), None);
    }
}
