//! HTTP range responses over torrent content
//!
//! Parses single `bytes=` ranges (RFC 7233) and streams the selected
//! window of a [`ContentSource`] with matching `Content-Range` and
//! `Content-Length` headers.

use std::io::SeekFrom;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use tidegate_core::streaming::{ContentSource, is_cancelled_error};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::ApiError;
use crate::handlers::request::RequestScope;

/// Outcome of parsing a `Range` header against a known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// Serve everything with 200
    Full,
    /// Serve `start..=end` with 206
    Partial { start: u64, end: u64 },
    /// 416
    Unsatisfiable,
}

/// Parses a `Range` header value.
///
/// Only single ranges are honored. Malformed headers and multi-range
/// requests fall back to the full content, as RFC 7233 permits.
///
/// # Examples
/// ```
/// use tidegate_web::handlers::range::{RangeRequest, parse_range_header};
///
/// assert_eq!(
///     parse_range_header(Some("bytes=100-199"), 1000),
///     RangeRequest::Partial { start: 100, end: 199 }
/// );
/// ```
pub fn parse_range_header(range: Option<&str>, total_size: u64) -> RangeRequest {
    let Some(range_spec) = range.and_then(|r| r.trim().strip_prefix("bytes=")) else {
        return RangeRequest::Full;
    };
    if range_spec.contains(',') {
        return RangeRequest::Full;
    }
    let Some((start_str, end_str)) = range_spec.split_once('-') else {
        return RangeRequest::Full;
    };
    let (start_str, end_str) = (start_str.trim(), end_str.trim());
    let last = total_size.checked_sub(1);

    if start_str.is_empty() {
        // Suffix range: the final `n` bytes
        let Ok(suffix) = end_str.parse::<u64>() else {
            return RangeRequest::Full;
        };
        return match last {
            Some(last) if suffix > 0 => RangeRequest::Partial {
                start: total_size.saturating_sub(suffix),
                end: last,
            },
            _ => RangeRequest::Unsatisfiable,
        };
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = if end_str.is_empty() {
        None
    } else {
        match end_str.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return RangeRequest::Full,
        }
    };
    match last {
        Some(last) if start <= last => RangeRequest::Partial {
            start,
            end: end.map_or(last, |end| end.min(last)),
        },
        _ => RangeRequest::Unsatisfiable,
    }
}

/// Quotes `name` for a `Content-Disposition` header.
pub fn content_disposition(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
    format!("filename=\"{escaped}\"")
}

/// Streams `source` honoring the request's `Range` header.
///
/// `scope` is moved into the body so the session stays leased until the
/// last byte is written or the client disconnects.
///
/// # Errors
/// - `ApiError::ClientCancelled` - Request cancelled while seeking
/// - `ApiError::Internal` - Seeking the content reader failed
pub async fn range_response(
    source: ContentSource,
    headers: &HeaderMap,
    disposition: Option<&str>,
    scope: RequestScope,
) -> Result<Response, ApiError> {
    let ContentSource { range, mut reader } = source;
    let total_size = range.length;
    let content_type = mime_guess::from_path(&range.name).first_or_octet_stream();
    let requested = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, content_type.as_ref())
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(name) = disposition {
        if let Ok(value) = HeaderValue::from_str(&content_disposition(name)) {
            response = response.header(header::CONTENT_DISPOSITION, value);
        }
    }

    let (start, length) = match parse_range_header(requested, total_size) {
        RangeRequest::Full => {
            response = response.status(StatusCode::OK);
            (0, total_size)
        }
        RangeRequest::Partial { start, end } => {
            response = response.status(StatusCode::PARTIAL_CONTENT).header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{total_size}"),
            );
            (start, end - start + 1)
        }
        RangeRequest::Unsatisfiable => {
            return response
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{total_size}"))
                .body(Body::empty())
                .map_err(|e| ApiError::Internal(e.to_string()));
        }
    };

    if start > 0 {
        reader.seek(SeekFrom::Start(start)).await.map_err(|e| {
            if is_cancelled_error(&e) {
                ApiError::ClientCancelled
            } else {
                ApiError::Internal(format!("seeking {} failed: {e}", scope.info_hash()))
            }
        })?;
    }

    let stream = ScopedStream {
        inner: ReaderStream::new(reader.take(length)),
        scope,
    };
    response
        .header(header::CONTENT_LENGTH, length)
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Body stream that keeps its request scope alive and logs how it ended.
struct ScopedStream<S> {
    inner: S,
    scope: RequestScope,
}

impl<S> Stream for ScopedStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(Err(e))) = &item {
            if is_cancelled_error(e) {
                tracing::debug!("Stream of {} cancelled", self.scope.info_hash());
            } else {
                tracing::warn!("Stream of {} failed: {}", self.scope.info_hash(), e);
            }
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header_valid() {
        assert_eq!(
            parse_range_header(Some("bytes=100-199"), 1000),
            RangeRequest::Partial { start: 100, end: 199 }
        );
    }

    #[test]
    fn test_parse_range_header_open_end() {
        assert_eq!(
            parse_range_header(Some("bytes=500-"), 1000),
            RangeRequest::Partial { start: 500, end: 999 }
        );
    }

    #[test]
    fn test_parse_range_header_suffix() {
        assert_eq!(
            parse_range_header(Some("bytes=-100"), 1000),
            RangeRequest::Partial { start: 900, end: 999 }
        );
        assert_eq!(
            parse_range_header(Some("bytes=-5000"), 1000),
            RangeRequest::Partial { start: 0, end: 999 }
        );
        assert_eq!(parse_range_header(Some("bytes=-0"), 1000), RangeRequest::Unsatisfiable);
    }

    #[test]
    fn test_parse_range_header_clamps_end() {
        assert_eq!(
            parse_range_header(Some("bytes=100-9999"), 500),
            RangeRequest::Partial { start: 100, end: 499 }
        );
    }

    #[test]
    fn test_parse_range_header_unsatisfiable() {
        assert_eq!(parse_range_header(Some("bytes=500-599"), 400), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range_header(Some("bytes=0-"), 0), RangeRequest::Unsatisfiable);
    }

    #[test]
    fn test_parse_range_header_falls_back_to_full() {
        assert_eq!(parse_range_header(None, 1000), RangeRequest::Full);
        assert_eq!(parse_range_header(Some("invalid"), 1000), RangeRequest::Full);
        assert_eq!(parse_range_header(Some("bytes=5-1"), 1000), RangeRequest::Full);
        assert_eq!(parse_range_header(Some("bytes=0-1,5-9"), 1000), RangeRequest::Full);
    }

    #[test]
    fn test_content_disposition_escapes_quotes() {
        assert_eq!(content_disposition("a.mkv"), "filename=\"a.mkv\"");
        assert_eq!(content_disposition("say \"hi\".txt"), "filename=\"say \\\"hi\\\".txt\"");
    }
}
