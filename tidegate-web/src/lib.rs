//! Tidegate Web - HTTP surface of the torrent gateway

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
//!
//! Streams torrent content with range support, exposes metainfo and piece
//! state, accepts uploads, and forwards item lookups to peer gateways.

pub mod error;
pub mod handlers;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{AppState, ServerError, router, run_server};
