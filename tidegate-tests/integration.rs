//! Integration tests for Tidegate
//!
//! These drive the real router with the local engine and in-memory stores,
//! checking the HTTP surface end to end.

#[path = "integration/common.rs"]
mod common;

#[path = "integration/data_streaming.rs"]
mod data_streaming;
#[path = "integration/lookup_federation.rs"]
mod lookup_federation;
#[path = "integration/metainfo_exchange.rs"]
mod metainfo_exchange;
#[path = "integration/session_lifecycle.rs"]
mod session_lifecycle;
#[path = "integration/upload_flow.rs"]
mod upload_flow;
