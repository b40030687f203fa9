//! HTTP request handlers organized by endpoint

pub mod data;
pub mod events;
pub mod file_state;
pub mod metainfo;
pub mod misc;
pub mod range;
pub mod request;
pub mod upload;

pub use data::{data, data_by_info_hash, data_by_path, info};
pub use events::events;
pub use file_state::file_state;
pub use metainfo::{get_metainfo, post_metainfo};
pub use misc::{bep44, health, status};
pub use range::parse_range_header;
pub use request::{RequestScope, TorrentRequest};
pub use upload::upload;
