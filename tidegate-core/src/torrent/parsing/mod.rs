//! Metainfo and magnet link parsing.
//!
//! Decoding uses bencode-rs for field extraction plus a byte-span scanner that
//! keeps the info dictionary exactly as received. Encoding is hand written
//! with sorted keys.

pub mod bencode;
pub mod encoding;
pub mod magnet;
pub mod types;

pub use bencode::BencodeParser;
pub use encoding::BencodeWriter;
pub use magnet::MagnetParser;
pub use types::{FilePieceState, Info, MagnetLink, MetaInfo, TorrentFile, TorrentSpec};

use crate::torrent::TorrentError;

impl MetaInfo {
    /// Decodes a bencoded metainfo file.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode
    pub fn from_bytes(data: &[u8]) -> Result<Self, TorrentError> {
        BencodeParser::parse_metainfo(data)
    }

    /// Decodes the embedded info dictionary.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - No info present or it is malformed
    pub fn parse_info(&self) -> Result<Info, TorrentError> {
        if !self.has_info() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Missing 'info' field".to_string(),
            });
        }
        BencodeParser::parse_info(&self.info_bytes)
    }
}

impl Info {
    /// Decodes a bencoded info dictionary.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed info dictionary
    pub fn from_bytes(info_bytes: &[u8]) -> Result<Self, TorrentError> {
        BencodeParser::parse_info(info_bytes)
    }
}

impl MagnetLink {
    /// # Errors
    /// - `TorrentError::InvalidMagnetLink` - Malformed URI
    pub fn parse(magnet_url: &str) -> Result<Self, TorrentError> {
        MagnetParser::parse_magnet_link(magnet_url)
    }
}
