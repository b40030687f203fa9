//! Magnet link parsing utilities

use super::types::MagnetLink;
use crate::torrent::{InfoHash, TorrentError};

/// Magnet link parsing utilities.
pub struct MagnetParser;

impl MagnetParser {
    /// Parses magnet link to extract the info hash, display name and trackers.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMagnetLink` - Malformed URI or missing `btih` topic
    pub fn parse_magnet_link(magnet_url: &str) -> Result<MagnetLink, TorrentError> {
        let magnet =
            magnet_url::Magnet::new(magnet_url).map_err(|e| TorrentError::InvalidMagnetLink {
                reason: format!("{e}"),
            })?;

        let info_hash = Self::extract_info_hash(magnet_url)?;
        let display_name = magnet.display_name().map(|name| {
            urlencoding::decode(name)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| name.to_string())
        });

        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers: magnet.trackers().to_vec(),
        })
    }

    /// Finds the `xt=urn:btih:` parameter in the query string.
    fn extract_info_hash(magnet_url: &str) -> Result<InfoHash, TorrentError> {
        let query = magnet_url
            .split_once('?')
            .map(|(_, query)| query)
            .unwrap_or_default();

        query
            .split('&')
            .find_map(|param| param.strip_prefix("xt=urn:btih:"))
            .ok_or_else(|| TorrentError::InvalidMagnetLink {
                reason: "Missing or invalid info hash".to_string(),
            })
            .and_then(|hash| {
                InfoHash::from_hex(hash).map_err(|e| TorrentError::InvalidMagnetLink {
                    reason: e.to_string(),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnet_link_parsing() {
        let magnet = MagnetParser::parse_magnet_link(
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Test%20Torrent&tr=http://tracker.example.com/announce",
        )
        .unwrap();
        assert_eq!(
            magnet.info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(magnet.display_name.as_deref(), Some("Test Torrent"));
        assert_eq!(magnet.trackers, vec!["http://tracker.example.com/announce"]);
    }

    #[test]
    fn test_invalid_magnet_link() {
        assert!(MagnetParser::parse_magnet_link("invalid://not-a-magnet").is_err());
    }

    #[test]
    fn test_magnet_link_invalid_hash_length() {
        let result = MagnetParser::parse_magnet_link("magnet:?xt=urn:btih:tooshort&dn=Test");
        assert!(matches!(
            result,
            Err(TorrentError::InvalidMagnetLink { .. })
        ));
    }
}
