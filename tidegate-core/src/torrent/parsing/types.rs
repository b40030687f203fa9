//! Metainfo, info dictionary and merge spec types

use serde::Serialize;

use crate::torrent::{InfoHash, PieceIndex};

/// Individual file within a torrent's info dictionary.
///
/// `offset` is the byte position of the file inside the torrent's
/// concatenated content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
    pub offset: u64,
}

impl TorrentFile {
    /// Slash-joined path used to address the file over HTTP.
    ///
    /// Single-file torrents have one component: the torrent name.
    pub fn display_path(&self) -> String {
        self.path.join("/")
    }

    /// Exclusive end offset within the torrent content.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Decoded info dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    /// Set for the single-file form. Multi-file torrents list their files instead.
    pub length: Option<u64>,
    pub files: Vec<TorrentFile>,
}

impl Info {
    /// Builds a single-file info dictionary.
    pub fn single_file(name: String, piece_length: u64, pieces: Vec<[u8; 20]>, length: u64) -> Self {
        let files = vec![TorrentFile {
            path: vec![name.clone()],
            length,
            offset: 0,
        }];
        Self {
            name,
            piece_length,
            pieces,
            length: Some(length),
            files,
        }
    }

    /// Builds a multi-file info dictionary, computing file offsets in order.
    pub fn multi_file(
        name: String,
        piece_length: u64,
        pieces: Vec<[u8; 20]>,
        files: Vec<(Vec<String>, u64)>,
    ) -> Self {
        let mut offset = 0;
        let files = files
            .into_iter()
            .map(|(path, length)| {
                let file = TorrentFile {
                    path,
                    length,
                    offset,
                };
                offset += length;
                file
            })
            .collect();
        Self {
            name,
            piece_length,
            pieces,
            length: None,
            files,
        }
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Byte length of a piece. The last piece may be shorter.
    pub fn piece_size(&self, index: PieceIndex) -> u64 {
        let start = u64::from(index.as_u32()) * self.piece_length;
        self.total_length()
            .saturating_sub(start)
            .min(self.piece_length)
    }

    /// Piece containing the given content offset.
    pub fn piece_at(&self, offset: u64) -> PieceIndex {
        PieceIndex::new((offset / self.piece_length) as u32)
    }

    /// Looks a file up by its display path.
    pub fn file(&self, display_path: &str) -> Option<&TorrentFile> {
        self.files.iter().find(|f| f.display_path() == display_path)
    }

    /// Per-piece state for every piece overlapping `file`, in order.
    ///
    /// `bytes` counts only the part of each piece that belongs to the file.
    pub fn file_piece_states(
        &self,
        file: &TorrentFile,
        is_complete: impl Fn(PieceIndex) -> bool,
    ) -> Vec<FilePieceState> {
        if file.length == 0 || self.piece_length == 0 {
            return Vec::new();
        }
        let first = file.offset / self.piece_length;
        let last = (file.end() - 1) / self.piece_length;
        (first..=last)
            .map(|index| {
                let piece_start = index * self.piece_length;
                let piece_end = piece_start + self.piece_length;
                let bytes = piece_end.min(file.end()) - piece_start.max(file.offset);
                FilePieceState {
                    bytes,
                    complete: is_complete(PieceIndex::new(index as u32)),
                }
            })
            .collect()
    }
}

/// Completion of one piece as seen from a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilePieceState {
    pub bytes: u64,
    pub complete: bool,
}

/// Full metainfo descriptor.
///
/// `info_bytes` holds the info dictionary exactly as received so the info
/// hash survives a decode and re-encode. Empty when the info is unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaInfo {
    pub info_bytes: Vec<u8>,
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub nodes: Vec<String>,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
    pub url_list: Vec<String>,
}

impl MetaInfo {
    pub fn has_info(&self) -> bool {
        !self.info_bytes.is_empty()
    }

    /// Info hash of the embedded info dictionary.
    pub fn info_hash(&self) -> InfoHash {
        InfoHash::from_info_bytes(&self.info_bytes)
    }

    /// Tracker tiers, falling back to the single `announce` URL.
    pub fn upvert_announce_list(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            return self.announce_list.clone();
        }
        match &self.announce {
            Some(announce) if !announce.is_empty() => vec![vec![announce.clone()]],
            _ => Vec::new(),
        }
    }
}

/// Parsed magnet URI.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

/// Additive description merged into a live torrent.
///
/// Trackers are appended tier by tier. Info bytes are applied only when the
/// torrent has no info yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorrentSpec {
    pub trackers: Vec<Vec<String>>,
    pub info_bytes: Option<Vec<u8>>,
    pub nodes: Vec<String>,
    pub display_name: Option<String>,
    pub web_seeds: Vec<String>,
}

impl TorrentSpec {
    pub fn from_metainfo(metainfo: &MetaInfo) -> Self {
        Self {
            trackers: metainfo.upvert_announce_list(),
            info_bytes: metainfo.has_info().then(|| metainfo.info_bytes.clone()),
            nodes: metainfo.nodes.clone(),
            display_name: None,
            web_seeds: metainfo.url_list.clone(),
        }
    }

    pub fn from_magnet(magnet: &MagnetLink) -> Self {
        Self {
            trackers: magnet.trackers.iter().map(|t| vec![t.clone()]).collect(),
            display_name: magnet.display_name.clone(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.iter().all(Vec::is_empty)
            && self.info_bytes.is_none()
            && self.nodes.is_empty()
            && self.display_name.is_none()
            && self.web_seeds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_file_info() -> Info {
        Info::multi_file(
            "album".to_string(),
            16,
            vec![[0u8; 20]; 3],
            vec![
                (vec!["a.txt".to_string()], 10),
                (vec!["disc".to_string(), "b.txt".to_string()], 20),
                (vec!["empty".to_string()], 0),
            ],
        )
    }

    #[test]
    fn test_multi_file_offsets() {
        let info = three_file_info();
        assert_eq!(info.total_length(), 30);
        assert_eq!(info.files[1].offset, 10);
        assert_eq!(info.files[1].display_path(), "disc/b.txt");
        assert_eq!(info.files[2].offset, 30);
        assert!(info.file("disc/b.txt").is_some());
        assert!(info.file("album/disc/b.txt").is_none());
    }

    #[test]
    fn test_last_piece_is_short() {
        let info = three_file_info();
        assert_eq!(info.piece_size(PieceIndex::new(0)), 16);
        assert_eq!(info.piece_size(PieceIndex::new(1)), 14);
        assert_eq!(info.piece_at(29), PieceIndex::new(1));
    }

    #[test]
    fn test_file_piece_states_split_bytes_across_pieces() {
        let info = three_file_info();
        let file = info.file("disc/b.txt").unwrap().clone();
        let states = info.file_piece_states(&file, |index| index.as_u32() == 0);
        assert_eq!(
            states,
            vec![
                FilePieceState {
                    bytes: 6,
                    complete: true
                },
                FilePieceState {
                    bytes: 14,
                    complete: false
                },
            ]
        );
        let empty = info.file("empty").unwrap().clone();
        assert!(info.file_piece_states(&empty, |_| true).is_empty());
    }

    #[test]
    fn test_single_file_display_path_is_name() {
        let info = Info::single_file("movie.mkv".to_string(), 32, vec![[1u8; 20]], 20);
        assert_eq!(info.files.len(), 1);
        assert_eq!(info.files[0].display_path(), "movie.mkv");
        assert_eq!(info.length, Some(20));
    }

    #[test]
    fn test_announce_list_upvert() {
        let mut metainfo = MetaInfo {
            announce: Some("http://a/announce".to_string()),
            ..MetaInfo::default()
        };
        assert_eq!(
            metainfo.upvert_announce_list(),
            vec![vec!["http://a/announce".to_string()]]
        );
        metainfo.announce_list = vec![vec!["http://b".to_string()], vec!["http://c".to_string()]];
        assert_eq!(metainfo.upvert_announce_list().len(), 2);
    }

    #[test]
    fn test_spec_from_metainfo_without_info() {
        let metainfo = MetaInfo {
            announce: Some("udp://t:1".to_string()),
            url_list: vec!["http://seed/".to_string()],
            ..MetaInfo::default()
        };
        let spec = TorrentSpec::from_metainfo(&metainfo);
        assert!(spec.info_bytes.is_none());
        assert_eq!(spec.trackers, vec![vec!["udp://t:1".to_string()]]);
        assert_eq!(spec.web_seeds.len(), 1);
        assert!(!spec.is_empty());
        assert!(TorrentSpec::default().is_empty());
    }
}
