//! Deterministic torrents for tests.

use crate::storage::{PieceStorage, StorageKey};
use crate::torrent::{Info, InfoHash, MetaInfo, PieceIndex, hash_piece};

/// A torrent with generated content and matching piece hashes.
#[derive(Debug, Clone)]
pub struct TorrentFixture {
    pub info: Info,
    pub info_bytes: Vec<u8>,
    pub info_hash: InfoHash,
    pub content: Vec<u8>,
}

impl TorrentFixture {
    pub fn single_file(name: &str, piece_length: u64, length: usize) -> Self {
        let content = generate_content(name, length);
        let info = Info::single_file(
            name.to_string(),
            piece_length,
            piece_hashes(&content, piece_length),
            length as u64,
        );
        Self::from_info(info, content)
    }

    /// Files are given as `(slash/separated/path, length)`.
    pub fn multi_file(name: &str, piece_length: u64, files: &[(&str, usize)]) -> Self {
        let total: usize = files.iter().map(|(_, length)| length).sum();
        let content = generate_content(name, total);
        let files = files
            .iter()
            .map(|(path, length)| {
                (
                    path.split('/').map(str::to_string).collect(),
                    *length as u64,
                )
            })
            .collect();
        let info = Info::multi_file(
            name.to_string(),
            piece_length,
            piece_hashes(&content, piece_length),
            files,
        );
        Self::from_info(info, content)
    }

    fn from_info(info: Info, content: Vec<u8>) -> Self {
        let info_bytes = info.to_bytes();
        Self {
            info_hash: InfoHash::from_info_bytes(&info_bytes),
            info,
            info_bytes,
            content,
        }
    }

    pub fn piece(&self, index: u32) -> &[u8] {
        let start = index as usize * self.info.piece_length as usize;
        let end = (start + self.info.piece_length as usize).min(self.content.len());
        &self.content[start..end]
    }

    pub fn metainfo(&self) -> MetaInfo {
        MetaInfo {
            info_bytes: self.info_bytes.clone(),
            announce: Some("http://tracker.test/announce".to_string()),
            ..MetaInfo::default()
        }
    }

    /// Writes and completes every piece under the fixture's info hash.
    pub async fn store_all(&self, storage: &dyn PieceStorage) {
        let pieces = storage.open(StorageKey::Torrent(self.info_hash));
        for index in 0..self.info.piece_count() {
            pieces
                .write_piece(PieceIndex::new(index), self.piece(index))
                .await
                .expect("fixture piece write");
            pieces
                .mark_complete(PieceIndex::new(index))
                .await
                .expect("fixture piece complete");
        }
    }
}

fn generate_content(seed: &str, length: usize) -> Vec<u8> {
    let salt = seed.bytes().fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    (0..length)
        .map(|i| ((i as u32).wrapping_mul(131).wrapping_add(salt) % 251) as u8)
        .collect()
}

fn piece_hashes(content: &[u8], piece_length: u64) -> Vec<[u8; 20]> {
    content
        .chunks(piece_length as usize)
        .map(hash_piece)
        .collect()
}
