//! Piece length selection and piece hashing for newly created torrents

use sha1::{Digest, Sha1};

/// Smallest piece length a created torrent uses (16 KiB).
pub const MIN_PIECE_LENGTH: u64 = 16 * 1024;

/// Upper bound on the chosen piece length (16 MiB).
pub const MAX_PIECE_LENGTH: u64 = 16 * 1024 * 1024;

/// Piece count above which the piece length keeps doubling.
const TARGET_PIECE_COUNT: u64 = 2048;

/// Picks a piece length for `total_length` bytes of content.
///
/// Starts at [`MIN_PIECE_LENGTH`] and doubles while the content would need
/// at least 2048 pieces, capped at [`MAX_PIECE_LENGTH`]. Always a power of two.
pub fn choose_piece_length(total_length: u64) -> u64 {
    let mut piece_length = MIN_PIECE_LENGTH;
    while piece_length < MAX_PIECE_LENGTH
        && total_length.div_ceil(piece_length) >= TARGET_PIECE_COUNT
    {
        piece_length *= 2;
    }
    piece_length
}

/// SHA-1 of one piece.
pub fn hash_piece(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_small_content_uses_minimum() {
        assert_eq!(choose_piece_length(0), MIN_PIECE_LENGTH);
        assert_eq!(choose_piece_length(1), MIN_PIECE_LENGTH);
        assert_eq!(choose_piece_length(MIN_PIECE_LENGTH * 2047), MIN_PIECE_LENGTH);
    }

    #[test]
    fn test_doubles_at_threshold() {
        assert_eq!(choose_piece_length(MIN_PIECE_LENGTH * 2048), MIN_PIECE_LENGTH * 2);
        assert_eq!(choose_piece_length(u64::MAX / 2), MAX_PIECE_LENGTH);
    }

    #[test]
    fn test_hash_piece_matches_known_digest() {
        assert_eq!(
            hex::encode(hash_piece(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    proptest! {
        #[test]
        fn chosen_length_is_power_of_two_in_bounds(total in 0u64..(1u64 << 42)) {
            let piece_length = choose_piece_length(total);
            prop_assert!(piece_length.is_power_of_two());
            prop_assert!((MIN_PIECE_LENGTH..=MAX_PIECE_LENGTH).contains(&piece_length));
            if piece_length < MAX_PIECE_LENGTH {
                prop_assert!(total.div_ceil(piece_length) < 2048);
            }
        }
    }
}
