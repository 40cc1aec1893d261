//! Input normalization and hashing.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// NFKC-normalize and trim user input.
///
/// Folds full-width forms (`８５ｋｍ` -> `85km`) so keyword rules and cache
/// keys see one spelling.
pub fn normalize(text: &str) -> String {
    text.nfkc().collect::<String>().trim().to_string()
}

/// Hex SHA-256 of already-normalized text.
pub fn hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Length in characters, not bytes.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_folds_full_width() {
        assert_eq!(normalize("  ８５ｋｍ要求  "), "85km要求");
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let a = hash("邱德拔开放时间");
        assert_eq!(a, hash("邱德拔开放时间"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash("邱德拔开放时间?"));
    }

    #[test]
    fn test_char_len_counts_chars() {
        assert_eq!(char_len("体测"), 2);
    }
}
