use borsh::{BorshDeserialize, BorshSerialize};

use crate::path::Path;

/// Maximum key length accepted from a peer (64 KiB).
pub const MAX_LEAF_KEY_SIZE: usize = 64 * 1024;

/// Maximum value length accepted from a peer (1 MiB).
///
/// Prevents memory exhaustion from oversized leaf payloads.
pub const MAX_LEAF_VALUE_SIZE: usize = 1_048_576;

/// Key/value record stored at a leaf path.
///
/// A `None` value is a tombstone: the key exists but holds nothing.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct LeafRecord {
    pub path: Path,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl LeafRecord {
    #[must_use]
    pub const fn new(path: Path, key: Vec<u8>, value: Option<Vec<u8>>) -> Self {
        Self { path, key, value }
    }

    /// Same key and value, relocated to another path.
    #[must_use]
    pub fn at(mut self, path: Path) -> Self {
        self.path = path;
        self
    }

    /// Check that the record stays within the transfer limits.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.key.len() <= MAX_LEAF_KEY_SIZE
            && self
                .value
                .as_ref()
                .map_or(true, |value| value.len() <= MAX_LEAF_VALUE_SIZE)
    }
}
