//! Hashes of a small subtree, fetched with a single storage access.
//!
//! A chunk rooted at `path` with height `h` holds the hashes of every
//! descendant of `path` down to `h` ranks below it (the chunk root itself is
//! not included). Chunk roots sit at ranks that are multiples of `h`, so every
//! non-root node belongs to exactly one chunk.

use crate::hash::Hash;
use crate::path::{grand_parent, left_grand_child, rank, Path, TreeBoundaries, ROOT_PATH};

/// Default number of ranks covered by one chunk.
pub const DEFAULT_HASH_CHUNK_HEIGHT: u32 = 5;

/// Upper bound on chunk height; a chunk holds `2^(h+1) - 2` entries.
pub const MAX_HASH_CHUNK_HEIGHT: u32 = 16;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HashChunk {
    path: Path,
    height: u32,
    hashes: Vec<Option<Hash>>,
}

impl HashChunk {
    /// Chunk root of the chunk that stores the hash of `path`.
    #[must_use]
    pub const fn path_to_chunk_path(path: Path, height: u32) -> Path {
        if path <= ROOT_PATH {
            return ROOT_PATH;
        }
        let height = if height == 0 { 1 } else { height };
        let rank_dif = rank(path) % height;
        grand_parent(path, if rank_dif == 0 { height } else { rank_dif })
    }

    /// Number of hash slots in a chunk of the given height.
    #[must_use]
    pub const fn capacity(height: u32) -> usize {
        (1 << (height + 1)) - 2
    }

    /// Gather a chunk by loading every hash it covers. Paths past the last
    /// leaf are left empty.
    pub fn collect<E>(
        path: Path,
        height: u32,
        boundaries: &TreeBoundaries,
        mut load_hash: impl FnMut(Path) -> Result<Option<Hash>, E>,
    ) -> Result<Self, E> {
        let height = height.clamp(1, MAX_HASH_CHUNK_HEIGHT);
        let mut hashes = Vec::with_capacity(Self::capacity(height));

        for depth in 1..=height {
            let first = left_grand_child(path, depth);
            for offset in 0..(1_i64 << depth) {
                let descendant = first + offset;
                let hash = if descendant <= boundaries.last_leaf_path {
                    load_hash(descendant)?
                } else {
                    None
                };
                hashes.push(hash);
            }
        }

        Ok(Self {
            path,
            height,
            hashes,
        })
    }

    #[must_use]
    pub const fn path(&self) -> Path {
        self.path
    }

    /// Hash of `path`, if this chunk covers it and the path is a node.
    #[must_use]
    pub fn hash_at(&self, path: Path) -> Option<Hash> {
        self.slot(path)
            .and_then(|index| self.hashes.get(index).copied().flatten())
    }

    fn slot(&self, path: Path) -> Option<usize> {
        if path <= self.path {
            return None;
        }
        let depth = rank(path).checked_sub(rank(self.path))?;
        if depth == 0 || depth > self.height || grand_parent(path, depth) != self.path {
            return None;
        }
        let offset = usize::try_from(path - left_grand_child(self.path, depth)).ok()?;
        Some(((1_usize << depth) - 2) + offset)
    }
}
