//! Seams between reconnect and the virtual store.
//!
//! The teacher reads its snapshot through [`TeacherRecords`]. The learner
//! reads its stale copy through [`OriginalRecords`], feeds received leaves
//! into [`ReconnectHashing`] and reports key movements to a [`NodeRemover`].

use async_trait::async_trait;
use eyre::Result as EyreResult;

use crate::error::ReconnectError;
use crate::hash::Hash;
use crate::hash_chunk::{HashChunk, DEFAULT_HASH_CHUNK_HEIGHT};
use crate::leaf::LeafRecord;
use crate::path::{Path, TreeBoundaries};

/// Read access to the teacher's fully hashed snapshot.
pub trait TeacherRecords: Send + Sync {
    fn boundaries(&self) -> TreeBoundaries;

    fn load_hash(&self, path: Path) -> EyreResult<Option<Hash>>;

    fn load_leaf(&self, path: Path) -> EyreResult<Option<LeafRecord>>;

    fn is_leaf(&self, path: Path) -> bool {
        self.boundaries().is_leaf(path)
    }

    fn hash_chunk_height(&self) -> u32 {
        DEFAULT_HASH_CHUNK_HEIGHT
    }

    /// Stores that keep hashes chunked should override this with a single
    /// read.
    fn load_hash_chunk(&self, chunk_path: Path) -> EyreResult<HashChunk> {
        HashChunk::collect(
            chunk_path,
            self.hash_chunk_height(),
            &self.boundaries(),
            |path| self.load_hash(path),
        )
    }
}

/// Read access to the learner's tree as it was before reconnect started.
pub trait OriginalRecords: Send + Sync {
    fn boundaries(&self) -> TreeBoundaries;

    fn load_hash(&self, path: Path) -> EyreResult<Option<Hash>>;

    /// Hash the learner reports for `path`.
    ///
    /// Paths the original tree never reached report [`Hash::EMPTY`]; a gap
    /// inside the original tree is fatal.
    fn find_hash(&self, path: Path) -> EyreResult<Hash> {
        if path > self.boundaries().last_leaf_path {
            return Ok(Hash::EMPTY);
        }
        self.load_hash(path)?
            .ok_or_else(|| ReconnectError::MissingOriginalHash { path }.into())
    }
}

/// Learner-side pipeline that rehashes the tree from the leaves it receives.
#[async_trait]
pub trait ReconnectHashing: Send + Sync {
    /// Called once the teacher's leaf range is known.
    fn prepare_reconnect_hashing(&self, boundaries: TreeBoundaries) -> EyreResult<()>;

    /// Leaves arrive in ascending path order. May block when the pipeline is
    /// saturated.
    async fn forward_leaf(&self, leaf: LeafRecord) -> EyreResult<()>;

    async fn end_reconnect_hashing(&self) -> EyreResult<()>;
}

/// Tracks keys that moved or vanished so their stale records can be dropped.
pub trait NodeRemover: Send + Sync {
    fn set_path_information(&self, original: TreeBoundaries, reconnect: TreeBoundaries);

    fn new_leaf_node(&self, path: Path, key: &[u8]);

    /// Called exactly once, after the last response has been applied.
    fn all_nodes_received(&self) -> EyreResult<()>;
}
