//! Push protocol messages.
//!
//! The teacher sends one [`Lesson`] per node in breadth-first order. An
//! internal lesson doubles as a query: it carries the hashes of the node's
//! children, and the learner answers each one, in order, with a
//! [`QueryResponse`].

use borsh::{BorshDeserialize, BorshSerialize};
use bytes::Bytes;

use crate::error::ReconnectError;
use crate::hash::Hash;
use crate::leaf::LeafRecord;
use crate::path::{Path, TreeBoundaries, ROOT_PATH};

/// Maximum child hashes in one internal lesson (binary tree).
pub const MAX_CHILD_HASHES: usize = 2;

#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum Lesson {
    /// The learner already has this node and everything below it.
    UpToDate { path: Path },
    /// Leaf content the learner is missing.
    Leaf { leaf: LeafRecord },
    /// Internal node; the learner must answer one query per child hash.
    Internal {
        path: Path,
        /// Present iff `path` is the root.
        boundaries: Option<TreeBoundaries>,
        child_hashes: Vec<Hash>,
    },
}

impl Lesson {
    #[must_use]
    pub const fn path(&self) -> Path {
        match self {
            Self::UpToDate { path } | Self::Internal { path, .. } => *path,
            Self::Leaf { leaf } => leaf.path,
        }
    }

    /// Check the structural limits a peer must respect.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self {
            Self::UpToDate { .. } => true,
            Self::Leaf { leaf } => leaf.is_valid(),
            Self::Internal {
                path,
                boundaries,
                child_hashes,
            } => child_hashes.len() <= MAX_CHILD_HASHES && (*path == ROOT_PATH) == boundaries.is_some(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ReconnectError> {
        borsh::to_vec(self)
            .map(Bytes::from)
            .map_err(|_| ReconnectError::Malformed("lesson failed to serialize"))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ReconnectError> {
        let lesson: Self = borsh::from_slice(frame)
            .map_err(|_| ReconnectError::Malformed("lesson failed to deserialize"))?;
        if !lesson.is_valid() {
            return Err(ReconnectError::Malformed("lesson exceeds structural limits"));
        }
        Ok(lesson)
    }
}

/// Learner's answer to one child query.
#[derive(Clone, Copy, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct QueryResponse {
    pub learner_has_node: bool,
}

impl QueryResponse {
    #[must_use]
    pub const fn new(learner_has_node: bool) -> Self {
        Self { learner_has_node }
    }

    pub fn encode(&self) -> Result<Bytes, ReconnectError> {
        borsh::to_vec(self)
            .map(Bytes::from)
            .map_err(|_| ReconnectError::Malformed("query response failed to serialize"))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ReconnectError> {
        borsh::from_slice(frame)
            .map_err(|_| ReconnectError::Malformed("query response failed to deserialize"))
    }
}

#[cfg(test)]
mod tests {
    use claims::{assert_matches, assert_ok};

    use super::*;

    #[test]
    fn internal_lesson_limits() {
        let root = Lesson::Internal {
            path: ROOT_PATH,
            boundaries: Some(TreeBoundaries::for_leaf_count(2)),
            child_hashes: vec![Hash::EMPTY; 2],
        };
        assert!(root.is_valid(), "root with boundaries");

        let root_without_boundaries = Lesson::Internal {
            path: ROOT_PATH,
            boundaries: None,
            child_hashes: vec![],
        };
        assert!(!root_without_boundaries.is_valid(), "root must carry boundaries");

        let too_many_children = Lesson::Internal {
            path: 3,
            boundaries: None,
            child_hashes: vec![Hash::EMPTY; 3],
        };
        let frame = assert_ok!(too_many_children.encode());
        assert_matches!(Lesson::decode(&frame), Err(ReconnectError::Malformed(_)));
    }

    #[test]
    fn leaf_lesson_keeps_tombstones() {
        let lesson = Lesson::Leaf {
            leaf: LeafRecord::new(4, b"k".to_vec(), None),
        };
        let frame = assert_ok!(lesson.encode());
        assert_eq!(assert_ok!(Lesson::decode(&frame)), lesson, "decodes back");
        assert_eq!(lesson.path(), 4, "leaf path");
    }
}
