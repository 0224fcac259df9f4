//! Path addressing for a complete binary virtual tree.
//!
//! Nodes are numbered breadth-first starting at [`ROOT_PATH`]. The children
//! of `p` are `2p + 1` and `2p + 2`, so every structural relation is a
//! couple of integer operations and never touches storage.
//!
//! A tree with `n > 1` leaves keeps them in `[n - 1, 2n - 2]`; a single leaf
//! lives at path 1 (the root keeps a left child only). The empty tree uses
//! [`INVALID_PATH`] for both boundaries.

use core::sync::atomic::{AtomicI64, Ordering};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::error::ReconnectError;

/// Breadth-first node address.
pub type Path = i64;

/// Path of the root node.
pub const ROOT_PATH: Path = 0;

/// Sentinel path. Boundaries of the empty tree, and the terminal request of
/// a pull session.
pub const INVALID_PATH: Path = -1;

#[must_use]
pub const fn is_root(path: Path) -> bool {
    path == ROOT_PATH
}

#[must_use]
pub const fn left_child(path: Path) -> Path {
    path * 2 + 1
}

#[must_use]
pub const fn right_child(path: Path) -> Path {
    path * 2 + 2
}

/// Parent of `path`, or [`INVALID_PATH`] for the root.
#[must_use]
pub const fn parent(path: Path) -> Path {
    if path <= ROOT_PATH {
        return INVALID_PATH;
    }
    (path - 1) >> 1
}

/// Depth of `path`; the root has rank 0.
#[must_use]
pub const fn rank(path: Path) -> u32 {
    debug_assert!(path >= ROOT_PATH, "rank of a negative path");
    63 - (path + 1).leading_zeros()
}

/// Ancestor `levels` ranks above `path`.
#[must_use]
pub const fn grand_parent(path: Path, levels: u32) -> Path {
    ((path + 1) >> levels) - 1
}

/// Leftmost descendant `levels` ranks below `path`.
#[must_use]
pub const fn left_grand_child(path: Path, levels: u32) -> Path {
    ((path + 1) << levels) - 1
}

/// Leaf range `(first_leaf_path, last_leaf_path)` of one side of a reconnect.
#[derive(Clone, Copy, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct TreeBoundaries {
    pub first_leaf_path: Path,
    pub last_leaf_path: Path,
}

impl TreeBoundaries {
    /// Boundaries of a tree without leaves.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            first_leaf_path: INVALID_PATH,
            last_leaf_path: INVALID_PATH,
        }
    }

    /// Boundaries of a complete tree holding `leaf_count` leaves.
    #[must_use]
    #[expect(clippy::cast_possible_wrap, reason = "leaf counts stay far below 2^62")]
    pub const fn for_leaf_count(leaf_count: u64) -> Self {
        match leaf_count {
            0 => Self::empty(),
            1 => Self {
                first_leaf_path: 1,
                last_leaf_path: 1,
            },
            n => Self {
                first_leaf_path: n as Path - 1,
                last_leaf_path: 2 * n as Path - 2,
            },
        }
    }

    /// Validates a boundary pair received from a peer.
    pub const fn new(first_leaf_path: Path, last_leaf_path: Path) -> Result<Self, ReconnectError> {
        let valid = (first_leaf_path == INVALID_PATH && last_leaf_path == INVALID_PATH)
            || (first_leaf_path == 1 && last_leaf_path == 1)
            || (first_leaf_path >= 1
                && first_leaf_path <= Path::MAX >> 2
                && last_leaf_path == 2 * first_leaf_path);

        if !valid {
            return Err(ReconnectError::InvalidBoundaries {
                first_leaf_path,
                last_leaf_path,
            });
        }

        Ok(Self {
            first_leaf_path,
            last_leaf_path,
        })
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.last_leaf_path <= ROOT_PATH
    }

    #[must_use]
    #[expect(clippy::cast_sign_loss, reason = "checked non-negative above")]
    pub const fn leaf_count(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (self.last_leaf_path - self.first_leaf_path + 1) as u64
    }

    /// Is `path` a leaf of this tree?
    #[must_use]
    pub const fn is_leaf(&self, path: Path) -> bool {
        path > ROOT_PATH && path >= self.first_leaf_path && path <= self.last_leaf_path
    }

    /// Is `path` an internal node of this tree? The root always is.
    #[must_use]
    pub const fn is_internal(&self, path: Path) -> bool {
        path == ROOT_PATH || (path > ROOT_PATH && path < self.first_leaf_path)
    }

    /// Fails unless `path` addresses a node of this tree. The root always
    /// passes, so that an empty tree can still be asked for its root.
    pub const fn check_node(&self, path: Path) -> Result<(), ReconnectError> {
        if path == ROOT_PATH || (path > ROOT_PATH && path <= self.last_leaf_path) {
            return Ok(());
        }
        Err(ReconnectError::PathOutOfBounds {
            path,
            last_leaf_path: self.last_leaf_path,
        })
    }

    pub const fn check_internal(&self, path: Path) -> Result<(), ReconnectError> {
        if self.is_internal(path) {
            return Ok(());
        }
        Err(self.wrong_kind(path, "internal"))
    }

    pub const fn check_leaf(&self, path: Path) -> Result<(), ReconnectError> {
        if self.is_leaf(path) {
            return Ok(());
        }
        Err(self.wrong_kind(path, "leaf"))
    }

    const fn wrong_kind(&self, path: Path, expected: &'static str) -> ReconnectError {
        if path < ROOT_PATH || path > self.last_leaf_path {
            return ReconnectError::PathOutOfBounds {
                path,
                last_leaf_path: self.last_leaf_path,
            };
        }
        ReconnectError::WrongNodeKind {
            path,
            expected,
            first_leaf_path: self.first_leaf_path,
            last_leaf_path: self.last_leaf_path,
        }
    }
}

impl Default for TreeBoundaries {
    fn default() -> Self {
        Self::empty()
    }
}

/// Boundary state shared between concurrent tasks of one side.
///
/// Written once, when the root response is applied, and read by every task
/// afterwards.
#[derive(Debug)]
pub struct AtomicBoundaries {
    first_leaf_path: AtomicI64,
    last_leaf_path: AtomicI64,
}

impl AtomicBoundaries {
    #[must_use]
    pub const fn new(boundaries: TreeBoundaries) -> Self {
        Self {
            first_leaf_path: AtomicI64::new(boundaries.first_leaf_path),
            last_leaf_path: AtomicI64::new(boundaries.last_leaf_path),
        }
    }

    pub fn set(&self, boundaries: TreeBoundaries) {
        self.first_leaf_path
            .store(boundaries.first_leaf_path, Ordering::Release);
        self.last_leaf_path
            .store(boundaries.last_leaf_path, Ordering::Release);
    }

    #[must_use]
    pub fn get(&self) -> TreeBoundaries {
        TreeBoundaries {
            first_leaf_path: self.first_leaf_path.load(Ordering::Acquire),
            last_leaf_path: self.last_leaf_path.load(Ordering::Acquire),
        }
    }
}

impl Default for AtomicBoundaries {
    fn default() -> Self {
        Self::new(TreeBoundaries::empty())
    }
}

#[cfg(test)]
mod tests {
    use claims::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn children_and_parent_are_inverse() {
        for path in 0..1_000 {
            assert_eq!(parent(left_child(path)), path, "left child of {path}");
            assert_eq!(parent(right_child(path)), path, "right child of {path}");
        }
        assert_eq!(parent(ROOT_PATH), INVALID_PATH, "root has no parent");
    }

    #[test]
    fn rank_follows_levels() {
        assert_eq!(rank(0), 0, "root");
        assert_eq!(rank(1), 1, "first child");
        assert_eq!(rank(2), 1, "second child");
        assert_eq!(rank(3), 2, "first grandchild");
        assert_eq!(rank(6), 2, "last grandchild");
        assert_eq!(rank(7), 3, "first of rank 3");
    }

    #[test]
    fn grand_relations() {
        assert_eq!(grand_parent(9, 2), 1, "9 -> 4 -> 1");
        assert_eq!(grand_parent(14, 3), 0, "14 -> 6 -> 2 -> 0");
        assert_eq!(left_grand_child(1, 2), 7, "1 -> 3 -> 7");
    }

    #[test]
    fn boundaries_for_leaf_counts() {
        assert_eq!(TreeBoundaries::for_leaf_count(0), TreeBoundaries::empty(), "empty");
        assert_eq!(
            TreeBoundaries::for_leaf_count(1),
            TreeBoundaries {
                first_leaf_path: 1,
                last_leaf_path: 1
            },
            "single leaf"
        );
        assert_eq!(
            TreeBoundaries::for_leaf_count(4),
            TreeBoundaries {
                first_leaf_path: 3,
                last_leaf_path: 6
            },
            "four leaves"
        );
        assert_eq!(TreeBoundaries::for_leaf_count(5).leaf_count(), 5, "five leaves");
    }

    #[test]
    fn received_boundaries_are_validated() {
        let _ = assert_ok!(TreeBoundaries::new(-1, -1));
        let _ = assert_ok!(TreeBoundaries::new(1, 1));
        let _ = assert_ok!(TreeBoundaries::new(3, 6));
        let _ = assert_err!(TreeBoundaries::new(1, 7));
        let _ = assert_err!(TreeBoundaries::new(0, 0));
        let _ = assert_err!(TreeBoundaries::new(4, 6));
    }

    #[test]
    fn node_kinds() {
        let b = TreeBoundaries::for_leaf_count(4);
        assert!(b.is_internal(0), "root");
        assert!(b.is_internal(2), "inner node");
        assert!(b.is_leaf(3), "first leaf");
        assert!(b.is_leaf(6), "last leaf");
        assert!(!b.is_leaf(7), "past the tree");

        let single = TreeBoundaries::for_leaf_count(1);
        assert!(single.is_leaf(1), "single leaf");
        assert!(!single.is_leaf(2), "root has no right child");

        let empty = TreeBoundaries::empty();
        assert!(!empty.is_leaf(0), "empty root is not a leaf");
        assert!(empty.is_internal(0), "empty root");
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let b = TreeBoundaries::for_leaf_count(4);
        assert_ok!(b.check_node(0));
        assert_ok!(b.check_node(6));
        assert!(
            matches!(
                b.check_node(7),
                Err(ReconnectError::PathOutOfBounds { path: 7, .. })
            ),
            "path 7 is past the last leaf"
        );
        assert!(
            matches!(
                b.check_node(INVALID_PATH),
                Err(ReconnectError::PathOutOfBounds { .. })
            ),
            "the sentinel is not a node"
        );
        assert!(
            matches!(
                b.check_leaf(2),
                Err(ReconnectError::WrongNodeKind { path: 2, .. })
            ),
            "2 is internal"
        );
        assert_ok!(TreeBoundaries::empty().check_node(ROOT_PATH));
    }

    #[test]
    fn atomic_boundaries_publish() {
        let shared = AtomicBoundaries::default();
        assert!(shared.get().is_empty(), "starts empty");
        shared.set(TreeBoundaries::for_leaf_count(8));
        assert_eq!(shared.get().first_leaf_path, 7, "published");
    }
}
