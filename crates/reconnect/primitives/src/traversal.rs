//! Learner-side strategies deciding which path to request next.
//!
//! Sender tasks first drain [`NodeTraversalOrder::next_internal_path_to_send`]
//! and then [`NodeTraversalOrder::next_leaf_path_to_send`]. Receivers feed every
//! applied response back through [`NodeTraversalOrder::node_received`], which
//! lets a strategy prune subtrees the teacher reported clean.
//!
//! Leaf paths must be handed out in ascending order: the collector applies
//! leaf responses in exactly the order they were requested.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::path::{parent, Path, TreeBoundaries, ROOT_PATH};

/// Outcome of asking a strategy for the next path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NextPath {
    /// Request this path.
    Send(Path),
    /// Nothing to send until more responses arrive; back off and ask again.
    NotYet,
    /// This phase has nothing left to send.
    Exhausted,
}

pub trait NodeTraversalOrder: Send + Sync {
    /// Called once, after the root response, with the teacher's leaf range.
    fn start(&self, boundaries: TreeBoundaries);

    fn next_internal_path_to_send(&self) -> NextPath;

    /// Only asked once the internal phase is exhausted.
    fn next_leaf_path_to_send(&self) -> NextPath;

    fn node_received(&self, path: Path, is_clean: bool);
}

/// Requests every node of the teacher's tree, in path order.
///
/// Never prunes, so nothing it hands out depends on earlier responses.
#[derive(Debug, Default)]
pub struct InOrderTraversal {
    state: Mutex<Option<Cursor>>,
}

#[derive(Debug)]
struct Cursor {
    boundaries: TreeBoundaries,
    next: Path,
}

impl InOrderTraversal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeTraversalOrder for InOrderTraversal {
    fn start(&self, boundaries: TreeBoundaries) {
        *self.state.lock() = Some(Cursor {
            boundaries,
            next: ROOT_PATH + 1,
        });
    }

    fn next_internal_path_to_send(&self) -> NextPath {
        let mut state = self.state.lock();
        let Some(cursor) = state.as_mut() else {
            return NextPath::NotYet;
        };
        if cursor.next >= cursor.boundaries.first_leaf_path {
            return NextPath::Exhausted;
        }
        let path = cursor.next;
        cursor.next += 1;
        NextPath::Send(path)
    }

    fn next_leaf_path_to_send(&self) -> NextPath {
        let mut state = self.state.lock();
        let Some(cursor) = state.as_mut() else {
            return NextPath::NotYet;
        };
        if cursor.boundaries.is_empty() || cursor.next > cursor.boundaries.last_leaf_path {
            return NextPath::Exhausted;
        }
        let path = cursor.next.max(cursor.boundaries.first_leaf_path);
        cursor.next = path + 1;
        NextPath::Send(path)
    }

    fn node_received(&self, _path: Path, _is_clean: bool) {}
}

/// Walks the tree rank by rank and skips every descendant of a node the
/// teacher reported clean.
///
/// A node is only requested once its parent's response has been applied and
/// found dirty, so this strategy regularly answers [`NextPath::NotYet`] while
/// a level is in flight.
#[derive(Debug, Default)]
pub struct TopToBottomTraversal {
    state: Mutex<Option<PruningState>>,
}

#[derive(Debug)]
struct PruningState {
    boundaries: TreeBoundaries,
    next: Path,
    /// Internal nodes whose response was applied and dirty.
    dirty: HashSet<Path>,
    /// Internal nodes known clean, reported or inherited from an ancestor.
    clean: HashSet<Path>,
}

enum Decision {
    Send,
    Skip,
    Wait,
}

impl PruningState {
    fn decide(&self, path: Path) -> Decision {
        let parent = parent(path);
        if parent == ROOT_PATH {
            return Decision::Send;
        }
        if self.clean.contains(&parent) {
            return Decision::Skip;
        }
        if self.dirty.contains(&parent) {
            return Decision::Send;
        }
        Decision::Wait
    }

    fn advance(&mut self, end: Path) -> NextPath {
        while self.next <= end {
            let path = self.next;
            match self.decide(path) {
                Decision::Wait => return NextPath::NotYet,
                Decision::Send => {
                    self.next += 1;
                    return NextPath::Send(path);
                }
                Decision::Skip => {
                    self.next += 1;
                    if self.boundaries.is_internal(path) {
                        let _ = self.clean.insert(path);
                    }
                }
            }
        }
        NextPath::Exhausted
    }
}

impl TopToBottomTraversal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeTraversalOrder for TopToBottomTraversal {
    fn start(&self, boundaries: TreeBoundaries) {
        *self.state.lock() = Some(PruningState {
            boundaries,
            next: ROOT_PATH + 1,
            dirty: HashSet::new(),
            clean: HashSet::new(),
        });
    }

    fn next_internal_path_to_send(&self) -> NextPath {
        let mut state = self.state.lock();
        let Some(state) = state.as_mut() else {
            return NextPath::NotYet;
        };
        let end = state.boundaries.first_leaf_path - 1;
        state.advance(end)
    }

    fn next_leaf_path_to_send(&self) -> NextPath {
        let mut state = self.state.lock();
        let Some(state) = state.as_mut() else {
            return NextPath::NotYet;
        };
        if state.boundaries.is_empty() {
            return NextPath::Exhausted;
        }
        state.next = state.next.max(state.boundaries.first_leaf_path);
        let end = state.boundaries.last_leaf_path;
        state.advance(end)
    }

    fn node_received(&self, path: Path, is_clean: bool) {
        let mut state = self.state.lock();
        let Some(state) = state.as_mut() else {
            return;
        };
        if !state.boundaries.is_internal(path) || path == ROOT_PATH {
            return;
        }
        let _ = if is_clean {
            state.clean.insert(path)
        } else {
            state.dirty.insert(path)
        };
    }
}
