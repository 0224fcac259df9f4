use calimero_reconnect_primitives::path::parent;
use calimero_reconnect_primitives::{Path, ROOT_PATH};
use dashmap::DashMap;

/// What the teacher knows about the learner's copy of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    /// The learner has this node, and therefore its whole subtree.
    Known,
    /// The learner reported a different node here.
    NotKnown,
    /// No report yet.
    Unknown,
}

/// Per-node learner reports, shared by the push teacher's send and receive
/// tasks.
///
/// Nodes without a report of their own inherit `Known` from the nearest
/// reported ancestor; the inference is cached. A `NotKnown` ancestor says
/// nothing about its descendants. The root is implicitly `NotKnown`.
#[derive(Debug, Default)]
pub struct NodeStatusTracker {
    statuses: DashMap<Path, NodeStatus>,
}

impl NodeStatusTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the learner's answer for `path`.
    pub fn record(&self, path: Path, learner_has_node: bool) {
        let status = if learner_has_node {
            NodeStatus::Known
        } else {
            NodeStatus::NotKnown
        };
        let _ = self.statuses.insert(path, status);
    }

    #[must_use]
    pub fn status(&self, path: Path) -> NodeStatus {
        if path == ROOT_PATH {
            return NodeStatus::NotKnown;
        }
        if let Some(status) = self.explicit(path) {
            return status;
        }

        let mut ancestor = parent(path);
        while ancestor > ROOT_PATH {
            match self.explicit(ancestor) {
                Some(NodeStatus::Known) => {
                    let _ = self.statuses.insert(path, NodeStatus::Known);
                    return NodeStatus::Known;
                }
                Some(_) => return NodeStatus::Unknown,
                None => ancestor = parent(ancestor),
            }
        }

        NodeStatus::Unknown
    }

    #[must_use]
    pub fn has_learner_confirmed_for(&self, path: Path) -> bool {
        self.status(path) == NodeStatus::Known
    }

    /// Has the learner answered for `path`, directly or through an ancestor?
    #[must_use]
    pub fn is_reported(&self, path: Path) -> bool {
        self.status(path) != NodeStatus::Unknown
    }

    fn explicit(&self, path: Path) -> Option<NodeStatus> {
        // Copied out so no shard guard outlives the lookup.
        self.statuses.get(&path).map(|status| *status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_never_known() {
        let tracker = NodeStatusTracker::new();
        tracker.record(ROOT_PATH, true);
        assert_eq!(tracker.status(ROOT_PATH), NodeStatus::NotKnown, "implicit");
    }

    #[test]
    fn explicit_reports_win() {
        let tracker = NodeStatusTracker::new();
        assert_eq!(tracker.status(3), NodeStatus::Unknown, "no report yet");
        tracker.record(3, false);
        assert_eq!(tracker.status(3), NodeStatus::NotKnown, "reported missing");
        tracker.record(4, true);
        assert!(tracker.has_learner_confirmed_for(4), "reported present");
    }

    #[test]
    fn known_is_inherited_and_cached() {
        let tracker = NodeStatusTracker::new();
        tracker.record(1, true);

        assert!(tracker.has_learner_confirmed_for(3), "child of a known node");
        assert!(tracker.has_learner_confirmed_for(16), "great-grandchild");
        assert_eq!(
            tracker.explicit(16),
            Some(NodeStatus::Known),
            "inference was cached"
        );
        assert!(!tracker.has_learner_confirmed_for(5), "sits under node 2");
    }

    #[test]
    fn not_known_is_not_inherited() {
        let tracker = NodeStatusTracker::new();
        tracker.record(2, false);
        assert_eq!(tracker.status(5), NodeStatus::Unknown, "child needs its own report");
        assert!(!tracker.is_reported(5), "still waiting");

        tracker.record(5, true);
        assert!(tracker.is_reported(5), "answered");
    }
}
