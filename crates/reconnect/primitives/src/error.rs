//! Error taxonomy shared by both reconnect roles.

use std::time::Duration;

use thiserror::Error as ThisError;

use crate::path::Path;

/// Failures that end a reconnect session.
///
/// Transient backpressure never surfaces here; callers sleep and retry
/// instead.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum ReconnectError {
    #[error("path {path} is outside the tree (last leaf path {last_leaf_path})")]
    PathOutOfBounds { path: Path, last_leaf_path: Path },

    #[error("path {path} is not a {expected} node (leaves {first_leaf_path}..={last_leaf_path})")]
    WrongNodeKind {
        path: Path,
        expected: &'static str,
        first_leaf_path: Path,
        last_leaf_path: Path,
    },

    #[error("invalid tree boundaries ({first_leaf_path}, {last_leaf_path})")]
    InvalidBoundaries {
        first_leaf_path: Path,
        last_leaf_path: Path,
    },

    #[error("first response must be for the root, got path {path}")]
    RootNotFirst { path: Path },

    #[error("root response received more than once")]
    DuplicateRoot,

    #[error("no hash available for path {path}")]
    UnresolvablePath { path: Path },

    #[error("no leaf record available for dirty leaf path {path}")]
    MissingLeaf { path: Path },

    #[error("learner has no original hash for path {path}")]
    MissingOriginalHash { path: Path },

    #[error("timed out after {0:?} waiting for the root response")]
    RootResponseTimeout(Duration),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("response for path {path} was not expected")]
    UnexpectedResponse { path: Path },

    #[error("hashing pipeline rejected the leaf at path {path}")]
    Hashing { path: Path },

    #[error("stream closed before the reconnect completed")]
    TransportClosed,

    #[error("reconnect was cancelled")]
    Cancelled,
}
