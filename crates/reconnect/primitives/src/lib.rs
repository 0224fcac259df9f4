//! Building blocks for reconnecting a stale virtual tree to an authoritative
//! snapshot.
//!
//! This crate holds everything both peers agree on: path addressing, node
//! hashes, wire frames for the pull and push protocols, traversal
//! strategies, and the traits through which a session reaches storage and
//! the network. The sessions themselves live in `calimero-reconnect`.

pub mod access;
pub mod config;
pub mod error;
pub mod hash;
pub mod hash_chunk;
pub mod leaf;
pub mod lesson;
pub mod message;
pub mod path;
pub mod transport;
pub mod traversal;

pub use access::{NodeRemover, OriginalRecords, ReconnectHashing, TeacherRecords};
pub use config::{ReconnectConfig, ReconnectMode};
pub use error::ReconnectError;
pub use hash::Hash;
pub use hash_chunk::HashChunk;
pub use leaf::LeafRecord;
pub use lesson::{Lesson, QueryResponse};
pub use message::{PullRequest, PullResponse};
pub use path::{Path, TreeBoundaries, INVALID_PATH, ROOT_PATH};
pub use transport::{FrameReceiver, FrameSender};
pub use traversal::{InOrderTraversal, NextPath, NodeTraversalOrder, TopToBottomTraversal};
