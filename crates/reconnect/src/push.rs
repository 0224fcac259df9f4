//! Teacher-driven reconnect, kept for peers that predate the pull protocol.
//!
//! The teacher walks its tree breadth first. Each internal node is sent with
//! its children's hashes, the learner answers whether it already has each
//! child, and children the learner confirmed are sent as up to date without
//! descending further.

mod learner;
mod queue;
mod status;
mod teacher;

pub use learner::LearnerPushView;
pub use queue::LevelQueues;
pub use status::{NodeStatus, NodeStatusTracker};
pub use teacher::TeacherPushView;
