//! Learner-driven reconnect.
//!
//! The learner walks the teacher's tree with a [`NodeTraversalOrder`] and
//! sends its own hash for each path it visits. The teacher answers clean or
//! dirty, attaching the record of every dirty leaf, and the learner prunes
//! what came back clean.
//!
//! [`NodeTraversalOrder`]: calimero_reconnect_primitives::NodeTraversalOrder

mod learner;
mod teacher;

pub use learner::{LearnerParts, LearnerPullView};
pub use teacher::TeacherPullView;
