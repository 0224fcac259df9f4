//! Teacher and learner sessions for virtual tree reconnect.
//!
//! A learner whose tree fell behind reconnects it to a teacher's snapshot by
//! fetching only what differs. [`run_teacher`] and [`run_learner`] drive one
//! session each over a pair of framed streams, using either the pull
//! protocol ([`pull`]) or the legacy push protocol ([`push`]).

pub mod memory;
pub mod pull;
pub mod push;
pub mod rate_limit;
pub mod session;
pub mod stats;
pub mod work_group;

pub use pull::LearnerParts;
pub use session::{run_learner, run_teacher};
pub use stats::{ReconnectMapStats, ReconnectStats};
