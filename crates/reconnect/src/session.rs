//! Entry points that pick the protocol configured for a session.
//!
//! Both sides count into the [`ReconnectMapStats`] they are handed. Pass a
//! fresh set per session; register it first to export the counters.

use std::sync::Arc;

use calimero_reconnect_primitives::{
    FrameReceiver, FrameSender, ReconnectConfig, ReconnectMode, TeacherRecords,
};
use eyre::Result as EyreResult;
use tokio_util::sync::CancellationToken;

use crate::pull::{LearnerParts, LearnerPullView, TeacherPullView};
use crate::push::{LearnerPushView, TeacherPushView};
use crate::stats::{ReconnectMapStats, ReconnectStats};

/// Serve one reconnect as the teacher.
pub async fn run_teacher(
    config: &ReconnectConfig,
    records: Arc<dyn TeacherRecords>,
    sender: Arc<dyn FrameSender>,
    receiver: Box<dyn FrameReceiver>,
    stats: ReconnectMapStats,
    cancel: &CancellationToken,
) -> EyreResult<ReconnectStats> {
    config.validate()?;

    match config.mode {
        ReconnectMode::Pull => {
            Arc::new(TeacherPullView::new(records).with_stats(stats))
                .run(config, sender, receiver, cancel)
                .await
        }
        ReconnectMode::Push => {
            Arc::new(TeacherPushView::new(config.clone(), records).with_stats(stats))
                .run(sender, receiver, cancel)
                .await
        }
    }
}

/// Reconnect a stale tree as the learner.
///
/// On failure the partially built state behind `parts` must be discarded.
pub async fn run_learner(
    config: &ReconnectConfig,
    parts: LearnerParts,
    sender: Arc<dyn FrameSender>,
    receiver: Box<dyn FrameReceiver>,
    stats: ReconnectMapStats,
    cancel: &CancellationToken,
) -> EyreResult<ReconnectStats> {
    config.validate()?;

    match config.mode {
        ReconnectMode::Pull => {
            Arc::new(LearnerPullView::new(config.clone(), parts).with_stats(stats))
                .run(sender, receiver, cancel)
                .await
        }
        ReconnectMode::Push => {
            Arc::new(LearnerPushView::new(config.clone(), parts).with_stats(stats))
                .run(sender, receiver, cancel)
                .await
        }
    }
}
