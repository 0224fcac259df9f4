use std::collections::VecDeque;
use std::sync::Arc;

use calimero_reconnect_primitives::config::ReconnectConfig;
use calimero_reconnect_primitives::path::{left_child, right_child};
use calimero_reconnect_primitives::{
    FrameReceiver, FrameSender, Hash, Lesson, Path, QueryResponse, ReconnectError,
    TreeBoundaries, ROOT_PATH,
};
use eyre::{Result as EyreResult, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::pull::LearnerParts;
use crate::stats::{ReconnectMapStats, ReconnectStats};
use crate::work_group::{cancelled, WorkGroup};

/// Receives the teacher's lessons and answers its child queries.
///
/// Lessons arrive in the order their nodes were queried, so a single task
/// applies them and leaves reach the hashing pipeline in path order. The
/// traversal strategy in [`LearnerParts`] is not consulted; the teacher
/// decides what to send.
#[derive(Debug)]
pub struct LearnerPushView {
    config: ReconnectConfig,
    parts: LearnerParts,
    original_boundaries: TreeBoundaries,
    stats: ReconnectMapStats,
}

impl LearnerPushView {
    #[must_use]
    pub fn new(config: ReconnectConfig, parts: LearnerParts) -> Self {
        let original_boundaries = parts.original.boundaries();
        Self {
            config,
            parts,
            original_boundaries,
            stats: ReconnectMapStats::default(),
        }
    }

    /// Count into `stats` instead of private counters, typically a set the
    /// caller registered for export.
    #[must_use]
    pub fn with_stats(mut self, stats: ReconnectMapStats) -> Self {
        self.stats = stats;
        self
    }

    pub async fn run(
        self: Arc<Self>,
        sender: Arc<dyn FrameSender>,
        receiver: Box<dyn FrameReceiver>,
        cancel: &CancellationToken,
    ) -> EyreResult<ReconnectStats> {
        info!(
            first_leaf_path = self.original_boundaries.first_leaf_path,
            last_leaf_path = self.original_boundaries.last_leaf_path,
            hashing_queue_capacity = self.config.hashing_queue_capacity,
            "Starting push reconnect as learner"
        );

        let mut group = WorkGroup::new("learner-push", cancel);
        group.spawn(
            "learner-push-receive",
            Arc::clone(&self).receive_task(Arc::clone(&sender), receiver, group.token()),
        );

        let outcome = group.join().await;
        sender.close();
        outcome.wrap_err("push reconnect failed on the learner")?;

        let stats = self.stats.snapshot();
        info!(%stats, "Finished push reconnect as learner");

        Ok(stats)
    }

    async fn receive_task(
        self: Arc<Self>,
        sender: Arc<dyn FrameSender>,
        mut receiver: Box<dyn FrameReceiver>,
        token: CancellationToken,
    ) -> EyreResult<()> {
        let mut expected: VecDeque<Path> = VecDeque::from([ROOT_PATH]);
        let mut reconnect_boundaries: Option<TreeBoundaries> = None;

        while let Some(&expected_path) = expected.front() {
            let frame = tokio::select! {
                () = token.cancelled() => return Err(cancelled("learner push receive")),
                frame = receiver.recv() => frame?,
            };
            let Some(frame) = frame else {
                return Err(ReconnectError::TransportClosed.into());
            };

            let lesson = Lesson::decode(&frame)?;
            let path = lesson.path();
            self.stats.increment_transfers_from_teacher();

            let Some(boundaries) = reconnect_boundaries else {
                if path != ROOT_PATH {
                    return Err(ReconnectError::RootNotFirst { path }.into());
                }
                let boundaries = self.apply_root(&lesson)?;
                reconnect_boundaries = Some(boundaries);
                let _ = expected.pop_front();
                self.answer_queries(&lesson, &mut expected, sender.as_ref())
                    .await?;
                continue;
            };

            if path != expected_path {
                return Err(ReconnectError::UnexpectedResponse { path }.into());
            }
            let _ = expected.pop_front();

            match lesson {
                Lesson::UpToDate { path } => {
                    boundaries.check_node(path)?;
                    trace!(path, "Up to date");
                    if boundaries.is_leaf(path) {
                        self.stats.increment_leaf_hashes(true);
                    } else {
                        self.stats.increment_internal_hashes(true);
                    }
                }
                Lesson::Leaf { leaf } => {
                    boundaries.check_leaf(path)?;
                    trace!(path, "Received leaf");
                    self.stats.increment_leaf_hashes(false);
                    self.stats.increment_leaf_data();
                    self.parts.remover.new_leaf_node(path, &leaf.key);

                    tokio::select! {
                        () = token.cancelled() => return Err(cancelled("learner hashing")),
                        forwarded = self.parts.hashing.forward_leaf(leaf) => {
                            forwarded.wrap_err(ReconnectError::Hashing { path })?;
                        }
                    }
                }
                internal @ Lesson::Internal { .. } => {
                    boundaries.check_internal(path)?;
                    self.stats.increment_internal_hashes(false);
                    self.answer_queries(&internal, &mut expected, sender.as_ref())
                        .await?;
                }
            }
        }

        debug!("Every lesson received, finishing reconnect hashing");
        self.parts.remover.all_nodes_received()?;
        self.parts.hashing.end_reconnect_hashing().await?;

        Ok(())
    }

    fn apply_root(&self, lesson: &Lesson) -> EyreResult<TreeBoundaries> {
        let Lesson::Internal {
            boundaries: Some(boundaries),
            ..
        } = lesson
        else {
            return Err(ReconnectError::Malformed("root lesson without boundaries").into());
        };
        let boundaries = *boundaries;

        info!(
            first_leaf_path = boundaries.first_leaf_path,
            last_leaf_path = boundaries.last_leaf_path,
            "Received teacher boundaries"
        );

        self.parts.hashing.prepare_reconnect_hashing(boundaries)?;
        self.parts
            .remover
            .set_path_information(self.original_boundaries, boundaries);

        Ok(boundaries)
    }

    /// Compare each queried child against the original tree and tell the
    /// teacher whether it can skip that subtree.
    async fn answer_queries(
        &self,
        lesson: &Lesson,
        expected: &mut VecDeque<Path>,
        sender: &dyn FrameSender,
    ) -> EyreResult<()> {
        let Lesson::Internal {
            path, child_hashes, ..
        } = lesson
        else {
            return Ok(());
        };

        let children = [left_child(*path), right_child(*path)];
        for (&child, teacher_hash) in children.iter().zip(child_hashes) {
            let learner_hash: Hash = self.parts.original.find_hash(child)?;
            let learner_has_node = learner_hash == *teacher_hash;
            trace!(path = child, learner_has_node, "Answering query");

            sender
                .send(QueryResponse::new(learner_has_node).encode()?)
                .await?;
            expected.push_back(child);
        }

        Ok(())
    }
}
