use core::fmt;
use core::sync::atomic::{AtomicI64, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;

use calimero_reconnect_primitives::config::ReconnectConfig;
use calimero_reconnect_primitives::hash_chunk::MAX_HASH_CHUNK_HEIGHT;
use calimero_reconnect_primitives::path::{left_child, right_child};
use calimero_reconnect_primitives::{
    FrameReceiver, FrameSender, Hash, HashChunk, Lesson, Path, QueryResponse, ReconnectError,
    TeacherRecords, TreeBoundaries, INVALID_PATH, ROOT_PATH,
};
use eyre::{Result as EyreResult, WrapErr};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::queue::LevelQueues;
use super::status::NodeStatusTracker;
use crate::stats::{ReconnectMapStats, ReconnectStats};
use crate::work_group::{cancelled, WorkGroup};

/// Sends the teacher's tree level by level, skipping subtrees the learner
/// confirmed.
pub struct TeacherPushView {
    config: ReconnectConfig,
    records: Arc<dyn TeacherRecords>,
    boundaries: TreeBoundaries,
    chunk_height: u32,

    statuses: NodeStatusTracker,
    queues: LevelQueues,
    /// Child queries in the order the learner will answer them.
    expected_responses: Mutex<VecDeque<Path>>,
    /// Last node sent from the current level that the learner had not
    /// reported on yet; the next level waits for its report.
    last_node_awaiting_report: AtomicI64,
    report_received: Notify,
    chunk_cache: Mutex<Option<HashChunk>>,

    stats: ReconnectMapStats,
}

impl fmt::Debug for TeacherPushView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeacherPushView")
            .field("boundaries", &self.boundaries)
            .field("chunk_height", &self.chunk_height)
            .field("queues", &self.queues)
            .field(
                "last_node_awaiting_report",
                &self.last_node_awaiting_report.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl TeacherPushView {
    #[must_use]
    pub fn new(config: ReconnectConfig, records: Arc<dyn TeacherRecords>) -> Self {
        let boundaries = records.boundaries();
        let chunk_height = records.hash_chunk_height().clamp(1, MAX_HASH_CHUNK_HEIGHT);

        Self {
            config,
            records,
            boundaries,
            chunk_height,
            statuses: NodeStatusTracker::new(),
            queues: LevelQueues::new(),
            expected_responses: Mutex::default(),
            last_node_awaiting_report: AtomicI64::new(INVALID_PATH),
            report_received: Notify::new(),
            chunk_cache: Mutex::new(None),
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
            first_leaf_path = self.boundaries.first_leaf_path,
            last_leaf_path = self.boundaries.last_leaf_path,
            chunk_height = self.chunk_height,
            "Starting push reconnect as teacher"
        );

        let mut group = WorkGroup::new("teacher-push", cancel);
        group.spawn(
            "teacher-push-send",
            Arc::clone(&self).send_task(sender, group.token()),
        );
        group.spawn(
            "teacher-push-receive",
            Arc::clone(&self).receive_task(receiver, group.token()),
        );

        group
            .join()
            .await
            .wrap_err("push reconnect failed on the teacher")?;

        let stats = self.stats.snapshot();
        info!(%stats, "Finished push reconnect as teacher");

        Ok(stats)
    }

    // ===== Sending =====

    async fn send_task(
        self: Arc<Self>,
        sender: Arc<dyn FrameSender>,
        token: CancellationToken,
    ) -> EyreResult<()> {
        let root = Lesson::Internal {
            path: ROOT_PATH,
            boundaries: Some(self.boundaries),
            child_hashes: self.query_children(ROOT_PATH)?,
        };
        self.stats.increment_transfers_from_teacher();
        sender.send(root.encode()?).await?;

        while let Some(path) = self.next_node(&token).await? {
            let lesson = self.lesson_for(path)?;
            trace!(path, ?lesson, "Sending lesson");
            self.stats.increment_transfers_from_teacher();
            sender.send(lesson.encode()?).await?;
        }

        debug!("Every lesson sent");
        Ok(())
    }

    fn lesson_for(&self, path: Path) -> EyreResult<Lesson> {
        let is_leaf = self.records.is_leaf(path);

        if self.statuses.has_learner_confirmed_for(path) {
            if is_leaf {
                self.stats.increment_leaf_hashes(true);
            } else {
                self.stats.increment_internal_hashes(true);
            }
            return Ok(Lesson::UpToDate { path });
        }

        if is_leaf {
            self.stats.increment_leaf_hashes(false);
            self.stats.increment_leaf_data();
            let leaf = self
                .records
                .load_leaf(path)?
                .ok_or(ReconnectError::MissingLeaf { path })?;
            return Ok(Lesson::Leaf { leaf: leaf.at(path) });
        }

        self.stats.increment_internal_hashes(false);
        Ok(Lesson::Internal {
            path,
            boundaries: None,
            child_hashes: self.query_children(path)?,
        })
    }

    /// Child hashes of `path`. Every child becomes an expected response and a
    /// node of the next level.
    fn query_children(&self, path: Path) -> EyreResult<Vec<Hash>> {
        let children = self.child_paths(path);
        let mut hashes = Vec::with_capacity(children.len());

        for &child in &children {
            hashes.push(self.child_hash(child)?);
        }

        let mut expected = self.expected_responses.lock();
        for &child in &children {
            expected.push_back(child);
            self.queues.push_next(child);
        }

        Ok(hashes)
    }

    fn child_paths(&self, path: Path) -> Vec<Path> {
        if path == ROOT_PATH {
            if self.boundaries.is_empty() {
                return vec![];
            }
            if self.boundaries.last_leaf_path == 1 {
                return vec![left_child(ROOT_PATH)];
            }
        }
        vec![left_child(path), right_child(path)]
    }

    /// Siblings always share a chunk, and consecutive parents usually do, so
    /// the last chunk read is kept around.
    fn child_hash(&self, child: Path) -> EyreResult<Hash> {
        let chunk_path = HashChunk::path_to_chunk_path(child, self.chunk_height);
        let mut cache = self.chunk_cache.lock();

        if cache.as_ref().map_or(true, |chunk| chunk.path() != chunk_path) {
            *cache = Some(self.records.load_hash_chunk(chunk_path)?);
        }

        cache
            .as_ref()
            .and_then(|chunk| chunk.hash_at(child))
            .ok_or_else(|| ReconnectError::UnresolvablePath { path: child }.into())
    }

    /// Next node to send, flipping to the next level once the current one is
    /// drained. Returns `None` when there is nothing left.
    async fn next_node(&self, token: &CancellationToken) -> EyreResult<Option<Path>> {
        loop {
            if let Some(path) = self.queues.pop() {
                // A node already settled, directly or through an ancestor,
                // is not worth waiting for.
                if !self.statuses.is_reported(path) {
                    self.last_node_awaiting_report.store(path, Ordering::SeqCst);
                }
                return Ok(Some(path));
            }
            if !self.queues.has_next_level() {
                return Ok(None);
            }
            self.wait_for_last_report(token).await?;
            let _ = self.queues.flip();
        }
    }

    /// Give the learner a chance to report on the previous level before the
    /// next one is sent, so confirmed subtrees are not sent again. Proceeds
    /// anyway once the ceiling is reached.
    async fn wait_for_last_report(&self, token: &CancellationToken) -> EyreResult<()> {
        let path = self.last_node_awaiting_report.load(Ordering::SeqCst);
        if path == INVALID_PATH {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.push_max_report_wait;
        while !self.statuses.is_reported(path) {
            if Instant::now() >= deadline {
                warn!(path, "Learner has not reported in time, sending next level anyway");
                return Ok(());
            }
            tokio::select! {
                () = token.cancelled() => return Err(cancelled("teacher push send")),
                _ = tokio::time::timeout(
                    self.config.push_report_poll,
                    self.report_received.notified(),
                ) => {}
            }
        }

        Ok(())
    }

    // ===== Receiving =====

    async fn receive_task(
        self: Arc<Self>,
        mut receiver: Box<dyn FrameReceiver>,
        token: CancellationToken,
    ) -> EyreResult<()> {
        loop {
            let frame = tokio::select! {
                () = token.cancelled() => return Err(cancelled("teacher push receive")),
                frame = receiver.recv() => frame?,
            };

            let Some(frame) = frame else {
                // The learner closes its side once every lesson arrived.
                if self.expected_responses.lock().is_empty() && self.queues.is_drained() {
                    return Ok(());
                }
                return Err(ReconnectError::TransportClosed.into());
            };

            let response = QueryResponse::decode(&frame)?;
            let path = self
                .expected_responses
                .lock()
                .pop_front()
                .ok_or(ReconnectError::UnexpectedResponse { path: INVALID_PATH })?;

            trace!(path, learner_has_node = response.learner_has_node, "Learner reported");
            self.statuses.record(path, response.learner_has_node);
            self.report_received.notify_waiters();
        }
    }
}
