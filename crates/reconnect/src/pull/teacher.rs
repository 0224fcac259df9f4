use core::fmt;
use std::sync::Arc;

use calimero_reconnect_primitives::config::ReconnectConfig;
use calimero_reconnect_primitives::{
    FrameReceiver, FrameSender, PullRequest, PullResponse, ReconnectError, TeacherRecords,
    ROOT_PATH,
};
use eyre::{Result as EyreResult, WrapErr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::rate_limit::RateLimiter;
use crate::stats::{ReconnectMapStats, ReconnectStats};
use crate::work_group::{cancelled, WorkGroup};

/// Requests decoded but not yet answered.
const REQUEST_QUEUE_CAPACITY: usize = 1_024;

/// Answers learner requests against the teacher's snapshot.
pub struct TeacherPullView {
    records: Arc<dyn TeacherRecords>,
    stats: ReconnectMapStats,
}

impl fmt::Debug for TeacherPullView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeacherPullView")
            .field("boundaries", &self.records.boundaries())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl TeacherPullView {
    #[must_use]
    pub fn new(records: Arc<dyn TeacherRecords>) -> Self {
        Self {
            records,
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

    /// Verdict for a single request.
    ///
    /// The root is never compared and always carries the teacher's leaf
    /// range. Any other path must resolve to a teacher hash; a dirty leaf
    /// also carries its record.
    pub fn respond_to(&self, request: &PullRequest) -> EyreResult<PullResponse> {
        if request.is_terminal() {
            return Ok(PullResponse::terminal_ack());
        }

        let boundaries = self.records.boundaries();

        if request.path == ROOT_PATH {
            return Ok(PullResponse::root(boundaries));
        }

        let path = request.path;
        boundaries.check_node(path)?;

        let teacher_hash = self
            .records
            .load_hash(path)?
            .ok_or(ReconnectError::UnresolvablePath { path })?;
        let is_clean = teacher_hash == request.hash;

        if !self.records.is_leaf(path) {
            self.stats.increment_internal_hashes(is_clean);
            return Ok(PullResponse::internal(path, is_clean));
        }

        self.stats.increment_leaf_hashes(is_clean);
        if is_clean {
            return Ok(PullResponse::clean_leaf(path));
        }

        let leaf = self
            .records
            .load_leaf(path)?
            .ok_or(ReconnectError::MissingLeaf { path })?;
        self.stats.increment_leaf_data();

        Ok(PullResponse::dirty_leaf(leaf.at(path)))
    }

    /// Serve one learner until it sends the terminal request.
    ///
    /// A receive task decodes requests while a send task answers them under
    /// the configured rate limit.
    pub async fn run(
        self: Arc<Self>,
        config: &ReconnectConfig,
        sender: Arc<dyn FrameSender>,
        receiver: Box<dyn FrameReceiver>,
        cancel: &CancellationToken,
    ) -> EyreResult<ReconnectStats> {
        let boundaries = self.records.boundaries();
        info!(
            first_leaf_path = boundaries.first_leaf_path,
            last_leaf_path = boundaries.last_leaf_path,
            max_nodes_per_second = config.max_nodes_per_second,
            "Starting pull reconnect as teacher"
        );

        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let mut group = WorkGroup::new("teacher-pull", cancel);

        group.spawn(
            "teacher-pull-receive",
            receive_requests(receiver, requests_tx, group.token()),
        );
        group.spawn(
            "teacher-pull-send",
            Arc::clone(&self).send_responses(
                RateLimiter::new(config.max_nodes_per_second),
                config.rate_limiter_sleep,
                sender,
                requests_rx,
                group.token(),
            ),
        );

        group
            .join()
            .await
            .wrap_err("pull reconnect failed on the teacher")?;

        let stats = self.stats.snapshot();
        info!(%stats, "Finished pull reconnect as teacher");

        Ok(stats)
    }

    async fn send_responses(
        self: Arc<Self>,
        limiter: RateLimiter,
        limiter_sleep: core::time::Duration,
        sender: Arc<dyn FrameSender>,
        mut requests: mpsc::Receiver<PullRequest>,
        token: CancellationToken,
    ) -> EyreResult<()> {
        loop {
            let request = tokio::select! {
                () = token.cancelled() => return Err(cancelled("teacher send")),
                request = requests.recv() => request,
            };
            let Some(request) = request else {
                return Err(ReconnectError::TransportClosed.into());
            };

            while !limiter.request_and_trigger() {
                tokio::select! {
                    () = token.cancelled() => return Err(cancelled("teacher send")),
                    () = tokio::time::sleep(limiter_sleep) => {}
                }
            }

            let response = self.respond_to(&request)?;
            trace!(path = request.path, is_clean = response.is_clean, "Responding");
            self.stats.increment_transfers_from_teacher();
            sender.send(response.encode()?).await?;

            if request.is_terminal() {
                debug!("Acknowledged terminal request");
                return Ok(());
            }
        }
    }
}

async fn receive_requests(
    mut receiver: Box<dyn FrameReceiver>,
    requests: mpsc::Sender<PullRequest>,
    token: CancellationToken,
) -> EyreResult<()> {
    loop {
        let frame = tokio::select! {
            () = token.cancelled() => return Err(cancelled("teacher receive")),
            frame = receiver.recv() => frame?,
        };
        let Some(frame) = frame else {
            return Err(ReconnectError::TransportClosed.into());
        };

        let request = PullRequest::decode(frame)?;
        let is_terminal = request.is_terminal();

        if requests.send(request).await.is_err() {
            return Err(cancelled("teacher receive"));
        }

        if is_terminal {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use calimero_reconnect_primitives::{Hash, LeafRecord, Path, TreeBoundaries};
    use claims::{assert_err, assert_ok};

    use super::*;
    use crate::memory::MemoryTree;

    /// A snapshot that lost one hash and one leaf record.
    struct Damaged {
        tree: MemoryTree,
        lost_hash: Path,
        lost_leaf: Path,
    }

    impl TeacherRecords for Damaged {
        fn boundaries(&self) -> TreeBoundaries {
            self.tree.boundaries()
        }

        fn load_hash(&self, path: Path) -> EyreResult<Option<Hash>> {
            Ok(self.tree.hash(path).filter(|_| path != self.lost_hash))
        }

        fn load_leaf(&self, path: Path) -> EyreResult<Option<LeafRecord>> {
            Ok(self.tree.leaf(path).filter(|_| path != self.lost_leaf).cloned())
        }
    }

    fn damaged() -> TeacherPullView {
        TeacherPullView::new(Arc::new(Damaged {
            tree: MemoryTree::from_entries((0..4_u8).map(|i| (vec![i], Some(vec![i])))),
            lost_hash: 2,
            lost_leaf: 4,
        }))
    }

    fn teacher() -> (TeacherPullView, Arc<MemoryTree>) {
        let tree = Arc::new(MemoryTree::from_entries(
            (0..4_u8).map(|i| (vec![i], Some(vec![i, i]))),
        ));
        (TeacherPullView::new(tree.clone()), tree)
    }

    #[test]
    fn root_carries_boundaries_and_is_never_clean() {
        let (view, _) = teacher();
        let response = assert_ok!(view.respond_to(&PullRequest::root()));
        assert!(!response.is_clean, "root dirty");
        assert_eq!(
            response.boundaries,
            Some(TreeBoundaries::for_leaf_count(4)),
            "teacher boundaries"
        );
    }

    #[test]
    fn matching_hash_is_clean() {
        let (view, tree) = teacher();
        let hash = tree.hash(1).unwrap();
        let response = assert_ok!(view.respond_to(&PullRequest::new(1, hash)));
        assert!(response.is_clean, "same hash");
        assert!(response.leaf.is_none(), "no payload for internals");
    }

    #[test]
    fn dirty_leaf_carries_its_record() {
        let (view, tree) = teacher();
        let response = assert_ok!(view.respond_to(&PullRequest::new(5, Hash::EMPTY)));
        assert!(!response.is_clean, "different hash");
        assert_eq!(response.leaf.as_ref(), tree.leaf(5), "record attached");
    }

    #[test]
    fn clean_leaf_has_no_payload() {
        let (view, tree) = teacher();
        let hash = tree.hash(6).unwrap();
        let response = assert_ok!(view.respond_to(&PullRequest::new(6, hash)));
        assert!(response.is_clean && response.leaf.is_none(), "bare clean leaf");
    }

    #[test]
    fn terminal_request_is_acknowledged() {
        let (view, _) = teacher();
        let response = assert_ok!(view.respond_to(&PullRequest::terminal()));
        assert!(response.is_terminal_ack(), "ack");
    }

    #[test]
    fn out_of_bounds_request_is_fatal() {
        let (view, _) = teacher();
        let err = assert_err!(view.respond_to(&PullRequest::new(7, Hash::EMPTY)));
        assert!(
            matches!(
                err.downcast_ref(),
                Some(ReconnectError::PathOutOfBounds { path: 7, .. })
            ),
            "past the last leaf"
        );
    }

    #[test]
    fn in_range_path_without_a_hash_is_fatal() {
        let err = assert_err!(damaged().respond_to(&PullRequest::new(2, Hash::EMPTY)));
        assert!(
            matches!(
                err.downcast_ref(),
                Some(ReconnectError::UnresolvablePath { path: 2 })
            ),
            "teacher cannot answer for path 2"
        );
    }

    #[test]
    fn dirty_leaf_without_a_record_is_fatal() {
        let err = assert_err!(damaged().respond_to(&PullRequest::new(4, Hash::EMPTY)));
        assert!(
            matches!(
                err.downcast_ref(),
                Some(ReconnectError::MissingLeaf { path: 4 })
            ),
            "hash present, record gone"
        );
    }
}
