//! Learner side of the pull protocol.
//!
//! Sender tasks ask the traversal strategy for paths and stream requests;
//! receiver tasks apply the teacher's responses. The two sides meet in a few
//! places:
//!
//! - the root barrier: nothing but the root request is sent, and no other
//!   response is decoded, before the root response has been applied;
//! - the leaf reorder buffers: leaf paths are queued in the order they were
//!   handed out, and a leaf response is applied only once it reaches the
//!   head of that queue;
//! - the send gate: the terminal request is sent under an exclusive lock so
//!   that it cannot overtake a request another task is still sending;
//! - finalization: once the terminal acknowledgement has arrived and every
//!   outstanding response has been applied, exactly one task tells the node
//!   remover and the hashing pipeline that reconnect is over.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use calimero_reconnect_primitives::config::ReconnectConfig;
use calimero_reconnect_primitives::path::AtomicBoundaries;
use calimero_reconnect_primitives::{
    FrameReceiver, FrameSender, NextPath, NodeRemover, NodeTraversalOrder, OriginalRecords, Path,
    PullRequest, PullResponse, ReconnectError, ReconnectHashing, TreeBoundaries, INVALID_PATH,
    ROOT_PATH,
};
use eyre::{Result as EyreResult, WrapErr};
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::stats::{ReconnectMapStats, ReconnectStats};
use crate::work_group::{cancelled, WorkGroup};

/// Storage and pipeline handles the learner needs for one reconnect.
#[derive(Clone)]
pub struct LearnerParts {
    pub original: Arc<dyn OriginalRecords>,
    pub traversal: Arc<dyn NodeTraversalOrder>,
    pub hashing: Arc<dyn ReconnectHashing>,
    pub remover: Arc<dyn NodeRemover>,
}

impl fmt::Debug for LearnerParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LearnerParts")
            .field("original", &self.original.boundaries())
            .field("traversal", &"<traversal>")
            .field("hashing", &"<hashing>")
            .field("remover", &"<remover>")
            .finish()
    }
}

#[derive(Debug, Default)]
struct PendingLeaves {
    /// Leaf paths in the order they were requested.
    anticipated: VecDeque<Path>,
    /// Leaf responses that arrived before their turn.
    arrived: HashMap<Path, PullResponse>,
}

pub struct LearnerPullView {
    config: ReconnectConfig,
    parts: LearnerParts,
    original_boundaries: TreeBoundaries,
    reconnect_boundaries: AtomicBoundaries,

    root_requested: AtomicBool,
    first_response_seen: AtomicBool,
    root_ready: watch::Sender<bool>,
    terminal_requested: AtomicBool,

    pending: Mutex<PendingLeaves>,
    drain: AsyncMutex<()>,
    send_gate: RwLock<()>,

    /// Requests sent whose response has not been applied yet.
    outstanding: AtomicU64,
    ack_received: AtomicBool,
    finalized: AtomicBool,
    finished: CancellationToken,

    stats: ReconnectMapStats,
}

impl fmt::Debug for LearnerPullView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LearnerPullView")
            .field("original_boundaries", &self.original_boundaries)
            .field("reconnect_boundaries", &self.reconnect_boundaries.get())
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .field("ack_received", &self.ack_received.load(Ordering::Relaxed))
            .field("finalized", &self.finalized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LearnerPullView {
    #[must_use]
    pub fn new(config: ReconnectConfig, parts: LearnerParts) -> Self {
        let original_boundaries = parts.original.boundaries();
        let (root_ready, _) = watch::channel(false);

        Self {
            config,
            parts,
            original_boundaries,
            reconnect_boundaries: AtomicBoundaries::default(),
            root_requested: AtomicBool::new(false),
            first_response_seen: AtomicBool::new(false),
            root_ready,
            terminal_requested: AtomicBool::new(false),
            pending: Mutex::default(),
            drain: AsyncMutex::new(()),
            send_gate: RwLock::new(()),
            outstanding: AtomicU64::new(0),
            ack_received: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            finished: CancellationToken::new(),
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

    /// Leaf range the teacher reported, once the root response was applied.
    #[must_use]
    pub fn reconnect_boundaries(&self) -> TreeBoundaries {
        self.reconnect_boundaries.get()
    }

    /// Run the whole learner side to completion.
    pub async fn run(
        self: Arc<Self>,
        sender: Arc<dyn FrameSender>,
        receiver: Box<dyn FrameReceiver>,
        cancel: &CancellationToken,
    ) -> EyreResult<ReconnectStats> {
        info!(
            first_leaf_path = self.original_boundaries.first_leaf_path,
            last_leaf_path = self.original_boundaries.last_leaf_path,
            send_tasks = self.config.learner_send_tasks,
            receive_tasks = self.config.learner_receive_tasks,
            "Starting pull reconnect as learner"
        );

        let receiver = Arc::new(AsyncMutex::new(receiver));
        let mut group = WorkGroup::new("learner-pull", cancel);

        for _ in 0..self.config.learner_send_tasks.max(1) {
            group.spawn(
                "learner-pull-send",
                Arc::clone(&self).send_task(Arc::clone(&sender), group.token()),
            );
        }
        for _ in 0..self.config.learner_receive_tasks.max(1) {
            group.spawn(
                "learner-pull-receive",
                Arc::clone(&self).receive_task(Arc::clone(&receiver), group.token()),
            );
        }

        let outcome = group.join().await;
        sender.close();
        outcome.wrap_err("pull reconnect failed on the learner")?;

        if !self.finalized.load(Ordering::SeqCst) {
            return Err(ReconnectError::TransportClosed)
                .wrap_err("pull reconnect ended before the terminal acknowledgement");
        }

        let stats = self.stats.snapshot();
        info!(%stats, "Finished pull reconnect as learner");

        Ok(stats)
    }

    // ===== Sending =====

    async fn send_task(
        self: Arc<Self>,
        sender: Arc<dyn FrameSender>,
        token: CancellationToken,
    ) -> EyreResult<()> {
        if self
            .root_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("Requesting root");
            let _ = self.outstanding.fetch_add(1, Ordering::SeqCst);
            sender.send(PullRequest::root().encode()).await?;
        }

        self.wait_for_root(&token).await?;

        loop {
            if token.is_cancelled() {
                return Err(cancelled("learner send"));
            }

            let gate = self.send_gate.read().await;
            match self.next_path_to_send() {
                NextPath::Send(path) => {
                    let hash = self.parts.original.find_hash(path)?;
                    let _ = self.outstanding.fetch_add(1, Ordering::SeqCst);
                    trace!(path, %hash, "Requesting");
                    sender.send(PullRequest::new(path, hash).encode()).await?;
                    drop(gate);
                }
                NextPath::NotYet => {
                    drop(gate);
                    tokio::select! {
                        () = token.cancelled() => return Err(cancelled("learner send")),
                        () = tokio::time::sleep(self.config.traversal_retry_sleep) => {}
                    }
                }
                NextPath::Exhausted => {
                    drop(gate);
                    return self.send_terminal(sender.as_ref()).await;
                }
            }
        }
    }

    /// Internal paths first; leaf paths are queued for in-order application
    /// in the same critical section that hands them out.
    fn next_path_to_send(&self) -> NextPath {
        match self.parts.traversal.next_internal_path_to_send() {
            NextPath::Exhausted => {}
            next => return next,
        }

        let mut pending = self.pending.lock();
        let next = self.parts.traversal.next_leaf_path_to_send();
        if let NextPath::Send(path) = next {
            pending.anticipated.push_back(path);
        }
        next
    }

    async fn send_terminal(&self, sender: &dyn FrameSender) -> EyreResult<()> {
        if self
            .terminal_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        // Waits for every in-flight request to be on the wire.
        let _exclusive = self.send_gate.write().await;
        debug!("Traversal exhausted, sending terminal request");
        sender.send(PullRequest::terminal().encode()).await
    }

    async fn wait_for_root(&self, token: &CancellationToken) -> EyreResult<()> {
        let mut ready = self.root_ready.subscribe();
        let timeout = self.config.root_response_timeout;
        let root_applied = async move { ready.wait_for(|ready| *ready).await.map(|_| ()) };

        tokio::select! {
            () = token.cancelled() => Err(cancelled("learner root barrier")),
            waited = tokio::time::timeout(timeout, root_applied) => match waited {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ReconnectError::TransportClosed.into()),
                Err(_) => Err(ReconnectError::RootResponseTimeout(timeout).into()),
            },
        }
    }

    // ===== Receiving =====

    async fn receive_task(
        self: Arc<Self>,
        receiver: Arc<AsyncMutex<Box<dyn FrameReceiver>>>,
        token: CancellationToken,
    ) -> EyreResult<()> {
        loop {
            let received = tokio::select! {
                () = self.finished.cancelled() => return Ok(()),
                () = token.cancelled() => return Err(cancelled("learner receive")),
                received = self.next_frame(&receiver) => received?,
            };

            match received {
                Some((frame, is_first)) => self.handle_frame(frame, is_first, &token).await?,
                None => return self.stream_ended(&token).await,
            }
        }
    }

    /// Pull one frame off the shared receiver and note whether it is the
    /// first frame of the session.
    async fn next_frame(
        &self,
        receiver: &AsyncMutex<Box<dyn FrameReceiver>>,
    ) -> EyreResult<Option<(Bytes, bool)>> {
        let mut receiver = receiver.lock().await;
        let Some(frame) = receiver.recv().await? else {
            return Ok(None);
        };
        let is_first = !self.first_response_seen.swap(true, Ordering::SeqCst);
        if peek_path(&frame).is_ok_and(|path| path == INVALID_PATH) {
            // Recorded before the next frame is pulled, so a receiver that
            // sees the stream end knows the teacher finished cleanly.
            self.ack_received.store(true, Ordering::SeqCst);
        }
        Ok(Some((frame, is_first)))
    }

    async fn stream_ended(&self, token: &CancellationToken) -> EyreResult<()> {
        if !self.ack_received.load(Ordering::SeqCst) {
            return Err(ReconnectError::TransportClosed.into());
        }
        // The teacher is done; whoever applies the last response finalizes.
        tokio::select! {
            () = self.finished.cancelled() => Ok(()),
            () = token.cancelled() => Err(cancelled("learner receive")),
            () = tokio::time::sleep(self.config.terminal_drain_timeout) => {
                Err(ReconnectError::TransportClosed)
                    .wrap_err("teacher acknowledged before every request was answered")
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Bytes,
        is_first: bool,
        token: &CancellationToken,
    ) -> EyreResult<()> {
        let path = peek_path(&frame)?;

        if is_first {
            if path != ROOT_PATH {
                return Err(ReconnectError::RootNotFirst { path }.into());
            }
            let response = PullResponse::decode(frame, &TreeBoundaries::empty())?;
            self.apply_root(&response)?;
            // The acknowledgement may already have been handled by another task.
            return self.maybe_finalize().await;
        }

        if path == ROOT_PATH {
            return Err(ReconnectError::DuplicateRoot.into());
        }

        // The root frame may still be in the middle of being applied.
        self.wait_for_root(token).await?;
        let boundaries = self.reconnect_boundaries.get();
        let response = PullResponse::decode(frame, &boundaries)?;

        if response.is_terminal_ack() {
            debug!("Terminal request acknowledged");
            self.stats.increment_transfers_from_teacher();
            return self.maybe_finalize().await;
        }

        if boundaries.last_leaf_path <= ROOT_PATH {
            // Nothing was requested past the root of an empty tree.
            trace!(path, "Ignoring response, teacher tree is empty");
            return Ok(());
        }

        self.stats.increment_transfers_from_teacher();
        boundaries.check_node(path)?;

        if boundaries.is_leaf(path) {
            self.leaf_arrived(response, token).await?;
        } else {
            self.apply(response, &boundaries, token).await?;
        }

        self.maybe_finalize().await
    }

    fn apply_root(&self, response: &PullResponse) -> EyreResult<()> {
        let boundaries = response
            .boundaries
            .ok_or(ReconnectError::Malformed("root response without boundaries"))?;

        info!(
            first_leaf_path = boundaries.first_leaf_path,
            last_leaf_path = boundaries.last_leaf_path,
            "Received teacher boundaries"
        );

        self.stats.increment_transfers_from_teacher();
        self.reconnect_boundaries.set(boundaries);
        self.parts.traversal.start(boundaries);
        self.parts.hashing.prepare_reconnect_hashing(boundaries)?;
        self.parts
            .remover
            .set_path_information(self.original_boundaries, boundaries);
        // Accounted for before the barrier opens, so no other response can
        // be applied while the root still counts as outstanding.
        self.response_applied();
        let _ = self.root_ready.send_replace(true);

        Ok(())
    }

    async fn leaf_arrived(&self, response: PullResponse, token: &CancellationToken) -> EyreResult<()> {
        let path = response.path;
        if self.pending.lock().arrived.insert(path, response).is_some() {
            return Err(ReconnectError::UnexpectedResponse { path }.into());
        }
        self.drain_leaves(token).await
    }

    /// Apply buffered leaves for as long as the head of the queue is ready.
    async fn drain_leaves(&self, token: &CancellationToken) -> EyreResult<()> {
        let _draining = self.drain.lock().await;
        let boundaries = self.reconnect_boundaries.get();

        loop {
            let next = {
                let mut pending = self.pending.lock();
                let Some(&head) = pending.anticipated.front() else {
                    return Ok(());
                };
                let ready = pending.arrived.remove(&head);
                if ready.is_some() {
                    let _ = pending.anticipated.pop_front();
                }
                ready
            };

            let Some(response) = next else {
                return Ok(());
            };
            self.apply(response, &boundaries, token).await?;
        }
    }

    async fn apply(
        &self,
        response: PullResponse,
        boundaries: &TreeBoundaries,
        token: &CancellationToken,
    ) -> EyreResult<()> {
        let PullResponse {
            path,
            is_clean,
            leaf,
            ..
        } = response;
        let is_leaf = boundaries.is_leaf(path);

        trace!(path, is_clean, "Applying response");
        self.parts.traversal.node_received(path, is_clean);

        if !is_leaf {
            self.stats.increment_internal_hashes(is_clean);
        } else {
            self.stats.increment_leaf_hashes(is_clean);
            if !is_clean {
                let leaf = leaf.ok_or(ReconnectError::Malformed("dirty leaf without payload"))?;
                self.stats.increment_leaf_data();
                self.parts.remover.new_leaf_node(path, &leaf.key);

                tokio::select! {
                    () = token.cancelled() => return Err(cancelled("learner hashing")),
                    forwarded = self.parts.hashing.forward_leaf(leaf) => {
                        forwarded.wrap_err(ReconnectError::Hashing { path })?;
                    }
                }
            }
        }

        self.response_applied();
        Ok(())
    }

    fn response_applied(&self) {
        let _ = self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    async fn maybe_finalize(&self) -> EyreResult<()> {
        if !self.ack_received.load(Ordering::SeqCst) || self.outstanding.load(Ordering::SeqCst) != 0 {
            return Ok(());
        }
        if self
            .finalized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        debug!("All responses applied, finishing reconnect hashing");
        self.parts.remover.all_nodes_received()?;
        self.parts.hashing.end_reconnect_hashing().await?;
        self.finished.cancel();

        Ok(())
    }
}

fn peek_path(frame: &Bytes) -> EyreResult<Path> {
    let bytes = frame
        .get(..8)
        .and_then(|prefix| <[u8; 8]>::try_from(prefix).ok())
        .ok_or(ReconnectError::Malformed("truncated frame"))?;
    Ok(Path::from_be_bytes(bytes))
}
