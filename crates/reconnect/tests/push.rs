//! Push reconnect sessions end to end.

mod common;

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::sync::Arc;

    use calimero_reconnect::memory::MemoryTree;
    use calimero_reconnect::{run_teacher, ReconnectMapStats};
    use calimero_reconnect_primitives::transport::channel::{duplex, Endpoint, DEFAULT_CAPACITY};
    use calimero_reconnect_primitives::{
        FrameReceiver, FrameSender, Lesson, QueryResponse, ReconnectConfig, ReconnectMode,
        TopToBottomTraversal,
    };
    use claims::assert_ok;
    use rand::Rng;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::common::{diverge, entries, random_entries, reconnect, seeded, Reconnected};

    fn config() -> ReconnectConfig {
        ReconnectConfig::default().with_mode(ReconnectMode::Push)
    }

    async fn push(teacher: &MemoryTree, original: &MemoryTree) -> Reconnected {
        // The learner ignores the traversal when pushed to.
        reconnect(
            &config(),
            teacher,
            original,
            Arc::new(TopToBottomTraversal::new()),
        )
        .await
    }

    #[tokio::test]
    async fn identical_trees_stop_below_the_root() {
        let tree = MemoryTree::from_entries(entries(4));

        let done = push(&tree, &tree).await;
        let rebuilt = done.tree();
        let stats = done.teacher_stats();

        assert_eq!(rebuilt.root_hash(), tree.root_hash(), "same tree");
        assert_eq!(stats.transfers_from_teacher, 3, "root and two up-to-date children");
        assert_eq!(stats.internal_clean_hashes, 2, "both children confirmed");
        assert_eq!(stats.leaf_data, 0, "no leaves sent");
        assert_eq!(done.learner_stats().transfers_from_teacher, 3, "learner saw the same");
    }

    #[tokio::test]
    async fn single_changed_leaf_descends_one_branch() {
        let teacher = MemoryTree::from_entries(entries(4));
        let mut stale = entries(4);
        stale[2].1 = None;
        let original = MemoryTree::from_entries(stale);

        let done = push(&teacher, &original).await;
        let rebuilt = done.tree();
        let stats = done.teacher_stats();

        assert_eq!(rebuilt.root_hash(), teacher.root_hash(), "caught up");
        assert_eq!(done.side.builder.forwarded_paths(), vec![5], "only path 5");
        assert_eq!(stats.leaf_data, 1, "one leaf sent");
        assert_eq!(stats.leaf_clean_hashes, 1, "path 6 confirmed");
        assert_eq!(stats.internal_clean_hashes, 1, "path 1 confirmed");
    }

    #[tokio::test]
    async fn empty_teacher_sends_only_the_root() {
        let teacher = MemoryTree::empty();
        let original = MemoryTree::from_entries(entries(3));

        let done = push(&teacher, &original).await;

        assert!(done.tree().is_empty(), "no leaves left");
        assert_eq!(done.teacher_stats().transfers_from_teacher, 1, "root only");
        assert_eq!(done.side.remover.stale_keys().len(), 3, "every key stale");
        assert_eq!(done.side.remover.completions(), 1, "finalized once");
    }

    #[tokio::test]
    async fn empty_learner_receives_every_leaf() {
        let teacher = MemoryTree::from_entries(entries(5));

        let done = push(&teacher, &MemoryTree::empty()).await;

        assert_eq!(done.tree().root_hash(), teacher.root_hash(), "caught up");
        assert_eq!(
            done.side.builder.forwarded_paths(),
            (4..=8).collect::<Vec<_>>(),
            "leaves level by level"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn random_trees_converge() {
        for seed in 100..116 {
            let mut rng = seeded(seed);
            let count = rng.gen_range(0..48);
            let teacher_entries = random_entries(&mut rng, count);
            let original_entries = diverge(&mut rng, &teacher_entries, 0.3);
            let teacher = MemoryTree::from_entries(teacher_entries);
            let original = MemoryTree::from_entries(original_entries);

            let done = push(&teacher, &original).await;

            assert_eq!(
                done.tree().root_hash(),
                teacher.root_hash(),
                "seed {seed}"
            );
            assert_eq!(done.side.remover.completions(), 1, "seed {seed}");
        }
    }

    /// Reads `lessons` lessons without answering, then answers every query
    /// at once. Returns the lessons and when the last one arrived.
    async fn late_learner(end: Endpoint, lessons: usize) -> (Vec<Lesson>, Instant) {
        let Endpoint {
            sender,
            mut receiver,
        } = end;

        let mut received = Vec::with_capacity(lessons);
        while received.len() < lessons {
            let frame = receiver.recv().await.unwrap().unwrap();
            received.push(Lesson::decode(&frame).unwrap());
        }
        let finished = Instant::now();

        let queries: usize = received
            .iter()
            .map(|lesson| match lesson {
                Lesson::Internal { child_hashes, .. } => child_hashes.len(),
                Lesson::UpToDate { .. } | Lesson::Leaf { .. } => 0,
            })
            .sum();
        for _ in 0..queries {
            let answer = QueryResponse::new(false).encode().unwrap();
            sender.send(answer).await.unwrap();
        }
        sender.close();

        (received, finished)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_learner_delays_each_level_once() {
        let teacher = MemoryTree::from_entries(entries(4));
        let wait = Duration::from_secs(2);
        let config = config().with_push_max_report_wait(wait);
        let (teacher_end, learner_end) = duplex(DEFAULT_CAPACITY);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let (stats, (lessons, finished)) = tokio::join!(
            run_teacher(
                &config,
                Arc::new(teacher),
                Arc::new(teacher_end.sender),
                Box::new(teacher_end.receiver),
                ReconnectMapStats::default(),
                &cancel,
            ),
            late_learner(learner_end, 7),
        );

        let stats = assert_ok!(stats);
        let paths: Vec<_> = lessons.iter().map(Lesson::path).collect();
        assert_eq!(paths, (0_i64..=6).collect::<Vec<_>>(), "breadth first, nothing skipped");
        assert_eq!(stats.leaf_data, 4, "every leaf sent");

        // The root's children go out at once. Only the leaf level waits, and
        // only for the last internal node sent.
        let elapsed = finished.duration_since(started);
        assert!(elapsed >= wait, "waited for a report, took {elapsed:?}");
        assert!(elapsed < wait * 2, "waited once, took {elapsed:?}");
    }
}
