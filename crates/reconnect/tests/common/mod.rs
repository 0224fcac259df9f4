//! Shared harness for reconnect sessions over in-memory streams.

use std::sync::Arc;

use calimero_reconnect::memory::{MemoryLearner, MemoryTree};
use calimero_reconnect::{run_learner, run_teacher, ReconnectMapStats, ReconnectStats};
use calimero_reconnect_primitives::transport::channel::{duplex, DEFAULT_CAPACITY};
use calimero_reconnect_primitives::{NodeTraversalOrder, ReconnectConfig, ReconnectError};
use eyre::{Report, Result as EyreResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

pub type Entries = Vec<(Vec<u8>, Option<Vec<u8>>)>;

/// Outcome of one teacher/learner session.
pub struct Reconnected {
    pub teacher: EyreResult<ReconnectStats>,
    pub learner: EyreResult<ReconnectStats>,
    pub side: MemoryLearner,
}

impl Reconnected {
    /// Both sides succeeded; the rebuilt tree.
    pub fn tree(&self) -> MemoryTree {
        if let Err(err) = &self.teacher {
            panic!("teacher failed: {err:?}");
        }
        if let Err(err) = &self.learner {
            panic!("learner failed: {err:?}");
        }
        self.side
            .builder
            .take_tree()
            .expect("hashing pipeline finished")
    }

    pub fn learner_stats(&self) -> ReconnectStats {
        *self.learner.as_ref().expect("learner succeeded")
    }

    pub fn teacher_stats(&self) -> ReconnectStats {
        *self.teacher.as_ref().expect("teacher succeeded")
    }
}

/// Run both sides of a session to completion.
pub async fn reconnect(
    config: &ReconnectConfig,
    teacher: &MemoryTree,
    original: &MemoryTree,
    traversal: Arc<dyn NodeTraversalOrder>,
) -> Reconnected {
    let (teacher_end, learner_end) = duplex(DEFAULT_CAPACITY);
    let side = MemoryLearner::new(
        Arc::new(original.clone()),
        traversal,
        config.hashing_queue_capacity,
    );
    let cancel = CancellationToken::new();

    let (teacher, learner) = tokio::join!(
        run_teacher(
            config,
            Arc::new(teacher.clone()),
            Arc::new(teacher_end.sender),
            Box::new(teacher_end.receiver),
            ReconnectMapStats::default(),
            &cancel,
        ),
        run_learner(
            config,
            side.parts.clone(),
            Arc::new(learner_end.sender),
            Box::new(learner_end.receiver),
            ReconnectMapStats::default(),
            &cancel,
        ),
    );

    Reconnected {
        teacher,
        learner,
        side,
    }
}

/// First [`ReconnectError`] anywhere in the report's chain.
pub fn reconnect_error(report: &Report) -> Option<&ReconnectError> {
    report
        .chain()
        .find_map(|cause| cause.downcast_ref::<ReconnectError>())
}

pub fn entries(count: u32) -> Entries {
    (0..count)
        .map(|i| (format!("key-{i:05}").into_bytes(), Some(i.to_be_bytes().to_vec())))
        .collect()
}

pub fn random_entries(rng: &mut StdRng, count: u32) -> Entries {
    (0..count)
        .map(|i| {
            let value = rng
                .gen_bool(0.9)
                .then(|| (0..rng.gen_range(0..16)).map(|_| rng.gen::<u8>()).collect::<Vec<_>>());
            (format!("key-{i:05}").into_bytes(), value)
        })
        .collect()
}

/// A stale copy of `entries`: some values changed, the tail cut or extended.
pub fn diverge(rng: &mut StdRng, entries: &Entries, change_ratio: f64) -> Entries {
    let mut stale: Entries = entries
        .iter()
        .map(|(key, value)| {
            if rng.gen_bool(change_ratio) {
                (key.clone(), Some(vec![rng.gen(), rng.gen()]))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect();

    match rng.gen_range(0..3) {
        0 => stale.truncate(rng.gen_range(0..=stale.len())),
        1 => stale.extend((0..rng.gen_range(1..8)).map(|i: u32| {
            (format!("old-{i:05}").into_bytes(), Some(vec![rng.gen()]))
        })),
        _ => {}
    }

    stale
}

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
