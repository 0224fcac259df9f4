use std::borrow::Cow;
use std::sync::Arc;

use calimero_reconnect::memory::{MemoryLearner, MemoryTree};
use calimero_reconnect::{run_learner, run_teacher, ReconnectMapStats};
use calimero_reconnect_primitives::transport::channel::{duplex, DEFAULT_CAPACITY};
use calimero_reconnect_primitives::{
    InOrderTraversal, NodeTraversalOrder, ReconnectConfig, ReconnectMode, TopToBottomTraversal,
};
use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use const_format::concatcp;
use eyre::{bail, OptionExt, Result as EyreResult, WrapErr};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const EXAMPLES: &str = r"
  # Reconnect a learner that missed 5% of the updates
  $ reconnect-sim --teacher-leaves 4096 --learner-leaves 4000 --change-ratio 0.05

  # Same, over the legacy push protocol
  $ reconnect-sim --mode push --teacher-leaves 4096 --learner-leaves 4000

  # Throttle the teacher to 500 responses per second
  $ reconnect-sim --max-nodes-per-second 500

  # Dump both sides' counters in Prometheus text format
  $ reconnect-sim --metrics
";

/// Reconnect a stale in-memory tree to a teacher's snapshot.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(after_help = concatcp!(
    "Environment variables:\n",
    "  RECONNECT_CONFIG    Reconnect configuration file\n",
    "  RUST_LOG            Log filter directives\n\n",
    "Examples:",
    EXAMPLES
))]
pub struct RootCommand {
    /// Reconnect configuration file, defaults apply when absent
    #[arg(long, value_name = "PATH")]
    #[arg(env = "RECONNECT_CONFIG", hide_env_values = true)]
    pub config: Option<Utf8PathBuf>,

    /// Protocol to run, overriding the configuration file
    #[arg(long, value_name = "MODE")]
    pub mode: Option<ReconnectMode>,

    /// Traversal strategy of the pull learner
    #[arg(long, value_enum, default_value_t = Traversal::TopToBottom)]
    pub traversal: Traversal,

    /// Leaves in the teacher's snapshot
    #[arg(long, default_value_t = 1_024)]
    pub teacher_leaves: u32,

    /// Leaves in the learner's stale tree
    #[arg(long, default_value_t = 1_000)]
    pub learner_leaves: u32,

    /// Share of shared leaves whose value the learner has outdated
    #[arg(long, default_value_t = 0.05)]
    pub change_ratio: f64,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Teacher responses per second, 0 for unlimited
    #[arg(long, value_name = "RATE")]
    pub max_nodes_per_second: Option<u32>,

    /// Print the session counters in Prometheus text format when done
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Traversal {
    InOrder,
    TopToBottom,
}

impl Traversal {
    fn strategy(self) -> Arc<dyn NodeTraversalOrder> {
        match self {
            Self::InOrder => Arc::new(InOrderTraversal::new()),
            Self::TopToBottom => Arc::new(TopToBottomTraversal::new()),
        }
    }
}

impl RootCommand {
    pub async fn run(self) -> EyreResult<()> {
        if !(0.0..=1.0).contains(&self.change_ratio) {
            bail!("--change-ratio must be between 0 and 1");
        }

        let config = self.config()?;
        let (teacher, original) = self.trees();

        info!(
            mode = %config.mode,
            teacher_leaves = teacher.len(),
            learner_leaves = original.len(),
            teacher_root = %teacher.root_hash(),
            learner_root = %original.root_hash(),
            "Prepared trees"
        );

        let (teacher_end, learner_end) = duplex(DEFAULT_CAPACITY);
        let side = MemoryLearner::new(
            Arc::new(original),
            self.traversal.strategy(),
            config.hashing_queue_capacity,
        );

        let mut registry = Registry::default();
        let teacher_counters = ReconnectMapStats::default();
        teacher_counters.register(registry.sub_registry_with_label((
            Cow::Borrowed("side"),
            Cow::Borrowed("teacher"),
        )));
        let learner_counters = ReconnectMapStats::default();
        learner_counters.register(registry.sub_registry_with_label((
            Cow::Borrowed("side"),
            Cow::Borrowed("learner"),
        )));

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        drop(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling reconnect");
                interrupt.cancel();
            }
        }));

        let started = Instant::now();
        let (teacher_stats, learner_stats) = tokio::join!(
            run_teacher(
                &config,
                Arc::new(teacher.clone()),
                Arc::new(teacher_end.sender),
                Box::new(teacher_end.receiver),
                teacher_counters,
                &cancel,
            ),
            run_learner(
                &config,
                side.parts.clone(),
                Arc::new(learner_end.sender),
                Box::new(learner_end.receiver),
                learner_counters,
                &cancel,
            ),
        );
        let elapsed = started.elapsed();

        let teacher_stats = teacher_stats.wrap_err("teacher side failed")?;
        let learner_stats = learner_stats.wrap_err("learner side failed")?;

        let rebuilt = side
            .builder
            .take_tree()
            .ok_or_eyre("learner finished without rebuilding its tree")?;

        if rebuilt.root_hash() != teacher.root_hash() {
            bail!(
                "learner converged on {} instead of {}",
                rebuilt.root_hash(),
                teacher.root_hash()
            );
        }

        info!(
            ?elapsed,
            %teacher_stats,
            %learner_stats,
            stale_keys = side.remover.stale_keys().len(),
            root = %rebuilt.root_hash(),
            "Learner caught up"
        );

        if self.metrics {
            let mut text = String::new();
            encode(&mut text, &registry).wrap_err("failed to encode metrics")?;
            print!("{text}");
        }

        Ok(())
    }

    fn config(&self) -> EyreResult<ReconnectConfig> {
        let mut config = match &self.config {
            Some(path) => ReconnectConfig::load(path)?,
            None => ReconnectConfig::default(),
        };

        if let Some(mode) = self.mode {
            config = config.with_mode(mode);
        }
        if let Some(rate) = self.max_nodes_per_second {
            config = config.with_max_nodes_per_second(rate);
        }

        Ok(config)
    }

    /// The teacher's snapshot and a learner tree that shares a prefix of its
    /// keys with some values outdated.
    fn trees(&self) -> (MemoryTree, MemoryTree) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let count = self.teacher_leaves.max(self.learner_leaves);

        let current: Vec<(Vec<u8>, Option<Vec<u8>>)> = (0..count)
            .map(|i| {
                let value: [u8; 8] = rng.gen();
                (format!("key-{i:08}").into_bytes(), Some(value.to_vec()))
            })
            .collect();

        let stale = current
            .iter()
            .take(self.learner_leaves as usize)
            .map(|(key, value)| {
                if rng.gen_bool(self.change_ratio) {
                    (key.clone(), Some(b"outdated".to_vec()))
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect::<Vec<_>>();

        let teacher = MemoryTree::from_entries(
            current.into_iter().take(self.teacher_leaves as usize),
        );

        (teacher, MemoryTree::from_entries(stale))
    }
}
