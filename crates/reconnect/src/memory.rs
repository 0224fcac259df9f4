//! In-memory virtual tree.
//!
//! Backs the simulator and the integration tests. [`MemoryTree`] serves as
//! either the teacher's snapshot or the learner's original;
//! [`ReconnectTreeBuilder`] is a hashing pipeline that rebuilds the learner's
//! tree from the leaves it is fed; [`MemoryNodeRemover`] works out which of
//! the original keys became stale.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use calimero_reconnect_primitives::path::{left_child, right_child};
use calimero_reconnect_primitives::{
    Hash, LeafRecord, NodeRemover, NodeTraversalOrder, OriginalRecords, Path, ReconnectHashing,
    TeacherRecords, TreeBoundaries, ROOT_PATH,
};
use eyre::{bail, eyre, OptionExt, Result as EyreResult};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::pull::LearnerParts;

const LEAF_DOMAIN: u8 = 0x00;
const INTERNAL_DOMAIN: u8 = 0x01;

#[must_use]
pub fn hash_leaf(leaf: &LeafRecord) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_DOMAIN]);
    hasher.update((leaf.key.len() as u64).to_be_bytes());
    hasher.update(&leaf.key);
    match &leaf.value {
        Some(value) => {
            hasher.update([1]);
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value);
        }
        None => hasher.update([0]),
    }
    Hash::new(hasher.finalize().into())
}

#[must_use]
pub fn hash_internal(children: &[Hash]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([INTERNAL_DOMAIN]);
    for child in children {
        hasher.update(child.as_bytes());
    }
    Hash::new(hasher.finalize().into())
}

/// Complete binary tree of key/value leaves with every hash precomputed.
#[derive(Clone, Debug)]
pub struct MemoryTree {
    boundaries: TreeBoundaries,
    leaves: BTreeMap<Path, LeafRecord>,
    hashes: HashMap<Path, Hash>,
}

impl MemoryTree {
    #[must_use]
    pub fn empty() -> Self {
        Self::build(TreeBoundaries::empty(), BTreeMap::new())
    }

    /// Lay `entries` out as consecutive leaves, in iteration order.
    #[must_use]
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        let boundaries = TreeBoundaries::for_leaf_count(entries.len() as u64);
        let leaves = (boundaries.first_leaf_path..)
            .zip(entries)
            .map(|(path, (key, value))| (path, LeafRecord::new(path, key, value)))
            .collect();

        Self::build(boundaries, leaves)
    }

    /// Assemble a tree from explicit leaves; every leaf path must be filled
    /// exactly once.
    pub fn from_leaves<I>(boundaries: TreeBoundaries, leaves: I) -> EyreResult<Self>
    where
        I: IntoIterator<Item = LeafRecord>,
    {
        let mut by_path = BTreeMap::new();
        for leaf in leaves {
            if !boundaries.is_leaf(leaf.path) {
                bail!("leaf at path {} is outside the tree", leaf.path);
            }
            if by_path.insert(leaf.path, leaf).is_some() {
                bail!("two leaves share a path");
            }
        }
        if by_path.len() as u64 != boundaries.leaf_count() {
            bail!(
                "tree needs {} leaves, got {}",
                boundaries.leaf_count(),
                by_path.len()
            );
        }

        Ok(Self::build(boundaries, by_path))
    }

    fn build(boundaries: TreeBoundaries, leaves: BTreeMap<Path, LeafRecord>) -> Self {
        let mut hashes = HashMap::with_capacity(leaves.len() * 2);

        for path in (ROOT_PATH..=boundaries.last_leaf_path.max(ROOT_PATH)).rev() {
            let hash = match leaves.get(&path) {
                Some(leaf) => hash_leaf(leaf),
                None => {
                    let children: Vec<Hash> = [left_child(path), right_child(path)]
                        .iter()
                        .filter_map(|child| hashes.get(child).copied())
                        .collect();
                    hash_internal(&children)
                }
            };
            let _ = hashes.insert(path, hash);
        }

        Self {
            boundaries,
            leaves,
            hashes,
        }
    }

    #[must_use]
    pub const fn boundaries(&self) -> TreeBoundaries {
        self.boundaries
    }

    #[must_use]
    pub fn root_hash(&self) -> Hash {
        self.hash(ROOT_PATH).unwrap_or_else(|| hash_internal(&[]))
    }

    #[must_use]
    pub fn hash(&self, path: Path) -> Option<Hash> {
        self.hashes.get(&path).copied()
    }

    #[must_use]
    pub fn leaf(&self, path: Path) -> Option<&LeafRecord> {
        self.leaves.get(&path)
    }

    pub fn leaves(&self) -> impl Iterator<Item = &LeafRecord> {
        self.leaves.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

impl TeacherRecords for MemoryTree {
    fn boundaries(&self) -> TreeBoundaries {
        self.boundaries
    }

    fn load_hash(&self, path: Path) -> EyreResult<Option<Hash>> {
        Ok(self.hash(path))
    }

    fn load_leaf(&self, path: Path) -> EyreResult<Option<LeafRecord>> {
        Ok(self.leaf(path).cloned())
    }
}

impl OriginalRecords for MemoryTree {
    fn boundaries(&self) -> TreeBoundaries {
        self.boundaries
    }

    fn load_hash(&self, path: Path) -> EyreResult<Option<Hash>> {
        Ok(self.hash(path))
    }
}

/// Hashing pipeline that rebuilds the learner's tree.
///
/// Forwarded leaves travel through a bounded channel to a worker task, so a
/// slow pipeline pushes back on the collector. Leaf paths that were never
/// forwarded were clean and are taken from the original tree.
#[derive(Debug)]
pub struct ReconnectTreeBuilder {
    original: Arc<MemoryTree>,
    capacity: usize,
    state: Mutex<BuilderState>,
}

#[derive(Debug, Default)]
struct BuilderState {
    boundaries: Option<TreeBoundaries>,
    tx: Option<mpsc::Sender<LeafRecord>>,
    worker: Option<JoinHandle<Vec<LeafRecord>>>,
    forwarded: Vec<Path>,
    tree: Option<MemoryTree>,
}

impl ReconnectTreeBuilder {
    #[must_use]
    pub fn new(original: Arc<MemoryTree>, capacity: usize) -> Self {
        Self {
            original,
            capacity: capacity.max(1),
            state: Mutex::default(),
        }
    }

    /// Leaf paths in the order they were forwarded.
    #[must_use]
    pub fn forwarded_paths(&self) -> Vec<Path> {
        self.state.lock().forwarded.clone()
    }

    /// The rebuilt tree, once reconnect hashing has ended.
    #[must_use]
    pub fn take_tree(&self) -> Option<MemoryTree> {
        self.state.lock().tree.take()
    }
}

#[async_trait]
impl ReconnectHashing for ReconnectTreeBuilder {
    fn prepare_reconnect_hashing(&self, boundaries: TreeBoundaries) -> EyreResult<()> {
        let mut state = self.state.lock();
        if state.boundaries.is_some() {
            bail!("reconnect hashing prepared twice");
        }

        let (tx, mut rx) = mpsc::channel(self.capacity);
        let worker = tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(leaf) = rx.recv().await {
                received.push(leaf);
            }
            received
        });

        state.boundaries = Some(boundaries);
        state.tx = Some(tx);
        state.worker = Some(worker);

        Ok(())
    }

    async fn forward_leaf(&self, leaf: LeafRecord) -> EyreResult<()> {
        let tx = {
            let mut state = self.state.lock();
            state.forwarded.push(leaf.path);
            state
                .tx
                .clone()
                .ok_or_eyre("leaf forwarded before reconnect hashing was prepared")?
        };

        tx.send(leaf)
            .await
            .map_err(|_| eyre!("hashing worker stopped"))
    }

    async fn end_reconnect_hashing(&self) -> EyreResult<()> {
        let (boundaries, worker) = {
            let mut state = self.state.lock();
            drop(state.tx.take());
            (state.boundaries, state.worker.take())
        };
        let boundaries = boundaries.ok_or_eyre("reconnect hashing was never prepared")?;
        let received = worker.ok_or_eyre("reconnect hashing ended twice")?.await?;

        if received.windows(2).any(|pair| pair[0].path >= pair[1].path) {
            bail!("leaves reached the hashing pipeline out of order");
        }

        let mut leaves: BTreeMap<Path, LeafRecord> = received
            .into_iter()
            .map(|leaf| (leaf.path, leaf))
            .collect();
        let received_count = leaves.len();

        if !boundaries.is_empty() {
            for path in boundaries.first_leaf_path..=boundaries.last_leaf_path {
                if leaves.contains_key(&path) {
                    continue;
                }
                let clean = self
                    .original
                    .leaf(path)
                    .ok_or_else(|| eyre!("no leaf for clean path {path}"))?;
                drop(leaves.insert(path, clean.clone()));
            }
        }

        let tree = MemoryTree::from_leaves(boundaries, leaves.into_values())?;
        debug!(
            received = received_count,
            leaves = tree.len(),
            root = %tree.root_hash(),
            "Rebuilt learner tree"
        );
        self.state.lock().tree = Some(tree);

        Ok(())
    }
}

/// Works out which original keys no longer belong to the reconnected tree.
///
/// A key is stale when it did not arrive in any dirty leaf and its original
/// path either fell outside the new leaf range or was overwritten.
#[derive(Debug)]
pub struct MemoryNodeRemover {
    original: Arc<MemoryTree>,
    state: Mutex<RemoverState>,
}

#[derive(Debug, Default)]
struct RemoverState {
    reconnect: Option<TreeBoundaries>,
    received_keys: HashSet<Vec<u8>>,
    received_paths: HashSet<Path>,
    completions: u32,
    stale_keys: Vec<Vec<u8>>,
}

impl MemoryNodeRemover {
    #[must_use]
    pub fn new(original: Arc<MemoryTree>) -> Self {
        Self {
            original,
            state: Mutex::default(),
        }
    }

    /// How many times `all_nodes_received` was called.
    #[must_use]
    pub fn completions(&self) -> u32 {
        self.state.lock().completions
    }

    #[must_use]
    pub fn stale_keys(&self) -> Vec<Vec<u8>> {
        self.state.lock().stale_keys.clone()
    }
}

impl NodeRemover for MemoryNodeRemover {
    fn set_path_information(&self, original: TreeBoundaries, reconnect: TreeBoundaries) {
        debug!(
            original_last_leaf_path = original.last_leaf_path,
            reconnect_last_leaf_path = reconnect.last_leaf_path,
            "Node remover tracking path ranges"
        );
        self.state.lock().reconnect = Some(reconnect);
    }

    fn new_leaf_node(&self, path: Path, key: &[u8]) {
        let mut state = self.state.lock();
        let _ = state.received_keys.insert(key.to_vec());
        let _ = state.received_paths.insert(path);
    }

    fn all_nodes_received(&self) -> EyreResult<()> {
        let mut state = self.state.lock();
        state.completions += 1;

        let reconnect = state
            .reconnect
            .ok_or_eyre("all nodes received before the path range was known")?;

        let stale: Vec<Vec<u8>> = self
            .original
            .leaves()
            .filter(|leaf| !state.received_keys.contains(&leaf.key))
            .filter(|leaf| {
                !reconnect.is_leaf(leaf.path) || state.received_paths.contains(&leaf.path)
            })
            .map(|leaf| leaf.key.clone())
            .collect();
        state.stale_keys = stale;

        Ok(())
    }
}

/// Learner wiring over an in-memory original.
#[derive(Clone, Debug)]
pub struct MemoryLearner {
    pub parts: LearnerParts,
    pub builder: Arc<ReconnectTreeBuilder>,
    pub remover: Arc<MemoryNodeRemover>,
}

impl MemoryLearner {
    #[must_use]
    pub fn new(
        original: Arc<MemoryTree>,
        traversal: Arc<dyn NodeTraversalOrder>,
        hashing_queue_capacity: usize,
    ) -> Self {
        let builder = Arc::new(ReconnectTreeBuilder::new(
            Arc::clone(&original),
            hashing_queue_capacity,
        ));
        let remover = Arc::new(MemoryNodeRemover::new(Arc::clone(&original)));

        let parts = LearnerParts {
            original,
            traversal,
            hashing: builder.clone(),
            remover: remover.clone(),
        };

        Self {
            parts,
            builder,
            remover,
        }
    }
}
