use std::collections::VecDeque;

use calimero_reconnect_primitives::Path;
use parking_lot::Mutex;

/// Double-buffered breadth-first queue.
///
/// Nodes of the level being sent are popped from the processing buffer while
/// their children accumulate in the other one. The buffers only swap once
/// the processing side is empty, and the swap happens under the same lock
/// as every push and pop.
#[derive(Debug, Default)]
pub struct LevelQueues {
    inner: Mutex<Levels>,
}

#[derive(Debug, Default)]
struct Levels {
    processing: VecDeque<Path>,
    accumulating: VecDeque<Path>,
}

impl LevelQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a node for the next level.
    pub fn push_next(&self, path: Path) {
        self.inner.lock().accumulating.push_back(path);
    }

    /// Next node of the current level.
    pub fn pop(&self) -> Option<Path> {
        self.inner.lock().processing.pop_front()
    }

    /// Promote the accumulated level. Returns `false`, and leaves both
    /// buffers alone, unless the current level is drained and the next one
    /// has nodes.
    pub fn flip(&self) -> bool {
        let mut levels = self.inner.lock();
        if !levels.processing.is_empty() || levels.accumulating.is_empty() {
            return false;
        }
        let levels = &mut *levels;
        core::mem::swap(&mut levels.processing, &mut levels.accumulating);
        true
    }

    #[must_use]
    pub fn has_next_level(&self) -> bool {
        !self.inner.lock().accumulating.is_empty()
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        let levels = self.inner.lock();
        levels.processing.is_empty() && levels.accumulating.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_come_out_in_order() {
        let queues = LevelQueues::new();
        queues.push_next(1);
        queues.push_next(2);
        assert_eq!(queues.pop(), None, "nothing promoted yet");

        assert!(queues.flip(), "first level promoted");
        assert_eq!(queues.pop(), Some(1), "fifo");
        queues.push_next(3);
        assert!(!queues.flip(), "current level not drained");
        assert_eq!(queues.pop(), Some(2), "fifo");
        assert_eq!(queues.pop(), None, "level drained");

        assert!(queues.flip(), "second level promoted");
        assert_eq!(queues.pop(), Some(3), "child");
        assert!(!queues.flip(), "nothing left to promote");
        assert!(queues.is_drained(), "done");
    }
}
