//! Transfer counters for one reconnect session.
//!
//! Every session counts into its own [`ReconnectMapStats`]. A node that
//! exports metrics registers the counters before the session starts:
//!
//! - `reconnect_transfers_from_teacher`: frames the teacher sent
//! - `reconnect_internal_hashes{_clean}`: internal nodes compared
//! - `reconnect_leaf_hashes{_clean}`: leaves compared
//! - `reconnect_leaf_data`: leaf records the teacher sent

use core::fmt;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Counters describing what a reconnect transferred.
///
/// Cloning shares the counters, so a registered clone keeps observing the
/// session that counts into the original.
#[derive(Clone, Debug, Default)]
pub struct ReconnectMapStats {
    transfers_from_teacher: Counter,
    internal_hashes: Counter,
    internal_clean_hashes: Counter,
    leaf_hashes: Counter,
    leaf_clean_hashes: Counter,
    leaf_data: Counter,
}

impl ReconnectMapStats {
    /// Register the counters under the `reconnect` prefix.
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("reconnect");

        registry.register(
            "transfers_from_teacher",
            "Frames the teacher sent during reconnect",
            self.transfers_from_teacher.clone(),
        );
        registry.register(
            "internal_hashes",
            "Internal nodes compared during reconnect",
            self.internal_hashes.clone(),
        );
        registry.register(
            "internal_clean_hashes",
            "Internal nodes the learner already had",
            self.internal_clean_hashes.clone(),
        );
        registry.register(
            "leaf_hashes",
            "Leaves compared during reconnect",
            self.leaf_hashes.clone(),
        );
        registry.register(
            "leaf_clean_hashes",
            "Leaves the learner already had",
            self.leaf_clean_hashes.clone(),
        );
        registry.register(
            "leaf_data",
            "Leaf records the teacher sent",
            self.leaf_data.clone(),
        );
    }

    pub fn increment_transfers_from_teacher(&self) {
        let _ = self.transfers_from_teacher.inc();
    }

    pub fn increment_internal_hashes(&self, is_clean: bool) {
        let _ = self.internal_hashes.inc();
        if is_clean {
            let _ = self.internal_clean_hashes.inc();
        }
    }

    pub fn increment_leaf_hashes(&self, is_clean: bool) {
        let _ = self.leaf_hashes.inc();
        if is_clean {
            let _ = self.leaf_clean_hashes.inc();
        }
    }

    pub fn increment_leaf_data(&self) {
        let _ = self.leaf_data.inc();
    }

    #[must_use]
    pub fn snapshot(&self) -> ReconnectStats {
        ReconnectStats {
            transfers_from_teacher: self.transfers_from_teacher.get(),
            internal_hashes: self.internal_hashes.get(),
            internal_clean_hashes: self.internal_clean_hashes.get(),
            leaf_hashes: self.leaf_hashes.get(),
            leaf_clean_hashes: self.leaf_clean_hashes.get(),
            leaf_data: self.leaf_data.get(),
        }
    }
}

/// Point-in-time copy of [`ReconnectMapStats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReconnectStats {
    pub transfers_from_teacher: u64,
    pub internal_hashes: u64,
    pub internal_clean_hashes: u64,
    pub leaf_hashes: u64,
    pub leaf_clean_hashes: u64,
    pub leaf_data: u64,
}

impl fmt::Display for ReconnectStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transfers={} internal={}/{} clean leaves={}/{} clean leaf data={}",
            self.transfers_from_teacher,
            self.internal_clean_hashes,
            self.internal_hashes,
            self.leaf_clean_hashes,
            self.leaf_hashes,
            self.leaf_data,
        )
    }
}

#[cfg(test)]
mod tests {
    use prometheus_client::encoding::text::encode;

    use super::*;

    #[test]
    fn clean_hashes_count_towards_both_totals() {
        let stats = ReconnectMapStats::default();
        stats.increment_internal_hashes(true);
        stats.increment_internal_hashes(false);
        stats.increment_leaf_hashes(false);
        stats.increment_leaf_data();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.internal_hashes, 2, "every internal");
        assert_eq!(snapshot.internal_clean_hashes, 1, "clean internals");
        assert_eq!(snapshot.leaf_hashes, 1, "every leaf");
        assert_eq!(snapshot.leaf_clean_hashes, 0, "no clean leaf");
        assert_eq!(snapshot.leaf_data, 1, "one record");
    }

    #[test]
    fn registered_counters_follow_the_session() {
        let stats = ReconnectMapStats::default();
        let mut registry = Registry::default();
        stats.register(&mut registry);

        stats.increment_transfers_from_teacher();
        stats.increment_transfers_from_teacher();

        let mut text = String::new();
        encode(&mut text, &registry).unwrap();
        assert!(
            text.contains("reconnect_transfers_from_teacher_total 2"),
            "exported value tracks the session: {text}"
        );
        assert!(
            text.contains("reconnect_leaf_data_total 0"),
            "untouched counters are exported too: {text}"
        );
    }
}
